//! Error types for the Kestrel kernel
//!
//! Every public kernel operation returns [`KernelResult`]. The variants map
//! one-to-one onto the error kinds peripheral modules are written against,
//! so callers can branch on [`KernelError::kind`] without string matching.

use std::fmt;

/// Result alias used throughout the kernel
pub type KernelResult<T> = Result<T, KernelError>;

/// Coarse error taxonomy shared by every kernel service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    InvalidState,
    NoMemory,
    Timeout,
    NotSupported,
    Failed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidArgument => "INVALID_ARG",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::InvalidState => "INVALID_STATE",
            ErrorKind::NoMemory => "NO_MEM",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::NotSupported => "NOT_SUPPORTED",
            ErrorKind::Failed => "FAIL",
        };
        f.write_str(s)
    }
}

/// Kernel error
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("out of memory: {0}")]
    NoMemory(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("operation failed: {0}")]
    Failed(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl KernelError {
    /// Map this error onto the shared taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            KernelError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            KernelError::NotFound(_) => ErrorKind::NotFound,
            KernelError::InvalidState(_) => ErrorKind::InvalidState,
            KernelError::NoMemory(_) => ErrorKind::NoMemory,
            KernelError::Timeout(_) => ErrorKind::Timeout,
            KernelError::NotSupported(_) => ErrorKind::NotSupported,
            KernelError::Failed(_) | KernelError::Io(_) => ErrorKind::Failed,
            KernelError::Config(_)
            | KernelError::Json(_)
            | KernelError::Toml(_)
            | KernelError::Yaml(_) => ErrorKind::InvalidArgument,
        }
    }

    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        KernelError::InvalidArgument(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        KernelError::NotFound(msg.into())
    }

    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        KernelError::InvalidState(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        KernelError::Timeout(msg.into())
    }

    pub fn not_supported<S: Into<String>>(msg: S) -> Self {
        KernelError::NotSupported(msg.into())
    }

    pub fn failed<S: Into<String>>(msg: S) -> Self {
        KernelError::Failed(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        KernelError::Config(msg.into())
    }
}
