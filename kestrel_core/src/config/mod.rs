//! Kernel configuration
//!
//! Two documents feed the kernel:
//!
//! - [`KernelConfig`]: tunables for the services themselves (queue sizes,
//!   worker count, tick period, dependency policy). Every field has a default.
//! - [`SystemConfig`]: the persisted module document, keyed by module
//!   instance name. The kernel reads it and never writes it back.

mod system;

pub use system::{ModuleSpec, SystemConfig, DEFAULT_INIT_RANK};

use crate::error::{KernelError, KernelResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables for the kernel services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Capacity of the event bus message queue
    pub event_queue_capacity: usize,
    /// Maximum subscribers per event name (the wildcard counts as a name)
    pub max_subscribers_per_event: usize,
    /// Capacity of the job scheduler's ready queue
    pub job_queue_capacity: usize,
    /// Number of job worker threads
    pub job_workers: usize,
    /// Period of the scheduled-set scan, in milliseconds
    pub scheduler_tick_ms: u64,
    /// Capacity of the promise execution queue
    pub promise_queue_capacity: usize,
    /// Upper bound for every registry lock acquisition, in milliseconds
    pub lock_timeout_ms: u64,
    /// Require service dependencies to be ACTIVE before injection
    pub strict_dependencies: bool,
    /// How long shutdown waits for each service thread, in milliseconds
    pub shutdown_timeout_ms: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            event_queue_capacity: 32,
            max_subscribers_per_event: 16,
            job_queue_capacity: 16,
            job_workers: 2,
            scheduler_tick_ms: 10,
            promise_queue_capacity: 16,
            lock_timeout_ms: 100,
            strict_dependencies: false,
            shutdown_timeout_ms: 1000,
        }
    }
}

impl KernelConfig {
    /// Smallest footprint: short queues and a single job worker
    pub fn constrained() -> Self {
        Self {
            event_queue_capacity: 8,
            max_subscribers_per_event: 8,
            job_queue_capacity: 4,
            job_workers: 1,
            promise_queue_capacity: 4,
            ..Self::default()
        }
    }

    /// Default tunables with strict dependency injection
    pub fn strict() -> Self {
        Self {
            strict_dependencies: true,
            ..Self::default()
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Reject values no service can run with
    pub fn validate(&self) -> KernelResult<()> {
        if self.event_queue_capacity == 0 {
            return Err(KernelError::config("event_queue_capacity must be > 0"));
        }
        if self.max_subscribers_per_event == 0 {
            return Err(KernelError::config("max_subscribers_per_event must be > 0"));
        }
        if self.job_queue_capacity == 0 {
            return Err(KernelError::config("job_queue_capacity must be > 0"));
        }
        if self.job_workers == 0 {
            return Err(KernelError::config("job_workers must be > 0"));
        }
        if self.promise_queue_capacity == 0 {
            return Err(KernelError::config("promise_queue_capacity must be > 0"));
        }
        Ok(())
    }

    pub fn from_toml_str(s: &str) -> KernelResult<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(s: &str) -> KernelResult<Self> {
        let config: Self = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(s: &str) -> KernelResult<Self> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from disk, picking the format from the file extension
    pub fn load_from_disk(path: &Path) -> KernelResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&contents),
            Some("yaml") | Some("yml") => Self::from_yaml_str(&contents),
            Some("json") => Self::from_json_str(&contents),
            other => Err(KernelError::config(format!(
                "unsupported kernel config format: {:?}",
                other
            ))),
        }
    }
}
