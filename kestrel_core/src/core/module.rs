use crate::core::context::ModuleContext;
use crate::core::payload::Payload;
use crate::error::{KernelError, KernelResult};
use crate::services::Capability;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Config keys ending in this suffix resolve through the capability directory
pub const SERVICE_SUFFIX: &str = "_service";

/// Config keys ending in this suffix resolve through the module registry
pub const HANDLE_SUFFIX: &str = "_handle";

/// Module lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleStatus {
    Uninitialized,
    Initialized,
    Running,
    Disabled,
    Error,
    Stopped,
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleStatus::Uninitialized => write!(f, "Uninitialized"),
            ModuleStatus::Initialized => write!(f, "Initialized"),
            ModuleStatus::Running => write!(f, "Running"),
            ModuleStatus::Disabled => write!(f, "Disabled"),
            ModuleStatus::Error => write!(f, "Error"),
            ModuleStatus::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Where a dependency is looked up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
    /// Capability directory, by capability name
    Service,
    /// Module registry, by instance name
    Module,
}

/// A named external handle a module needs before `init`
///
/// `key` names an entry of the module's config object whose string value is
/// the capability or module to inject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub key: String,
    pub required: bool,
}

impl Dependency {
    pub fn required(key: &str) -> Self {
        Self {
            key: key.to_string(),
            required: true,
        }
    }

    pub fn optional(key: &str) -> Self {
        Self {
            key: key.to_string(),
            required: false,
        }
    }

    /// Classify by key suffix; any other suffix is a config error
    pub fn kind(&self) -> KernelResult<DependencyKind> {
        if self.key.ends_with(SERVICE_SUFFIX) {
            Ok(DependencyKind::Service)
        } else if self.key.ends_with(HANDLE_SUFFIX) {
            Ok(DependencyKind::Module)
        } else {
            Err(KernelError::invalid_argument(format!(
                "dependency key '{}' must end in '{}' or '{}'",
                self.key, SERVICE_SUFFIX, HANDLE_SUFFIX
            )))
        }
    }
}

/// A resolved dependency, handed to [`Module::inject`]
///
/// Module dependencies arrive as a [`WeakModuleHandle`]: two modules holding
/// each other's handles would otherwise keep both alive past shutdown.
#[derive(Clone)]
pub enum Resolved {
    Service(Capability),
    Module(WeakModuleHandle),
}

impl fmt::Debug for Resolved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolved::Service(cap) => write!(f, "Service({})", cap.name()),
            Resolved::Module(handle) => write!(f, "Module({})", handle.name()),
        }
    }
}

/// Lifecycle contract implemented by every peripheral module
///
/// Methods take `&self`: a module keeps its private state behind its own
/// lock, the kernel never touches it. Optional operations default to
/// `NotSupported`; `init` and `start` default to success.
pub trait Module: Send + Sync {
    /// Called once, in rank order, after dependencies were injected
    fn init(&self, _ctx: &ModuleContext<'_>) -> KernelResult<()> {
        Ok(())
    }

    /// Called once for every module that initialized successfully
    fn start(&self, _ctx: &ModuleContext<'_>) -> KernelResult<()> {
        Ok(())
    }

    fn enable(&self) -> KernelResult<()> {
        Err(KernelError::not_supported("enable"))
    }

    fn disable(&self) -> KernelResult<()> {
        Err(KernelError::not_supported("disable"))
    }

    /// Release hardware and background work during shutdown
    fn deinit(&self) -> KernelResult<()> {
        Err(KernelError::not_supported("deinit"))
    }

    /// Apply a new `config` object at runtime
    fn reconfigure(&self, _config: &Value) -> KernelResult<()> {
        Err(KernelError::not_supported("reconfigure"))
    }

    /// Module-reported status, when it tracks one of its own
    fn get_status(&self) -> KernelResult<ModuleStatus> {
        Err(KernelError::not_supported("get_status"))
    }

    /// Event delivery; the handler owns `payload` and releases it when done
    fn handle_event(&self, _event: &str, payload: Option<Payload>) {
        drop(payload);
    }

    /// Dependencies to resolve before `init`
    fn dependencies(&self) -> Vec<Dependency> {
        Vec::new()
    }

    /// Receive one resolved dependency
    fn inject(&self, key: &str, _dependency: Resolved) -> KernelResult<()> {
        Err(KernelError::not_supported(format!("inject '{}'", key)))
    }
}

struct ModuleCell {
    name: String,
    module_type: String,
    init_rank: i32,
    config: RwLock<Value>,
    status: Mutex<ModuleStatus>,
    provided: Mutex<Vec<String>>,
    module: Box<dyn Module>,
}

/// Shared handle to a registered module
#[derive(Clone)]
pub struct ModuleHandle {
    cell: Arc<ModuleCell>,
}

impl ModuleHandle {
    pub fn new(
        name: &str,
        module_type: &str,
        init_rank: i32,
        config: Value,
        module: Box<dyn Module>,
    ) -> Self {
        Self {
            cell: Arc::new(ModuleCell {
                name: name.to_string(),
                module_type: module_type.to_string(),
                init_rank,
                config: RwLock::new(config),
                status: Mutex::new(ModuleStatus::Uninitialized),
                provided: Mutex::new(Vec::new()),
                module,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.cell.name
    }

    pub fn module_type(&self) -> &str {
        &self.cell.module_type
    }

    pub fn init_rank(&self) -> i32 {
        self.cell.init_rank
    }

    pub fn module(&self) -> &dyn Module {
        self.cell.module.as_ref()
    }

    pub fn config(&self) -> Value {
        self.cell.config.read().clone()
    }

    pub(crate) fn set_config(&self, config: Value) {
        *self.cell.config.write() = config;
    }

    pub fn status(&self) -> ModuleStatus {
        *self.cell.status.lock()
    }

    /// Move to `status` under the module's status lock, returning the old one
    pub(crate) fn transition(
        &self,
        status: ModuleStatus,
        timeout: Duration,
    ) -> KernelResult<ModuleStatus> {
        let mut current = self.cell.status.try_lock_for(timeout).ok_or_else(|| {
            KernelError::timeout(format!("status lock of module '{}'", self.cell.name))
        })?;
        let previous = *current;
        *current = status;
        Ok(previous)
    }

    /// Capabilities this module registered through its context
    pub fn provided_capabilities(&self) -> Vec<String> {
        self.cell.provided.lock().clone()
    }

    pub(crate) fn record_capability(&self, name: &str) {
        let mut provided = self.cell.provided.lock();
        if !provided.iter().any(|p| p == name) {
            provided.push(name.to_string());
        }
    }

    pub(crate) fn forget_capability(&self, name: &str) {
        self.cell.provided.lock().retain(|p| p != name);
    }

    pub fn ptr_eq(&self, other: &ModuleHandle) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    pub fn downgrade(&self) -> WeakModuleHandle {
        WeakModuleHandle {
            name: self.cell.name.clone(),
            cell: Arc::downgrade(&self.cell),
        }
    }
}

/// Non-owning reference to a module; the kernel owns the module itself
#[derive(Clone)]
pub struct WeakModuleHandle {
    name: String,
    cell: Weak<ModuleCell>,
}

impl WeakModuleHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `None` once the kernel has dropped the module
    pub fn upgrade(&self) -> Option<ModuleHandle> {
        self.cell.upgrade().map(|cell| ModuleHandle { cell })
    }
}

impl fmt::Debug for WeakModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakModuleHandle").field("name", &self.name).finish()
    }
}

impl fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("name", &self.cell.name)
            .field("type", &self.cell.module_type)
            .field("init_rank", &self.cell.init_rank)
            .field("status", &self.status())
            .finish()
    }
}
