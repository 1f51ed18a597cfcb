//! # Module lifecycle kernel
//!
//! Single source of truth for which modules exist, the order they start in,
//! and their status. The kernel owns the five services and drives every
//! module through construction, dependency injection, `init`, `start`,
//! runtime operations and shutdown.
//!
//! One module failing never stops the others: a failed factory leaves the
//! module out of the registry, and a failed `init` or `start` parks that
//! module in [`ModuleStatus::Error`] while boot carries on.

pub mod factory;

pub use factory::{FactoryRegistry, ModuleFactory};

use crate::config::{KernelConfig, ModuleSpec, SystemConfig};
use crate::core::{
    DependencyKind, Module, ModuleContext, ModuleHandle, ModuleStatus, Payload, Resolved, Services,
};
use crate::error::{KernelError, KernelResult};
use crate::events;
use crate::services::CapabilityStatus;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

const LOG_TARGET: &str = "kestrel::kernel";

/// Registry row returned by [`Kernel::modules`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSummary {
    pub name: String,
    pub module_type: String,
    pub init_rank: i32,
    pub status: ModuleStatus,
}

/// The embedded application kernel
///
/// ```no_run
/// use kestrel_core::{Kernel, KernelConfig, KernelError, Module, SystemConfig};
///
/// struct Led;
/// impl Module for Led {}
///
/// let mut kernel = Kernel::new(KernelConfig::default())?;
/// kernel.register_factory("led", |_, _| Ok(Box::new(Led) as Box<dyn Module>));
/// kernel.create_all(&SystemConfig::from_json_str(r#"{ "led0": { "type": "led" } }"#)?)?;
/// kernel.boot()?;
/// # Ok::<(), KernelError>(())
/// ```
pub struct Kernel {
    config: KernelConfig,
    services: Services,
    factories: FactoryRegistry,
    modules: RwLock<Vec<ModuleHandle>>,
    booted: AtomicBool,
    shut_down: AtomicBool,
}

impl Kernel {
    /// Validate `config` and start the services
    pub fn new(config: KernelConfig) -> KernelResult<Self> {
        let services = Services::start(&config)?;
        log::info!(
            target: LOG_TARGET,
            "kernel started (strict dependencies: {})",
            config.strict_dependencies
        );

        Ok(Self {
            config,
            services,
            factories: FactoryRegistry::new(),
            modules: RwLock::new(Vec::new()),
            booted: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Make `module_type` constructible by [`create_all`](Self::create_all)
    pub fn register_factory<F>(&mut self, module_type: &str, factory: F) -> &mut Self
    where
        F: Fn(&ModuleSpec, &Services) -> KernelResult<Box<dyn Module>> + Send + Sync + 'static,
    {
        if self.factories.register(module_type, factory) {
            log::warn!(target: LOG_TARGET, "factory for '{}' replaced", module_type);
        }
        self
    }

    pub fn factories(&self) -> &FactoryRegistry {
        &self.factories
    }

    /// Build every enabled module of `system`, returning how many were created
    ///
    /// A module whose type is unknown, whose factory fails, or whose
    /// dependency keys are malformed is logged and left out.
    pub fn create_all(&self, system: &SystemConfig) -> KernelResult<usize> {
        self.ensure_not_booted()?;

        let mut created = 0;
        for spec in system.modules() {
            if !spec.enabled {
                log::info!(target: LOG_TARGET, "module '{}' disabled in config, skipped", spec.instance_name);
                continue;
            }

            let Some(factory) = self.factories.get(&spec.module_type) else {
                log::error!(
                    target: LOG_TARGET,
                    "no factory for type '{}', module '{}' skipped",
                    spec.module_type,
                    spec.instance_name
                );
                continue;
            };

            let module = match factory(spec, &self.services) {
                Ok(module) => module,
                Err(e) => {
                    log::error!(target: LOG_TARGET, "failed to create module '{}': {}", spec.instance_name, e);
                    continue;
                }
            };

            match self.add(spec, module) {
                Ok(_) => created += 1,
                Err(e) => {
                    log::error!(target: LOG_TARGET, "module '{}' rejected: {}", spec.instance_name, e)
                }
            }
        }

        log::info!(
            target: LOG_TARGET,
            "created {} of {} configured modules",
            created,
            system.len()
        );
        Ok(created)
    }

    /// Register an already constructed module
    pub fn add(&self, spec: &ModuleSpec, module: Box<dyn Module>) -> KernelResult<ModuleHandle> {
        self.ensure_not_booted()?;
        if spec.instance_name.is_empty() {
            return Err(KernelError::invalid_argument("empty module name"));
        }
        for dependency in module.dependencies() {
            dependency.kind()?;
        }

        let mut modules = self.modules.write();
        if modules.iter().any(|m| m.name() == spec.instance_name) {
            return Err(KernelError::invalid_state(format!(
                "module '{}' already registered",
                spec.instance_name
            )));
        }

        let handle = ModuleHandle::new(
            &spec.instance_name,
            &spec.module_type,
            spec.init_rank,
            spec.config.clone(),
            module,
        );
        modules.push(handle.clone());
        modules.sort_by(|a, b| {
            a.init_rank()
                .cmp(&b.init_rank())
                .then_with(|| a.name().cmp(b.name()))
        });

        log::debug!(
            target: LOG_TARGET,
            "registered module '{}' (type '{}', rank {})",
            spec.instance_name,
            spec.module_type,
            spec.init_rank
        );
        Ok(handle)
    }

    /// Initialize and start every registered module in rank order
    ///
    /// Fails only when called twice; module failures are reported through
    /// module status, never as an error of `boot` itself. Publishes
    /// [`SYSTEM_STARTED`](events::SYSTEM_STARTED) once at the end.
    pub fn boot(&self) -> KernelResult<()> {
        if self.booted.swap(true, Ordering::AcqRel) {
            return Err(KernelError::invalid_state("kernel already booted"));
        }

        let modules = self.modules.read().clone();
        log::info!(target: LOG_TARGET, "booting {} modules", modules.len());

        for handle in &modules {
            self.init_module(handle);
        }
        for handle in modules.iter().filter(|h| h.status() == ModuleStatus::Initialized) {
            self.start_module(handle);
        }

        if let Err(e) = self.services.bus.publish(events::SYSTEM_STARTED, None) {
            log::error!(target: LOG_TARGET, "failed to announce system start: {}", e);
        }

        let counts = self.status_counts();
        log::info!(
            target: LOG_TARGET,
            "boot complete: {} running, {} failed",
            counts.get(&ModuleStatus::Running).copied().unwrap_or(0),
            counts.get(&ModuleStatus::Error).copied().unwrap_or(0)
        );
        Ok(())
    }

    fn init_module(&self, handle: &ModuleHandle) {
        self.set_capabilities(handle, CapabilityStatus::Initializing);

        let ctx = ModuleContext::new(handle, &self.services);
        let result = self
            .resolve_dependencies(handle)
            .and_then(|()| handle.module().init(&ctx));

        match result {
            Ok(()) => {
                // Capabilities provided during init join the lifecycle here.
                self.set_capabilities(handle, CapabilityStatus::Initializing);
                self.transition(handle, ModuleStatus::Initialized);
                log::info!(target: LOG_TARGET, "initialized module '{}'", handle.name());
            }
            Err(e) => {
                log::error!(target: LOG_TARGET, "failed to initialize module '{}': {}", handle.name(), e);
                self.fail(handle);
            }
        }
    }

    fn start_module(&self, handle: &ModuleHandle) {
        let ctx = ModuleContext::new(handle, &self.services);
        match handle.module().start(&ctx) {
            Ok(()) => {
                self.transition(handle, ModuleStatus::Running);
                self.set_capabilities(handle, CapabilityStatus::Active);
                log::info!(target: LOG_TARGET, "started module '{}'", handle.name());
            }
            Err(e) => {
                log::error!(target: LOG_TARGET, "failed to start module '{}': {}", handle.name(), e);
                self.fail(handle);
            }
        }
    }

    fn fail(&self, handle: &ModuleHandle) {
        self.transition(handle, ModuleStatus::Error);
        self.set_capabilities(handle, CapabilityStatus::Error);
    }

    fn transition(&self, handle: &ModuleHandle, status: ModuleStatus) {
        if let Err(e) = handle.transition(status, self.config.lock_timeout()) {
            log::error!(target: LOG_TARGET, "module '{}' not moved to {}: {}", handle.name(), status, e);
        }
    }

    fn set_capabilities(&self, handle: &ModuleHandle, status: CapabilityStatus) {
        for name in handle.provided_capabilities() {
            if let Err(e) = self.services.capabilities.set_status(&name, status) {
                log::warn!(target: LOG_TARGET, "capability '{}' of '{}': {}", name, handle.name(), e);
            }
        }
    }

    /// Look up and inject every declared dependency of `handle`
    fn resolve_dependencies(&self, handle: &ModuleHandle) -> KernelResult<()> {
        let config = handle.config();

        for dependency in handle.module().dependencies() {
            let kind = dependency.kind()?;
            let Some(target) = config.get(&dependency.key).and_then(Value::as_str) else {
                if dependency.required {
                    return Err(KernelError::not_found(format!(
                        "config key '{}' of module '{}'",
                        dependency.key,
                        handle.name()
                    )));
                }
                continue;
            };

            let resolved = match kind {
                DependencyKind::Service => self.resolve_service(target),
                DependencyKind::Module => {
                    self.module(target).map(|m| Resolved::Module(m.downgrade()))
                }
            };

            match resolved {
                Ok(resolved) => {
                    handle.module().inject(&dependency.key, resolved)?;
                    log::debug!(
                        target: LOG_TARGET,
                        "injected '{}' into '{}' as '{}'",
                        target,
                        handle.name(),
                        dependency.key
                    );
                }
                Err(e) if dependency.required => return Err(e),
                Err(e) => {
                    log::warn!(
                        target: LOG_TARGET,
                        "optional dependency '{}' of '{}' unresolved: {}",
                        dependency.key,
                        handle.name(),
                        e
                    );
                }
            }
        }
        Ok(())
    }

    fn resolve_service(&self, name: &str) -> KernelResult<Resolved> {
        let capability = self.services.capabilities.get(name)?;
        if self.config.strict_dependencies {
            let status = self.services.capabilities.get_status(name)?;
            if status != CapabilityStatus::Active {
                return Err(KernelError::invalid_state(format!(
                    "capability '{}' is {}, not ACTIVE",
                    name, status
                )));
            }
        }
        Ok(Resolved::Service(capability))
    }

    /// Delegate to the module's `enable`, then mark it running
    ///
    /// Only a started module (`Running` or `Disabled`) can be enabled.
    pub fn enable(&self, name: &str) -> KernelResult<()> {
        let handle = self.runtime_module(name)?;
        handle.module().enable()?;
        handle.transition(ModuleStatus::Running, self.config.lock_timeout())?;
        self.announce(events::MODULE_ENABLED, name);
        Ok(())
    }

    /// Delegate to the module's `disable`, then mark it disabled
    pub fn disable(&self, name: &str) -> KernelResult<()> {
        let handle = self.runtime_module(name)?;
        handle.module().disable()?;
        handle.transition(ModuleStatus::Disabled, self.config.lock_timeout())?;
        self.announce(events::MODULE_DISABLED, name);
        Ok(())
    }

    fn runtime_module(&self, name: &str) -> KernelResult<ModuleHandle> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(KernelError::invalid_state("kernel is shut down"));
        }
        let handle = self.module(name)?;
        match handle.status() {
            ModuleStatus::Running | ModuleStatus::Disabled => Ok(handle),
            status => Err(KernelError::invalid_state(format!(
                "module '{}' is {}",
                name, status
            ))),
        }
    }

    /// Hand `config` to the module and keep it as the module's config
    pub fn reconfigure(&self, name: &str, config: Value) -> KernelResult<()> {
        if !config.is_object() {
            return Err(KernelError::invalid_argument("module config must be an object"));
        }
        let handle = self.module(name)?;
        handle.module().reconfigure(&config)?;
        handle.set_config(config);
        self.announce(events::CONFIG_UPDATED, name);
        Ok(())
    }

    /// Status as reported by the module itself
    pub fn get_status(&self, name: &str) -> KernelResult<ModuleStatus> {
        self.module(name)?.module().get_status()
    }

    /// Status as tracked by the kernel
    pub fn status(&self, name: &str) -> KernelResult<ModuleStatus> {
        Ok(self.module(name)?.status())
    }

    fn announce(&self, event: &str, name: &str) {
        let payload = Payload::new(name.to_string());
        if let Err(e) = self.services.bus.publish(event, Some(&payload)) {
            log::warn!(target: LOG_TARGET, "'{}' for '{}' not published: {}", event, name, e);
        }
    }

    pub fn module(&self, name: &str) -> KernelResult<ModuleHandle> {
        self.modules
            .read()
            .iter()
            .find(|m| m.name() == name)
            .cloned()
            .ok_or_else(|| KernelError::not_found(format!("module '{}'", name)))
    }

    /// Registered modules in boot order
    pub fn modules(&self) -> Vec<ModuleSummary> {
        self.modules
            .read()
            .iter()
            .map(|m| ModuleSummary {
                name: m.name().to_string(),
                module_type: m.module_type().to_string(),
                init_rank: m.init_rank(),
                status: m.status(),
            })
            .collect()
    }

    pub fn status_counts(&self) -> HashMap<ModuleStatus, usize> {
        let mut counts = HashMap::new();
        for handle in self.modules.read().iter() {
            *counts.entry(handle.status()).or_insert(0) += 1;
        }
        counts
    }

    pub fn is_booted(&self) -> bool {
        self.booted.load(Ordering::Acquire)
    }

    /// Tear everything down in reverse rank order and stop the services
    ///
    /// [`SHUTDOWN_REQUESTED`](events::SHUTDOWN_REQUESTED) is published and
    /// delivered first.
    /// Every module then gets `deinit`, loses its capabilities, resource
    /// locks and subscriptions, and ends up [`ModuleStatus::Stopped`].
    /// Idempotent; also run on drop.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        log::info!(target: LOG_TARGET, "shutting down");
        match self.services.bus.publish(events::SHUTDOWN_REQUESTED, None) {
            Ok(()) => {
                // Subscribers see the request before anything is torn down.
                if let Err(e) = self.services.bus.flush(self.config.shutdown_timeout()) {
                    log::warn!(target: LOG_TARGET, "shutdown request not fully delivered: {}", e);
                }
            }
            Err(e) => log::warn!(target: LOG_TARGET, "shutdown not announced: {}", e),
        }

        let modules = self.modules.read().clone();
        for handle in modules.iter().rev() {
            self.stop_module(handle);
        }
        if let Err(e) = self.services.bus.clear() {
            log::warn!(target: LOG_TARGET, "event subscriptions not cleared: {}", e);
        }

        self.services.stop();
        log::info!(target: LOG_TARGET, "shutdown complete");
    }

    fn stop_module(&self, handle: &ModuleHandle) {
        let name = handle.name();
        match handle.status() {
            ModuleStatus::Initialized | ModuleStatus::Running | ModuleStatus::Disabled => {
                match handle.module().deinit() {
                    Ok(()) => log::info!(target: LOG_TARGET, "deinitialized module '{}'", name),
                    Err(KernelError::NotSupported(_)) => {}
                    Err(e) => log::error!(target: LOG_TARGET, "error deinitializing '{}': {}", name, e),
                }
            }
            _ => {}
        }

        self.set_capabilities(handle, CapabilityStatus::Stopping);
        for capability in handle.provided_capabilities() {
            if let Err(e) = self.services.capabilities.unregister(&capability) {
                log::warn!(target: LOG_TARGET, "capability '{}' of '{}': {}", capability, name, e);
            }
            handle.forget_capability(&capability);
        }

        match self.services.resources.release_all(name) {
            Ok(0) => {}
            Ok(released) => {
                log::debug!(target: LOG_TARGET, "released {} resources held by '{}'", released, name)
            }
            Err(e) => log::warn!(target: LOG_TARGET, "resources of '{}' not released: {}", name, e),
        }
        if let Err(e) = self.services.bus.unsubscribe_all(handle) {
            log::warn!(target: LOG_TARGET, "subscriptions of '{}' not removed: {}", name, e);
        }

        self.transition(handle, ModuleStatus::Stopped);
    }

    fn ensure_not_booted(&self) -> KernelResult<()> {
        if self.is_booted() {
            return Err(KernelError::invalid_state("kernel already booted"));
        }
        Ok(())
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    #[derive(Default)]
    struct Switch {
        enabled: Mutex<bool>,
        config: Mutex<Value>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl Module for Switch {
        fn init(&self, ctx: &ModuleContext<'_>) -> KernelResult<()> {
            self.calls.lock().push(format!("init {}", ctx.name()));
            Ok(())
        }

        fn enable(&self) -> KernelResult<()> {
            *self.enabled.lock() = true;
            Ok(())
        }

        fn disable(&self) -> KernelResult<()> {
            *self.enabled.lock() = false;
            Ok(())
        }

        fn deinit(&self) -> KernelResult<()> {
            self.calls.lock().push("deinit".to_string());
            Ok(())
        }

        fn reconfigure(&self, config: &Value) -> KernelResult<()> {
            *self.config.lock() = config.clone();
            Ok(())
        }
    }

    struct Inert;
    impl Module for Inert {}

    /// Supports `enable`, but has no hardware to initialize
    struct Faulty;

    impl Module for Faulty {
        fn init(&self, _ctx: &ModuleContext<'_>) -> KernelResult<()> {
            Err(KernelError::failed("no sensor on the bus"))
        }

        fn enable(&self) -> KernelResult<()> {
            Ok(())
        }
    }

    fn kernel_with(calls: &Arc<Mutex<Vec<String>>>) -> Kernel {
        let mut kernel = Kernel::new(KernelConfig::default()).unwrap();
        let calls = calls.clone();
        kernel.register_factory("switch", move |_, _| {
            Ok(Box::new(Switch {
                calls: calls.clone(),
                ..Switch::default()
            }) as Box<dyn Module>)
        });
        kernel.register_factory("broken", |spec, _| {
            Err(KernelError::failed(format!("{} has no hardware", spec.instance_name)))
        });
        kernel
    }

    #[test]
    fn test_create_all_skips_failures() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let kernel = kernel_with(&calls);
        let system = SystemConfig::new(vec![
            ModuleSpec::new("a", "switch"),
            ModuleSpec::new("b", "broken"),
            ModuleSpec::new("c", "unknown"),
            ModuleSpec::new("d", "switch").disabled(),
        ]);

        assert_eq!(kernel.create_all(&system).unwrap(), 1);
        assert!(kernel.module("a").is_ok());
        assert_eq!(kernel.module("b").unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(kernel.modules().len(), 1);
    }

    #[test]
    fn test_boot_in_rank_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let kernel = kernel_with(&calls);
        let system = SystemConfig::new(vec![
            ModuleSpec::new("late", "switch").with_rank(50),
            ModuleSpec::new("early", "switch").with_rank(10),
            ModuleSpec::new("alpha", "switch").with_rank(50),
        ]);
        kernel.create_all(&system).unwrap();
        kernel.boot().unwrap();

        assert_eq!(*calls.lock(), vec!["init early", "init alpha", "init late"]);
        assert_eq!(kernel.status("late").unwrap(), ModuleStatus::Running);
        assert_eq!(kernel.boot().unwrap_err().kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_runtime_operations() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let kernel = kernel_with(&calls);
        kernel.create_all(&SystemConfig::new(vec![ModuleSpec::new("fan", "switch")])).unwrap();
        kernel.boot().unwrap();

        kernel.disable("fan").unwrap();
        assert_eq!(kernel.status("fan").unwrap(), ModuleStatus::Disabled);
        kernel.enable("fan").unwrap();
        assert_eq!(kernel.status("fan").unwrap(), ModuleStatus::Running);

        kernel.reconfigure("fan", json!({ "speed": 3 })).unwrap();
        assert_eq!(kernel.module("fan").unwrap().config()["speed"], 3);

        assert_eq!(kernel.get_status("fan").unwrap_err().kind(), ErrorKind::NotSupported);
        assert_eq!(kernel.enable("pump").unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_missing_optional_op_is_not_supported() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        kernel.add(&ModuleSpec::new("inert", "inert"), Box::new(Inert)).unwrap();
        kernel.boot().unwrap();

        assert_eq!(kernel.enable("inert").unwrap_err().kind(), ErrorKind::NotSupported);
        assert_eq!(kernel.status("inert").unwrap(), ModuleStatus::Running);
    }

    #[test]
    fn test_shutdown_stops_modules() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let kernel = kernel_with(&calls);
        kernel.create_all(&SystemConfig::new(vec![ModuleSpec::new("fan", "switch")])).unwrap();
        kernel.boot().unwrap();

        kernel.services().resources.lock(crate::services::ResourceType::Gpio, 7, "fan").unwrap();
        kernel.shutdown();
        kernel.shutdown();

        assert_eq!(kernel.status("fan").unwrap(), ModuleStatus::Stopped);
        assert_eq!(calls.lock().last().map(String::as_str), Some("deinit"));
        assert!(!kernel.services().resources.is_locked(crate::services::ResourceType::Gpio, 7));
    }

    #[test]
    fn test_enable_keeps_faults_visible() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let kernel = kernel_with(&calls);
        kernel.add(&ModuleSpec::new("sensor", "faulty"), Box::new(Faulty)).unwrap();
        kernel.create_all(&SystemConfig::new(vec![ModuleSpec::new("fan", "switch")])).unwrap();
        kernel.boot().unwrap();

        assert_eq!(kernel.enable("sensor").unwrap_err().kind(), ErrorKind::InvalidState);
        assert_eq!(kernel.disable("sensor").unwrap_err().kind(), ErrorKind::InvalidState);
        assert_eq!(kernel.status("sensor").unwrap(), ModuleStatus::Error);

        kernel.shutdown();
        assert_eq!(kernel.enable("fan").unwrap_err().kind(), ErrorKind::InvalidState);
        assert_eq!(kernel.disable("fan").unwrap_err().kind(), ErrorKind::InvalidState);
        assert_eq!(kernel.status("fan").unwrap(), ModuleStatus::Stopped);
    }
}
