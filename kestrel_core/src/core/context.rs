use crate::communication::EventBus;
use crate::config::KernelConfig;
use crate::core::module::ModuleHandle;
use crate::core::payload::Payload;
use crate::error::KernelResult;
use crate::scheduling::{JobScheduler, PromiseManager};
use crate::services::{CapabilityDirectory, CapabilityStatus, CapabilityType, ResourceArbiter};
use serde_json::Value;
use std::any::Any;
use std::sync::Arc;

/// The five long-lived kernel services, shared by reference
#[derive(Clone)]
pub struct Services {
    pub bus: Arc<EventBus>,
    pub capabilities: Arc<CapabilityDirectory>,
    pub resources: Arc<ResourceArbiter>,
    pub jobs: Arc<JobScheduler>,
    pub promises: Arc<PromiseManager>,
}

impl Services {
    /// Start every service thread
    pub fn start(config: &KernelConfig) -> KernelResult<Self> {
        config.validate()?;

        let bus = Arc::new(EventBus::start(config)?);
        let capabilities = Arc::new(CapabilityDirectory::new(bus.clone(), config));
        let resources = Arc::new(ResourceArbiter::new(config));
        let jobs = match JobScheduler::start(config) {
            Ok(jobs) => Arc::new(jobs),
            Err(e) => {
                bus.stop();
                return Err(e);
            }
        };
        let promises = match PromiseManager::start(config) {
            Ok(promises) => Arc::new(promises),
            Err(e) => {
                jobs.stop();
                bus.stop();
                return Err(e);
            }
        };

        Ok(Self {
            bus,
            capabilities,
            resources,
            jobs,
            promises,
        })
    }

    /// Stop the service threads, event bus last
    pub fn stop(&self) {
        self.jobs.stop();
        self.promises.stop();
        self.bus.stop();
    }
}

/// What a module sees during `init` and `start`
pub struct ModuleContext<'a> {
    handle: &'a ModuleHandle,
    services: &'a Services,
}

impl<'a> ModuleContext<'a> {
    pub fn new(handle: &'a ModuleHandle, services: &'a Services) -> Self {
        Self { handle, services }
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    /// This module's own handle, e.g. to subscribe it later from a job
    pub fn handle(&self) -> &ModuleHandle {
        self.handle
    }

    pub fn config(&self) -> Value {
        self.handle.config()
    }

    pub fn services(&self) -> &Services {
        self.services
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.services.bus
    }

    pub fn capabilities(&self) -> &Arc<CapabilityDirectory> {
        &self.services.capabilities
    }

    pub fn resources(&self) -> &Arc<ResourceArbiter> {
        &self.services.resources
    }

    pub fn jobs(&self) -> &Arc<JobScheduler> {
        &self.services.jobs
    }

    pub fn promises(&self) -> &Arc<PromiseManager> {
        &self.services.promises
    }

    /// Subscribe this module to `event`
    pub fn subscribe(&self, event: &str) -> KernelResult<()> {
        self.services.bus.subscribe(event, self.handle)
    }

    pub fn unsubscribe(&self, event: &str) -> KernelResult<()> {
        self.services.bus.unsubscribe(event, self.handle)
    }

    pub fn publish(&self, event: &str, payload: Option<&Payload>) -> KernelResult<()> {
        self.services.bus.publish(event, payload)
    }

    /// Register a capability owned by this module
    ///
    /// The kernel then drives its status along with the module's lifecycle.
    pub fn provide<T>(&self, name: &str, cap_type: CapabilityType, api: Arc<T>) -> KernelResult<()>
    where
        T: ?Sized + Any + Send + Sync,
    {
        self.services
            .capabilities
            .register(name, cap_type, api, CapabilityStatus::Registered)?;
        self.handle.record_capability(name);
        Ok(())
    }
}
