//! # Kestrel Core
//!
//! The framework kernel of the Kestrel embedded application runtime.
//!
//! Kestrel turns a flat collection of peripheral modules into a coordinated,
//! dependency-aware runtime on a small preemptively scheduled device. This
//! crate provides the kernel pieces:
//!
//! - **Kernel**: module creation, dependency injection, boot, runtime control and shutdown
//! - **Event Bus**: asynchronous publish/subscribe with reference-counted payloads
//! - **Capability Directory**: named, typed APIs provided by modules
//! - **Resource Arbiter**: exclusive ownership of pins, bus ports and channels
//! - **Job Scheduler**: shared worker pool for periodic and one-shot jobs
//! - **Promise Manager**: one-shot asynchronous results delivered to callbacks
//!
//! ## Quick Start
//!
//! ```rust
//! use kestrel_core::{Kernel, KernelConfig, KernelResult, Module, ModuleContext, ModuleSpec};
//!
//! struct Heartbeat;
//!
//! impl Module for Heartbeat {
//!     fn init(&self, ctx: &ModuleContext<'_>) -> KernelResult<()> {
//!         ctx.subscribe(kestrel_core::events::SYSTEM_STARTED)
//!     }
//! }
//!
//! let kernel = Kernel::new(KernelConfig::default()).unwrap();
//! kernel.add(&ModuleSpec::new("heartbeat", "heartbeat"), Box::new(Heartbeat)).unwrap();
//! kernel.boot().unwrap();
//! kernel.shutdown();
//! ```

pub mod communication;
pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod kernel;
pub mod scheduling;
pub mod services;

// Re-export commonly used types for easy access
pub use communication::{BusMetrics, EventBus};
pub use config::{KernelConfig, ModuleSpec, SystemConfig};
pub use crate::core::{
    Dependency, DependencyKind, Module, ModuleContext, ModuleHandle, ModuleStatus, Payload,
    Resolved, Services, WeakModuleHandle,
};
pub use error::{ErrorKind, KernelError, KernelResult};
pub use kernel::{Kernel, ModuleSummary};
pub use scheduling::{JobHandle, JobScheduler, Promise, PromiseManager, PromiseState};
pub use services::{
    Capability, CapabilityDirectory, CapabilityStatus, CapabilityType, ResourceArbiter,
    ResourceType,
};
