//! # Kestrel
//!
//! A dependency-aware application kernel for small, preemptively scheduled
//! devices. Peripheral drivers are written as [`Module`]s; the kernel builds
//! them from a configuration document, injects their dependencies, boots them
//! in rank order and connects them through an event bus, a capability
//! directory, a resource arbiter, a shared job scheduler and promises.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use kestrel::prelude::*;
//!
//! struct StatusLed;
//!
//! impl Module for StatusLed {
//!     fn init(&self, ctx: &ModuleContext<'_>) -> KernelResult<()> {
//!         let pin = ctx.config()["pin"].as_u64().unwrap_or(2) as u8;
//!         ctx.resources().lock(ResourceType::Gpio, pin, ctx.name())?;
//!         ctx.subscribe(events::NETWORK_CONNECTED)
//!     }
//! }
//!
//! fn main() -> AnyResult<()> {
//!     kestrel::logging::init()?;
//!
//!     let mut kernel = Kernel::new(KernelConfig::default())?;
//!     kernel.register_factory("status_led", |_, _| Ok(Box::new(StatusLed) as Box<dyn Module>));
//!     kernel.create_all(&SystemConfig::from_json_str(
//!         r#"{ "led": { "type": "status_led", "config": { "pin": 5 } } }"#,
//!     )?)?;
//!     kernel.boot()?;
//!     Ok(())
//! }
//! ```

// Re-export core components
pub use kestrel_core::{self, *};

pub mod logging;

/// The Kestrel prelude - everything a module author needs
pub mod prelude {
    // Kernel and modules
    pub use kestrel_core::core::{
        Dependency, Module, ModuleContext, ModuleHandle, ModuleStatus, Payload, Resolved,
        Services, WeakModuleHandle,
    };
    pub use kestrel_core::events;
    pub use kestrel_core::kernel::Kernel;

    // Configuration
    pub use kestrel_core::config::{KernelConfig, ModuleSpec, SystemConfig};

    // Services
    pub use kestrel_core::communication::EventBus;
    pub use kestrel_core::scheduling::{JobHandle, Promise, PromiseState};
    pub use kestrel_core::services::{
        Capability, CapabilityStatus, CapabilityType, ResourceType,
    };

    // Error types
    pub use kestrel_core::error::{ErrorKind, KernelError, KernelResult};
    pub type Result<T> = KernelResult<T>;

    // Common std types
    pub use std::sync::Arc;
    pub use std::time::Duration;

    // Common traits
    pub use serde::{Deserialize, Serialize};
    pub use serde_json::{json, Value};

    // Re-export anyhow for error handling
    pub use anyhow::{anyhow, bail, ensure, Context, Result as AnyResult};
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get Kestrel version
pub fn version() -> &'static str {
    VERSION
}
