//! # Core types of the Kestrel kernel
//!
//! - **Module**: the lifecycle contract every peripheral module implements
//! - **ModuleHandle**: the kernel's shared reference to a registered module
//! - **ModuleContext**: what a module sees during `init` and `start`
//! - **Payload**: reference-counted event payload
//!
//! ## Module Lifecycle
//!
//! 1. **Construction** - a factory builds the module from its config entry
//! 2. **Injection** - declared dependencies are resolved and injected
//! 3. **Initialization** - `init()` is called in init-rank order
//! 4. **Start** - `start()` is called for every initialized module
//! 5. **Runtime** - `enable`/`disable`/`reconfigure` and event delivery
//! 6. **Shutdown** - `deinit()` is called in reverse rank order

pub mod context;
pub mod module;
pub mod payload;

pub use context::{ModuleContext, Services};
pub use module::{
    Dependency, DependencyKind, Module, ModuleHandle, ModuleStatus, Resolved, WeakModuleHandle,
    HANDLE_SUFFIX, SERVICE_SUFFIX,
};
pub use payload::{Payload, PayloadValue, Releaser};
