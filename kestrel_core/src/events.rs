//! Framework-reserved event names
//!
//! These strings are part of the cross-module contract; peripheral modules
//! subscribe to them by value, so they must not change.

/// Subscribing to this name delivers every event
pub const WILDCARD: &str = "*";

/// Published once after the start pass of `boot()`, no payload
pub const SYSTEM_STARTED: &str = "SYSTEM_STARTED";

/// A module accepted a new configuration, payload is the module name
pub const CONFIG_UPDATED: &str = "CONFIG_UPDATED";

/// Payload is the module name
pub const MODULE_ENABLED: &str = "MODULE_ENABLED";

/// Payload is the module name
pub const MODULE_DISABLED: &str = "MODULE_DISABLED";

pub const NETWORK_CONNECTED: &str = "NETWORK_CONNECTED";

pub const NETWORK_DISCONNECTED: &str = "NETWORK_DISCONNECTED";

/// Published at the start of an orderly shutdown, no payload
pub const SHUTDOWN_REQUESTED: &str = "SHUTDOWN_REQUESTED";

/// Capability status transition, payload is a [`CapabilityStatusChange`]
///
/// [`CapabilityStatusChange`]: crate::services::CapabilityStatusChange
pub const CAPABILITY_STATUS_CHANGED: &str = "CAPABILITY_STATUS_CHANGED";
