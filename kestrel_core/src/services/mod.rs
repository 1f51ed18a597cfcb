//! # Kestrel discovery and arbitration services
//!
//! - **CapabilityDirectory**: named, typed module APIs with a lifecycle status
//! - **ResourceArbiter**: exclusive ownership of pins, bus ports and channels

pub mod capability;
pub mod resources;

pub use capability::{
    Capability, CapabilityDirectory, CapabilityInfo, CapabilityStatus, CapabilityStatusChange,
    CapabilityType,
};
pub use resources::{ResourceArbiter, ResourceType};
