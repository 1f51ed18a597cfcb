use crate::communication::EventBus;
use crate::config::KernelConfig;
use crate::core::payload::Payload;
use crate::error::{KernelError, KernelResult};
use crate::events::CAPABILITY_STATUS_CHANGED;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const LOG_TARGET: &str = "kestrel::capability";

/// Closed set of capability kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityType {
    I2cBus,
    SpiBus,
    Gpio,
    Display,
    Network,
    Storage,
    Sensor,
    Timer,
    Ui,
    Custom,
}

/// Advisory lifecycle status of a capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CapabilityStatus {
    Registered,
    Initializing,
    Active,
    Stopping,
    Error,
}

impl fmt::Display for CapabilityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityStatus::Registered => write!(f, "REGISTERED"),
            CapabilityStatus::Initializing => write!(f, "INITIALIZING"),
            CapabilityStatus::Active => write!(f, "ACTIVE"),
            CapabilityStatus::Stopping => write!(f, "STOPPING"),
            CapabilityStatus::Error => write!(f, "ERROR"),
        }
    }
}

/// Payload of [`CAPABILITY_STATUS_CHANGED`]; `old` is `None` on registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityStatusChange {
    pub name: String,
    pub old: Option<CapabilityStatus>,
    pub new: CapabilityStatus,
}

/// A registered API, shared with every consumer that looks it up
///
/// The API is stored type-erased; consumers recover it with
/// [`api`](Self::api) using the same type it was registered with, usually a
/// trait object such as `dyn I2cBus`.
#[derive(Clone)]
pub struct Capability {
    name: String,
    cap_type: CapabilityType,
    api: Arc<dyn Any + Send + Sync>,
}

impl Capability {
    pub fn new<T>(name: &str, cap_type: CapabilityType, api: Arc<T>) -> Self
    where
        T: ?Sized + Any + Send + Sync,
    {
        Self {
            name: name.to_string(),
            cap_type,
            api: Arc::new(api),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cap_type(&self) -> CapabilityType {
        self.cap_type
    }

    /// The API as `Arc<T>`, or `None` if it was registered as another type
    pub fn api<T>(&self) -> Option<Arc<T>>
    where
        T: ?Sized + Any + Send + Sync,
    {
        self.api.downcast_ref::<Arc<T>>().cloned()
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("name", &self.name)
            .field("type", &self.cap_type)
            .finish_non_exhaustive()
    }
}

/// Directory listing row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityInfo {
    pub name: String,
    pub cap_type: CapabilityType,
    pub status: CapabilityStatus,
}

struct Entry {
    capability: Capability,
    status: CapabilityStatus,
}

/// Name/type indexed registry of module-provided APIs
///
/// The set of capabilities on a device is small, so every operation is a
/// linear scan under one lock. Status changes are announced on the event bus
/// as [`CAPABILITY_STATUS_CHANGED`].
pub struct CapabilityDirectory {
    entries: Mutex<Vec<Entry>>,
    bus: Arc<EventBus>,
    lock_timeout: Duration,
}

impl CapabilityDirectory {
    pub fn new(bus: Arc<EventBus>, config: &KernelConfig) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            bus,
            lock_timeout: config.lock_timeout(),
        }
    }

    fn lock(&self) -> KernelResult<MutexGuard<'_, Vec<Entry>>> {
        self.entries
            .try_lock_for(self.lock_timeout)
            .ok_or_else(|| KernelError::timeout("capability directory lock"))
    }

    /// Register `api` under `name`; fails `InvalidState` if the name is taken
    pub fn register<T>(
        &self,
        name: &str,
        cap_type: CapabilityType,
        api: Arc<T>,
        status: CapabilityStatus,
    ) -> KernelResult<()>
    where
        T: ?Sized + Any + Send + Sync,
    {
        if name.is_empty() {
            return Err(KernelError::invalid_argument("empty capability name"));
        }

        {
            let mut entries = self.lock()?;
            if entries.iter().any(|e| e.capability.name == name) {
                return Err(KernelError::invalid_state(format!(
                    "capability '{}' already registered",
                    name
                )));
            }
            entries.push(Entry {
                capability: Capability::new(name, cap_type, api),
                status,
            });
        }

        log::info!(target: LOG_TARGET, "registered capability '{}' ({:?}, {})", name, cap_type, status);
        self.announce(name, None, status);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> KernelResult<()> {
        let mut entries = self.lock()?;
        let index = entries
            .iter()
            .position(|e| e.capability.name == name)
            .ok_or_else(|| KernelError::not_found(format!("capability '{}'", name)))?;
        entries.remove(index);
        drop(entries);

        log::info!(target: LOG_TARGET, "unregistered capability '{}'", name);
        Ok(())
    }

    pub fn get(&self, name: &str) -> KernelResult<Capability> {
        self.lock()?
            .iter()
            .find(|e| e.capability.name == name)
            .map(|e| e.capability.clone())
            .ok_or_else(|| KernelError::not_found(format!("capability '{}'", name)))
    }

    /// Typed lookup; `InvalidArgument` if the API is not a `T`
    pub fn get_api<T>(&self, name: &str) -> KernelResult<Arc<T>>
    where
        T: ?Sized + Any + Send + Sync,
    {
        self.get(name)?.api::<T>().ok_or_else(|| {
            KernelError::invalid_argument(format!(
                "capability '{}' is not a {}",
                name,
                std::any::type_name::<T>()
            ))
        })
    }

    pub fn get_type(&self, name: &str) -> KernelResult<CapabilityType> {
        self.lock()?
            .iter()
            .find(|e| e.capability.name == name)
            .map(|e| e.capability.cap_type)
            .ok_or_else(|| KernelError::not_found(format!("capability '{}'", name)))
    }

    /// First capability of `cap_type`, in registration order
    pub fn lookup_first_by_type(&self, cap_type: CapabilityType) -> KernelResult<Capability> {
        self.lock()?
            .iter()
            .find(|e| e.capability.cap_type == cap_type)
            .map(|e| e.capability.clone())
            .ok_or_else(|| KernelError::not_found(format!("no capability of type {:?}", cap_type)))
    }

    /// Set the status, announcing it when it actually changed
    pub fn set_status(&self, name: &str, status: CapabilityStatus) -> KernelResult<()> {
        let old = {
            let mut entries = self.lock()?;
            let entry = entries
                .iter_mut()
                .find(|e| e.capability.name == name)
                .ok_or_else(|| KernelError::not_found(format!("capability '{}'", name)))?;
            std::mem::replace(&mut entry.status, status)
        };

        if old != status {
            log::debug!(target: LOG_TARGET, "capability '{}': {} -> {}", name, old, status);
            self.announce(name, Some(old), status);
        }
        Ok(())
    }

    pub fn get_status(&self, name: &str) -> KernelResult<CapabilityStatus> {
        self.lock()?
            .iter()
            .find(|e| e.capability.name == name)
            .map(|e| e.status)
            .ok_or_else(|| KernelError::not_found(format!("capability '{}'", name)))
    }

    pub fn list(&self) -> KernelResult<Vec<CapabilityInfo>> {
        Ok(self
            .lock()?
            .iter()
            .map(|e| CapabilityInfo {
                name: e.capability.name.clone(),
                cap_type: e.capability.cap_type,
                status: e.status,
            })
            .collect())
    }

    /// Registered capabilities
    pub fn count(&self) -> KernelResult<usize> {
        Ok(self.lock()?.len())
    }

    fn announce(&self, name: &str, old: Option<CapabilityStatus>, new: CapabilityStatus) {
        let payload = Payload::new(CapabilityStatusChange {
            name: name.to_string(),
            old,
            new,
        });
        if let Err(e) = self.bus.publish(CAPABILITY_STATUS_CHANGED, Some(&payload)) {
            log::warn!(target: LOG_TARGET, "status change of '{}' not announced: {}", name, e);
        }
    }
}
