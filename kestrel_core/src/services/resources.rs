use crate::config::KernelConfig;
use crate::error::{KernelError, KernelResult};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

const LOG_TARGET: &str = "kestrel::resources";

/// Kinds of exclusive hardware lines, each arbitrated independently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Gpio,
    I2cPort,
    SpiHost,
    UartPort,
    AdcChannel,
    PwmChannel,
    TimerGroup,
}

impl ResourceType {
    pub const ALL: [ResourceType; 7] = [
        ResourceType::Gpio,
        ResourceType::I2cPort,
        ResourceType::SpiHost,
        ResourceType::UartPort,
        ResourceType::AdcChannel,
        ResourceType::PwmChannel,
        ResourceType::TimerGroup,
    ];

    /// Number of valid ids for this type (ids are `0..capacity`)
    pub fn capacity(&self) -> u8 {
        match self {
            ResourceType::Gpio => 64,
            ResourceType::I2cPort => 2,
            ResourceType::SpiHost => 4,
            ResourceType::UartPort => 3,
            ResourceType::AdcChannel => 20,
            ResourceType::PwmChannel => 16,
            ResourceType::TimerGroup => 4,
        }
    }

    fn index(&self) -> usize {
        match self {
            ResourceType::Gpio => 0,
            ResourceType::I2cPort => 1,
            ResourceType::SpiHost => 2,
            ResourceType::UartPort => 3,
            ResourceType::AdcChannel => 4,
            ResourceType::PwmChannel => 5,
            ResourceType::TimerGroup => 6,
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceType::Gpio => "GPIO",
            ResourceType::I2cPort => "I2C port",
            ResourceType::SpiHost => "SPI host",
            ResourceType::UartPort => "UART port",
            ResourceType::AdcChannel => "ADC channel",
            ResourceType::PwmChannel => "PWM channel",
            ResourceType::TimerGroup => "timer group",
        };
        f.write_str(s)
    }
}

/// Taken-bitmap plus owner names for one resource type
struct Pool {
    taken: u64,
    owners: Vec<Option<String>>,
}

impl Pool {
    fn new(capacity: u8) -> Self {
        Self {
            taken: 0,
            owners: vec![None; capacity as usize],
        }
    }

    fn is_taken(&self, id: u8) -> bool {
        self.taken & (1u64 << id) != 0
    }
}

/// Exclusive ownership ledger for shared hardware lines
///
/// Each resource type has its own lock, so contention on one kind of line
/// never delays arbitration of another.
pub struct ResourceArbiter {
    pools: Vec<Mutex<Pool>>,
    lock_timeout: Duration,
}

impl ResourceArbiter {
    pub fn new(config: &KernelConfig) -> Self {
        Self {
            pools: ResourceType::ALL
                .iter()
                .map(|t| Mutex::new(Pool::new(t.capacity())))
                .collect(),
            lock_timeout: config.lock_timeout(),
        }
    }

    fn pool(&self, rtype: ResourceType, id: u8) -> KernelResult<MutexGuard<'_, Pool>> {
        if id >= rtype.capacity() {
            return Err(KernelError::invalid_argument(format!(
                "{} {} out of range (max {})",
                rtype,
                id,
                rtype.capacity() - 1
            )));
        }
        self.pools[rtype.index()]
            .try_lock_for(self.lock_timeout)
            .ok_or_else(|| KernelError::timeout(format!("{} pool lock", rtype)))
    }

    /// Take `id` for `owner`; `InvalidState` naming the holder if already taken
    pub fn lock(&self, rtype: ResourceType, id: u8, owner: &str) -> KernelResult<()> {
        if owner.is_empty() {
            return Err(KernelError::invalid_argument("empty resource owner"));
        }

        let mut pool = self.pool(rtype, id)?;
        if pool.is_taken(id) {
            let holder = pool.owners[id as usize].as_deref().unwrap_or("<unknown>");
            log::warn!(
                target: LOG_TARGET,
                "'{}' denied {} {}: owned by '{}'",
                owner,
                rtype,
                id,
                holder
            );
            return Err(KernelError::invalid_state(format!(
                "{} {} already owned by '{}'",
                rtype, id, holder
            )));
        }

        pool.taken |= 1u64 << id;
        pool.owners[id as usize] = Some(owner.to_string());
        log::debug!(target: LOG_TARGET, "{} {} locked by '{}'", rtype, id, owner);
        Ok(())
    }

    /// Give `id` back; only the recorded owner may do so
    pub fn release(&self, rtype: ResourceType, id: u8, owner: &str) -> KernelResult<()> {
        let mut pool = self.pool(rtype, id)?;
        if !pool.is_taken(id) {
            return Err(KernelError::not_found(format!("{} {} is not locked", rtype, id)));
        }
        if pool.owners[id as usize].as_deref() != Some(owner) {
            return Err(KernelError::invalid_state(format!(
                "{} {} is owned by '{}', not '{}'",
                rtype,
                id,
                pool.owners[id as usize].as_deref().unwrap_or("<unknown>"),
                owner
            )));
        }

        pool.taken &= !(1u64 << id);
        pool.owners[id as usize] = None;
        log::debug!(target: LOG_TARGET, "{} {} released by '{}'", rtype, id, owner);
        Ok(())
    }

    /// Reports `true` when the pool lock cannot be taken in time
    pub fn is_locked(&self, rtype: ResourceType, id: u8) -> bool {
        match self.pool(rtype, id) {
            Ok(pool) => pool.is_taken(id),
            Err(KernelError::InvalidArgument(_)) => false,
            Err(_) => true,
        }
    }

    pub fn get_owner(&self, rtype: ResourceType, id: u8) -> KernelResult<String> {
        let pool = self.pool(rtype, id)?;
        pool.owners[id as usize]
            .clone()
            .ok_or_else(|| KernelError::not_found(format!("{} {} is not locked", rtype, id)))
    }

    /// Every line currently held by `owner`
    pub fn owned_by(&self, owner: &str) -> KernelResult<Vec<(ResourceType, u8)>> {
        let mut held = Vec::new();
        for rtype in ResourceType::ALL {
            let pool = self.pools[rtype.index()]
                .try_lock_for(self.lock_timeout)
                .ok_or_else(|| KernelError::timeout(format!("{} pool lock", rtype)))?;
            for (id, slot) in pool.owners.iter().enumerate() {
                if slot.as_deref() == Some(owner) {
                    held.push((rtype, id as u8));
                }
            }
        }
        Ok(held)
    }

    /// Release everything `owner` holds, returning the count
    pub fn release_all(&self, owner: &str) -> KernelResult<usize> {
        let held = self.owned_by(owner)?;
        Ok(held
            .iter()
            .filter(|(rtype, id)| self.release(*rtype, *id, owner).is_ok())
            .count())
    }
}
