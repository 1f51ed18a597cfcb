// Dependency injection through service and handle config keys
use kestrel_core::{
    CapabilityType, Dependency, Kernel, KernelConfig, KernelError, KernelResult, Module,
    ModuleContext, ModuleSpec, ModuleStatus, Resolved, WeakModuleHandle,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

trait I2cBus: Send + Sync {
    fn read(&self, addr: u8) -> u8;
}

struct FakeBus;

impl I2cBus for FakeBus {
    fn read(&self, addr: u8) -> u8 {
        addr.wrapping_add(1)
    }
}

/// Registers the `i2c0` capability during init
struct BusDriver;

impl Module for BusDriver {
    fn init(&self, ctx: &ModuleContext<'_>) -> KernelResult<()> {
        let bus: Arc<dyn I2cBus> = Arc::new(FakeBus);
        ctx.provide("i2c0", CapabilityType::I2cBus, bus)
    }
}

/// Needs an I2C bus and, optionally, a display module
#[derive(Default)]
struct Sensor {
    bus: Mutex<Option<Arc<dyn I2cBus>>>,
    display: Mutex<Option<String>>,
}

impl Module for Sensor {
    fn dependencies(&self) -> Vec<Dependency> {
        vec![
            Dependency::required("i2c_bus_service"),
            Dependency::optional("display_handle"),
        ]
    }

    fn inject(&self, key: &str, dependency: Resolved) -> KernelResult<()> {
        match (key, dependency) {
            ("i2c_bus_service", Resolved::Service(cap)) => {
                let api = cap
                    .api::<dyn I2cBus>()
                    .ok_or_else(|| KernelError::invalid_argument("not an I2C bus"))?;
                *self.bus.lock() = Some(api);
                Ok(())
            }
            ("display_handle", Resolved::Module(handle)) => {
                *self.display.lock() = Some(handle.name().to_string());
                Ok(())
            }
            (key, _) => Err(KernelError::invalid_argument(format!("unexpected '{}'", key))),
        }
    }

    fn init(&self, _ctx: &ModuleContext<'_>) -> KernelResult<()> {
        let bus = self.bus.lock().clone().ok_or_else(|| KernelError::invalid_state("no bus"))?;
        if bus.read(0x40) != 0x41 {
            return Err(KernelError::failed("sensor probe failed"));
        }
        Ok(())
    }
}

struct Display;
impl Module for Display {}

/// Declares a key with neither suffix
struct Misconfigured;

impl Module for Misconfigured {
    fn dependencies(&self) -> Vec<Dependency> {
        vec![Dependency::required("display")]
    }
}

fn add_all(kernel: &Kernel, sensor: Arc<Sensor>) {
    struct Shared(Arc<Sensor>);
    impl Module for Shared {
        fn dependencies(&self) -> Vec<Dependency> {
            self.0.dependencies()
        }
        fn inject(&self, key: &str, dependency: Resolved) -> KernelResult<()> {
            self.0.inject(key, dependency)
        }
        fn init(&self, ctx: &ModuleContext<'_>) -> KernelResult<()> {
            self.0.init(ctx)
        }
    }

    kernel
        .add(&ModuleSpec::new("bus", "i2c").with_rank(10), Box::new(BusDriver))
        .unwrap();
    kernel
        .add(&ModuleSpec::new("lcd", "display").with_rank(20), Box::new(Display))
        .unwrap();
    kernel
        .add(
            &ModuleSpec::new("env", "bme280").with_rank(30).with_config(json!({
                "i2c_bus_service": "i2c0",
                "display_handle": "lcd"
            })),
            Box::new(Shared(sensor)),
        )
        .unwrap();
}

#[test]
fn test_service_and_handle_injected() {
    let kernel = Kernel::new(KernelConfig::default()).unwrap();
    let sensor = Arc::new(Sensor::default());
    add_all(&kernel, sensor.clone());
    kernel.boot().unwrap();

    assert_eq!(kernel.status("env").unwrap(), ModuleStatus::Running);
    assert!(sensor.bus.lock().is_some());
    assert_eq!(sensor.display.lock().as_deref(), Some("lcd"));
}

#[test]
fn test_strict_mode_requires_active_capability() {
    // The bus capability is still INITIALIZING when the sensor initializes,
    // because capabilities only become ACTIVE in the start pass.
    let kernel = Kernel::new(KernelConfig::strict()).unwrap();
    let sensor = Arc::new(Sensor::default());
    add_all(&kernel, sensor.clone());
    kernel.boot().unwrap();

    assert_eq!(kernel.status("bus").unwrap(), ModuleStatus::Running);
    assert_eq!(kernel.status("env").unwrap(), ModuleStatus::Error);
    assert!(sensor.bus.lock().is_none());
}

#[test]
fn test_missing_required_dependency_fails_init() {
    let kernel = Kernel::new(KernelConfig::default()).unwrap();
    kernel
        .add(
            &ModuleSpec::new("env", "bme280").with_config(json!({ "i2c_bus_service": "i2c7" })),
            Box::new(Sensor::default()),
        )
        .unwrap();
    kernel.boot().unwrap();

    assert_eq!(kernel.status("env").unwrap(), ModuleStatus::Error);
}

#[test]
fn test_malformed_dependency_key_rejected() {
    let kernel = Kernel::new(KernelConfig::default()).unwrap();
    let err = kernel
        .add(&ModuleSpec::new("bad", "misconfigured"), Box::new(Misconfigured))
        .unwrap_err();
    assert_eq!(err.kind(), kestrel_core::ErrorKind::InvalidArgument);
    assert!(kernel.module("bad").is_err());
}

/// Keeps a handle to its peer and counts its own drop
struct Peer {
    peer: Mutex<Option<WeakModuleHandle>>,
    dropped: Arc<AtomicUsize>,
}

impl Module for Peer {
    fn dependencies(&self) -> Vec<Dependency> {
        vec![Dependency::required("peer_handle")]
    }

    fn inject(&self, _key: &str, dependency: Resolved) -> KernelResult<()> {
        let Resolved::Module(handle) = dependency else {
            return Err(KernelError::invalid_argument("expected a module"));
        };
        *self.peer.lock() = Some(handle);
        Ok(())
    }

    fn init(&self, _ctx: &ModuleContext<'_>) -> KernelResult<()> {
        let peer = self.peer.lock().as_ref().and_then(WeakModuleHandle::upgrade);
        peer.map(|_| ()).ok_or_else(|| KernelError::not_found("peer"))
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_mutual_handles_do_not_leak() {
    let dropped = Arc::new(AtomicUsize::new(0));
    let kernel = Kernel::new(KernelConfig::default()).unwrap();
    for (name, peer) in [("left", "right"), ("right", "left")] {
        let module = Peer {
            peer: Mutex::new(None),
            dropped: dropped.clone(),
        };
        kernel
            .add(
                &ModuleSpec::new(name, "peer").with_config(json!({ "peer_handle": peer })),
                Box::new(module),
            )
            .unwrap();
    }
    kernel.boot().unwrap();
    assert_eq!(kernel.status("left").unwrap(), ModuleStatus::Running);
    assert_eq!(kernel.status("right").unwrap(), ModuleStatus::Running);

    let left = kernel.module("left").unwrap().downgrade();
    drop(kernel);
    assert!(left.upgrade().is_none());
    assert_eq!(dropped.load(Ordering::SeqCst), 2);
}
