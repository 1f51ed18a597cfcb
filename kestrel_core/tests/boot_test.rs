// Boot, fault containment and shutdown through the public kernel API
use crossbeam::channel::{self, Sender};
use kestrel_core::events::{SHUTDOWN_REQUESTED, SYSTEM_STARTED};
use kestrel_core::{
    CapabilityStatus, CapabilityType, Kernel, KernelConfig, KernelError, KernelResult, Module,
    ModuleContext, ModuleHandle, ModuleStatus, Payload, SystemConfig,
};
use serde_json::Value;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

/// Provides a capability named after itself; fails `init` when configured to
struct Peripheral {
    fail_init: bool,
}

impl Module for Peripheral {
    fn init(&self, ctx: &ModuleContext<'_>) -> KernelResult<()> {
        let name = format!("{}_api", ctx.name());
        ctx.provide(&name, CapabilityType::Sensor, Arc::new(ctx.name().to_string()))?;
        if self.fail_init {
            return Err(KernelError::failed("sensor did not answer"));
        }
        Ok(())
    }
}

struct Observer {
    events: Sender<String>,
}

impl Module for Observer {
    fn handle_event(&self, event: &str, payload: Option<Payload>) {
        let _ = self.events.send(event.to_string());
        drop(payload);
    }
}

fn kernel() -> Kernel {
    let mut kernel = Kernel::new(KernelConfig::default()).unwrap();
    kernel.register_factory("peripheral", |spec, _| {
        Ok(Box::new(Peripheral {
            fail_init: spec.get_or("fail_init", false),
        }) as Box<dyn Module>)
    });
    kernel
}

fn observe(kernel: &Kernel, event: &str) -> channel::Receiver<String> {
    let (tx, rx) = channel::unbounded();
    let observer = ModuleHandle::new("observer", "observer", 0, Value::Null, Box::new(Observer { events: tx }));
    kernel.services().bus.subscribe(event, &observer).unwrap();
    rx
}

const THREE_MODULES: &str = r#"{
    "first":  { "type": "peripheral", "init_rank": 10 },
    "second": { "type": "peripheral", "init_rank": 20, "config": { "fail_init": true } },
    "third":  { "type": "peripheral", "init_rank": 30 }
}"#;

#[test]
fn test_failed_init_is_contained() {
    let kernel = kernel();
    let started = observe(&kernel, SYSTEM_STARTED);

    let system = SystemConfig::from_json_str(THREE_MODULES).unwrap();
    assert_eq!(kernel.create_all(&system).unwrap(), 3);
    kernel.boot().unwrap();

    let counts = kernel.status_counts();
    assert_eq!(counts.get(&ModuleStatus::Running), Some(&2));
    assert_eq!(counts.get(&ModuleStatus::Error), Some(&1));
    assert_eq!(kernel.status("second").unwrap(), ModuleStatus::Error);

    assert_eq!(started.recv_timeout(Duration::from_secs(1)).unwrap(), SYSTEM_STARTED);
    assert!(started.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn test_capability_status_follows_module() {
    let kernel = kernel();
    kernel
        .create_all(&SystemConfig::from_json_str(THREE_MODULES).unwrap())
        .unwrap();
    kernel.boot().unwrap();

    let caps = &kernel.services().capabilities;
    assert_eq!(caps.get_status("first_api").unwrap(), CapabilityStatus::Active);
    assert_eq!(caps.get_status("second_api").unwrap(), CapabilityStatus::Error);
    assert_eq!(caps.get_status("third_api").unwrap(), CapabilityStatus::Active);
    assert_eq!(*caps.get_api::<String>("third_api").unwrap(), "third");

    kernel.shutdown();
    assert_eq!(caps.count().unwrap(), 0);
    assert_eq!(kernel.status("first").unwrap(), ModuleStatus::Stopped);
}

#[test]
fn test_modules_listed_in_boot_order() {
    let kernel = kernel();
    kernel
        .create_all(&SystemConfig::from_json_str(THREE_MODULES).unwrap())
        .unwrap();

    let names: Vec<String> = kernel.modules().into_iter().map(|m| m.name).collect();
    assert_eq!(names, vec!["first", "second", "third"]);
    assert!(kernel
        .modules()
        .iter()
        .all(|m| m.status == ModuleStatus::Uninitialized));
}

#[test]
fn test_shutdown_announced() {
    let kernel = kernel();
    let shutdown = observe(&kernel, SHUTDOWN_REQUESTED);
    kernel.boot().unwrap();

    kernel.shutdown();
    assert_eq!(
        shutdown.recv_timeout(Duration::from_secs(1)).unwrap(),
        SHUTDOWN_REQUESTED
    );
    assert!(kernel.services().bus.publish(SYSTEM_STARTED, None).is_err());
}

#[test]
fn test_boot_from_config_file() {
    let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    file.write_all(THREE_MODULES.as_bytes()).unwrap();

    let system = SystemConfig::load_from_disk(file.path()).unwrap();
    let kernel = kernel();
    kernel.create_all(&system).unwrap();
    kernel.boot().unwrap();

    assert_eq!(kernel.status("third").unwrap(), ModuleStatus::Running);
}
