use crate::error::{KernelError, KernelResult};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::Path;

/// Rank given to modules whose entry does not set one
pub const DEFAULT_INIT_RANK: i32 = 100;

/// One module entry of the persisted document
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleSpec {
    /// Registry name, unique across the system
    pub instance_name: String,
    /// Factory key
    pub module_type: String,
    /// Lower ranks initialize earlier
    pub init_rank: i32,
    pub enabled: bool,
    /// Module-specific `config` object
    pub config: Value,
}

#[derive(Deserialize)]
struct RawEntry {
    #[serde(rename = "type")]
    module_type: String,
    #[serde(default)]
    init_rank: Option<i32>,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    config: Option<Value>,
}

fn default_enabled() -> bool {
    true
}

impl ModuleSpec {
    pub fn new(instance_name: &str, module_type: &str) -> Self {
        Self {
            instance_name: instance_name.to_string(),
            module_type: module_type.to_string(),
            init_rank: DEFAULT_INIT_RANK,
            enabled: true,
            config: Value::Object(Map::new()),
        }
    }

    pub fn with_rank(mut self, init_rank: i32) -> Self {
        self.init_rank = init_rank;
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Typed read of a key in the `config` object
    pub fn get<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Option<T> {
        let value = self.config.get(key)?;
        serde_json::from_value(value.clone()).ok()
    }

    pub fn get_or<T: for<'de> Deserialize<'de>>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }
}

/// Read-only view of the persisted module document
///
/// ```json
/// {
///   "status_led": { "type": "led", "init_rank": 20, "config": { "pin": 5 } },
///   "env_sensor": { "type": "bme280", "config": { "i2c_bus_service": "i2c0" } }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemConfig {
    modules: Vec<ModuleSpec>,
}

impl SystemConfig {
    pub fn new(modules: Vec<ModuleSpec>) -> Self {
        Self { modules }
    }

    pub fn from_value(doc: &Value) -> KernelResult<Self> {
        let entries = doc
            .as_object()
            .ok_or_else(|| KernelError::config("system config must be a JSON object"))?;

        let mut modules = Vec::with_capacity(entries.len());
        for (key, raw) in entries {
            let entry: RawEntry = serde_json::from_value(raw.clone()).map_err(|e| {
                KernelError::config(format!("module entry '{}': {}", key, e))
            })?;
            let config = entry.config.unwrap_or_else(|| Value::Object(Map::new()));
            if !config.is_object() {
                return Err(KernelError::config(format!(
                    "module entry '{}': config must be an object",
                    key
                )));
            }
            let instance_name = config
                .get("instance_name")
                .and_then(Value::as_str)
                .unwrap_or(key)
                .to_string();
            if instance_name.is_empty() {
                return Err(KernelError::config(format!(
                    "module entry '{}': empty instance name",
                    key
                )));
            }
            if modules.iter().any(|m: &ModuleSpec| m.instance_name == instance_name) {
                return Err(KernelError::config(format!(
                    "duplicate module instance name '{}'",
                    instance_name
                )));
            }

            modules.push(ModuleSpec {
                instance_name,
                module_type: entry.module_type,
                init_rank: entry.init_rank.unwrap_or(DEFAULT_INIT_RANK),
                enabled: entry.enabled,
                config,
            });
        }

        Ok(Self { modules })
    }

    pub fn from_json_str(s: &str) -> KernelResult<Self> {
        let doc: Value = serde_json::from_str(s)?;
        Self::from_value(&doc)
    }

    pub fn load_from_disk(path: &Path) -> KernelResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn modules(&self) -> &[ModuleSpec] {
        &self.modules
    }

    pub fn module(&self, instance_name: &str) -> Option<&ModuleSpec> {
        self.modules.iter().find(|m| m.instance_name == instance_name)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"{
        "status_led": { "type": "led", "init_rank": 20, "config": { "pin": 5 } },
        "sensor": { "type": "bme280", "config": { "instance_name": "env", "i2c_bus_service": "i2c0" } },
        "spare": { "type": "led", "enabled": false }
    }"#;

    #[test]
    fn test_parse_document() {
        let system = SystemConfig::from_json_str(DOC).unwrap();
        assert_eq!(system.len(), 3);

        let led = system.module("status_led").unwrap();
        assert_eq!(led.module_type, "led");
        assert_eq!(led.init_rank, 20);
        assert_eq!(led.get::<u32>("pin"), Some(5));

        let env = system.module("env").unwrap();
        assert_eq!(env.init_rank, DEFAULT_INIT_RANK);
        assert_eq!(env.get_str("i2c_bus_service"), Some("i2c0"));

        assert!(!system.module("spare").unwrap().enabled);
    }

    #[test]
    fn test_missing_type_rejected() {
        let err = SystemConfig::from_json_str(r#"{ "x": { "config": {} } }"#).unwrap_err();
        assert!(err.to_string().contains("'x'"));
    }

    #[test]
    fn test_duplicate_instance_name_rejected() {
        let doc = r#"{
            "a": { "type": "led", "config": { "instance_name": "same" } },
            "b": { "type": "led", "config": { "instance_name": "same" } }
        }"#;
        assert!(SystemConfig::from_json_str(doc).is_err());
    }
}
