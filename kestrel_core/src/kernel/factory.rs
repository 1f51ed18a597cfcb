use crate::config::ModuleSpec;
use crate::core::{Module, Services};
use crate::error::KernelResult;
use std::collections::HashMap;

/// Builds a module from its config entry
pub type ModuleFactory =
    Box<dyn Fn(&ModuleSpec, &Services) -> KernelResult<Box<dyn Module>> + Send + Sync>;

/// Module type name to factory
#[derive(Default)]
pub struct FactoryRegistry {
    factories: HashMap<String, ModuleFactory>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` for `module_type`, replacing any previous one
    pub fn register<F>(&mut self, module_type: &str, factory: F) -> bool
    where
        F: Fn(&ModuleSpec, &Services) -> KernelResult<Box<dyn Module>> + Send + Sync + 'static,
    {
        self.factories
            .insert(module_type.to_string(), Box::new(factory))
            .is_some()
    }

    pub fn get(&self, module_type: &str) -> Option<&ModuleFactory> {
        self.factories.get(module_type)
    }

    pub fn contains(&self, module_type: &str) -> bool {
        self.factories.contains_key(module_type)
    }

    /// Registered type names, sorted
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}
