//! Registry of named adapter configurations.
//!
//! This module provides functionality for:
//! - Registering named adapter configs in insertion order
//! - Tracking the active adapter selection
//! - Removing adapters without reassigning the active selection

use crate::config::{PeftConfig, PeftType};
use crate::error::{PeftError, Result};

/// Registry mapping adapter names to their configurations.
///
/// The first registered adapter becomes active; later ones do not.
#[derive(Debug, Clone, Default)]
pub struct AdapterRegistry {
    /// Adapter configs in insertion order
    adapters: Vec<(String, PeftConfig)>,
    /// Currently active adapter names
    active_adapters: Vec<String>,
}

impl AdapterRegistry {
    /// Create a new empty adapter registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new adapter config with the given name.
    ///
    /// # Arguments
    /// * `name` - Unique name for the adapter
    /// * `config` - The adapter's configuration
    ///
    /// # Errors
    /// Returns an error if an adapter with this name already exists
    pub fn register_adapter(&mut self, name: impl Into<String>, config: PeftConfig) -> Result<()> {
        let name = name.into();

        if self.contains_adapter(&name) {
            return Err(PeftError::AdapterExists { name });
        }

        if self.adapters.is_empty() {
            self.active_adapters = vec![name.clone()];
        }
        self.adapters.push((name, config));

        Ok(())
    }

    /// Set the active adapters by name.
    ///
    /// # Errors
    /// Returns an error if any name is not registered
    pub fn set_active_adapters(&mut self, names: &[String]) -> Result<()> {
        if let Some(missing) = names.iter().find(|n| !self.contains_adapter(n)) {
            return Err(PeftError::AdapterNotFound {
                name: missing.clone(),
            });
        }
        self.active_adapters = names.to_vec();
        Ok(())
    }

    /// Names of the active adapters.
    #[must_use]
    pub fn active_adapters(&self) -> &[String] {
        &self.active_adapters
    }

    /// The single active adapter, if exactly one is active.
    #[must_use]
    pub fn active_adapter_name(&self) -> Option<&str> {
        match self.active_adapters.as_slice() {
            [name] => Some(name),
            _ => None,
        }
    }

    /// Get the config of an adapter by name.
    ///
    /// # Errors
    /// Returns an error if no adapter with this name exists
    pub fn get_config(&self, name: &str) -> Result<&PeftConfig> {
        self.adapters
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c)
            .ok_or_else(|| PeftError::AdapterNotFound {
                name: name.to_string(),
            })
    }

    /// Get a mutable config by name.
    ///
    /// # Errors
    /// Returns an error if no adapter with this name exists
    pub fn get_config_mut(&mut self, name: &str) -> Result<&mut PeftConfig> {
        self.adapters
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c)
            .ok_or_else(|| PeftError::AdapterNotFound {
                name: name.to_string(),
            })
    }

    /// Check if an adapter with the given name exists.
    #[must_use]
    pub fn contains_adapter(&self, name: &str) -> bool {
        self.adapters.iter().any(|(n, _)| n == name)
    }

    /// Registered adapter names in insertion order.
    #[must_use]
    pub fn adapter_names(&self) -> Vec<&str> {
        self.adapters.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Iterate over `(name, config)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PeftConfig)> {
        self.adapters.iter().map(|(n, c)| (n.as_str(), c))
    }

    /// Family shared by the registered adapters.
    #[must_use]
    pub fn peft_type(&self) -> Option<PeftType> {
        self.adapters.first().map(|(_, c)| c.peft_type())
    }

    /// Get the number of registered adapters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    /// Check if the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Remove an adapter by name.
    ///
    /// A removed active adapter leaves the active selection without it;
    /// no other adapter is activated in its place.
    ///
    /// # Returns
    /// The removed config, if it existed
    pub fn remove_adapter(&mut self, name: &str) -> Option<PeftConfig> {
        let index = self.adapters.iter().position(|(n, _)| n == name)?;
        self.active_adapters.retain(|n| n != name);
        Some(self.adapters.remove(index).1)
    }
}
