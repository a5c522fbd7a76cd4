//! Representor port table

use std::collections::HashMap;

use flower_common::PortConfig;

/// Ports flows can be created on and output to
#[derive(Debug, Default, Clone)]
pub struct PortTable {
    ports: HashMap<u16, PortConfig>,
}

impl PortTable {
    /// Build from configuration
    pub fn from_config(ports: &[PortConfig]) -> Self {
        let mut table = Self::default();
        for port in ports {
            table.insert(port.clone());
        }
        table
    }

    /// Register or replace a port
    pub fn insert(&mut self, port: PortConfig) -> Option<PortConfig> {
        self.ports.insert(port.id, port)
    }

    /// Look up a port
    pub fn get(&self, id: u16) -> Option<&PortConfig> {
        self.ports.get(&id)
    }

    /// Check whether `id` is registered
    pub fn contains(&self, id: u16) -> bool {
        self.ports.contains_key(&id)
    }

    /// Number of ports
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}
