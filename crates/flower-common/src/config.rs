//! Engine Configuration

use serde::{Deserialize, Serialize};

use crate::{FlowerError, FlowerResult, MAX_MEM_UNITS, STATS_INDEX_BITS};

/// Flow engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowEngineConfig {
    /// Number of hardware stats contexts
    pub ctx_count: u32,
    /// Number of memory units the stats contexts are split across
    pub ctx_split: u32,
    /// Digest seed; chosen at random on start-up when absent
    pub hash_seed: Option<u32>,
    /// Size of the pre-tunnel MAC table, index 0 included
    pub pre_tunnel_limit: u16,
    /// When pre-tunnel MAC rows are handed back to the hardware
    pub pre_tunnel_release: PreTunnelRelease,
    /// Optional firmware capabilities
    pub features: FeatureFlags,
    /// Representor ports flows may be created on
    pub ports: Vec<PortConfig>,
    /// Meters available to meter actions
    pub meters: Vec<MeterConfig>,
}

impl Default for FlowEngineConfig {
    fn default() -> Self {
        Self {
            ctx_count: 1 << 16,
            ctx_split: 4,
            hash_seed: None,
            pre_tunnel_limit: 32,
            pre_tunnel_release: PreTunnelRelease::default(),
            features: FeatureFlags::default(),
            ports: Vec::new(),
            meters: Vec::new(),
        }
    }
}

impl FlowEngineConfig {
    /// Load from file
    pub fn load(path: &str) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save to file
    pub fn save(&self, path: &str) -> Result<(), std::io::Error> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Stats contexts handed out per memory unit
    pub fn contexts_per_unit(&self) -> u32 {
        if self.ctx_split == 0 {
            return 0;
        }
        self.ctx_count / self.ctx_split
    }

    /// Check the sizing fields against what the hardware can address
    pub fn validate(&self) -> FlowerResult<()> {
        if self.ctx_split == 0 || self.ctx_split > MAX_MEM_UNITS {
            return Err(FlowerError::invalid(format!(
                "ctx_split must be within 1..={MAX_MEM_UNITS}, got {}",
                self.ctx_split
            )));
        }
        if self.ctx_count == 0 || self.ctx_count % self.ctx_split != 0 {
            return Err(FlowerError::invalid(format!(
                "ctx_count {} is not a multiple of ctx_split {}",
                self.ctx_count, self.ctx_split
            )));
        }
        if self.contexts_per_unit() > 1 << STATS_INDEX_BITS {
            return Err(FlowerError::invalid("too many stats contexts per memory unit"));
        }
        if !(2..=64).contains(&self.pre_tunnel_limit) {
            return Err(FlowerError::invalid(format!(
                "pre_tunnel_limit must be within 2..=64, got {}",
                self.pre_tunnel_limit
            )));
        }
        Ok(())
    }
}

/// Pre-tunnel MAC release policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreTunnelRelease {
    /// Drop a row as soon as its own reference count reaches zero
    #[default]
    Refcounted,
    /// Keep released rows programmed until the whole table is unused
    Resident,
}

/// Firmware capability flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    /// Firmware understands the partial (mark/queue) action record
    pub partial_flow: bool,
    /// Firmware tracks decap state per neighbor instead of per pre-tunnel rule
    pub decap_v2: bool,
}

/// Representor port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    /// Port id used by callers
    pub id: u16,
    /// Port id the hardware matches and outputs on
    pub hw_port: u32,
    /// Port MAC address
    pub mac: [u8; 6],
    /// Number of receive queues
    #[serde(default = "default_rx_queues")]
    pub rx_queues: u16,
}

fn default_rx_queues() -> u16 {
    1
}

/// Meter definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterConfig {
    /// Meter id referenced by meter actions
    pub id: u32,
    /// Hardware profile the meter is bound to
    pub profile_id: u32,
    /// May be referenced by more than one flow
    #[serde(default)]
    pub shared: bool,
    /// Disabled meters reject new references
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}
