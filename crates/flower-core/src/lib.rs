//! Flower Flow Offload Engine
//!
//! Control plane that compiles generic match/action flow rules into the
//! key, mask and action buffers a flower-capable NIC executes, and manages
//! the hardware resources those rules hold.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         FLOW ENGINE                              │
//! │                                                                  │
//! │   items + actions                                                │
//! │         │                                                        │
//! │         ▼                                                        │
//! │  ┌─────────────┐   ┌──────────────┐   ┌─────────────────┐        │
//! │  │   Layout    │──▶│ Key Compiler │──▶│ Action Compiler │        │
//! │  │ Calculator  │   │ (exact/mask) │   │  (action list)  │        │
//! │  └─────────────┘   └──────────────┘   └────────┬────────┘        │
//! │                                                │                 │
//! │         ┌──────────────────────────────────────┘                 │
//! │         ▼                                                        │
//! │  ┌─────────────┐ ┌─────────────┐ ┌───────────────────────┐       │
//! │  │ Stats Pool  │ │ Mask Table  │ │ Tunnel Caches         │       │
//! │  │ (contexts)  │ │ (mask ids)  │ │ neighbor / pre-tunnel │       │
//! │  └─────────────┘ └─────────────┘ │ / ip offload          │       │
//! │                                  └───────────────────────┘       │
//! │         │                                                        │
//! │         ▼                                                        │
//! │  ┌─────────────┐        ┌──────────────────┐                     │
//! │  │  Registry   │───────▶│ Firmware channel │                     │
//! │  │ (hash key)  │        │    (trait)       │                     │
//! │  └─────────────┘        └──────────────────┘                     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! 1. **All or nothing**: a failed create leaves every pool as it was
//! 2. **Validation is free**: `validate` never keeps a resource
//! 3. **Best-effort teardown**: destroy releases everything, reporting the
//!    first failure

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod action;
pub mod action_compiler;
pub mod engine;
pub mod firmware;
pub mod flow;
pub mod id_pool;
pub mod item;
pub mod key_compiler;
pub mod layout;
pub mod mask;
pub mod meter;
pub mod port;
pub mod registry;
pub mod stats;
pub mod tunnel;

pub use action::{Action, EncapIp, RssConf, TunnelEncap, TunnelKind};
pub use engine::{FlowEngine, ResourceSnapshot};
pub use firmware::{Firmware, FirmwareMessage, LoopbackFirmware, MessageKind};
pub use flow::{CompiledFlow, FlowHandle, FlowMeta, FlowType};
pub use item::{Item, Match};
pub use layout::{KeyLayout, TunnelType};
pub use stats::{FlowCounters, StatsTable};

pub use flower_common::{FlowEngineConfig, FlowerError, FlowerResult};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(layout::MAX_ACTION_SIZE, 1216);
        assert_eq!(flow::LW_SHIFT, 2);
        assert_eq!(layout::act_size::OUTPUT % 4, 0);
        assert_eq!(layout::key_size::UDP_TUN6 - layout::key_size::UDP_TUN4, 24);
    }
}
