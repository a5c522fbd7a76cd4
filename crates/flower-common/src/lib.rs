//! Flower Common - shared building blocks for the flow offload engine
//!
//! This crate provides the pieces every other flower crate leans on:
//! - Error taxonomy (`FlowerError`, `FlowerResult`)
//! - Seeded Jenkins lookup3 digest used to index masks and flows
//! - Engine configuration (serde, JSON on disk)
//! - Tracing subscriber bootstrap

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod hash;
pub mod telemetry;

pub use config::{FeatureFlags, FlowEngineConfig, MeterConfig, PortConfig, PreTunnelRelease};
pub use error::*;
pub use hash::jhash;

/// Number of bits of a stats context id that carry the slot index
pub const STATS_INDEX_BITS: u32 = 22;

/// Largest number of memory units a stats context id can address
pub const MAX_MEM_UNITS: u32 = 1 << (32 - STATS_INDEX_BITS);
