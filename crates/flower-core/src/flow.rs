//! Compiled Flows
//!
//! The byte-exact form of a rule as the hardware consumes it, plus the
//! resource bindings needed to tear it down again.

use std::net::IpAddr;

use bitflags::bitflags;

use crate::action::RssConf;
use crate::tunnel::NeighborNotice;

bitflags! {
    /// Flow metadata flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MetaFlags: u8 {
        /// Firmware must (un)program the mask along with the flow
        const MANAGE_MASK = 0x80;
    }
}

/// Action shortcut: drop
pub const SHORTCUT_DROP: u32 = 0x8000_0000;
/// Action shortcut: none, run the action list
pub const SHORTCUT_NULL: u32 = 0;
/// Action shortcut: pop VLAN
pub const SHORTCUT_POP_VLAN: u32 = 0x6a00_0000;

/// Bytes per long word in buffer length fields
pub const LW_SHIFT: usize = 2;

/// Rule metadata header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlowMeta {
    /// Key length in long words
    pub key_len: u16,
    /// Mask length in long words
    pub mask_len: u16,
    /// Action length in long words
    pub act_len: u16,
    /// Flags
    pub flags: MetaFlags,
    /// Action shortcut
    pub shortcut: u32,
    /// Stats context
    pub host_ctx_id: u32,
    /// Caller cookie
    pub cookie: u64,
    /// Engine version at the last change
    pub flow_version: u64,
}

/// What kind of rule a flow is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FlowType {
    /// Plain match/action rule
    #[default]
    Common,
    /// Encapsulates into a tunnel
    Encap,
    /// Terminates a tunnel
    Decap,
    /// Spreads over receive queues
    Rss,
}

/// Caller-visible flow identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowHandle(pub u64);

/// Pre-tunnel row held by a decap flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreTunnelBinding {
    /// Owner port MAC
    pub mac: [u8; 6],
    /// Row index
    pub index: u16,
}

/// Tunnel cache rows held by a flow
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelBinding {
    /// Offloaded tunnel endpoint
    pub ip_offload: Option<IpAddr>,
    /// Tunnel neighbor
    pub neighbor: Option<NeighborNotice>,
    /// Pre-tunnel MAC row
    pub pre_tunnel: Option<PreTunnelBinding>,
    /// Tunnel runs over IPv6
    pub is_v6: bool,
}

/// A rule in hardware form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledFlow {
    /// Metadata header
    pub meta: FlowMeta,
    /// Exact key
    pub exact: Vec<u8>,
    /// Key mask
    pub mask: Vec<u8>,
    /// Action records
    pub actions: Vec<u8>,
    /// Digest of the exact key
    pub hash_key: u32,
    /// Program into hardware
    pub install: bool,
    /// May be shared by identical rules
    pub merge: bool,
    /// Rule kind
    pub kind: FlowType,
    /// Port the rule was created on
    pub owner: u16,
    /// Hardware mask id
    pub mask_id: u8,
    /// Stats context
    pub stats_ctx: u32,
    /// Referenced meter
    pub meter: Option<u32>,
    /// Tunnel cache rows
    pub tunnel: TunnelBinding,
    /// RSS spread
    pub rss: Option<RssConf>,
}

impl CompiledFlow {
    /// Key length in bytes
    pub fn key_size(&self) -> usize {
        self.exact.len()
    }
}
