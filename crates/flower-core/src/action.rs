//! Flow Actions
//!
//! What the hardware does with a packet once a rule matched.

use std::net::{Ipv4Addr, Ipv6Addr};

/// Tunnel encapsulation flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelKind {
    /// VXLAN over UDP
    Vxlan,
    /// Geneve over UDP
    Geneve,
    /// NVGRE (GRE with key, transparent ethernet bridging)
    Nvgre,
}

/// Outer IP header of an encapsulation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncapIp {
    /// IPv4 outer header
    V4 {
        /// Local tunnel endpoint
        src: Ipv4Addr,
        /// Remote tunnel endpoint
        dst: Ipv4Addr,
        /// Type of service
        tos: u8,
        /// Time to live
        ttl: u8,
    },
    /// IPv6 outer header
    V6 {
        /// Local tunnel endpoint
        src: Ipv6Addr,
        /// Remote tunnel endpoint
        dst: Ipv6Addr,
        /// Traffic class
        tc: u8,
        /// Hop limit
        hop_limit: u8,
    },
}

impl EncapIp {
    /// Check whether the outer header is IPv6
    pub fn is_v6(&self) -> bool {
        matches!(self, EncapIp::V6 { .. })
    }
}

/// Headers pushed by an encapsulation action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelEncap {
    /// Tunnel flavour
    pub kind: TunnelKind,
    /// Next hop MAC
    pub eth_dst: [u8; 6],
    /// Local MAC
    pub eth_src: [u8; 6],
    /// Outer IP header
    pub ip: EncapIp,
    /// VNI, or the GRE key for NVGRE
    pub vni: u32,
    /// Geneve protocol type
    pub protocol: u16,
}

/// Receive-side scaling spread
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RssConf {
    /// Queues traffic is spread over
    pub queues: Vec<u16>,
    /// Hash types
    pub types: u64,
    /// Hash key
    pub key: Vec<u8>,
}

/// One flow action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// No-op
    Void,
    /// Drop the packet
    Drop,
    /// Count the packet
    Count,
    /// Continue in another group
    Jump(u32),
    /// Send to a representor port
    Output {
        /// Destination port id
        port: u16,
    },
    /// Rewrite source MAC
    SetMacSrc([u8; 6]),
    /// Rewrite destination MAC
    SetMacDst([u8; 6]),
    /// Remove the outer VLAN tag
    PopVlan,
    /// Push a VLAN tag
    PushVlan {
        /// Tag protocol identifier
        ethertype: u16,
    },
    /// VID of the pushed tag
    SetVlanVid(u16),
    /// PCP of the pushed tag
    SetVlanPcp(u8),
    /// Rewrite IPv4 source
    SetIpv4Src(Ipv4Addr),
    /// Rewrite IPv4 destination
    SetIpv4Dst(Ipv4Addr),
    /// Rewrite IPv6 source
    SetIpv6Src(Ipv6Addr),
    /// Rewrite IPv6 destination
    SetIpv6Dst(Ipv6Addr),
    /// Rewrite transport source port
    SetTpSrc(u16),
    /// Rewrite transport destination port
    SetTpDst(u16),
    /// Rewrite TTL / hop limit
    SetTtl(u8),
    /// Rewrite IPv4 DSCP
    SetIpv4Dscp(u8),
    /// Rewrite IPv6 DSCP
    SetIpv6Dscp(u8),
    /// Encapsulate in a tunnel
    Encap(TunnelEncap),
    /// Strip the tunnel headers of a tunnel match
    Decap,
    /// Police through a meter
    Meter {
        /// Meter id
        id: u32,
    },
    /// Tag the packet for the host
    Mark(u32),
    /// Deliver to a receive queue of the owner port
    Queue(u16),
    /// Spread over receive queues of the owner port
    Rss(RssConf),
}

impl Action {
    /// Action name used in errors and logs
    pub fn name(&self) -> &'static str {
        match self {
            Action::Void => "void",
            Action::Drop => "drop",
            Action::Count => "count",
            Action::Jump(_) => "jump",
            Action::Output { .. } => "output",
            Action::SetMacSrc(_) => "set_mac_src",
            Action::SetMacDst(_) => "set_mac_dst",
            Action::PopVlan => "pop_vlan",
            Action::PushVlan { .. } => "push_vlan",
            Action::SetVlanVid(_) => "set_vlan_vid",
            Action::SetVlanPcp(_) => "set_vlan_pcp",
            Action::SetIpv4Src(_) => "set_ipv4_src",
            Action::SetIpv4Dst(_) => "set_ipv4_dst",
            Action::SetIpv6Src(_) => "set_ipv6_src",
            Action::SetIpv6Dst(_) => "set_ipv6_dst",
            Action::SetTpSrc(_) => "set_tp_src",
            Action::SetTpDst(_) => "set_tp_dst",
            Action::SetTtl(_) => "set_ttl",
            Action::SetIpv4Dscp(_) => "set_ipv4_dscp",
            Action::SetIpv6Dscp(_) => "set_ipv6_dscp",
            Action::Encap(_) => "encap",
            Action::Decap => "decap",
            Action::Meter { .. } => "meter",
            Action::Mark(_) => "mark",
            Action::Queue(_) => "queue",
            Action::Rss(_) => "rss",
        }
    }
}
