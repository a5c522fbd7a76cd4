//! Key Compiler
//!
//! Writes match items into the exact and mask key buffers at the offsets
//! a [`KeyLayout`] prescribes, and reads compiled keys back.
//!
//! # Design
//!
//! - Record offsets are fixed up front, so transport items land before the
//!   L3 record regardless of item order
//! - The exact key holds `spec & mask`; the mask key holds the mask in effect
//! - In tunnel rules the outer IP header is written into the tunnel record
//!   and the outer Ethernet/L4 headers are only remembered, not matched
//! - Compiled keys are self-describing: `decode` needs nothing but the bytes

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use flower_common::{FlowerError, FlowerResult};

use crate::item::{EthSpec, Item, Match, TcpSpec, VlanSpec, ETH_P_TEB};
use crate::item::tcp_flags;
use crate::layout::{KeyLayer, KeyLayer2, KeyLayout, TunnelType};

/// Mask id placeholder until the mask is registered
pub const MASK_ID_UNSET: u8 = 0xff;
/// In-port type of tunnel rules
pub const PORT_TYPE_TUN: u32 = 0x5000_0000;
/// GRE tunnel flag: key present
pub const GRE_FLAG_KEY: u16 = 1 << 2;

/// TCP flag bits in the L3 record flags byte
pub mod l3_flags {
    /// FIN
    pub const TCP_FIN: u8 = 1 << 0;
    /// SYN
    pub const TCP_SYN: u8 = 1 << 1;
    /// RST
    pub const TCP_RST: u8 = 1 << 2;
    /// PSH
    pub const TCP_PSH: u8 = 1 << 3;
    /// URG
    pub const TCP_URG: u8 = 1 << 4;
}

const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;
const IPPROTO_SCTP: u8 = 132;

fn map_tcp_flags(flags: u8) -> u8 {
    const MAP: [(u8, u8); 5] = [
        (tcp_flags::FIN, l3_flags::TCP_FIN),
        (tcp_flags::SYN, l3_flags::TCP_SYN),
        (tcp_flags::RST, l3_flags::TCP_RST),
        (tcp_flags::PSH, l3_flags::TCP_PSH),
        (tcp_flags::URG, l3_flags::TCP_URG),
    ];
    MAP.iter()
        .filter(|(wire, _)| flags & wire != 0)
        .fold(0, |acc, (_, bit)| acc | bit)
}

/// Field offsets inside a tunnel record
#[derive(Debug, Clone, Copy)]
struct TunnelFields {
    src: usize,
    dst: usize,
    flags: usize,
    tos: usize,
    ttl: usize,
    ethertype: usize,
    id: usize,
}

impl TunnelFields {
    fn new(at: usize, v6: bool) -> Self {
        let addr = if v6 { 16 } else { 4 };
        let end = at + 2 * addr;
        Self {
            src: at,
            dst: at + addr,
            flags: end,
            tos: end + 2,
            ttl: end + 3,
            ethertype: end + 6,
            id: end + 8,
        }
    }
}

/// Exact and mask buffers written side by side
struct KeyWriter {
    exact: Vec<u8>,
    mask: Vec<u8>,
}

impl KeyWriter {
    fn new(size: usize) -> Self {
        Self {
            exact: vec![0; size],
            mask: vec![0; size],
        }
    }

    fn bytes(&mut self, at: usize, exact: &[u8], mask: &[u8]) {
        self.exact[at..at + exact.len()].copy_from_slice(exact);
        self.mask[at..at + mask.len()].copy_from_slice(mask);
    }

    fn u8(&mut self, at: usize, exact: u8, mask: u8) {
        self.exact[at] = exact;
        self.mask[at] = mask;
    }

    fn or_u8(&mut self, at: usize, exact: u8, mask: u8) {
        self.exact[at] |= exact;
        self.mask[at] |= mask;
    }

    fn u16(&mut self, at: usize, exact: u16, mask: u16) {
        self.bytes(at, &exact.to_be_bytes(), &mask.to_be_bytes());
    }

    fn or_u16(&mut self, at: usize, exact: u16, mask: u16) {
        let e = u16::from_be_bytes([self.exact[at], self.exact[at + 1]]) | exact;
        let m = u16::from_be_bytes([self.mask[at], self.mask[at + 1]]) | mask;
        self.u16(at, e, m);
    }

    fn u32(&mut self, at: usize, exact: u32, mask: u32) {
        self.bytes(at, &exact.to_be_bytes(), &mask.to_be_bytes());
    }
}

/// Facts about the rule collected while compiling its key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyArtifacts {
    /// Outer Ethernet header of a tunnel match
    pub outer_eth: Option<EthSpec>,
    /// Outer VLAN tag of a tunnel match
    pub outer_vlan: Option<VlanSpec>,
    /// Outer source address of a tunnel match
    pub outer_src: Option<IpAddr>,
    /// Outer destination address of a tunnel match
    pub outer_dst: Option<IpAddr>,
    /// Local endpoint the NIC must terminate
    pub tunnel_dst: Option<IpAddr>,
    /// The matched transport is TCP
    pub tcp: bool,
}

/// Output of [`compile`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledKey {
    /// Exact key
    pub exact: Vec<u8>,
    /// Key mask
    pub mask: Vec<u8>,
    /// Collected facts
    pub artifacts: KeyArtifacts,
}

/// In-port word of a rule: the tunnel type for tunnel matches, the
/// matched hardware port otherwise
pub fn in_port_word(layout: &KeyLayout) -> u32 {
    if layout.is_tunnel() {
        PORT_TYPE_TUN | layout.tun_type as u32
    } else {
        layout.port
    }
}

fn need(offset: Option<usize>, record: &str) -> FlowerResult<usize> {
    offset.ok_or_else(|| FlowerError::invalid(format!("key layout has no {record} record")))
}

fn write_ports(w: &mut KeyWriter, at: usize, spec: (u16, u16), mask: (u16, u16)) {
    w.u16(at, spec.0, mask.0);
    w.u16(at + 2, spec.1, mask.1);
}

/// Compile `items` into key buffers shaped by `layout`
pub fn compile(items: &[Item], layout: &KeyLayout) -> FlowerResult<CompiledKey> {
    let offsets = layout.offsets();
    if offsets.end != layout.key_size {
        return Err(FlowerError::invalid("key layout size mismatch"));
    }

    let mut w = KeyWriter::new(layout.key_size);
    let mut art = KeyArtifacts::default();

    let meta = offsets.meta_tci;
    let layer = layout.key_layer.bits();
    w.u8(meta, layer, layer);
    w.u8(meta + 1, MASK_ID_UNSET, MASK_ID_UNSET);
    w.u16(meta + 2, layout.vlan_tci, layout.vlan_tci);

    if let Some(at) = offsets.ext_meta {
        let layer2 = layout.key_layer2.bits();
        w.u32(at, layer2, layer2);
    }

    w.u32(offsets.in_port, in_port_word(layout), u32::MAX);

    let outer_end = layout.tunnel_items.as_ref().map_or(0, |r| r.start);
    let tun = offsets.tunnel.map(|at| TunnelFields::new(at, layout.tun_ipv6()));
    let mut l3: Option<usize> = None;

    for (i, item) in items.iter().enumerate() {
        let outer = i < outer_end;
        match item {
            Item::PortId(_) => {}
            Item::Eth(m) if outer => art.outer_eth = m.values().map(|(s, _)| s),
            Item::Eth(m) => {
                if let Some((s, mask)) = m.values() {
                    let at = need(offsets.mac, "mac")?;
                    w.bytes(at, &s.dst, &mask.dst);
                    w.bytes(at + 6, &s.src, &mask.src);
                    if let Some(at) = offsets.l3_other {
                        w.u16(at + 2, s.ether_type, mask.ether_type);
                    }
                }
            }
            Item::Vlan(m) if outer => art.outer_vlan = m.values().map(|(s, _)| s),
            Item::Vlan(m) => {
                if let Some((s, mask)) = m.values() {
                    w.or_u16(meta + 2, s.tci, mask.tci);
                }
            }
            Item::Ipv4(m) if outer => {
                if let Some((s, mask)) = m.values() {
                    art.outer_src = Some(IpAddr::V4(Ipv4Addr::from(s.src)));
                    art.outer_dst = Some(IpAddr::V4(Ipv4Addr::from(s.dst)));
                    if let Some(t) = tun {
                        w.bytes(t.src, &s.src, &mask.src);
                        w.bytes(t.dst, &s.dst, &mask.dst);
                        w.u8(t.tos, s.tos, mask.tos);
                        w.u8(t.ttl, s.ttl, mask.ttl);
                    }
                }
            }
            Item::Ipv4(m) => {
                let at = need(offsets.ipv4, "ipv4")?;
                l3 = Some(at);
                if let Some((s, mask)) = m.values() {
                    w.u8(at, s.tos, mask.tos);
                    w.u8(at + 1, s.proto, mask.proto);
                    w.u8(at + 2, s.ttl, mask.ttl);
                    w.bytes(at + 4, &s.src, &mask.src);
                    w.bytes(at + 8, &s.dst, &mask.dst);
                }
            }
            Item::Ipv6(m) if outer => {
                if let Some((s, mask)) = m.values() {
                    art.outer_src = Some(IpAddr::V6(Ipv6Addr::from(s.src)));
                    art.outer_dst = Some(IpAddr::V6(Ipv6Addr::from(s.dst)));
                    if let Some(t) = tun {
                        w.bytes(t.src, &s.src, &mask.src);
                        w.bytes(t.dst, &s.dst, &mask.dst);
                        w.u8(t.tos, (s.vtc_flow >> 20) as u8, (mask.vtc_flow >> 20) as u8);
                        w.u8(t.ttl, s.hop_limits, mask.hop_limits);
                    }
                }
            }
            Item::Ipv6(m) => {
                let at = need(offsets.ipv6, "ipv6")?;
                l3 = Some(at);
                if let Some((s, mask)) = m.values() {
                    w.u8(at, (s.vtc_flow >> 20) as u8, (mask.vtc_flow >> 20) as u8);
                    w.u8(at + 1, s.proto, mask.proto);
                    w.u8(at + 2, s.hop_limits, mask.hop_limits);
                    w.u32(at + 4, s.vtc_flow & 0xf_ffff, mask.vtc_flow & 0xf_ffff);
                    w.bytes(at + 8, &s.src, &mask.src);
                    w.bytes(at + 24, &s.dst, &mask.dst);
                }
            }
            Item::Tcp(_) | Item::Udp(_) | Item::Sctp(_) if outer => {}
            Item::Tcp(m) => {
                art.tcp = true;
                compile_tcp(&mut w, m, need(offsets.tp, "tp")?, need(l3, "l3")?);
            }
            Item::Udp(m) => {
                let (tp, l3) = (need(offsets.tp, "tp")?, need(l3, "l3")?);
                w.u8(l3 + 1, IPPROTO_UDP, 0xff);
                if let Some((s, mask)) = m.values() {
                    write_ports(&mut w, tp, (s.src_port, s.dst_port), (mask.src_port, mask.dst_port));
                }
            }
            Item::Sctp(m) => {
                let (tp, l3) = (need(offsets.tp, "tp")?, need(l3, "l3")?);
                w.u8(l3 + 1, IPPROTO_SCTP, 0xff);
                if let Some((s, mask)) = m.values() {
                    write_ports(&mut w, tp, (s.src_port, s.dst_port), (mask.src_port, mask.dst_port));
                }
            }
            Item::Vxlan(m) => {
                let t = tun.ok_or_else(|| FlowerError::invalid("key layout has no tunnel record"))?;
                if let Some((s, mask)) = m.values() {
                    w.u32(t.id, s.vni << 8, mask.vni << 8);
                }
                art.tunnel_dst = art.outer_dst;
            }
            Item::Geneve(m) => {
                let t = tun.ok_or_else(|| FlowerError::invalid("key layout has no tunnel record"))?;
                if let Some((s, mask)) = m.values() {
                    w.u32(t.id, s.vni << 8, mask.vni << 8);
                }
                art.tunnel_dst = art.outer_dst;
            }
            Item::Gre(_) => {
                let t = tun.ok_or_else(|| FlowerError::invalid("key layout has no tunnel record"))?;
                w.u16(t.ethertype, ETH_P_TEB, 0xffff);
            }
            Item::GreKey(m) => {
                let t = tun.ok_or_else(|| FlowerError::invalid("key layout has no tunnel record"))?;
                w.u16(t.flags, GRE_FLAG_KEY, GRE_FLAG_KEY);
                if let Some((s, mask)) = m.values() {
                    w.u32(t.id, s.key, mask.key);
                }
                art.tunnel_dst = art.outer_dst;
            }
        }
    }

    Ok(CompiledKey {
        exact: w.exact,
        mask: w.mask,
        artifacts: art,
    })
}

fn compile_tcp(w: &mut KeyWriter, m: &Match<TcpSpec>, tp: usize, l3: usize) {
    w.u8(l3 + 1, IPPROTO_TCP, 0xff);
    if let Some((s, mask)) = m.values() {
        write_ports(w, tp, (s.src_port, s.dst_port), (mask.src_port, mask.dst_port));
        w.or_u8(l3 + 3, map_tcp_flags(s.flags), map_tcp_flags(mask.flags));
    }
}

/// MAC record fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacFields {
    /// Destination
    pub dst: [u8; 6],
    /// Source
    pub src: [u8; 6],
}

/// Transport ports record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortFields {
    /// Source port
    pub src: u16,
    /// Destination port
    pub dst: u16,
}

/// IPv4 record fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Fields {
    /// Type of service
    pub tos: u8,
    /// Protocol
    pub proto: u8,
    /// Time to live
    pub ttl: u8,
    /// TCP flags
    pub flags: u8,
    /// Source
    pub src: Ipv4Addr,
    /// Destination
    pub dst: Ipv4Addr,
}

/// IPv6 record fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6Fields {
    /// Traffic class
    pub tc: u8,
    /// Next header
    pub proto: u8,
    /// Hop limit
    pub hop_limit: u8,
    /// TCP flags
    pub flags: u8,
    /// Flow label
    pub label: u32,
    /// Source
    pub src: Ipv6Addr,
    /// Destination
    pub dst: Ipv6Addr,
}

/// Tunnel record fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelKeyFields {
    /// Tunnel type
    pub tun_type: TunnelType,
    /// Outer source
    pub src: IpAddr,
    /// Outer destination
    pub dst: IpAddr,
    /// Outer TOS / traffic class
    pub tos: u8,
    /// Outer TTL / hop limit
    pub ttl: u8,
    /// GRE flags
    pub flags: u16,
    /// GRE ethertype
    pub ethertype: u16,
    /// `vni << 8` for UDP tunnels, the key for GRE
    pub tun_id: u32,
}

/// A compiled key read back into fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedKey {
    /// First layer word
    pub key_layer: KeyLayer,
    /// Second layer word
    pub key_layer2: KeyLayer2,
    /// Mask id
    pub mask_id: u8,
    /// VLAN TCI
    pub tci: u16,
    /// In-port word
    pub in_port: u32,
    /// MAC record
    pub mac: Option<MacFields>,
    /// Non-IP ethertype
    pub ether_type: Option<u16>,
    /// Transport ports
    pub ports: Option<PortFields>,
    /// IPv4 record
    pub ipv4: Option<Ipv4Fields>,
    /// IPv6 record
    pub ipv6: Option<Ipv6Fields>,
    /// Tunnel record
    pub tunnel: Option<TunnelKeyFields>,
}

fn be16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

fn be32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn v4(buf: &[u8], at: usize) -> Ipv4Addr {
    Ipv4Addr::new(buf[at], buf[at + 1], buf[at + 2], buf[at + 3])
}

fn v6(buf: &[u8], at: usize) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&buf[at..at + 16]);
    Ipv6Addr::from(octets)
}

fn mac(buf: &[u8], at: usize) -> [u8; 6] {
    let mut out = [0u8; 6];
    out.copy_from_slice(&buf[at..at + 6]);
    out
}

/// Read an exact or mask key back into fields
pub fn decode(buf: &[u8]) -> FlowerResult<DecodedKey> {
    if buf.len() < 8 {
        return Err(FlowerError::invalid("key too short"));
    }
    let key_layer = KeyLayer::from_bits_retain(buf[0]);
    let key_layer2 = if key_layer.contains(KeyLayer::EXT_META) {
        KeyLayer2::from_bits_retain(be32(buf, 4))
    } else {
        KeyLayer2::empty()
    };

    let layout = KeyLayout::from_layers(key_layer, key_layer2);
    let offsets = layout.offsets();
    if offsets.end != buf.len() {
        return Err(FlowerError::invalid(format!(
            "key length {} does not match its layers ({})",
            buf.len(),
            offsets.end
        )));
    }

    let tunnel = offsets.tunnel.map(|at| {
        let is_v6 = layout.tun_ipv6();
        let t = TunnelFields::new(at, is_v6);
        let (src, dst) = if is_v6 {
            (IpAddr::V6(v6(buf, t.src)), IpAddr::V6(v6(buf, t.dst)))
        } else {
            (IpAddr::V4(v4(buf, t.src)), IpAddr::V4(v4(buf, t.dst)))
        };
        let gre = layout.tun_type == TunnelType::Gre;
        TunnelKeyFields {
            tun_type: layout.tun_type,
            src,
            dst,
            tos: buf[t.tos],
            ttl: buf[t.ttl],
            flags: if gre { be16(buf, t.flags) } else { 0 },
            ethertype: if gre { be16(buf, t.ethertype) } else { 0 },
            tun_id: be32(buf, t.id),
        }
    });

    Ok(DecodedKey {
        key_layer,
        key_layer2,
        mask_id: buf[offsets.meta_tci + 1],
        tci: be16(buf, offsets.meta_tci + 2),
        in_port: be32(buf, offsets.in_port),
        mac: offsets.mac.map(|at| MacFields {
            dst: mac(buf, at),
            src: mac(buf, at + 6),
        }),
        ether_type: offsets.l3_other.map(|at| be16(buf, at + 2)),
        ports: offsets.tp.map(|at| PortFields {
            src: be16(buf, at),
            dst: be16(buf, at + 2),
        }),
        ipv4: offsets.ipv4.map(|at| Ipv4Fields {
            tos: buf[at],
            proto: buf[at + 1],
            ttl: buf[at + 2],
            flags: buf[at + 3],
            src: v4(buf, at + 4),
            dst: v4(buf, at + 8),
        }),
        ipv6: offsets.ipv6.map(|at| Ipv6Fields {
            tc: buf[at],
            proto: buf[at + 1],
            hop_limit: buf[at + 2],
            flags: buf[at + 3],
            label: be32(buf, at + 4),
            src: v6(buf, at + 8),
            dst: v6(buf, at + 24),
        }),
        tunnel,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::*;
    use crate::layout::{self, LayoutContext, VLAN_CFI};
    use crate::port::PortTable;
    use flower_common::{FeatureFlags, PortConfig};
    use proptest::prelude::*;

    fn compile_items(items: &[Item]) -> (KeyLayout, CompiledKey) {
        let ports = PortTable::from_config(&[PortConfig {
            id: 0,
            hw_port: 0x100,
            mac: [2, 0, 0, 0, 0, 1],
            rx_queues: 1,
        }]);
        let owner = ports.get(0).cloned().unwrap();
        let ctx = LayoutContext { ports: &ports, owner: &owner, features: FeatureFlags::default() };
        let mut layout = layout::calculate(items, &[], &ctx).unwrap();
        layout.port = owner.hw_port;
        let key = compile(items, &layout).unwrap();
        (layout, key)
    }

    fn ipv4(src: [u8; 4], dst: [u8; 4]) -> Item {
        Item::Ipv4(Match::new(Ipv4Spec { src, dst, ..Default::default() }))
    }

    #[test]
    fn test_plain_tcp() {
        let items = [
            Item::Eth(Match::new(EthSpec { dst: [0xaa; 6], src: [0xbb; 6], ether_type: 0 })),
            Item::Ipv4(
                Match::new(Ipv4Spec { src: [10, 0, 0, 1], dst: [10, 0, 0, 2], ttl: 64, ..Default::default() })
                    .with_mask(Ipv4Spec { src: [0xff; 4], dst: [0xff; 4], ttl: 0xff, ..Default::default() }),
            ),
            Item::Tcp(
                Match::new(TcpSpec { src_port: 1000, dst_port: 80, flags: tcp_flags::SYN })
                    .with_mask(TcpSpec { src_port: 0xffff, dst_port: 0xffff, flags: tcp_flags::SYN }),
            ),
        ];
        let (layout, key) = compile_items(&items);
        assert_eq!(key.exact.len(), layout.key_size);
        assert_eq!(key.exact[0], 0x1e);
        assert_eq!(key.exact[1], MASK_ID_UNSET);
        assert_eq!(&key.exact[4..8], &0x100u32.to_be_bytes());
        assert_eq!(&key.mask[4..8], &[0xff; 4]);
        assert!(key.artifacts.tcp);

        // Transport ports precede the IPv4 record.
        assert_eq!(&key.exact[24..28], &[0x03, 0xe8, 0x00, 0x50]);
        assert_eq!(&key.exact[28..32], &[0, IPPROTO_TCP, 64, l3_flags::TCP_SYN]);
        assert_eq!(&key.mask[28..32], &[0, 0xff, 0xff, l3_flags::TCP_SYN]);

        let decoded = decode(&key.exact).unwrap();
        assert_eq!(decoded.mac, Some(MacFields { dst: [0xaa; 6], src: [0xbb; 6] }));
        assert_eq!(decoded.ports, Some(PortFields { src: 1000, dst: 80 }));
        let ip = decoded.ipv4.unwrap();
        assert_eq!((ip.src, ip.dst), (Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(decoded.tunnel, None);
    }

    #[test]
    fn test_tcp_flag_mapping() {
        assert_eq!(map_tcp_flags(tcp_flags::URG), l3_flags::TCP_URG);
        assert_eq!(
            map_tcp_flags(tcp_flags::FIN | tcp_flags::RST | tcp_flags::PSH),
            l3_flags::TCP_FIN | l3_flags::TCP_RST | l3_flags::TCP_PSH
        );
        assert_eq!(map_tcp_flags(0x10), 0);
    }

    #[test]
    fn test_udp_writes_protocol_without_spec() {
        let items = [Item::Ipv6(Match::any()), Item::Udp(Match::any())];
        let (_, key) = compile_items(&items);
        let decoded = decode(&key.exact).unwrap();
        assert_eq!(decoded.ipv6.unwrap().proto, IPPROTO_UDP);
        assert_eq!(decode(&key.mask).unwrap().ipv6.unwrap().proto, 0xff);
        assert_eq!(decoded.ports, Some(PortFields { src: 0, dst: 0 }));
    }

    #[test]
    fn test_vlan_tci() {
        let items = [
            Item::Eth(Match::any()),
            Item::Vlan(Match::new(VlanSpec { tci: 100, inner_type: 0 })),
            Item::Ipv4(Match::any()),
        ];
        let (_, key) = compile_items(&items);
        assert_eq!(decode(&key.exact).unwrap().tci, VLAN_CFI | 100);
        assert_eq!(decode(&key.mask).unwrap().tci, VLAN_CFI | 0x0fff);
    }

    #[test]
    fn test_l3_other() {
        let items = [Item::Eth(
            Match::new(EthSpec { ether_type: 0x88cc, ..Default::default() })
                .with_mask(EthSpec { ether_type: 0xffff, ..Default::default() }),
        )];
        let (_, key) = compile_items(&items);
        let decoded = decode(&key.exact).unwrap();
        assert_eq!(decoded.key_layer2, KeyLayer2::L3_OTHER);
        assert_eq!(decoded.ether_type, Some(0x88cc));
    }

    #[test]
    fn test_vxlan_key() {
        let items = [
            Item::Eth(Match::new(EthSpec { dst: [1; 6], src: [2; 6], ether_type: 0 })),
            ipv4([192, 168, 1, 1], [192, 168, 1, 2]),
            Item::Udp(Match::new(UdpSpec { src_port: 0, dst_port: 4789 })),
            Item::Vxlan(Match::new(VxlanSpec { vni: 42 })),
            Item::Eth(Match::new(EthSpec { dst: [3; 6], ..Default::default() })),
            ipv4([10, 0, 0, 1], [10, 0, 0, 2]),
        ];
        let (_, key) = compile_items(&items);
        let outer_dst = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 2));
        assert_eq!(key.artifacts.tunnel_dst, Some(outer_dst));
        assert_eq!(key.artifacts.outer_src, Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))));
        assert_eq!(key.artifacts.outer_eth.map(|e| e.src), Some([2; 6]));

        let decoded = decode(&key.exact).unwrap();
        assert_eq!(decoded.in_port, PORT_TYPE_TUN | TunnelType::Vxlan as u32);
        assert_eq!(decoded.ports, None);
        assert_eq!(decoded.mac.unwrap().dst, [3; 6]);
        assert_eq!(decoded.ipv4.unwrap().dst, Ipv4Addr::new(10, 0, 0, 2));
        let tun = decoded.tunnel.unwrap();
        assert_eq!(tun.tun_type, TunnelType::Vxlan);
        assert_eq!(tun.dst, outer_dst);
        assert_eq!(tun.tun_id, 42 << 8);

        let mask = decode(&key.mask).unwrap().tunnel.unwrap();
        assert_eq!(mask.tun_id, 0x00ff_ffff << 8);
    }

    #[test]
    fn test_gre_v6_key() {
        let outer = Ipv6Spec { src: [0x20; 16], dst: [0x21; 16], ..Default::default() };
        let items = [
            Item::Ipv6(Match::new(outer)),
            Item::Gre(Match::any()),
            Item::GreKey(Match::new(GreKeySpec { key: 0x1234 })),
            Item::Eth(Match::any()),
        ];
        let (layout, key) = compile_items(&items);
        assert!(layout.tun_ipv6());

        let decoded = decode(&key.exact).unwrap();
        assert_eq!(decoded.in_port, PORT_TYPE_TUN | TunnelType::Gre as u32);
        assert_eq!(decoded.key_layer2, KeyLayer2::GRE | KeyLayer2::TUN_IPV6);
        let tun = decoded.tunnel.unwrap();
        assert_eq!(tun.src, IpAddr::V6(Ipv6Addr::from([0x20; 16])));
        assert_eq!(tun.flags, GRE_FLAG_KEY);
        assert_eq!(tun.ethertype, ETH_P_TEB);
        assert_eq!(tun.tun_id, 0x1234);
        assert_eq!(key.artifacts.tunnel_dst, Some(IpAddr::V6(Ipv6Addr::from([0x21; 16]))));
    }

    #[test]
    fn test_geneve_without_outer_spec() {
        let items = [Item::Ipv4(Match::any()), Item::Udp(Match::any()), Item::Geneve(Match::new(GeneveSpec { vni: 9 }))];
        let (_, key) = compile_items(&items);
        assert_eq!(key.artifacts.tunnel_dst, None);
        assert_eq!(decode(&key.exact).unwrap().tunnel.unwrap().tun_id, 9 << 8);
    }

    #[test]
    fn test_decode_rejects_bad_length() {
        assert!(decode(&[0x02, 0xff, 0, 0]).is_err());
        let (_, key) = compile_items(&[ipv4([1, 2, 3, 4], [5, 6, 7, 8])]);
        assert!(decode(&key.exact[..key.exact.len() - 4]).is_err());
    }

    proptest! {
        #[test]
        fn prop_ipv4_round_trip(
            src in any::<[u8; 4]>(),
            dst in any::<[u8; 4]>(),
            tos in any::<u8>(),
            ttl in any::<u8>(),
            sport in any::<u16>(),
            dport in any::<u16>(),
        ) {
            let all = Ipv4Spec { tos: 0xff, ttl: 0xff, src: [0xff; 4], dst: [0xff; 4], ..Default::default() };
            let items = [
                Item::Ipv4(Match::new(Ipv4Spec { tos, ttl, src, dst, ..Default::default() }).with_mask(all)),
                Item::Udp(Match::new(UdpSpec { src_port: sport, dst_port: dport })),
            ];
            let (_, key) = compile_items(&items);
            let decoded = decode(&key.exact).unwrap();
            let ip = decoded.ipv4.unwrap();
            prop_assert_eq!(ip.src, Ipv4Addr::from(src));
            prop_assert_eq!(ip.dst, Ipv4Addr::from(dst));
            prop_assert_eq!((ip.tos, ip.ttl, ip.proto), (tos, ttl, IPPROTO_UDP));
            prop_assert_eq!(decoded.ports, Some(PortFields { src: sport, dst: dport }));
            prop_assert_eq!(decoded.in_port, 0x100);
        }

        #[test]
        fn prop_ipv6_masked_round_trip(
            src in any::<[u8; 16]>(),
            mask in any::<[u8; 16]>(),
            tc in any::<u8>(),
            label in 0u32..0x10_0000,
        ) {
            let spec = Ipv6Spec { src, vtc_flow: (u32::from(tc) << 20) | label, ..Default::default() };
            let m = Ipv6Spec { src: mask, vtc_flow: 0x0fff_ffff, ..Default::default() };
            let (_, key) = compile_items(&[Item::Ipv6(Match::new(spec).with_mask(m))]);

            let ip = decode(&key.exact).unwrap().ipv6.unwrap();
            let expected: Vec<u8> = src.iter().zip(mask.iter()).map(|(s, m)| s & m).collect();
            prop_assert_eq!(&ip.src.octets()[..], &expected[..]);
            prop_assert_eq!((ip.tc, ip.label), (tc, label));
            prop_assert_eq!(decode(&key.mask).unwrap().ipv6.unwrap().src.octets(), mask);
        }
    }
}
