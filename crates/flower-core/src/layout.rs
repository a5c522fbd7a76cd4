//! Key and Action Layout Calculator
//!
//! Walks a rule's items and actions once, without allocating any hardware
//! resource, and works out which key records the compiled rule carries and
//! how large its key and action buffers are.
//!
//! # Design
//!
//! - Items are checked against the protocol graph before sizes are summed
//! - Tunnel rules carry the outer L3 header inside the tunnel record, so the
//!   plain IPv4/IPv6 record of the outer header is never counted
//! - Action records shared by several actions (IPv4 addresses, ports, MACs)
//!   are counted once via [`ActionClasses`]
//! - The calculation is pure: same input, same layout

use std::ops::Range;

use bitflags::bitflags;
use flower_common::{FeatureFlags, FlowerError, FlowerResult, PortConfig};

use crate::action::Action;
use crate::item::{Item, ItemKind, ETH_P_TEB};
use crate::port::PortTable;

/// Key record sizes in bytes
pub mod key_size {
    /// Key layer, mask id and VLAN TCI
    pub const META_TCI: usize = 4;
    /// Second key layer word
    pub const EXT_META: usize = 4;
    /// Ingress port
    pub const IN_PORT: usize = 4;
    /// MAC addresses and MPLS
    pub const MAC: usize = 16;
    /// Non-IP ethertype
    pub const L3_OTHER: usize = 4;
    /// Transport ports
    pub const TP: usize = 4;
    /// IPv4 header fields
    pub const IPV4: usize = 12;
    /// IPv6 header fields
    pub const IPV6: usize = 40;
    /// UDP tunnel over IPv4
    pub const UDP_TUN4: usize = 20;
    /// UDP tunnel over IPv6
    pub const UDP_TUN6: usize = 44;
    /// GRE tunnel over IPv4
    pub const GRE_TUN4: usize = 24;
    /// GRE tunnel over IPv6
    pub const GRE_TUN6: usize = 48;
}

/// Action record sizes in bytes
pub mod act_size {
    /// Output to port
    pub const OUTPUT: usize = 8;
    /// Push VLAN
    pub const PUSH_VLAN: usize = 8;
    /// Pop VLAN
    pub const POP_VLAN: usize = 4;
    /// Set tunnel
    pub const SET_TUN: usize = 28;
    /// Set MAC addresses
    pub const SET_ETH: usize = 28;
    /// Set IPv4 addresses
    pub const SET_IPV4_ADDRS: usize = 20;
    /// Set IPv4 TTL and TOS
    pub const SET_IPV4_TTL_TOS: usize = 8;
    /// Set one IPv6 address
    pub const SET_IPV6_ADDR: usize = 36;
    /// Set IPv6 traffic class, hop limit and flow label
    pub const SET_IPV6_TC_HL_FL: usize = 12;
    /// Set transport ports
    pub const SET_TPORT: usize = 12;
    /// Pre-tunnel lookup
    pub const PRE_TUN: usize = 20;
    /// Meter
    pub const METER: usize = 8;
    /// Mark
    pub const MARK: usize = 8;
    /// Partial (mark and/or queue)
    pub const PARTIAL: usize = 12;
}

/// Largest action buffer the hardware accepts
pub const MAX_ACTION_SIZE: usize = 1216;

/// No port item matched; the engine substitutes the owner port
pub const PORT_UNSPECIFIED: u32 = u32::MAX;

/// TCI bit marking a VLAN as present
pub const VLAN_CFI: u16 = 0x1000;

bitflags! {
    /// First key layer word
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct KeyLayer: u8 {
        /// Second layer word present
        const EXT_META = 0x01;
        /// Ingress port
        const PORT = 0x02;
        /// MAC addresses
        const MAC = 0x04;
        /// Transport ports
        const TP = 0x08;
        /// IPv4
        const IPV4 = 0x10;
        /// IPv6
        const IPV6 = 0x20;
        /// Connection tracking
        const CT = 0x40;
        /// VXLAN tunnel
        const VXLAN = 0x80;
    }
}

bitflags! {
    /// Second key layer word
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct KeyLayer2: u32 {
        /// GRE tunnel
        const GRE = 1 << 0;
        /// Non-IP ethertype
        const L3_OTHER = 1 << 3;
        /// Double tagged
        const QINQ = 1 << 4;
        /// Geneve tunnel
        const GENEVE = 1 << 5;
        /// Geneve options
        const GENEVE_OP = 1 << 6;
        /// Tunnel outer header is IPv6
        const TUN_IPV6 = 1 << 7;
    }
}

bitflags! {
    /// Action records emitted at most once per rule
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ActionClasses: u16 {
        /// Set MAC record
        const MAC = 1 << 0;
        /// Set IPv4 addresses record
        const IPV4_ADDR = 1 << 1;
        /// Set transport ports record
        const TP = 1 << 2;
        /// IPv4 TTL/TOS record
        const TTL_TOS = 1 << 3;
        /// IPv6 TC/HL record
        const TC_HL = 1 << 4;
        /// Partial record
        const PARTIAL = 1 << 5;
        /// Partial record carries both mark and queue
        const PARTIAL_BOTH = 1 << 6;
        /// Tunnel encapsulation
        const ENCAP = 1 << 7;
        /// Tunnel decapsulation
        const DECAP = 1 << 8;
        /// Meter
        const METER = 1 << 9;
    }
}

/// Tunnel type of a tunnel match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum TunnelType {
    /// Not a tunnel rule
    #[default]
    None = 0,
    /// GRE
    Gre = 1,
    /// VXLAN
    Vxlan = 2,
    /// Geneve
    Geneve = 4,
}

/// What the layout calculation needs to know about the device
#[derive(Debug, Clone, Copy)]
pub struct LayoutContext<'a> {
    /// Registered ports
    pub ports: &'a PortTable,
    /// Port the rule is created on
    pub owner: &'a PortConfig,
    /// Firmware capabilities
    pub features: FeatureFlags,
}

/// Shape of a compiled rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    /// First key layer word
    pub key_layer: KeyLayer,
    /// Second key layer word
    pub key_layer2: KeyLayer2,
    /// Key buffer size in bytes
    pub key_size: usize,
    /// Action buffer size in bytes
    pub act_size: usize,
    /// Matched hardware port, or [`PORT_UNSPECIFIED`]
    pub port: u32,
    /// VLAN TCI seed
    pub vlan_tci: u16,
    /// Tunnel type
    pub tun_type: TunnelType,
    /// Action records emitted once
    pub classes: ActionClasses,
    /// Number of output actions
    pub output_count: usize,
    /// Indices of the tunnel header items; items before are the outer
    /// header, items after the inner one
    pub tunnel_items: Option<Range<usize>>,
}

/// Byte offsets of every key record present in a layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyOffsets {
    /// Metadata and TCI
    pub meta_tci: usize,
    /// Second layer word
    pub ext_meta: Option<usize>,
    /// Ingress port
    pub in_port: usize,
    /// MAC record
    pub mac: Option<usize>,
    /// Non-IP ethertype record
    pub l3_other: Option<usize>,
    /// Transport ports record
    pub tp: Option<usize>,
    /// IPv4 record
    pub ipv4: Option<usize>,
    /// IPv6 record
    pub ipv6: Option<usize>,
    /// Tunnel record
    pub tunnel: Option<usize>,
    /// End of the key
    pub end: usize,
}

impl KeyLayout {
    /// Key shape implied by the layer words of a compiled key
    pub fn from_layers(key_layer: KeyLayer, key_layer2: KeyLayer2) -> Self {
        let tun_type = if key_layer2.contains(KeyLayer2::GRE) {
            TunnelType::Gre
        } else if key_layer2.contains(KeyLayer2::GENEVE) {
            TunnelType::Geneve
        } else if key_layer.contains(KeyLayer::VXLAN) {
            TunnelType::Vxlan
        } else {
            TunnelType::None
        };
        let mut layout = Self {
            key_layer,
            key_layer2,
            key_size: 0,
            act_size: 0,
            port: PORT_UNSPECIFIED,
            vlan_tci: 0,
            tun_type,
            classes: ActionClasses::empty(),
            output_count: 0,
            tunnel_items: None,
        };
        layout.key_size = layout.offsets().end;
        layout
    }

    /// Check whether this is a tunnel match
    pub fn is_tunnel(&self) -> bool {
        self.tun_type != TunnelType::None
    }

    /// Check whether the tunnel outer header is IPv6
    pub fn tun_ipv6(&self) -> bool {
        self.key_layer2.contains(KeyLayer2::TUN_IPV6)
    }

    /// Size of the tunnel record, zero for plain rules
    pub fn tunnel_record_size(&self) -> usize {
        match (self.tun_type, self.tun_ipv6()) {
            (TunnelType::None, _) => 0,
            (TunnelType::Gre, false) => key_size::GRE_TUN4,
            (TunnelType::Gre, true) => key_size::GRE_TUN6,
            (_, false) => key_size::UDP_TUN4,
            (_, true) => key_size::UDP_TUN6,
        }
    }

    /// Offsets of the key records, in wire order
    pub fn offsets(&self) -> KeyOffsets {
        let mut cursor = 0;
        let mut take = |present: bool, size: usize| {
            present.then(|| {
                let at = cursor;
                cursor += size;
                at
            })
        };

        let meta_tci = take(true, key_size::META_TCI).unwrap_or_default();
        let ext_meta = take(self.key_layer.contains(KeyLayer::EXT_META), key_size::EXT_META);
        let in_port = take(true, key_size::IN_PORT).unwrap_or_default();
        let mac = take(self.key_layer.contains(KeyLayer::MAC), key_size::MAC);
        let l3_other = take(self.key_layer2.contains(KeyLayer2::L3_OTHER), key_size::L3_OTHER);
        let tp = take(self.key_layer.contains(KeyLayer::TP), key_size::TP);
        let ipv4 = take(self.key_layer.contains(KeyLayer::IPV4), key_size::IPV4);
        let ipv6 = take(self.key_layer.contains(KeyLayer::IPV6), key_size::IPV6);
        let tunnel = take(self.is_tunnel(), self.tunnel_record_size());

        KeyOffsets {
            meta_tci,
            ext_meta,
            in_port,
            mac,
            l3_other,
            tp,
            ipv4,
            ipv6,
            tunnel,
            end: cursor,
        }
    }

    fn add_ext_meta(&mut self) {
        if !self.key_layer.contains(KeyLayer::EXT_META) {
            self.key_layer |= KeyLayer::EXT_META;
            self.key_size += key_size::EXT_META;
        }
    }

    fn add_action(&mut self, size: usize) -> FlowerResult<()> {
        self.act_size += size;
        if self.act_size > MAX_ACTION_SIZE {
            return Err(FlowerError::invalid(format!(
                "action list too long ({} > {MAX_ACTION_SIZE} bytes)",
                self.act_size
            )));
        }
        Ok(())
    }
}

/// Indices of the tunnel header items of a checked item list
fn tunnel_items(items: &[Item]) -> Option<Range<usize>> {
    let at = items.iter().position(|i| i.kind().is_tunnel())?;
    let end = match items.get(at + 1).map(Item::kind) {
        Some(ItemKind::GreKey) => at + 2,
        _ => at + 1,
    };
    Some(at..end)
}

fn check_items(items: &[Item], ctx: &LayoutContext<'_>) -> FlowerResult<()> {
    let mut prev: Option<ItemKind> = None;
    let mut tunnel_seen = false;

    for item in items {
        item.check()?;
        let kind = item.kind();

        if let Item::Gre(m) = item {
            if let Some((spec, mask)) = m.values() {
                if spec.protocol != ETH_P_TEB & mask.protocol {
                    return Err(FlowerError::invalid("gre: only ethernet payloads are supported"));
                }
            }
        }

        if let Item::PortId(id) = item {
            if !ctx.ports.contains(*id) {
                return Err(FlowerError::invalid(format!("port {id} does not exist")));
            }
            continue;
        }

        let allowed = prev.map_or(ItemKind::START, ItemKind::next);
        if !allowed.contains(&kind) {
            return Err(FlowerError::invalid(match prev {
                Some(p) => format!("item {kind:?} cannot follow {p:?}"),
                None => format!("item {kind:?} cannot start a rule"),
            }));
        }

        if kind.is_tunnel() {
            if tunnel_seen {
                return Err(FlowerError::invalid("nested tunnels are not supported"));
            }
            tunnel_seen = true;
        }
        prev = Some(kind);
    }
    Ok(())
}

fn calculate_items(items: &[Item], ctx: &LayoutContext<'_>, layout: &mut KeyLayout) -> FlowerResult<()> {
    let tunnel = tunnel_items(items);
    let outer_end = tunnel.as_ref().map_or(0, |r| r.start);
    let outer_v6 = items[..outer_end]
        .iter()
        .rev()
        .find_map(|i| match i {
            Item::Ipv4(_) => Some(false),
            Item::Ipv6(_) => Some(true),
            _ => None,
        })
        .unwrap_or(false);
    let eth_only = items
        .iter()
        .all(|i| matches!(i.kind(), ItemKind::Eth | ItemKind::PortId));

    for (i, item) in items.iter().enumerate() {
        let outer = i < outer_end;
        match item {
            Item::PortId(id) => {
                let port = ctx
                    .ports
                    .get(*id)
                    .ok_or_else(|| FlowerError::invalid(format!("port {id} does not exist")))?;
                layout.port = port.hw_port;
            }
            Item::Eth(m) if !outer => {
                if let Some((spec, _)) = m.values() {
                    layout.key_layer |= KeyLayer::MAC;
                    layout.key_size += key_size::MAC;
                    if eth_only && spec.ether_type != 0 && !layout.key_layer2.contains(KeyLayer2::L3_OTHER) {
                        layout.add_ext_meta();
                        layout.key_layer2 |= KeyLayer2::L3_OTHER;
                        layout.key_size += key_size::L3_OTHER;
                    }
                }
            }
            Item::Vlan(_) if !outer => layout.vlan_tci = VLAN_CFI,
            Item::Ipv4(_) if !outer => {
                layout.key_layer |= KeyLayer::IPV4;
                layout.key_size += key_size::IPV4;
            }
            Item::Ipv6(_) if !outer => {
                layout.key_layer |= KeyLayer::IPV6;
                layout.key_size += key_size::IPV6;
            }
            Item::Tcp(_) | Item::Udp(_) | Item::Sctp(_) if !outer => {
                layout.key_layer |= KeyLayer::TP;
                layout.key_size += key_size::TP;
            }
            Item::Vxlan(_) => {
                layout.tun_type = TunnelType::Vxlan;
                layout.key_layer |= KeyLayer::VXLAN;
                if outer_v6 {
                    layout.add_ext_meta();
                    layout.key_layer2 |= KeyLayer2::TUN_IPV6;
                }
            }
            Item::Geneve(_) => {
                layout.tun_type = TunnelType::Geneve;
                layout.add_ext_meta();
                layout.key_layer2 |= KeyLayer2::GENEVE;
                if outer_v6 {
                    layout.key_layer2 |= KeyLayer2::TUN_IPV6;
                }
            }
            Item::Gre(_) => {
                layout.tun_type = TunnelType::Gre;
                layout.add_ext_meta();
                layout.key_layer2 |= KeyLayer2::GRE;
                if outer_v6 {
                    layout.key_layer2 |= KeyLayer2::TUN_IPV6;
                }
            }
            // Outer headers live in the tunnel record; the GRE key shares the GRE one.
            _ => {}
        }
    }

    layout.key_size += layout.tunnel_record_size();
    layout.tunnel_items = tunnel;
    Ok(())
}

fn calculate_actions(actions: &[Action], ctx: &LayoutContext<'_>, layout: &mut KeyLayout) -> FlowerResult<()> {
    let rx_queues = ctx.owner.rx_queues;

    for (i, action) in actions.iter().enumerate() {
        match action {
            Action::Void | Action::Drop | Action::Count | Action::Jump(_) => {}
            Action::Output { port } => {
                if !ctx.ports.contains(*port) {
                    return Err(FlowerError::invalid(format!("output port {port} does not exist")));
                }
                layout.output_count += 1;
                layout.add_action(act_size::OUTPUT)?;
            }
            Action::SetMacSrc(_) | Action::SetMacDst(_) => {
                if !layout.classes.contains(ActionClasses::MAC) {
                    layout.classes |= ActionClasses::MAC;
                    layout.add_action(act_size::SET_ETH)?;
                }
            }
            Action::PopVlan => layout.add_action(act_size::POP_VLAN)?,
            Action::PushVlan { .. } => {
                let pcp = actions.get(i + 1);
                let vid = actions.get(i + 2);
                if !matches!(pcp, Some(Action::SetVlanPcp(_))) || !matches!(vid, Some(Action::SetVlanVid(_))) {
                    return Err(FlowerError::invalid(
                        "push_vlan must be followed by set_vlan_pcp and set_vlan_vid",
                    ));
                }
                layout.add_action(act_size::PUSH_VLAN)?;
            }
            Action::SetVlanPcp(_) => {
                if !matches!(i.checked_sub(1).map(|p| &actions[p]), Some(Action::PushVlan { .. })) {
                    return Err(FlowerError::invalid("set_vlan_pcp must follow push_vlan"));
                }
            }
            Action::SetVlanVid(_) => {
                if !matches!(i.checked_sub(2).map(|p| &actions[p]), Some(Action::PushVlan { .. })) {
                    return Err(FlowerError::invalid("set_vlan_vid must follow set_vlan_pcp"));
                }
            }
            Action::SetIpv4Src(_) | Action::SetIpv4Dst(_) => {
                if !layout.classes.contains(ActionClasses::IPV4_ADDR) {
                    layout.classes |= ActionClasses::IPV4_ADDR;
                    layout.add_action(act_size::SET_IPV4_ADDRS)?;
                }
            }
            Action::SetIpv6Src(_) | Action::SetIpv6Dst(_) => layout.add_action(act_size::SET_IPV6_ADDR)?,
            Action::SetTpSrc(_) | Action::SetTpDst(_) => {
                if !layout.classes.contains(ActionClasses::TP) {
                    layout.classes |= ActionClasses::TP;
                    layout.add_action(act_size::SET_TPORT)?;
                }
            }
            Action::SetTtl(_) => {
                if layout.key_layer.contains(KeyLayer::IPV4) {
                    add_ttl_tos(layout)?;
                } else {
                    add_tc_hl(layout)?;
                }
            }
            Action::SetIpv4Dscp(_) => add_ttl_tos(layout)?,
            Action::SetIpv6Dscp(_) => add_tc_hl(layout)?,
            Action::Encap(_) => {
                claim_tunnel_action(layout, ActionClasses::ENCAP)?;
                layout.add_action(act_size::PRE_TUN)?;
                layout.add_action(act_size::SET_TUN)?;
            }
            Action::Decap => {
                if !layout.is_tunnel() {
                    return Err(FlowerError::invalid("decap requires a tunnel match"));
                }
                claim_tunnel_action(layout, ActionClasses::DECAP)?;
            }
            Action::Meter { .. } => {
                if layout.classes.contains(ActionClasses::METER) {
                    return Err(FlowerError::invalid("only one meter action is supported"));
                }
                layout.classes |= ActionClasses::METER;
                layout.add_action(act_size::METER)?;
            }
            Action::Mark(_) => {
                if ctx.features.partial_flow {
                    add_partial(layout)?;
                } else {
                    layout.add_action(act_size::MARK)?;
                }
            }
            Action::Queue(queue) => {
                if !ctx.features.partial_flow {
                    return Err(FlowerError::invalid("queue action not supported"));
                }
                if *queue >= rx_queues {
                    return Err(FlowerError::invalid(format!("queue index {queue} is illegal")));
                }
                add_partial(layout)?;
            }
            Action::Rss(conf) => {
                if conf.queues.is_empty() || conf.queues.iter().any(|&q| q >= rx_queues) {
                    return Err(FlowerError::invalid("rss queue list is illegal"));
                }
            }
        }
    }

    if layout.classes.contains(ActionClasses::PARTIAL_BOTH) && layout.act_size != act_size::PARTIAL {
        return Err(FlowerError::invalid("mark and queue can not be offloaded with other actions"));
    }
    Ok(())
}

fn add_ttl_tos(layout: &mut KeyLayout) -> FlowerResult<()> {
    if !layout.classes.contains(ActionClasses::TTL_TOS) {
        layout.classes |= ActionClasses::TTL_TOS;
        layout.add_action(act_size::SET_IPV4_TTL_TOS)?;
    }
    Ok(())
}

fn add_tc_hl(layout: &mut KeyLayout) -> FlowerResult<()> {
    if !layout.classes.contains(ActionClasses::TC_HL) {
        layout.classes |= ActionClasses::TC_HL;
        layout.add_action(act_size::SET_IPV6_TC_HL_FL)?;
    }
    Ok(())
}

fn add_partial(layout: &mut KeyLayout) -> FlowerResult<()> {
    if layout.classes.contains(ActionClasses::PARTIAL) {
        layout.classes |= ActionClasses::PARTIAL_BOTH;
        return Ok(());
    }
    layout.classes |= ActionClasses::PARTIAL;
    layout.add_action(act_size::PARTIAL)
}

fn claim_tunnel_action(layout: &mut KeyLayout, class: ActionClasses) -> FlowerResult<()> {
    if layout.classes.intersects(ActionClasses::ENCAP | ActionClasses::DECAP) {
        return Err(FlowerError::invalid("only one encap or decap action is supported"));
    }
    layout.classes |= class;
    Ok(())
}

/// Compute the layout of a rule
pub fn calculate(items: &[Item], actions: &[Action], ctx: &LayoutContext<'_>) -> FlowerResult<KeyLayout> {
    check_items(items, ctx)?;

    let mut layout = KeyLayout {
        key_layer: KeyLayer::PORT,
        key_layer2: KeyLayer2::empty(),
        key_size: key_size::META_TCI + key_size::IN_PORT,
        act_size: 0,
        port: PORT_UNSPECIFIED,
        vlan_tci: 0,
        tun_type: TunnelType::None,
        classes: ActionClasses::empty(),
        output_count: 0,
        tunnel_items: None,
    };
    calculate_items(items, ctx, &mut layout)?;
    calculate_actions(actions, ctx, &mut layout)?;
    Ok(layout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{EncapIp, RssConf, TunnelEncap, TunnelKind};
    use crate::item::*;
    use proptest::prelude::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn ports() -> PortTable {
        PortTable::from_config(&[
            PortConfig { id: 0, hw_port: 0x100, mac: [2, 0, 0, 0, 0, 1], rx_queues: 4 },
            PortConfig { id: 1, hw_port: 0x101, mac: [2, 0, 0, 0, 0, 2], rx_queues: 1 },
        ])
    }

    fn layout_of(items: &[Item], actions: &[Action]) -> FlowerResult<KeyLayout> {
        layout_with(items, actions, FeatureFlags::default())
    }

    fn layout_with(items: &[Item], actions: &[Action], features: FeatureFlags) -> FlowerResult<KeyLayout> {
        let ports = ports();
        let owner = ports.get(0).cloned().unwrap();
        calculate(items, actions, &LayoutContext { ports: &ports, owner: &owner, features })
    }

    fn eth() -> Item {
        Item::Eth(Match::new(EthSpec { dst: [0xaa; 6], ..Default::default() }))
    }

    fn ipv4() -> Item {
        Item::Ipv4(Match::new(Ipv4Spec { dst: [10, 0, 0, 1], ..Default::default() }))
    }

    fn ipv6() -> Item {
        Item::Ipv6(Match::new(Ipv6Spec { dst: [0xfe; 16], ..Default::default() }))
    }

    fn udp(dst_port: u16) -> Item {
        Item::Udp(Match::new(UdpSpec { src_port: 0, dst_port }))
    }

    fn output() -> Action {
        Action::Output { port: 1 }
    }

    #[test]
    fn test_plain_tcp() {
        let items = [eth(), ipv4(), Item::Tcp(Match::new(TcpSpec::default()))];
        let layout = layout_of(&items, &[output()]).unwrap();
        assert_eq!(layout.key_layer, KeyLayer::PORT | KeyLayer::MAC | KeyLayer::IPV4 | KeyLayer::TP);
        assert_eq!(layout.key_size, 40);
        assert_eq!(layout.act_size, 8);
        assert_eq!(layout.port, PORT_UNSPECIFIED);
        assert_eq!(layout.output_count, 1);

        let offsets = layout.offsets();
        assert_eq!(offsets.mac, Some(8));
        assert_eq!(offsets.tp, Some(24));
        assert_eq!(offsets.ipv4, Some(28));
        assert_eq!(offsets.end, layout.key_size);
    }

    #[test]
    fn test_port_item() {
        let layout = layout_of(&[Item::PortId(1), eth()], &[output()]).unwrap();
        assert_eq!(layout.port, 0x101);
        assert!(layout_of(&[Item::PortId(9), eth()], &[]).is_err());
    }

    #[test]
    fn test_eth_without_spec() {
        let layout = layout_of(&[Item::Eth(Match::any()), ipv4()], &[]).unwrap();
        assert!(!layout.key_layer.contains(KeyLayer::MAC));
        assert_eq!(layout.key_size, 20);
    }

    #[test]
    fn test_l3_other() {
        let lldp = Item::Eth(
            Match::new(EthSpec { ether_type: 0x88cc, ..Default::default() })
                .with_mask(EthSpec { ether_type: 0xffff, ..Default::default() }),
        );
        let layout = layout_of(&[lldp], &[Action::Drop]).unwrap();
        assert!(layout.key_layer.contains(KeyLayer::EXT_META));
        assert_eq!(layout.key_layer2, KeyLayer2::L3_OTHER);
        assert_eq!(layout.key_size, 32);
        assert_eq!(layout.offsets().l3_other, Some(28));

        // Not for rules that also match L3
        let layout = layout_of(&[lldp, ipv4()], &[]).unwrap();
        assert!(!layout.key_layer2.contains(KeyLayer2::L3_OTHER));
    }

    #[test]
    fn test_vlan_seeds_cfi() {
        let vlan = Item::Vlan(Match::new(VlanSpec { tci: 100, inner_type: 0 }));
        let layout = layout_of(&[eth(), vlan, ipv4()], &[]).unwrap();
        assert_eq!(layout.vlan_tci, VLAN_CFI);
    }

    #[test]
    fn test_vxlan_v4() {
        let items = [
            eth(),
            ipv4(),
            udp(4789),
            Item::Vxlan(Match::new(VxlanSpec { vni: 42 })),
            eth(),
            ipv4(),
        ];
        let layout = layout_of(&items, &[Action::Decap, output()]).unwrap();
        assert_eq!(layout.tun_type, TunnelType::Vxlan);
        assert!(layout.key_layer.contains(KeyLayer::VXLAN));
        assert!(!layout.key_layer.contains(KeyLayer::EXT_META));
        assert!(!layout.key_layer.contains(KeyLayer::TP));
        assert_eq!(layout.key_size, 8 + 16 + 12 + 20);
        assert_eq!(layout.tunnel_items, Some(3..4));

        let offsets = layout.offsets();
        assert_eq!(offsets.ipv4, Some(24));
        assert_eq!(offsets.tunnel, Some(36));
        assert_eq!(offsets.end, 56);
    }

    #[test]
    fn test_vxlan_v6_needs_ext_meta() {
        let items = [eth(), ipv6(), udp(4789), Item::Vxlan(Match::new(VxlanSpec { vni: 1 }))];
        let layout = layout_of(&items, &[]).unwrap();
        assert!(layout.key_layer.contains(KeyLayer::EXT_META | KeyLayer::VXLAN));
        assert!(layout.tun_ipv6());
        assert!(!layout.key_layer.contains(KeyLayer::IPV6));
        assert_eq!(layout.key_size, 8 + 4 + 44);
    }

    #[test]
    fn test_geneve_and_gre() {
        let items = [ipv4(), udp(6081), Item::Geneve(Match::new(GeneveSpec { vni: 7 }))];
        let layout = layout_of(&items, &[]).unwrap();
        assert_eq!(layout.tun_type, TunnelType::Geneve);
        assert_eq!(layout.key_layer2, KeyLayer2::GENEVE);
        assert_eq!(layout.key_size, 8 + 4 + 20);

        let items = [
            ipv6(),
            Item::Gre(Match::new(GreSpec::default())),
            Item::GreKey(Match::new(GreKeySpec { key: 9 })),
            eth(),
        ];
        let layout = layout_of(&items, &[]).unwrap();
        assert_eq!(layout.tun_type, TunnelType::Gre);
        assert_eq!(layout.key_layer2, KeyLayer2::GRE | KeyLayer2::TUN_IPV6);
        assert_eq!(layout.key_size, 8 + 4 + 16 + 48);
        assert_eq!(layout.tunnel_items, Some(1..3));
    }

    #[test]
    fn test_graph_violations() {
        let tcp = Item::Tcp(Match::any());
        assert!(layout_of(&[tcp], &[]).is_err());
        assert!(layout_of(&[eth(), tcp], &[]).is_err());
        // Tunnels need an outer L3 header.
        assert!(layout_of(&[eth(), Item::Vxlan(Match::any())], &[]).is_err());
        assert!(layout_of(&[eth(), Item::Gre(Match::any())], &[]).is_err());
        // The port item may appear anywhere.
        assert!(layout_of(&[eth(), Item::PortId(0), ipv4()], &[]).is_ok());
    }

    #[test]
    fn test_gre_protocol() {
        let gre = |protocol| Item::Gre(Match::new(GreSpec { c_rsvd0_ver: 0, protocol }));
        let key = Item::GreKey(Match::new(GreKeySpec { key: 1 }));
        assert!(layout_of(&[ipv4(), gre(ETH_P_TEB), key, eth()], &[]).is_ok());
        assert!(layout_of(&[ipv4(), gre(0x0800), key, eth()], &[]).is_err());
    }

    #[test]
    fn test_nested_tunnel_rejected() {
        let vxlan = Item::Vxlan(Match::any());
        let items = [ipv4(), udp(4789), vxlan, eth(), ipv4(), udp(4789), vxlan];
        assert!(layout_of(&items, &[]).is_err());
    }

    #[test]
    fn test_shared_action_records() {
        let actions = [
            Action::SetIpv4Src(Ipv4Addr::new(1, 1, 1, 1)),
            Action::SetIpv4Dst(Ipv4Addr::new(2, 2, 2, 2)),
            Action::SetTpSrc(1),
            Action::SetTpDst(2),
            Action::SetMacSrc([1; 6]),
            Action::SetMacDst([2; 6]),
            output(),
        ];
        let layout = layout_of(&[eth(), ipv4()], &actions).unwrap();
        assert_eq!(layout.act_size, 20 + 12 + 28 + 8);
        assert!(layout.classes.contains(ActionClasses::IPV4_ADDR | ActionClasses::TP | ActionClasses::MAC));
    }

    #[test]
    fn test_ttl_record_follows_key() {
        let layout = layout_of(&[eth(), ipv4()], &[Action::SetTtl(5), Action::SetIpv4Dscp(3)]).unwrap();
        assert_eq!(layout.act_size, 8);
        let layout = layout_of(&[eth(), ipv6()], &[Action::SetTtl(5), Action::SetIpv6Dscp(3)]).unwrap();
        assert_eq!(layout.act_size, 12);
    }

    #[test]
    fn test_action_size_limit() {
        let set = Action::SetIpv6Src(Ipv6Addr::LOCALHOST);
        assert!(layout_of(&[eth()], &vec![set.clone(); 33]).is_ok());
        assert!(layout_of(&[eth()], &vec![set; 34]).is_err());
    }

    #[test]
    fn test_push_vlan_sequence() {
        let push = Action::PushVlan { ethertype: 0x8100 };
        let ok = [push.clone(), Action::SetVlanPcp(3), Action::SetVlanVid(10), output()];
        assert_eq!(layout_of(&[eth()], &ok).unwrap().act_size, 16);

        let bad = [push, Action::SetVlanVid(10), Action::SetVlanPcp(3)];
        assert!(layout_of(&[eth()], &bad).is_err());
        assert!(layout_of(&[eth()], &[Action::SetVlanVid(1)]).is_err());
    }

    #[test]
    fn test_single_meter_and_tunnel_action() {
        let meter = Action::Meter { id: 1 };
        assert!(layout_of(&[eth()], &[meter.clone(), meter]).is_err());

        let encap = Action::Encap(TunnelEncap {
            kind: TunnelKind::Vxlan,
            eth_dst: [1; 6],
            eth_src: [2; 6],
            ip: EncapIp::V4 {
                src: Ipv4Addr::new(10, 0, 0, 1),
                dst: Ipv4Addr::new(10, 0, 0, 2),
                tos: 0,
                ttl: 64,
            },
            vni: 5,
            protocol: 0,
        });
        let layout = layout_of(&[eth()], &[encap.clone(), output()]).unwrap();
        assert_eq!(layout.act_size, 20 + 28 + 8);
        assert!(layout_of(&[eth()], &[encap.clone(), encap]).is_err());
        assert!(layout_of(&[eth()], &[Action::Decap]).is_err());
    }

    #[test]
    fn test_partial_actions() {
        let partial = FeatureFlags { partial_flow: true, decap_v2: false };

        assert_eq!(layout_of(&[eth()], &[Action::Mark(1)]).unwrap().act_size, 8);
        assert!(layout_of(&[eth()], &[Action::Queue(0)]).is_err());

        let layout = layout_with(&[eth()], &[Action::Mark(1), Action::Queue(3)], partial).unwrap();
        assert_eq!(layout.act_size, 12);
        assert!(layout.classes.contains(ActionClasses::PARTIAL_BOTH));

        assert!(layout_with(&[eth()], &[Action::Queue(4)], partial).is_err());
        assert!(layout_with(&[eth()], &[Action::Mark(1), Action::Queue(3), output()], partial).is_err());
    }

    #[test]
    fn test_rss_queues() {
        let rss = |queues: Vec<u16>| Action::Rss(RssConf { queues, ..Default::default() });
        assert_eq!(layout_of(&[eth()], &[rss(vec![0, 1, 3])]).unwrap().act_size, 0);
        assert!(layout_of(&[eth()], &[rss(vec![4])]).is_err());
        assert!(layout_of(&[eth()], &[rss(vec![])]).is_err());
    }

    #[test]
    fn test_unknown_output_port() {
        assert!(layout_of(&[eth()], &[Action::Output { port: 7 }]).is_err());
    }

    fn rules() -> Vec<Vec<Item>> {
        let vxlan = Item::Vxlan(Match::new(VxlanSpec { vni: 3 }));
        vec![
            vec![eth()],
            vec![eth(), ipv4()],
            vec![ipv6(), Item::Tcp(Match::any())],
            vec![eth(), Item::Vlan(Match::any()), ipv4(), udp(53)],
            vec![Item::PortId(1), eth(), ipv6(), Item::Sctp(Match::any())],
            vec![eth(), ipv4(), udp(4789), vxlan, eth(), ipv6(), udp(80)],
            vec![ipv6(), udp(6081), Item::Geneve(Match::any()), eth()],
            vec![ipv4(), Item::Gre(Match::any()), Item::GreKey(Match::new(GreKeySpec { key: 1 })), eth(), ipv4()],
        ]
    }

    proptest! {
        #[test]
        fn prop_layout_deterministic(rule in proptest::sample::select(rules())) {
            let a = layout_of(&rule, &[output()]).unwrap();
            let b = layout_of(&rule, &[output()]).unwrap();
            prop_assert_eq!(&a, &b);
            prop_assert_eq!(a.offsets().end, a.key_size);
            prop_assert_eq!(a.key_size % 4, 0);
        }
    }
}
