//! Action Compiler
//!
//! Packs an action list into the hardware action buffer and works out what
//! the rule needs from the tunnel caches, meters and RSS.
//!
//! # Design
//!
//! - One pass in action order; records shared by several actions (MAC,
//!   IPv4 addresses, ports, TTL/TOS, TC/HL, partial) are patched in place
//! - The pre-tunnel record of an encap goes to the front of the buffer
//! - Nothing is allocated here: cache requests are returned to the engine

use std::net::IpAddr;

use flower_common::{FeatureFlags, FlowerError, FlowerResult, PortConfig};

use crate::action::{Action, EncapIp, RssConf, TunnelEncap, TunnelKind};
use crate::flow::{FlowType, SHORTCUT_DROP, SHORTCUT_NULL, SHORTCUT_POP_VLAN};
use crate::item::ETH_P_TEB;
use crate::key_compiler::{in_port_word, KeyArtifacts, GRE_FLAG_KEY};
use crate::layout::{act_size, KeyLayer, KeyLayout, TunnelType, VLAN_CFI};
use crate::meter::MeterTable;
use crate::port::PortTable;
use crate::tunnel::{DecapContext, NeighborNotice, NeighborPayload};

/// Action record opcodes
pub mod opcode {
    /// Output to a port
    pub const OUTPUT: u8 = 0;
    /// Push VLAN
    pub const PUSH_VLAN: u8 = 1;
    /// Pop VLAN
    pub const POP_VLAN: u8 = 2;
    /// Set tunnel
    pub const SET_TUNNEL: u8 = 6;
    /// Set Ethernet addresses
    pub const SET_ETHERNET: u8 = 7;
    /// Set IPv4 addresses
    pub const SET_IPV4_ADDRS: u8 = 9;
    /// Set IPv4 TTL/TOS
    pub const SET_IPV4_TTL_TOS: u8 = 10;
    /// Set IPv6 source
    pub const SET_IPV6_SRC: u8 = 11;
    /// Set IPv6 destination
    pub const SET_IPV6_DST: u8 = 12;
    /// Set IPv6 TC/HL/FL
    pub const SET_IPV6_TC_HL_FL: u8 = 13;
    /// Set UDP ports
    pub const SET_UDP: u8 = 14;
    /// Set TCP ports
    pub const SET_TCP: u8 = 15;
    /// Pre-tunnel lookup
    pub const PRE_TUNNEL: u8 = 17;
    /// Meter
    pub const METER: u8 = 24;
    /// Mark / queue
    pub const SET_PARTIAL: u8 = 27;
}

/// Output flag: last output of the rule
pub const OUTPUT_FLAG_LAST: u16 = 1 << 15;
/// Pre-tunnel flag: IPv6 next hop
pub const PRE_TUN_FLAG_IPV6: u16 = 1;
/// TPID written for a VLAN-tagged decap outer header
pub const ETH_P_QINQ: u16 = 0x88a8;

/// Partial record flag values
pub mod partial_flag {
    /// Mark only
    pub const MARK: u8 = 0;
    /// Queue only
    pub const QUEUE: u8 = 1;
    /// Mark and queue
    pub const BOTH: u8 = 2;
}

/// What the action compiler needs from the engine
#[derive(Debug, Clone, Copy)]
pub struct ActionContext<'a> {
    /// Registered ports
    pub ports: &'a PortTable,
    /// Port the rule is created on
    pub owner: &'a PortConfig,
    /// Meters
    pub meters: &'a MeterTable,
    /// Firmware capabilities
    pub features: FeatureFlags,
    /// Stats context of the rule
    pub host_ctx: u32,
}

/// Pre-tunnel MAC row a decap rule needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreTunnelRequest {
    /// Owner port MAC
    pub mac: [u8; 6],
    /// Tunnel is IPv6
    pub v6: bool,
}

/// Output of [`compile`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledActions {
    /// Action buffer
    pub buf: Vec<u8>,
    /// Action shortcut
    pub shortcut: u32,
    /// Rule kind
    pub kind: FlowType,
    /// Program into hardware
    pub install: bool,
    /// Referenced meter
    pub meter: Option<u32>,
    /// Tunnel neighbor to reference
    pub neighbor: Option<NeighborNotice>,
    /// Pre-tunnel row to reference
    pub pre_tunnel: Option<PreTunnelRequest>,
    /// RSS spread to configure
    pub rss: Option<RssConf>,
}

#[derive(Debug, Default)]
struct Slots {
    mac: Option<usize>,
    ipv4_addrs: Option<usize>,
    tport: Option<usize>,
    ttl_tos: Option<usize>,
    tc_hl: Option<usize>,
    partial: Option<usize>,
}

impl Slots {
    fn shift(&mut self, by: usize) {
        for slot in [
            &mut self.mac,
            &mut self.ipv4_addrs,
            &mut self.tport,
            &mut self.ttl_tos,
            &mut self.tc_hl,
            &mut self.partial,
        ] {
            if let Some(at) = slot {
                *at += by;
            }
        }
    }
}

struct ActionWriter {
    buf: Vec<u8>,
    slots: Slots,
}

impl ActionWriter {
    /// Append a zeroed record with its header and return its offset
    fn record(&mut self, op: u8, size: usize) -> usize {
        let at = self.buf.len();
        self.buf.resize(at + size, 0);
        self.buf[at] = op;
        self.buf[at + 1] = (size >> 2) as u8;
        at
    }

    /// Offset of a shared record, appending it on first use
    fn shared(&mut self, slot: fn(&mut Slots) -> &mut Option<usize>, op: u8, size: usize) -> usize {
        if let Some(at) = *slot(&mut self.slots) {
            return at;
        }
        let at = self.record(op, size);
        *slot(&mut self.slots) = Some(at);
        at
    }

    fn put(&mut self, at: usize, bytes: &[u8]) {
        self.buf[at..at + bytes.len()].copy_from_slice(bytes);
    }

    fn u16(&mut self, at: usize, v: u16) {
        self.put(at, &v.to_be_bytes());
    }

    fn u32(&mut self, at: usize, v: u32) {
        self.put(at, &v.to_be_bytes());
    }

    fn prepend(&mut self, record: &[u8]) {
        self.buf.splice(0..0, record.iter().copied());
        self.slots.shift(record.len());
    }
}

fn set_mac(w: &mut ActionWriter, mac: &[u8; 6], src: bool) {
    let at = w.shared(|s| &mut s.mac, opcode::SET_ETHERNET, act_size::SET_ETH);
    // mask[12] then addr[12], destination first
    let field = if src { 6 } else { 0 };
    w.put(at + 4 + field, &[0xff; 6]);
    w.put(at + 16 + field, mac);
}

fn set_ipv4(w: &mut ActionWriter, addr: [u8; 4], src: bool) {
    let at = w.shared(|s| &mut s.ipv4_addrs, opcode::SET_IPV4_ADDRS, act_size::SET_IPV4_ADDRS);
    let field = if src { 4 } else { 12 };
    w.u32(at + field, u32::MAX);
    w.put(at + field + 4, &addr);
}

fn set_ipv6(w: &mut ActionWriter, addr: [u8; 16], src: bool) {
    let op = if src { opcode::SET_IPV6_SRC } else { opcode::SET_IPV6_DST };
    let at = w.record(op, act_size::SET_IPV6_ADDR);
    for (i, word) in addr.chunks_exact(4).enumerate() {
        let field = at + 4 + i * 8;
        w.u32(field, u32::MAX);
        w.put(field + 4, word);
    }
}

fn set_tport(w: &mut ActionWriter, port: u16, src: bool, tcp: bool) {
    let op = if tcp { opcode::SET_TCP } else { opcode::SET_UDP };
    let at = w.shared(|s| &mut s.tport, op, act_size::SET_TPORT);
    let field = if src { 0 } else { 2 };
    w.u16(at + 4 + field, 0xffff);
    w.u16(at + 8 + field, port);
}

/// IPv4 TTL/TOS record: ttl_mask, tos_mask, ttl, tos
fn ttl_tos(w: &mut ActionWriter) -> usize {
    w.shared(|s| &mut s.ttl_tos, opcode::SET_IPV4_TTL_TOS, act_size::SET_IPV4_TTL_TOS)
}

/// IPv6 TC/HL record: tc_mask, hl_mask, reserved, tc, hl, label
fn tc_hl(w: &mut ActionWriter) -> usize {
    w.shared(|s| &mut s.tc_hl, opcode::SET_IPV6_TC_HL_FL, act_size::SET_IPV6_TC_HL_FL)
}

fn set_partial(w: &mut ActionWriter, mark: Option<u32>, queue: Option<u16>) {
    let existed = w.slots.partial.is_some();
    let at = w.shared(|s| &mut s.partial, opcode::SET_PARTIAL, act_size::PARTIAL);
    if let Some(mark) = mark {
        w.u32(at + 4, mark);
    }
    if let Some(queue) = queue {
        w.u16(at + 8, queue);
    }
    w.buf[at + 2] = match (existed, queue.is_some()) {
        (true, _) => partial_flag::BOTH,
        (false, true) => partial_flag::QUEUE,
        (false, false) => partial_flag::MARK,
    };
}

fn tun_type_of(kind: TunnelKind) -> TunnelType {
    match kind {
        TunnelKind::Vxlan => TunnelType::Vxlan,
        TunnelKind::Geneve => TunnelType::Geneve,
        TunnelKind::Nvgre => TunnelType::Gre,
    }
}

fn pre_tunnel_record(ip: &EncapIp) -> Vec<u8> {
    let mut rec = vec![0u8; act_size::PRE_TUN];
    rec[0] = opcode::PRE_TUNNEL;
    rec[1] = (act_size::PRE_TUN >> 2) as u8;
    match ip {
        EncapIp::V4 { dst, .. } => rec[4..8].copy_from_slice(&dst.octets()),
        EncapIp::V6 { dst, .. } => {
            rec[2..4].copy_from_slice(&PRE_TUN_FLAG_IPV6.to_be_bytes());
            rec[4..20].copy_from_slice(&dst.octets());
        }
    }
    rec
}

/// Set tunnel record: reserved, tun_id be64, type/index, flags, ttl, tos,
/// reserved, protocol
fn set_tunnel(w: &mut ActionWriter, encap: &TunnelEncap) {
    let at = w.record(opcode::SET_TUNNEL, act_size::SET_TUN);
    w.put(at + 4, &u64::from(encap.vni).to_be_bytes());
    w.u32(at + 12, (tun_type_of(encap.kind) as u32) << 4);

    let (flags, proto) = match encap.kind {
        TunnelKind::Vxlan => (0, 0),
        TunnelKind::Geneve => (0, encap.protocol),
        TunnelKind::Nvgre => (GRE_FLAG_KEY, ETH_P_TEB),
    };
    w.u16(at + 16, flags);
    let (ttl, tos) = match encap.ip {
        EncapIp::V4 { ttl, tos, .. } => (ttl, tos),
        EncapIp::V6 { hop_limit, tc, .. } => (hop_limit, tc),
    };
    w.buf[at + 18] = ttl;
    w.buf[at + 19] = tos;
    w.u16(at + 26, proto);
}

fn encap_neighbor(encap: &TunnelEncap, in_port: u32) -> NeighborNotice {
    let (dst, src): (IpAddr, IpAddr) = match encap.ip {
        EncapIp::V4 { src, dst, .. } => (dst.into(), src.into()),
        EncapIp::V6 { src, dst, .. } => (dst.into(), src.into()),
    };
    NeighborNotice {
        payload: NeighborPayload {
            dst,
            src,
            dst_mac: encap.eth_dst,
            src_mac: encap.eth_src,
        },
        in_port,
        decap: None,
    }
}

fn decap_neighbor(key: &KeyArtifacts, in_port: u32, ctx: &ActionContext<'_>) -> FlowerResult<NeighborNotice> {
    let (Some(outer_src), Some(outer_dst)) = (key.outer_src, key.outer_dst) else {
        return Err(FlowerError::invalid("decap requires the outer addresses to be matched"));
    };
    let (eth_src, eth_dst) = key.outer_eth.map_or(([0; 6], [0; 6]), |e| (e.src, e.dst));

    let decap = ctx.features.decap_v2.then(|| match key.outer_vlan {
        Some(vlan) => DecapContext {
            host_ctx: ctx.host_ctx,
            vlan_tpid: ETH_P_QINQ,
            vlan_tci: vlan.tci | VLAN_CFI,
        },
        None => DecapContext::untagged(ctx.host_ctx),
    });

    // Traffic arrives from the remote end, so the neighbor is the matched source.
    Ok(NeighborNotice {
        payload: NeighborPayload {
            dst: outer_src,
            src: outer_dst,
            dst_mac: eth_src,
            src_mac: eth_dst,
        },
        in_port,
        decap,
    })
}

/// Compile `actions` into an action buffer shaped by `layout`
pub fn compile(
    actions: &[Action],
    layout: &KeyLayout,
    key: &KeyArtifacts,
    ctx: &ActionContext<'_>,
) -> FlowerResult<CompiledActions> {
    let mut w = ActionWriter {
        buf: Vec::with_capacity(layout.act_size),
        slots: Slots::default(),
    };
    let mut out = CompiledActions {
        buf: Vec::new(),
        shortcut: SHORTCUT_NULL,
        kind: FlowType::Common,
        install: true,
        meter: None,
        neighbor: None,
        pre_tunnel: None,
        rss: None,
    };
    let in_port = in_port_word(layout);
    let mut outputs_left = layout.output_count;
    let mut drop = false;
    let mut pending_vlan: Option<(u16, u8)> = None;

    for action in actions {
        match action {
            Action::Void | Action::Count | Action::Jump(_) => {}
            Action::Drop => drop = true,
            Action::Output { port } => {
                let hw_port = ctx
                    .ports
                    .get(*port)
                    .map(|p| p.hw_port)
                    .ok_or_else(|| FlowerError::invalid(format!("output port {port} does not exist")))?;
                outputs_left = outputs_left.saturating_sub(1);
                let at = w.record(opcode::OUTPUT, act_size::OUTPUT);
                if outputs_left == 0 {
                    w.u16(at + 2, OUTPUT_FLAG_LAST);
                }
                w.u32(at + 4, hw_port);
                out.shortcut = hw_port;
            }
            Action::SetMacSrc(mac) => set_mac(&mut w, mac, true),
            Action::SetMacDst(mac) => set_mac(&mut w, mac, false),
            Action::PopVlan => {
                w.record(opcode::POP_VLAN, act_size::POP_VLAN);
                out.shortcut = SHORTCUT_POP_VLAN;
            }
            Action::PushVlan { ethertype } => pending_vlan = Some((*ethertype, 0)),
            Action::SetVlanPcp(pcp) => {
                if let Some((_, p)) = pending_vlan.as_mut() {
                    *p = *pcp;
                }
            }
            Action::SetVlanVid(vid) => {
                let (tpid, pcp) = pending_vlan
                    .take()
                    .ok_or_else(|| FlowerError::invalid("set_vlan_vid must follow push_vlan"))?;
                let at = w.record(opcode::PUSH_VLAN, act_size::PUSH_VLAN);
                w.u16(at + 4, tpid);
                w.u16(at + 6, (vid & 0x0fff) | (u16::from(pcp & 0x07) << 13));
            }
            Action::SetIpv4Src(addr) => set_ipv4(&mut w, addr.octets(), true),
            Action::SetIpv4Dst(addr) => set_ipv4(&mut w, addr.octets(), false),
            Action::SetIpv6Src(addr) => set_ipv6(&mut w, addr.octets(), true),
            Action::SetIpv6Dst(addr) => set_ipv6(&mut w, addr.octets(), false),
            Action::SetTpSrc(port) => set_tport(&mut w, *port, true, key.tcp),
            Action::SetTpDst(port) => set_tport(&mut w, *port, false, key.tcp),
            Action::SetTtl(ttl) => {
                if layout.key_layer.contains(KeyLayer::IPV4) {
                    let at = ttl_tos(&mut w);
                    w.buf[at + 2] = 0xff;
                    w.buf[at + 4] = *ttl;
                } else {
                    let at = tc_hl(&mut w);
                    w.buf[at + 3] = 0xff;
                    w.buf[at + 7] = *ttl;
                }
            }
            Action::SetIpv4Dscp(dscp) => {
                let at = ttl_tos(&mut w);
                w.buf[at + 3] = 0xfc;
                w.buf[at + 5] = dscp << 2;
            }
            Action::SetIpv6Dscp(dscp) => {
                let at = tc_hl(&mut w);
                w.buf[at + 2] = 0xfc;
                w.buf[at + 6] = dscp << 2;
            }
            Action::Encap(encap) => {
                w.prepend(&pre_tunnel_record(&encap.ip));
                set_tunnel(&mut w, encap);
                out.neighbor = Some(encap_neighbor(encap, in_port));
                out.kind = FlowType::Encap;
            }
            Action::Decap => {
                out.pre_tunnel = Some(PreTunnelRequest {
                    mac: ctx.owner.mac,
                    v6: layout.tun_ipv6(),
                });
                out.neighbor = Some(decap_neighbor(key, in_port, ctx)?);
                out.kind = FlowType::Decap;
                out.install = false;
            }
            Action::Meter { id } => {
                let profile_id = ctx.meters.check(*id)?;
                let at = w.record(opcode::METER, act_size::METER);
                w.u32(at + 4, profile_id);
                out.meter = Some(*id);
            }
            Action::Mark(mark) if !ctx.features.partial_flow => {
                let at = w.record(opcode::SET_PARTIAL, act_size::MARK);
                w.u32(at + 4, *mark);
            }
            Action::Mark(mark) => set_partial(&mut w, Some(*mark), None),
            Action::Queue(queue) => set_partial(&mut w, None, Some(*queue)),
            Action::Rss(conf) => {
                out.rss = Some(conf.clone());
                out.kind = FlowType::Rss;
            }
        }
    }

    if out.install && actions.is_empty() {
        return Err(FlowerError::invalid("the action list is empty"));
    }
    if w.buf.len() != layout.act_size {
        return Err(FlowerError::invalid(format!(
            "action buffer is {} bytes, layout expects {}",
            w.buf.len(),
            layout.act_size
        )));
    }

    if drop {
        out.shortcut = SHORTCUT_DROP;
    } else if actions.len() > 1 {
        out.shortcut = SHORTCUT_NULL;
    }
    out.buf = w.buf;
    Ok(out)
}
