//! Flow Engine
//!
//! Lifecycle of offloaded flows: create, validate, destroy, flush and
//! query, on top of the resource caches and the firmware channel.
//!
//! # Design
//!
//! - Every acquisition made while creating a flow is journaled; a failure
//!   unwinds the journal newest first, so nothing outlives a reported error
//! - `validate` runs the create pipeline up to the tunnel caches and always
//!   unwinds
//! - Teardown carries on past a failed step and reports the first error
//! - The stats counter table is the only state shared with other threads

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use flower_common::{jhash, FeatureFlags, FlowEngineConfig, FlowerError, FlowerResult, PortConfig};
use metrics::{counter, gauge};
use tracing::{debug, error, info, warn};

use crate::action::{Action, RssConf};
use crate::action_compiler::{self, ActionContext};
use crate::firmware::Firmware;
use crate::flow::{
    CompiledFlow, FlowHandle, FlowMeta, FlowType, MetaFlags, PreTunnelBinding, TunnelBinding, LW_SHIFT,
};
use crate::id_pool::{Allocation, PoolError};
use crate::item::Item;
use crate::key_compiler;
use crate::layout::{self, KeyLayout, LayoutContext, PORT_UNSPECIFIED};
use crate::mask::{MaskRegistry, MaskSnapshot};
use crate::meter::MeterTable;
use crate::port::PortTable;
use crate::registry::{FlowRegistry, InsertOutcome};
use crate::stats::{CtxGeometry, FlowCounters, StatsAllocator, StatsPoolState, StatsTable};
use crate::tunnel::{
    mac_index, IpOffloadList, IpOffloadSnapshot, IpOffloadTable, NeighborCache, NeighborNotice,
    NeighborPayload, PreTunnelAdd, PreTunnelOutcome, PreTunnelSnapshot, PreTunnelTable,
};

/// One acquisition, with what it takes to undo it
#[derive(Debug)]
enum Acquired {
    Stats(Allocation),
    Mask { bytes: Vec<u8>, was_new: bool },
    IpOffload { addr: IpAddr, changed: bool },
    PreTunnel { mac: [u8; 6], add: PreTunnelAdd, v6: bool, meta: FlowMeta },
    Neighbor { notice: NeighborNotice, was_new: bool },
    Rss { port: u16, conf: RssConf },
    Registered(u32),
    Installed(u32),
}

/// A compiled flow whose resources are held but not yet registered
struct Prepared {
    flow: CompiledFlow,
    journal: Vec<Acquired>,
}

/// Comparable view of every resource pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSnapshot {
    /// Mask rows and id pool
    pub masks: MaskSnapshot,
    /// Stats context allocator
    pub stats: StatsPoolState,
    /// Tunnel neighbors and reference counts
    pub neighbors: Vec<(NeighborPayload, u32)>,
    /// Pre-tunnel rows
    pub pre_tunnel: PreTunnelSnapshot,
    /// Tunnel endpoint lists
    pub ip_offload: IpOffloadSnapshot,
    /// Meter reference counts
    pub meters: Vec<(u32, u32)>,
    /// Registered flow records
    pub flows: usize,
}

fn stats_error(err: PoolError) -> FlowerError {
    match err {
        PoolError::Exhausted => FlowerError::ResourceExhausted("stats context"),
        other => other.into(),
    }
}

fn keep_first(slot: &mut Option<FlowerError>, result: FlowerResult<()>) {
    if let Err(e) = result {
        warn!(error = %e, "flow teardown step failed");
        slot.get_or_insert(e);
    }
}

/// Flow offload engine
pub struct FlowEngine<F: Firmware> {
    features: FeatureFlags,
    hash_seed: u32,
    firmware: F,
    ports: PortTable,
    meters: MeterTable,
    masks: MaskRegistry,
    stats: StatsAllocator,
    counters: Arc<StatsTable>,
    neighbors: NeighborCache,
    pre_tunnel: PreTunnelTable,
    ip_offload: IpOffloadTable,
    registry: FlowRegistry,
    handles: HashMap<FlowHandle, u32>,
    next_handle: u64,
    flow_version: u64,
}

impl<F: Firmware> FlowEngine<F> {
    /// Create an engine talking to `firmware`
    pub fn new(config: FlowEngineConfig, firmware: F) -> FlowerResult<Self> {
        config.validate()?;

        let geometry = CtxGeometry::new(config.ctx_count, config.ctx_split);
        let hash_seed = config.hash_seed.unwrap_or_else(rand::random);
        info!(
            ctx_count = config.ctx_count,
            ctx_split = config.ctx_split,
            pre_tunnel_limit = config.pre_tunnel_limit,
            ports = config.ports.len(),
            "flow engine started"
        );

        Ok(Self {
            features: config.features,
            hash_seed,
            firmware,
            ports: PortTable::from_config(&config.ports),
            meters: MeterTable::from_config(&config.meters),
            masks: MaskRegistry::new(hash_seed),
            stats: StatsAllocator::new(geometry),
            counters: StatsTable::new(geometry),
            neighbors: NeighborCache::new(),
            pre_tunnel: PreTunnelTable::new(config.pre_tunnel_limit, config.pre_tunnel_release),
            ip_offload: IpOffloadTable::new(),
            registry: FlowRegistry::new(),
            handles: HashMap::new(),
            next_handle: 0,
            flow_version: 0,
        })
    }

    /// Create a flow on port `owner`
    pub fn create(&mut self, owner: u16, items: &[Item], actions: &[Action], cookie: u64) -> FlowerResult<FlowHandle> {
        self.create_with(owner, items, actions, cookie, false)
    }

    /// Create a flow that identical flows may share
    pub fn create_merge(
        &mut self,
        owner: u16,
        items: &[Item],
        actions: &[Action],
        cookie: u64,
    ) -> FlowerResult<FlowHandle> {
        self.create_with(owner, items, actions, cookie, true)
    }

    fn create_with(
        &mut self,
        owner: u16,
        items: &[Item],
        actions: &[Action],
        cookie: u64,
        merge: bool,
    ) -> FlowerResult<FlowHandle> {
        let result = self.try_create(owner, items, actions, cookie, merge);
        if let Err(e) = &result {
            counter!("flower_flow_failures_total", "op" => "create").increment(1);
            warn!(owner, error = %e, "flow create failed");
        }
        result
    }

    fn try_create(
        &mut self,
        owner: u16,
        items: &[Item],
        actions: &[Action],
        cookie: u64,
        merge: bool,
    ) -> FlowerResult<FlowHandle> {
        let Prepared { flow, mut journal } = self.prepare(owner, items, actions, cookie, merge)?;
        let (hash_key, install, meter) = (flow.hash_key, flow.install, flow.meter);

        match self.registry.insert_merge(flow) {
            Ok(InsertOutcome::Inserted) => journal.push(Acquired::Registered(hash_key)),
            Ok(InsertOutcome::Merged) => {
                self.unwind(journal);
                let handle = self.issue_handle(hash_key);
                debug!(hash_key, handle = handle.0, "flow merged into existing rule");
                return Ok(handle);
            }
            Err(e) => {
                self.unwind(journal);
                return Err(e.into());
            }
        }

        if install {
            let result = match self.registry.find(hash_key) {
                Some(flow) => self.firmware.install(flow).map_err(FlowerError::from),
                None => Err(FlowerError::invalid("registered flow vanished")),
            };
            if let Err(e) = result {
                self.unwind(journal);
                return Err(e);
            }
            journal.push(Acquired::Installed(hash_key));
        }

        if let Some(id) = meter {
            if let Err(e) = self.meters.acquire(id) {
                self.unwind(journal);
                return Err(e);
            }
        }

        self.flow_version += 1;
        if let Some(flow) = self.registry.find_mut(hash_key) {
            flow.meta.flow_version = self.flow_version;
        }
        let handle = self.issue_handle(hash_key);

        counter!("flower_flows_created_total").increment(1);
        self.update_installed_gauge();
        info!(owner, hash_key, handle = handle.0, install, "flow created");
        Ok(handle)
    }

    /// Check that a flow could be created, without keeping anything
    pub fn validate(&mut self, owner: u16, items: &[Item], actions: &[Action]) -> FlowerResult<()> {
        match self.prepare(owner, items, actions, 0, false) {
            Ok(Prepared { journal, .. }) => {
                self.unwind(journal);
                Ok(())
            }
            Err(e) => {
                counter!("flower_flow_failures_total", "op" => "validate").increment(1);
                debug!(owner, error = %e, "flow validation failed");
                Err(e)
            }
        }
    }

    /// Compile a flow and take every resource it needs, short of the
    /// registry and the hardware
    fn prepare(
        &mut self,
        owner: u16,
        items: &[Item],
        actions: &[Action],
        cookie: u64,
        merge: bool,
    ) -> FlowerResult<Prepared> {
        let port = self
            .ports
            .get(owner)
            .cloned()
            .ok_or_else(|| FlowerError::invalid(format!("port {owner} does not exist")))?;

        let ctx = LayoutContext {
            ports: &self.ports,
            owner: &port,
            features: self.features,
        };
        let mut layout = layout::calculate(items, actions, &ctx)?;
        if layout.port == PORT_UNSPECIFIED {
            layout.port = port.hw_port;
        }

        let mut journal = Vec::new();
        match self.build(&port, &layout, items, actions, cookie, merge, &mut journal) {
            Ok(flow) => Ok(Prepared { flow, journal }),
            Err(e) => {
                self.unwind(journal);
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        &mut self,
        port: &PortConfig,
        layout: &KeyLayout,
        items: &[Item],
        actions: &[Action],
        cookie: u64,
        merge: bool,
        journal: &mut Vec<Acquired>,
    ) -> FlowerResult<CompiledFlow> {
        let ctx = self.stats.alloc().map_err(stats_error)?;
        journal.push(Acquired::Stats(ctx));
        let host_ctx = ctx.id;

        let key = key_compiler::compile(items, layout)?;
        let acts = action_compiler::compile(
            actions,
            layout,
            &key.artifacts,
            &ActionContext {
                ports: &self.ports,
                owner: port,
                meters: &self.meters,
                features: self.features,
                host_ctx,
            },
        )?;

        let mask_ref = self.masks.lookup_or_insert(&key.mask)?;
        journal.push(Acquired::Mask {
            bytes: key.mask.clone(),
            was_new: mask_ref.is_new,
        });

        let mut exact = key.exact;
        exact[layout.offsets().meta_tci + 1] = mask_ref.mask_id;
        let hash_key = jhash(&exact, self.hash_seed);

        let meta = FlowMeta {
            key_len: (exact.len() >> LW_SHIFT) as u16,
            mask_len: (key.mask.len() >> LW_SHIFT) as u16,
            act_len: (acts.buf.len() >> LW_SHIFT) as u16,
            flags: if mask_ref.is_new {
                MetaFlags::MANAGE_MASK
            } else {
                MetaFlags::empty()
            },
            shortcut: acts.shortcut,
            host_ctx_id: host_ctx,
            cookie,
            flow_version: 0,
        };

        let mut tunnel = TunnelBinding {
            is_v6: layout.tun_ipv6() || acts.neighbor.is_some_and(|n| n.payload.is_v6()),
            ..TunnelBinding::default()
        };

        if let Some(addr) = key.artifacts.tunnel_dst {
            let changed = self.ip_offload.add(addr);
            if changed {
                if let Err(e) = self.sync_ip_offload(addr.is_ipv6()) {
                    self.ip_offload.undo_add(addr)?;
                    return Err(e);
                }
            }
            journal.push(Acquired::IpOffload { addr, changed });
            tunnel.ip_offload = Some(addr);
        }

        if let Some(req) = acts.pre_tunnel {
            let add = self.pre_tunnel.add(req.mac)?;
            if add.outcome == PreTunnelOutcome::New {
                if let Err(e) = self.program_pre_tunnel(req.mac, mac_index(add.index, req.v6), &meta) {
                    self.pre_tunnel.undo_add(&req.mac, add.outcome)?;
                    return Err(e);
                }
            }
            journal.push(Acquired::PreTunnel {
                mac: req.mac,
                add,
                v6: req.v6,
                meta,
            });
            tunnel.pre_tunnel = Some(PreTunnelBinding {
                mac: req.mac,
                index: add.index,
            });
        }

        if let Some(notice) = acts.neighbor {
            let was_new = self.neighbors.add(&notice);
            if was_new || (acts.kind == FlowType::Decap && self.features.decap_v2) {
                if let Err(e) = self.firmware.notify_tunnel_neighbor(&notice) {
                    self.neighbors.undo_add(&notice.payload, was_new)?;
                    return Err(e.into());
                }
            }
            journal.push(Acquired::Neighbor { notice, was_new });
            tunnel.neighbor = Some(notice);
        }

        if let Some(conf) = &acts.rss {
            self.firmware.configure_rss(port.id, conf, false)?;
            journal.push(Acquired::Rss {
                port: port.id,
                conf: conf.clone(),
            });
        }

        Ok(CompiledFlow {
            meta,
            exact,
            mask: key.mask,
            actions: acts.buf,
            hash_key,
            install: acts.install,
            merge,
            kind: acts.kind,
            owner: port.id,
            mask_id: mask_ref.mask_id,
            stats_ctx: host_ctx,
            meter: acts.meter,
            tunnel,
            rss: acts.rss,
        })
    }

    fn unwind(&mut self, journal: Vec<Acquired>) {
        for step in journal.into_iter().rev() {
            counter!("flower_unwind_steps_total").increment(1);
            debug!(?step, "unwinding");
            if let Err(e) = self.undo(step) {
                error!(error = %e, "unwind step failed");
            }
        }
    }

    fn undo(&mut self, step: Acquired) -> FlowerResult<()> {
        match step {
            Acquired::Stats(alloc) => self.stats.rollback(alloc).map_err(stats_error)?,
            Acquired::Mask { bytes, was_new } => self.masks.undo_insert(&bytes, was_new)?,
            Acquired::IpOffload { addr, changed } => {
                self.ip_offload.undo_add(addr)?;
                if changed {
                    self.sync_ip_offload(addr.is_ipv6())?;
                }
            }
            Acquired::PreTunnel { mac, add, v6, meta } => {
                self.pre_tunnel.undo_add(&mac, add.outcome)?;
                if add.outcome == PreTunnelOutcome::New {
                    let index = mac_index(add.index, v6);
                    if !self.features.decap_v2 {
                        self.firmware.notify_pre_tunnel_rule(&meta, index, true)?;
                    }
                    self.firmware.notify_mac_table(mac, index, true)?;
                }
            }
            Acquired::Neighbor { notice, was_new } => {
                self.neighbors.undo_add(&notice.payload, was_new)?;
                if was_new {
                    self.firmware.notify_tunnel_neighbor_remove(&notice)?;
                }
            }
            Acquired::Rss { port, conf } => self.firmware.configure_rss(port, &conf, true)?,
            Acquired::Registered(hash_key) => {
                self.registry.remove_merge(hash_key)?;
            }
            Acquired::Installed(hash_key) => {
                if let Some(flow) = self.registry.find(hash_key) {
                    self.firmware.remove(flow)?;
                }
            }
        }
        Ok(())
    }

    /// Program the MAC table rule of a new pre-tunnel row, and its
    /// pre-tunnel rule unless the firmware tracks decap per neighbor
    fn program_pre_tunnel(&mut self, mac: [u8; 6], index: u16, meta: &FlowMeta) -> FlowerResult<()> {
        self.firmware.notify_mac_table(mac, index, false)?;
        if !self.features.decap_v2 {
            if let Err(e) = self.firmware.notify_pre_tunnel_rule(meta, index, false) {
                if let Err(undo) = self.firmware.notify_mac_table(mac, index, true) {
                    error!(error = %undo, index, "mac table rule left behind");
                }
                return Err(e.into());
            }
        }
        Ok(())
    }

    fn sync_ip_offload(&mut self, v6: bool) -> FlowerResult<()> {
        let result = if v6 {
            let addrs = self.ip_offload.v6_addrs();
            self.firmware.notify_ip_offload(IpOffloadList::V6(&addrs))
        } else {
            let addrs = self.ip_offload.v4_addrs();
            self.firmware.notify_ip_offload(IpOffloadList::V4(&addrs))
        };
        result.map_err(FlowerError::from)
    }

    fn issue_handle(&mut self, hash_key: u32) -> FlowHandle {
        self.next_handle += 1;
        let handle = FlowHandle(self.next_handle);
        self.handles.insert(handle, hash_key);
        handle
    }

    fn update_installed_gauge(&self) {
        let installed = self.registry.iter().filter(|f| f.install).count();
        gauge!("flower_flows_installed").set(installed as f64);
    }

    /// Destroy a flow
    pub fn destroy(&mut self, handle: FlowHandle) -> FlowerResult<()> {
        let result = self.try_destroy(handle);
        if let Err(e) = &result {
            counter!("flower_flow_failures_total", "op" => "destroy").increment(1);
            warn!(handle = handle.0, error = %e, "flow destroy failed");
        }
        result
    }

    fn try_destroy(&mut self, handle: FlowHandle) -> FlowerResult<()> {
        let hash_key = *self
            .handles
            .get(&handle)
            .ok_or_else(|| FlowerError::invalid(format!("unknown flow handle {}", handle.0)))?;
        let flow = self
            .registry
            .find(hash_key)
            .ok_or_else(|| FlowerError::invalid(format!("flow handle {} has no rule", handle.0)))?;

        let shared = flow.merge && self.registry.ref_count(hash_key).unwrap_or(0) > 1;
        if !shared && flow.install {
            self.firmware.remove(flow)?;
        }

        let removed = self.registry.remove_merge(hash_key)?;
        self.handles.remove(&handle);
        let Some(flow) = removed else {
            debug!(hash_key, handle = handle.0, "merged flow reference dropped");
            return Ok(());
        };

        let result = self.release(&flow);
        self.flow_version += 1;
        counter!("flower_flows_destroyed_total").increment(1);
        self.update_installed_gauge();
        info!(hash_key, handle = handle.0, "flow destroyed");
        result
    }

    /// Hand back everything a removed flow held
    fn release(&mut self, flow: &CompiledFlow) -> FlowerResult<()> {
        let mut first_err = None;
        let decap_v2 = self.features.decap_v2;

        if let Some(notice) = &flow.tunnel.neighbor {
            let fw = &mut self.firmware;
            let released = self.neighbors.release_with(&notice.payload, |n| {
                fw.notify_tunnel_neighbor_remove(n).map_err(FlowerError::from)
            });
            match released {
                Ok(remaining) if remaining > 0 && flow.kind == FlowType::Decap && decap_v2 => {
                    if let Some(entry) = self.neighbors.get(&notice.payload) {
                        let result = self.firmware.notify_tunnel_neighbor(&entry.notice);
                        keep_first(&mut first_err, result.map_err(FlowerError::from));
                    }
                }
                Ok(_) => {}
                Err(e) => keep_first(&mut first_err, Err(e)),
            }
        }

        if let Some(binding) = flow.tunnel.pre_tunnel {
            let fw = &mut self.firmware;
            let (meta, v6) = (flow.meta, flow.tunnel.is_v6);
            let released = self.pre_tunnel.release_with(&binding.mac, |entry| {
                let index = mac_index(entry.index, v6);
                fw.notify_mac_table(entry.mac, index, true)?;
                if !decap_v2 {
                    fw.notify_pre_tunnel_rule(&meta, index, true)?;
                }
                Ok(())
            });
            keep_first(&mut first_err, released.map(|_| ()));
        }

        if let Some(addr) = flow.tunnel.ip_offload {
            match self.ip_offload.release(addr) {
                Ok(true) => {
                    let result = self.sync_ip_offload(addr.is_ipv6());
                    keep_first(&mut first_err, result);
                }
                Ok(false) => {}
                Err(e) => keep_first(&mut first_err, Err(e)),
            }
        }

        if let Some(conf) = &flow.rss {
            let result = self.firmware.configure_rss(flow.owner, conf, true);
            keep_first(&mut first_err, result.map_err(FlowerError::from));
        }

        if let Some(id) = flow.meter {
            keep_first(&mut first_err, self.meters.release(id));
        }

        keep_first(&mut first_err, self.masks.release(&flow.mask).map(|_| ()));

        keep_first(&mut first_err, self.stats.free(flow.stats_ctx).map_err(stats_error));
        self.counters.clear(flow.stats_ctx);

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Destroy every flow created on `owner`. Stops at the first failure.
    pub fn flush(&mut self, owner: u16) -> FlowerResult<usize> {
        let mut handles: Vec<FlowHandle> = self
            .handles
            .iter()
            .filter(|(_, hash_key)| self.registry.find(**hash_key).is_some_and(|f| f.owner == owner))
            .map(|(handle, _)| *handle)
            .collect();
        handles.sort_unstable();

        let mut destroyed = 0;
        for handle in handles {
            self.destroy(handle)?;
            destroyed += 1;
        }
        info!(owner, destroyed, "flows flushed");
        Ok(destroyed)
    }

    /// Counters of a flow, cleared afterwards when `reset` is set.
    ///
    /// `None` for unknown handles and for flows that have not seen traffic.
    pub fn query(&self, handle: FlowHandle, reset: bool) -> Option<FlowCounters> {
        let hash_key = self.handles.get(&handle)?;
        let flow = self.registry.find(*hash_key)?;
        self.counters.read(flow.stats_ctx, reset)
    }

    /// Compiled form of a flow
    pub fn flow(&self, handle: FlowHandle) -> Option<&CompiledFlow> {
        self.handles.get(&handle).and_then(|h| self.registry.find(*h))
    }

    /// Number of live handles
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Check if no flow exists
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Counter table for the data-plane updater
    pub fn stats_table(&self) -> Arc<StatsTable> {
        Arc::clone(&self.counters)
    }

    /// Register or replace a port
    pub fn add_port(&mut self, port: PortConfig) -> Option<PortConfig> {
        debug!(port = port.id, hw_port = port.hw_port, "port registered");
        self.ports.insert(port)
    }

    /// Registered ports
    pub fn ports(&self) -> &PortTable {
        &self.ports
    }

    /// Meters
    pub fn meters(&self) -> &MeterTable {
        &self.meters
    }

    /// Meters, for configuration
    pub fn meters_mut(&mut self) -> &mut MeterTable {
        &mut self.meters
    }

    /// Firmware channel
    pub fn firmware(&self) -> &F {
        &self.firmware
    }

    /// Firmware channel, for configuration
    pub fn firmware_mut(&mut self) -> &mut F {
        &mut self.firmware
    }

    /// Bumped on every create and destroy
    pub fn flow_version(&self) -> u64 {
        self.flow_version
    }

    /// Snapshot of every resource pool
    pub fn resource_snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            masks: self.masks.snapshot(),
            stats: self.stats.state(),
            neighbors: self.neighbors.snapshot(),
            pre_tunnel: self.pre_tunnel.snapshot(),
            ip_offload: self.ip_offload.snapshot(),
            meters: self.meters.ref_counts(),
            flows: self.registry.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::{FirmwareMessage, LoopbackFirmware, MessageKind};
    use crate::item::*;
    use flower_common::{FirmwareCode, MeterConfig};

    fn config() -> FlowEngineConfig {
        FlowEngineConfig {
            ctx_count: 64,
            ctx_split: 4,
            hash_seed: Some(0x5eed),
            ports: vec![
                PortConfig { id: 0, hw_port: 0x100, mac: [2, 0, 0, 0, 0, 1], rx_queues: 4 },
                PortConfig { id: 1, hw_port: 0x101, mac: [2, 0, 0, 0, 0, 2], rx_queues: 4 },
            ],
            meters: vec![MeterConfig { id: 9, profile_id: 3, shared: false, enabled: true }],
            ..Default::default()
        }
    }

    fn engine() -> FlowEngine<LoopbackFirmware> {
        FlowEngine::new(config(), LoopbackFirmware::new()).unwrap()
    }

    fn tcp_items(dst_port: u16) -> Vec<Item> {
        vec![
            Item::Eth(Match::any()),
            Item::Ipv4(Match::new(Ipv4Spec { dst: [10, 0, 0, 1], ..Default::default() })),
            Item::Tcp(Match::new(TcpSpec { src_port: 0, dst_port, flags: 0 })),
        ]
    }

    fn vxlan_decap_items() -> Vec<Item> {
        vec![
            Item::Eth(Match::new(EthSpec { dst: [2, 0, 0, 0, 0, 1], src: [4; 6], ether_type: 0 })),
            Item::Ipv4(Match::new(Ipv4Spec { src: [192, 0, 2, 1], dst: [192, 0, 2, 2], ..Default::default() })),
            Item::Udp(Match::new(UdpSpec { src_port: 0, dst_port: 4789 })),
            Item::Vxlan(Match::new(VxlanSpec { vni: 10 })),
            Item::Eth(Match::any()),
        ]
    }

    fn out(port: u16) -> Vec<Action> {
        vec![Action::Output { port }]
    }

    #[test]
    fn test_rejects_bad_config() {
        let cfg = FlowEngineConfig { ctx_split: 0, ..config() };
        assert!(FlowEngine::new(cfg, LoopbackFirmware::new()).is_err());
    }

    #[test]
    fn test_create_installs_and_manages_mask() {
        let mut engine = engine();
        let handle = engine.create(0, &tcp_items(80), &out(1), 0xc0ffee).unwrap();

        let flow = engine.flow(handle).unwrap();
        assert!(flow.install);
        assert!(flow.meta.flags.contains(MetaFlags::MANAGE_MASK));
        assert_eq!(flow.meta.cookie, 0xc0ffee);
        assert_eq!(flow.meta.host_ctx_id, flow.stats_ctx);
        assert_eq!(flow.exact[1], flow.mask_id);
        assert_eq!(flow.meta.flow_version, 1);
        assert!(engine.firmware().installed().contains(&flow.hash_key));

        // Same mask, other port number: mask reused without the flag.
        let second = engine.create(0, &tcp_items(443), &out(1), 0).unwrap();
        let flow2 = engine.flow(second).unwrap();
        assert!(!flow2.meta.flags.contains(MetaFlags::MANAGE_MASK));
        assert_eq!(flow2.mask_id, engine.flow(handle).unwrap().mask_id);
        assert_eq!(engine.flow_version(), 2);
    }

    #[test]
    fn test_duplicate_rule_unwinds() {
        let mut engine = engine();
        engine.create(0, &tcp_items(80), &out(1), 0).unwrap();
        let before = engine.resource_snapshot();

        let err = engine.create(0, &tcp_items(80), &out(1), 0).unwrap_err();
        assert!(matches!(err, FlowerError::DuplicateRule { .. }));
        assert_eq!(engine.resource_snapshot(), before);
    }

    #[test]
    fn test_merge_aliases_existing_rule() {
        let mut engine = engine();
        let a = engine.create_merge(0, &tcp_items(80), &out(1), 0).unwrap();
        let before = engine.resource_snapshot();
        let b = engine.create_merge(0, &tcp_items(80), &out(1), 0).unwrap();

        assert_ne!(a, b);
        assert_eq!(engine.resource_snapshot(), before);
        assert_eq!(engine.firmware().count(MessageKind::Install), 1);

        engine.destroy(a).unwrap();
        assert_eq!(engine.firmware().count(MessageKind::Remove), 0);
        assert!(engine.flow(b).is_some());

        engine.destroy(b).unwrap();
        assert_eq!(engine.firmware().count(MessageKind::Remove), 1);
        assert_eq!(engine.resource_snapshot().flows, 0);
    }

    #[test]
    fn test_install_failure_restores_state() {
        let mut engine = engine();
        let before = engine.resource_snapshot();
        engine.firmware_mut().fail_on(MessageKind::Install, FirmwareCode(-5));

        let err = engine.create(0, &tcp_items(80), &out(1), 0).unwrap_err();
        assert_eq!(err, FlowerError::Firmware(FirmwareCode(-5)));
        assert_eq!(engine.resource_snapshot(), before);
        assert!(engine.is_empty());
    }

    #[test]
    fn test_destroy_releases_everything() {
        let mut engine = engine();
        let before = engine.resource_snapshot();
        let handle = engine.create(0, &tcp_items(80), &out(1), 0).unwrap();
        engine.destroy(handle).unwrap();

        let after = engine.resource_snapshot();
        assert_eq!(after.masks.entries, before.masks.entries);
        assert_eq!(after.flows, 0);
        assert!(engine.firmware().installed().is_empty());
        assert!(engine.destroy(handle).is_err());
    }

    #[test]
    fn test_validate_keeps_nothing() {
        let mut engine = engine();
        let before = engine.resource_snapshot();
        engine.validate(0, &vxlan_decap_items(), &[Action::Decap]).unwrap();
        assert_eq!(engine.resource_snapshot(), before);
        assert!(engine.is_empty());

        assert!(engine.validate(0, &tcp_items(80), &out(7)).is_err());
        assert!(engine.validate(5, &tcp_items(80), &out(1)).is_err());
    }

    #[test]
    fn test_decap_flow_caches() {
        let mut engine = engine();
        let handle = engine.create(0, &vxlan_decap_items(), &[Action::Decap], 0).unwrap();
        let flow = engine.flow(handle).unwrap();
        assert!(!flow.install);
        assert_eq!(flow.kind, FlowType::Decap);
        assert_eq!(flow.tunnel.ip_offload, Some(IpAddr::from([192, 0, 2, 2])));

        let fw = engine.firmware();
        assert_eq!(fw.count(MessageKind::Install), 0);
        assert_eq!(fw.count(MessageKind::MacTable), 1);
        assert_eq!(fw.count(MessageKind::PreTunnelRule), 1);
        assert_eq!(fw.count(MessageKind::TunnelNeighbor), 1);
        assert!(fw
            .messages()
            .contains(&FirmwareMessage::IpOffloadV4(vec![[192, 0, 2, 2].into()])));

        let snap = engine.resource_snapshot();
        assert_eq!(snap.pre_tunnel.count, 2);
        assert_eq!(snap.neighbors.len(), 1);

        engine.destroy(handle).unwrap();
        let snap = engine.resource_snapshot();
        assert_eq!(snap.pre_tunnel.count, 1);
        assert!(snap.neighbors.is_empty());
        assert_eq!(snap.ip_offload, IpOffloadSnapshot::default());
        assert!(engine
            .firmware()
            .messages()
            .contains(&FirmwareMessage::IpOffloadV4(Vec::new())));
    }

    #[test]
    fn test_neighbor_failure_unwinds_tunnel_caches() {
        let mut engine = engine();
        let before = engine.resource_snapshot();
        engine
            .firmware_mut()
            .fail_on(MessageKind::TunnelNeighbor, FirmwareCode(-110));

        let err = engine.create(0, &vxlan_decap_items(), &[Action::Decap], 0).unwrap_err();
        assert_eq!(err, FlowerError::Firmware(FirmwareCode(-110)));
        assert_eq!(engine.resource_snapshot(), before);

        let fw = engine.firmware();
        assert!(fw.messages().contains(&FirmwareMessage::IpOffloadV4(Vec::new())));
        assert!(fw
            .messages()
            .iter()
            .any(|m| matches!(m, FirmwareMessage::MacTable { remove: true, .. })));
    }

    #[test]
    fn test_meter_reference() {
        let mut engine = engine();
        let meter = vec![Action::Meter { id: 9 }, Action::Output { port: 1 }];
        let handle = engine.create(0, &tcp_items(80), &meter, 0).unwrap();
        assert_eq!(engine.meters().get(9).unwrap().ref_cnt, 1);

        // Unshared meter already in use.
        assert!(engine.create(0, &tcp_items(81), &meter, 0).is_err());

        engine.destroy(handle).unwrap();
        assert_eq!(engine.meters().get(9).unwrap().ref_cnt, 0);
    }

    #[test]
    fn test_query() {
        let mut engine = engine();
        let handle = engine.create(0, &tcp_items(80), &out(1), 0).unwrap();
        let ctx = engine.flow(handle).unwrap().stats_ctx;

        assert_eq!(engine.query(handle, false), None);
        assert!(engine.stats_table().record(ctx, 3, 180));
        assert_eq!(engine.query(handle, true), Some(FlowCounters { pkts: 3, bytes: 180 }));
        assert_eq!(engine.query(handle, false), None);
        assert_eq!(engine.query(FlowHandle(999), false), None);
    }

    #[test]
    fn test_flush_by_owner() {
        let mut engine = engine();
        engine.create(0, &tcp_items(1), &out(1), 0).unwrap();
        engine.create(0, &tcp_items(2), &out(1), 0).unwrap();
        let keep = engine.create(1, &tcp_items(3), &out(0), 0).unwrap();

        assert_eq!(engine.flush(0).unwrap(), 2);
        assert_eq!(engine.len(), 1);
        assert!(engine.flow(keep).is_some());
        assert_eq!(engine.flush(0).unwrap(), 0);
    }

    #[test]
    fn test_stats_exhaustion() {
        let cfg = FlowEngineConfig { ctx_count: 4, ctx_split: 4, ..config() };
        let mut engine = FlowEngine::new(cfg, LoopbackFirmware::new()).unwrap();
        for port in 0..4 {
            engine.create(0, &tcp_items(port), &out(1), 0).unwrap();
        }
        let before = engine.resource_snapshot();
        assert_eq!(
            engine.create(0, &tcp_items(99), &out(1), 0),
            Err(FlowerError::ResourceExhausted("stats context"))
        );
        assert_eq!(engine.resource_snapshot(), before);
    }
}
