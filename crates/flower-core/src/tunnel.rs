//! Tunnel Caches
//!
//! Reference-counted tables behind tunnel offload:
//! - Neighbor cache: next-hop entries used by encap and decap flows
//! - Pre-tunnel MAC table: port MACs steered into the tunnel pipeline
//! - Tunnel IP offload lists: local endpoint addresses the NIC terminates
//!
//! # Design
//!
//! - Tables only keep books; the engine sends the firmware messages
//! - Removal callbacks run before a row is unlinked
//! - Every add has an exact undo, independent of the release policy

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use flower_common::{FlowerError, FlowerResult, PreTunnelRelease};
use tracing::{debug, error};

use crate::id_pool::IndexBitmap;

/// Next-hop data programmed for a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NeighborPayload {
    /// Remote endpoint
    pub dst: IpAddr,
    /// Local endpoint
    pub src: IpAddr,
    /// Next hop MAC
    pub dst_mac: [u8; 6],
    /// Local MAC
    pub src_mac: [u8; 6],
}

impl NeighborPayload {
    /// Check whether the endpoints are IPv6
    pub fn is_v6(&self) -> bool {
        self.dst.is_ipv6()
    }
}

/// Extra neighbor data for decap flows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecapContext {
    /// Host context of the flow
    pub host_ctx: u32,
    /// Outer VLAN TPID, `0xffff` when untagged
    pub vlan_tpid: u16,
    /// Outer VLAN TCI, `0xffff` when untagged
    pub vlan_tci: u16,
}

impl DecapContext {
    /// Context for an untagged outer header
    pub fn untagged(host_ctx: u32) -> Self {
        Self {
            host_ctx,
            vlan_tpid: 0xffff,
            vlan_tci: 0xffff,
        }
    }
}

/// "Neighbor programmed" message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborNotice {
    /// Next-hop data
    pub payload: NeighborPayload,
    /// Hardware port of the flow
    pub in_port: u32,
    /// Decap data, sent on decap_v2 firmware only
    pub decap: Option<DecapContext>,
}

/// One neighbor row
#[derive(Debug, Clone)]
pub struct NeighborEntry {
    /// Notice the row was programmed with
    pub notice: NeighborNotice,
    /// Flows using it
    pub ref_cnt: u32,
}

/// Tunnel neighbor cache
#[derive(Debug, Default)]
pub struct NeighborCache {
    entries: Vec<NeighborEntry>,
}

impl NeighborCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, payload: &NeighborPayload) -> Option<usize> {
        self.entries.iter().position(|e| e.notice.payload == *payload)
    }

    /// Reference the neighbor of `notice`. Returns `true` for a new row.
    pub fn add(&mut self, notice: &NeighborNotice) -> bool {
        if let Some(pos) = self.position(&notice.payload) {
            self.entries[pos].ref_cnt += 1;
            debug!(dst = %notice.payload.dst, ref_cnt = self.entries[pos].ref_cnt, "tunnel neighbor hit");
            return false;
        }
        self.entries.push(NeighborEntry {
            notice: *notice,
            ref_cnt: 1,
        });
        debug!(dst = %notice.payload.dst, "tunnel neighbor added");
        true
    }

    /// Drop a reference. `on_last` runs before the last reference's row is
    /// unlinked; the row is unlinked even if it fails. Returns the
    /// references left.
    pub fn release_with<F>(&mut self, payload: &NeighborPayload, on_last: F) -> FlowerResult<u32>
    where
        F: FnOnce(&NeighborNotice) -> FlowerResult<()>,
    {
        let pos = self
            .position(payload)
            .ok_or_else(|| FlowerError::invalid("tunnel neighbor not found"))?;

        let entry = &mut self.entries[pos];
        entry.ref_cnt -= 1;
        if entry.ref_cnt > 0 {
            return Ok(entry.ref_cnt);
        }

        let result = on_last(&entry.notice);
        self.entries.remove(pos);
        debug!(dst = %payload.dst, "tunnel neighbor removed");
        result.map(|_| 0)
    }

    /// Exactly undo an `add` of `payload`
    pub fn undo_add(&mut self, payload: &NeighborPayload, was_new: bool) -> FlowerResult<()> {
        let pos = self
            .position(payload)
            .ok_or_else(|| FlowerError::invalid("tunnel neighbor not found"))?;
        if was_new {
            self.entries.remove(pos);
        } else {
            self.entries[pos].ref_cnt -= 1;
        }
        Ok(())
    }

    /// Row holding `payload`
    pub fn get(&self, payload: &NeighborPayload) -> Option<&NeighborEntry> {
        self.position(payload).map(|pos| &self.entries[pos])
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(payload, ref_cnt)` in insertion order
    pub fn snapshot(&self) -> Vec<(NeighborPayload, u32)> {
        self.entries.iter().map(|e| (e.notice.payload, e.ref_cnt)).collect()
    }
}

/// Port type bits of a MAC table index
pub mod mac_index_bits {
    /// Not a physical port
    pub const OTHER_PORT: u16 = 0x4;
    /// Index refers to a pre-tunnel row
    pub const PRE_TUN_IDX: u16 = 0x8;
    /// Tunnel is IPv6
    pub const IPV6: u16 = 0x80;
}

/// MAC table index of a pre-tunnel row
pub fn mac_index(index: u16, v6: bool) -> u16 {
    let mut idx = (index << 8) | mac_index_bits::OTHER_PORT | mac_index_bits::PRE_TUN_IDX;
    if v6 {
        idx |= mac_index_bits::IPV6;
    }
    idx
}

/// One pre-tunnel row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreTunnelEntry {
    /// Port MAC
    pub mac: [u8; 6],
    /// Row index, never 0
    pub index: u16,
    /// Flows using it; 0 for parked rows
    pub ref_cnt: u32,
}

/// How `add` found its row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreTunnelOutcome {
    /// New row; needs programming
    New,
    /// Live row
    Hit,
    /// Parked row taken back into use; still programmed
    Revived,
}

/// Result of [`PreTunnelTable::add`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreTunnelAdd {
    /// Row index
    pub index: u16,
    /// How the row was found
    pub outcome: PreTunnelOutcome,
}

/// Comparable view of the pre-tunnel table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreTunnelSnapshot {
    /// Rows sorted by index
    pub entries: Vec<PreTunnelEntry>,
    /// Rows plus the reserved index
    pub count: u32,
}

/// Pre-tunnel MAC table
#[derive(Debug)]
pub struct PreTunnelTable {
    entries: Vec<PreTunnelEntry>,
    used: IndexBitmap,
    count: u32,
    limit: u16,
    policy: PreTunnelRelease,
}

impl PreTunnelTable {
    /// Table of `limit` indices (index 0 reserved)
    pub fn new(limit: u16, policy: PreTunnelRelease) -> Self {
        Self {
            entries: Vec::new(),
            used: IndexBitmap::new(limit),
            count: 1,
            limit,
            policy,
        }
    }

    /// Release policy
    pub fn policy(&self) -> PreTunnelRelease {
        self.policy
    }

    fn position(&self, mac: &[u8; 6]) -> Option<usize> {
        self.used
            .iter_set()
            .find_map(|index| self.entries.iter().position(|e| e.index == index && e.mac == *mac))
    }

    /// Reference the row for `mac`
    pub fn add(&mut self, mac: [u8; 6]) -> FlowerResult<PreTunnelAdd> {
        if self.count >= self.limit as u32 {
            return Err(FlowerError::ResourceExhausted("pre-tunnel table"));
        }

        if let Some(pos) = self.position(&mac) {
            let entry = &mut self.entries[pos];
            let outcome = if entry.ref_cnt == 0 {
                PreTunnelOutcome::Revived
            } else {
                PreTunnelOutcome::Hit
            };
            entry.ref_cnt += 1;
            debug!(index = entry.index, ref_cnt = entry.ref_cnt, "pre-tunnel hit");
            return Ok(PreTunnelAdd {
                index: entry.index,
                outcome,
            });
        }

        let index = self
            .used
            .first_free()
            .ok_or(FlowerError::ResourceExhausted("pre-tunnel table"))?;
        self.used.set(index);
        self.entries.push(PreTunnelEntry { mac, index, ref_cnt: 1 });
        self.count += 1;
        debug!(index, "pre-tunnel row added");

        Ok(PreTunnelAdd {
            index,
            outcome: PreTunnelOutcome::New,
        })
    }

    /// Drop a reference on `mac`. `on_free` runs for every row handed
    /// back, before it is unlinked; rows are unlinked even if it fails and
    /// the first error is returned. Returns the number of rows freed.
    pub fn release_with<F>(&mut self, mac: &[u8; 6], mut on_free: F) -> FlowerResult<usize>
    where
        F: FnMut(&PreTunnelEntry) -> FlowerResult<()>,
    {
        if self.count == 1 {
            return Ok(0);
        }
        let pos = self
            .position(mac)
            .ok_or_else(|| FlowerError::invalid("pre-tunnel row not found"))?;
        if self.entries[pos].ref_cnt == 0 {
            error!(index = self.entries[pos].index, "pre-tunnel row released while parked");
            return Err(FlowerError::invalid("pre-tunnel row is not referenced"));
        }
        self.entries[pos].ref_cnt -= 1;

        let doomed: Vec<usize> = match self.policy {
            PreTunnelRelease::Refcounted if self.entries[pos].ref_cnt == 0 => vec![pos],
            PreTunnelRelease::Resident if self.entries.iter().all(|e| e.ref_cnt == 0) => {
                (0..self.entries.len()).collect()
            }
            _ => Vec::new(),
        };

        let mut first_err = None;
        for &pos in &doomed {
            if let Err(e) = on_free(&self.entries[pos]) {
                first_err.get_or_insert(e);
            }
        }
        for &pos in doomed.iter().rev() {
            let entry = self.entries.remove(pos);
            self.used.clear(entry.index);
            self.count -= 1;
            debug!(index = entry.index, "pre-tunnel row freed");
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(doomed.len()),
        }
    }

    /// Exactly undo an `add`
    pub fn undo_add(&mut self, mac: &[u8; 6], outcome: PreTunnelOutcome) -> FlowerResult<()> {
        let pos = self
            .position(mac)
            .ok_or_else(|| FlowerError::invalid("pre-tunnel row not found"))?;
        match outcome {
            PreTunnelOutcome::New => {
                let entry = self.entries.remove(pos);
                self.used.clear(entry.index);
                self.count -= 1;
            }
            PreTunnelOutcome::Hit | PreTunnelOutcome::Revived => {
                self.entries[pos].ref_cnt -= 1;
            }
        }
        Ok(())
    }

    /// Row for `mac`
    pub fn get(&self, mac: &[u8; 6]) -> Option<&PreTunnelEntry> {
        self.position(mac).map(|pos| &self.entries[pos])
    }

    /// Rows plus the reserved index
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Snapshot for diffing
    pub fn snapshot(&self) -> PreTunnelSnapshot {
        let mut entries = self.entries.clone();
        entries.sort_by_key(|e| e.index);
        PreTunnelSnapshot {
            entries,
            count: self.count,
        }
    }
}

/// Full address list of one family, as sent to firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpOffloadList<'a> {
    /// IPv4 endpoints
    V4(&'a [Ipv4Addr]),
    /// IPv6 endpoints
    V6(&'a [Ipv6Addr]),
}

/// Comparable view of the IP offload lists
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IpOffloadSnapshot {
    /// IPv4 addresses and reference counts
    pub v4: Vec<(Ipv4Addr, u32)>,
    /// IPv6 addresses and reference counts
    pub v6: Vec<(Ipv6Addr, u32)>,
}

/// Tunnel endpoint addresses terminated by the NIC
#[derive(Debug, Default)]
pub struct IpOffloadTable {
    v4: Vec<(Ipv4Addr, u32)>,
    v6: Vec<(Ipv6Addr, u32)>,
}

fn add_addr<A: PartialEq + Copy>(list: &mut Vec<(A, u32)>, addr: A) -> bool {
    if let Some(entry) = list.iter_mut().find(|(a, _)| *a == addr) {
        entry.1 += 1;
        return false;
    }
    list.push((addr, 1));
    true
}

fn release_addr<A: PartialEq + Copy>(list: &mut Vec<(A, u32)>, addr: A) -> FlowerResult<bool> {
    let pos = list
        .iter()
        .position(|(a, _)| *a == addr)
        .ok_or_else(|| FlowerError::invalid("tunnel address not offloaded"))?;
    list[pos].1 -= 1;
    if list[pos].1 > 0 {
        return Ok(false);
    }
    list.remove(pos);
    Ok(true)
}

impl IpOffloadTable {
    /// Create empty lists
    pub fn new() -> Self {
        Self::default()
    }

    /// Reference `addr`. Returns `true` when the list changed.
    pub fn add(&mut self, addr: IpAddr) -> bool {
        let changed = match addr {
            IpAddr::V4(a) => add_addr(&mut self.v4, a),
            IpAddr::V6(a) => add_addr(&mut self.v6, a),
        };
        debug!(%addr, changed, "tunnel ip offload referenced");
        changed
    }

    /// Drop a reference. Returns `true` when the list changed.
    pub fn release(&mut self, addr: IpAddr) -> FlowerResult<bool> {
        match addr {
            IpAddr::V4(a) => release_addr(&mut self.v4, a),
            IpAddr::V6(a) => release_addr(&mut self.v6, a),
        }
    }

    /// Exactly undo an `add`
    pub fn undo_add(&mut self, addr: IpAddr) -> FlowerResult<()> {
        self.release(addr).map(|_| ())
    }

    /// IPv4 addresses
    pub fn v4_addrs(&self) -> Vec<Ipv4Addr> {
        self.v4.iter().map(|(a, _)| *a).collect()
    }

    /// IPv6 addresses
    pub fn v6_addrs(&self) -> Vec<Ipv6Addr> {
        self.v6.iter().map(|(a, _)| *a).collect()
    }

    /// Snapshot for diffing
    pub fn snapshot(&self) -> IpOffloadSnapshot {
        IpOffloadSnapshot {
            v4: self.v4.clone(),
            v6: self.v6.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(last: u8) -> NeighborPayload {
        NeighborPayload {
            dst: IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)),
            src: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            dst_mac: [2, 0, 0, 0, 0, last],
            src_mac: [2, 0, 0, 0, 0, 1],
        }
    }

    fn notice(last: u8) -> NeighborNotice {
        NeighborNotice {
            payload: payload(last),
            in_port: 0x100,
            decap: None,
        }
    }

    #[test]
    fn test_neighbor_refcount() {
        let mut cache = NeighborCache::new();
        assert!(cache.add(&notice(2)));
        assert!(!cache.add(&notice(2)));
        assert!(cache.add(&notice(3)));
        assert_eq!(cache.len(), 2);

        let mut calls = 0;
        let left = cache
            .release_with(&payload(2), |_| {
                calls += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!((left, calls), (1, 0));

        let left = cache
            .release_with(&payload(2), |n| {
                calls += 1;
                assert_eq!(n.payload, payload(2));
                Ok(())
            })
            .unwrap();
        assert_eq!((left, calls), (0, 1));
        assert!(cache.get(&payload(2)).is_none());
    }

    #[test]
    fn test_neighbor_unlinked_on_notify_failure() {
        let mut cache = NeighborCache::new();
        cache.add(&notice(2));
        let result = cache.release_with(&payload(2), |_| Err(FlowerError::invalid("nope")));
        assert!(result.is_err());
        assert!(cache.is_empty());
        assert!(cache.release_with(&payload(2), |_| Ok(())).is_err());
    }

    #[test]
    fn test_neighbor_full_payload_equality() {
        let mut cache = NeighborCache::new();
        cache.add(&notice(2));
        let mut other = notice(2);
        other.payload.src_mac = [9; 6];
        assert!(cache.add(&other));
    }

    #[test]
    fn test_neighbor_undo() {
        let mut cache = NeighborCache::new();
        cache.add(&notice(2));
        let before = cache.snapshot();
        let hit = cache.add(&notice(2));
        let miss = cache.add(&notice(4));
        cache.undo_add(&payload(4), miss).unwrap();
        cache.undo_add(&payload(2), hit).unwrap();
        assert_eq!(cache.snapshot(), before);
    }

    #[test]
    fn test_mac_index() {
        assert_eq!(mac_index(1, false), 0x010c);
        assert_eq!(mac_index(3, true), 0x038c);
    }

    #[test]
    fn test_pre_tunnel_limit() {
        let mut table = PreTunnelTable::new(3, PreTunnelRelease::Refcounted);
        assert_eq!(table.add([1; 6]).unwrap(), PreTunnelAdd { index: 1, outcome: PreTunnelOutcome::New });
        assert_eq!(table.add([1; 6]).unwrap().outcome, PreTunnelOutcome::Hit);
        assert_eq!(table.add([2; 6]).unwrap().index, 2);
        assert_eq!(table.count(), 3);

        let before = table.snapshot();
        assert_eq!(table.add([3; 6]), Err(FlowerError::ResourceExhausted("pre-tunnel table")));
        assert_eq!(table.snapshot(), before);
    }

    #[test]
    fn test_pre_tunnel_refcounted_release() {
        let mut table = PreTunnelTable::new(8, PreTunnelRelease::Refcounted);
        table.add([1; 6]).unwrap();
        table.add([1; 6]).unwrap();
        table.add([2; 6]).unwrap();

        let mut freed = Vec::new();
        assert_eq!(table.release_with(&[1; 6], |e| { freed.push(e.index); Ok(()) }).unwrap(), 0);
        assert_eq!(table.release_with(&[1; 6], |e| { freed.push(e.index); Ok(()) }).unwrap(), 1);
        assert_eq!(freed, vec![1]);
        assert!(table.get(&[1; 6]).is_none());

        // The freed index is reused.
        assert_eq!(table.add([3; 6]).unwrap().index, 1);
    }

    #[test]
    fn test_pre_tunnel_resident_release() {
        let mut table = PreTunnelTable::new(8, PreTunnelRelease::Resident);
        table.add([1; 6]).unwrap();
        table.add([2; 6]).unwrap();

        assert_eq!(table.release_with(&[1; 6], |_| Ok(())).unwrap(), 0);
        assert_eq!(table.get(&[1; 6]).map(|e| e.ref_cnt), Some(0));

        // Parked rows come back without reprogramming.
        assert_eq!(table.add([1; 6]).unwrap().outcome, PreTunnelOutcome::Revived);
        assert_eq!(table.release_with(&[1; 6], |_| Ok(())).unwrap(), 0);

        let mut freed = Vec::new();
        let n = table
            .release_with(&[2; 6], |e| {
                freed.push(e.index);
                Ok(())
            })
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(freed, vec![1, 2]);
        assert_eq!(table.count(), 1);
    }

    #[test]
    fn test_pre_tunnel_release_empty_is_noop() {
        let mut table = PreTunnelTable::new(4, PreTunnelRelease::Refcounted);
        assert_eq!(table.release_with(&[1; 6], |_| Ok(())).unwrap(), 0);
    }

    #[test]
    fn test_pre_tunnel_undo_ignores_policy() {
        let mut table = PreTunnelTable::new(8, PreTunnelRelease::Resident);
        table.add([1; 6]).unwrap();
        let before = table.snapshot();

        let hit = table.add([1; 6]).unwrap();
        let new = table.add([2; 6]).unwrap();
        table.undo_add(&[2; 6], new.outcome).unwrap();
        table.undo_add(&[1; 6], hit.outcome).unwrap();
        assert_eq!(table.snapshot(), before);
    }

    #[test]
    fn test_ip_offload() {
        let mut table = IpOffloadTable::new();
        let a = IpAddr::V4(Ipv4Addr::new(192, 168, 0, 1));
        let b = IpAddr::V6(Ipv6Addr::LOCALHOST);

        assert!(table.add(a));
        assert!(!table.add(a));
        assert!(table.add(b));
        assert_eq!(table.v4_addrs(), vec![Ipv4Addr::new(192, 168, 0, 1)]);
        assert_eq!(table.v6_addrs(), vec![Ipv6Addr::LOCALHOST]);

        assert!(!table.release(a).unwrap());
        assert!(table.release(a).unwrap());
        assert!(table.release(a).is_err());
        table.undo_add(b).unwrap();
        assert_eq!(table.snapshot(), IpOffloadSnapshot::default());
    }
}
