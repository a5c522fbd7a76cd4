//! Flow Statistics Contexts
//!
//! Every offloaded flow owns one hardware counter context. Context ids
//! encode a memory unit in the upper bits and a slot index in the lower
//! [`STATS_INDEX_BITS`] bits.
//!
//! # Design
//!
//! - Fresh contexts are spread round-robin over memory units before any recycling
//! - Recycled contexts come from one ring shared by all units
//! - Counters live in one flat table behind a single mutex, shared with the
//!   data-plane updater

use std::sync::Arc;

use flower_common::STATS_INDEX_BITS;
use parking_lot::Mutex;

use crate::id_pool::{Allocation, FreeRing, Origin, PoolError};

/// Mask selecting the slot index bits of a context id
pub const STATS_INDEX_MASK: u32 = (1 << STATS_INDEX_BITS) - 1;

/// Build a context id from a memory unit and slot index
#[inline(always)]
pub const fn ctx_id(unit: u32, index: u32) -> u32 {
    (unit << STATS_INDEX_BITS) | (index & STATS_INDEX_MASK)
}

/// Memory unit of a context id
#[inline(always)]
pub const fn ctx_unit(ctx: u32) -> u32 {
    ctx >> STATS_INDEX_BITS
}

/// Slot index of a context id
#[inline(always)]
pub const fn ctx_index(ctx: u32) -> u32 {
    ctx & STATS_INDEX_MASK
}

/// Shape of the context space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtxGeometry {
    /// Number of memory units
    pub units: u32,
    /// Contexts per memory unit
    pub per_unit: u32,
}

impl CtxGeometry {
    /// Geometry for `ctx_count` contexts split over `ctx_split` units
    pub fn new(ctx_count: u32, ctx_split: u32) -> Self {
        let units = ctx_split.max(1);
        Self {
            units,
            per_unit: ctx_count / units,
        }
    }

    /// Total contexts
    pub fn capacity(&self) -> u32 {
        self.units * self.per_unit
    }

    /// Dense table slot of a context id
    pub fn slot(&self, ctx: u32) -> Option<usize> {
        let (unit, index) = (ctx_unit(ctx), ctx_index(ctx));
        if unit >= self.units || index >= self.per_unit {
            return None;
        }
        Some((unit * self.per_unit + index) as usize)
    }
}

/// Comparable view of the allocator state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsPoolState {
    /// Fresh rounds left
    pub unallocated: u32,
    /// Unit the next fresh context comes from
    pub active_unit: u32,
    /// Free ring contents, oldest first
    pub free: Vec<u32>,
}

/// Stats context allocator
#[derive(Debug, Clone)]
pub struct StatsAllocator {
    geometry: CtxGeometry,
    unallocated: u32,
    active_unit: u32,
    ring: FreeRing,
}

impl StatsAllocator {
    /// Create an allocator for the given geometry
    pub fn new(geometry: CtxGeometry) -> Self {
        Self {
            geometry,
            unallocated: geometry.per_unit,
            active_unit: 0,
            ring: FreeRing::with_capacity(geometry.capacity() as usize),
        }
    }

    /// Context space shape
    pub fn geometry(&self) -> CtxGeometry {
        self.geometry
    }

    /// Allocate a context
    pub fn alloc(&mut self) -> Result<Allocation, PoolError> {
        if self.unallocated > 0 {
            let id = ctx_id(self.active_unit, self.unallocated - 1);
            self.active_unit += 1;
            if self.active_unit == self.geometry.units {
                self.unallocated -= 1;
                self.active_unit = 0;
            }
            return Ok(Allocation {
                id,
                origin: Origin::Fresh,
            });
        }

        self.ring
            .pop()
            .map(|id| Allocation {
                id,
                origin: Origin::Recycled,
            })
            .ok_or(PoolError::Exhausted)
    }

    /// Return a context
    pub fn free(&mut self, ctx: u32) -> Result<(), PoolError> {
        if self.geometry.slot(ctx).is_none() {
            return Err(PoolError::OutOfRange(ctx));
        }
        if !self.ring.push(ctx) {
            return Err(PoolError::DoubleFree(ctx));
        }
        Ok(())
    }

    /// Undo the most recent allocation
    pub fn rollback(&mut self, alloc: Allocation) -> Result<(), PoolError> {
        match alloc.origin {
            Origin::Fresh => {
                let (unallocated, unit) = if self.active_unit == 0 {
                    (self.unallocated + 1, self.geometry.units - 1)
                } else {
                    (self.unallocated, self.active_unit - 1)
                };
                if unallocated == 0
                    || unallocated > self.geometry.per_unit
                    || ctx_id(unit, unallocated - 1) != alloc.id
                {
                    return Err(PoolError::NotLatest(alloc.id));
                }
                self.unallocated = unallocated;
                self.active_unit = unit;
            }
            Origin::Recycled => {
                if !self.ring.unpop(alloc.id) {
                    return Err(PoolError::NotLatest(alloc.id));
                }
            }
        }
        Ok(())
    }

    /// Contexts that can still be allocated
    pub fn available(&self) -> usize {
        let fresh = if self.unallocated == 0 {
            0
        } else {
            (self.unallocated - 1) * self.geometry.units + (self.geometry.units - self.active_unit)
        };
        fresh as usize + self.ring.len()
    }

    /// Snapshot for diffing
    pub fn state(&self) -> StatsPoolState {
        StatsPoolState {
            unallocated: self.unallocated,
            active_unit: self.active_unit,
            free: self.ring.iter().collect(),
        }
    }
}

/// Packet and byte counters of one context
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowCounters {
    /// Packets matched
    pub pkts: u64,
    /// Bytes matched
    pub bytes: u64,
}

/// Counter table shared between the control plane and the data-plane updater
#[derive(Debug)]
pub struct StatsTable {
    geometry: CtxGeometry,
    counters: Mutex<Vec<FlowCounters>>,
}

impl StatsTable {
    /// Table sized for the whole context space
    pub fn new(geometry: CtxGeometry) -> Arc<Self> {
        Arc::new(Self {
            geometry,
            counters: Mutex::new(vec![FlowCounters::default(); geometry.capacity() as usize]),
        })
    }

    /// Add to a context's counters. Returns `false` for unknown contexts.
    #[inline]
    pub fn record(&self, ctx: u32, pkts: u64, bytes: u64) -> bool {
        let Some(slot) = self.geometry.slot(ctx) else {
            return false;
        };
        let mut counters = self.counters.lock();
        let entry = &mut counters[slot];
        entry.pkts = entry.pkts.wrapping_add(pkts);
        entry.bytes = entry.bytes.wrapping_add(bytes);
        true
    }

    /// Read a context's counters, optionally resetting them.
    ///
    /// Returns `None` until both packets and bytes have been counted.
    pub fn read(&self, ctx: u32, reset: bool) -> Option<FlowCounters> {
        let slot = self.geometry.slot(ctx)?;
        let mut counters = self.counters.lock();
        let entry = &mut counters[slot];
        if entry.pkts == 0 || entry.bytes == 0 {
            return None;
        }
        let snapshot = *entry;
        if reset {
            *entry = FlowCounters::default();
        }
        Some(snapshot)
    }

    /// Zero a context's counters
    pub fn clear(&self, ctx: u32) {
        if let Some(slot) = self.geometry.slot(ctx) {
            self.counters.lock()[slot] = FlowCounters::default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_round_robin_units() {
        let mut stats = StatsAllocator::new(CtxGeometry::new(16, 4));
        let units: Vec<u32> = (0..4).map(|_| ctx_unit(stats.alloc().unwrap().id)).collect();
        assert_eq!(units, vec![0, 1, 2, 3]);

        let next = stats.alloc().unwrap().id;
        assert_eq!(ctx_unit(next), 0);
        assert_eq!(ctx_index(next), 2);
    }

    #[test]
    fn test_fresh_ids_unique_then_exhausted() {
        let mut stats = StatsAllocator::new(CtxGeometry::new(12, 3));
        let mut seen = HashSet::new();
        for _ in 0..12 {
            let id = stats.alloc().unwrap().id;
            assert!(stats.geometry().slot(id).is_some());
            assert!(seen.insert(id));
        }
        assert_eq!(stats.available(), 0);
        let before = stats.state();
        assert_eq!(stats.alloc(), Err(PoolError::Exhausted));
        assert_eq!(stats.state(), before);
    }

    #[test]
    fn test_recycle() {
        let mut stats = StatsAllocator::new(CtxGeometry::new(2, 2));
        let a = stats.alloc().unwrap().id;
        let b = stats.alloc().unwrap().id;
        stats.free(b).unwrap();
        stats.free(a).unwrap();
        assert_eq!(stats.alloc().unwrap().id, b);
        assert_eq!(stats.alloc().unwrap().id, a);
    }

    #[test]
    fn test_free_out_of_range() {
        let mut stats = StatsAllocator::new(CtxGeometry::new(8, 2));
        assert_eq!(stats.free(ctx_id(2, 0)), Err(PoolError::OutOfRange(ctx_id(2, 0))));
        assert_eq!(stats.free(ctx_id(0, 4)), Err(PoolError::OutOfRange(ctx_id(0, 4))));
    }

    #[test]
    fn test_rollback_across_unit_wrap() {
        let mut stats = StatsAllocator::new(CtxGeometry::new(8, 2));
        stats.alloc().unwrap();
        let before = stats.state();
        let a = stats.alloc().unwrap();
        assert_eq!(stats.state().active_unit, 0);
        stats.rollback(a).unwrap();
        assert_eq!(stats.state(), before);
    }

    #[test]
    fn test_table_read_reset() {
        let geometry = CtxGeometry::new(8, 2);
        let table = StatsTable::new(geometry);
        let ctx = ctx_id(1, 3);

        assert_eq!(table.read(ctx, false), None);
        assert!(table.record(ctx, 2, 0));
        assert_eq!(table.read(ctx, false), None);
        assert!(table.record(ctx, 1, 1500));
        assert_eq!(table.read(ctx, true), Some(FlowCounters { pkts: 3, bytes: 1500 }));
        assert_eq!(table.read(ctx, false), None);
        assert!(!table.record(ctx_id(5, 0), 1, 1));
    }

    #[test]
    fn test_concurrent_record() {
        use std::thread;

        let table = StatsTable::new(CtxGeometry::new(4, 1));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let table = table.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    table.record(ctx_id(0, 1), 1, 64);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let counters = table.read(ctx_id(0, 1), false).unwrap();
        assert_eq!(counters.pkts, 4000);
        assert_eq!(counters.bytes, 4000 * 64);
    }
}
