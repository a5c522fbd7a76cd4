//! Mask Registry
//!
//! Deduplicates wildcard masks. Each distinct mask byte string gets one
//! small hardware mask id, shared by every flow using that mask.
//!
//! # Design
//!
//! - Rows are bucketed by a seeded digest of the mask bytes, with an exact
//!   byte comparison inside the bucket
//! - Mask ids come from an [`IdPool`] over `1..=255`; id 0 is invalid
//! - A row is dropped in the same call that takes its count to zero

use std::collections::HashMap;

use flower_common::{jhash, FlowerError, FlowerResult};
use tracing::debug;

use crate::id_pool::{Allocation, IdPool, PoolError, PoolState};

/// Number of usable mask ids
pub const MASK_ID_CAPACITY: u32 = 255;

/// One deduplicated mask
#[derive(Debug, Clone)]
pub struct MaskEntry {
    /// Digest of the mask bytes
    pub hash_key: u32,
    /// Hardware mask id
    pub mask_id: u8,
    /// Flows using this mask
    pub ref_cnt: u32,
    bytes: Box<[u8]>,
    allocation: Allocation,
}

/// Result of [`MaskRegistry::lookup_or_insert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskRef {
    /// Hardware mask id
    pub mask_id: u8,
    /// The mask was not known before; the caller owns the row
    pub is_new: bool,
}

/// Comparable view of the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskSnapshot {
    /// `(hash_key, mask_id, ref_cnt)` sorted by mask id
    pub entries: Vec<(u32, u8, u32)>,
    /// Mask id pool state
    pub pool: PoolState,
}

/// Mask registry
#[derive(Debug)]
pub struct MaskRegistry {
    seed: u32,
    buckets: HashMap<u32, Vec<MaskEntry>>,
    ids: IdPool,
}

impl MaskRegistry {
    /// Create an empty registry
    pub fn new(seed: u32) -> Self {
        Self {
            seed,
            buckets: HashMap::new(),
            ids: IdPool::new(1, MASK_ID_CAPACITY),
        }
    }

    fn find_mut(&mut self, hash_key: u32, mask: &[u8]) -> Option<&mut MaskEntry> {
        self.buckets
            .get_mut(&hash_key)?
            .iter_mut()
            .find(|e| &*e.bytes == mask)
    }

    /// Look a mask up, inserting it when unknown
    pub fn lookup_or_insert(&mut self, mask: &[u8]) -> FlowerResult<MaskRef> {
        let hash_key = jhash(mask, self.seed);

        if let Some(entry) = self.find_mut(hash_key, mask) {
            entry.ref_cnt += 1;
            debug!(hash_key, mask_id = entry.mask_id, ref_cnt = entry.ref_cnt, "mask hit");
            return Ok(MaskRef {
                mask_id: entry.mask_id,
                is_new: false,
            });
        }

        let allocation = self.ids.alloc().map_err(|e| match e {
            PoolError::Exhausted => FlowerError::ResourceExhausted("mask id"),
            other => FlowerError::invalid(other.to_string()),
        })?;
        let mask_id = allocation.id as u8;
        self.buckets.entry(hash_key).or_default().push(MaskEntry {
            hash_key,
            mask_id,
            ref_cnt: 1,
            bytes: mask.into(),
            allocation,
        });
        debug!(hash_key, mask_id, "mask added");

        Ok(MaskRef {
            mask_id,
            is_new: true,
        })
    }

    /// Drop one reference. Returns `true` when the mask row was freed.
    pub fn release(&mut self, mask: &[u8]) -> FlowerResult<bool> {
        let hash_key = jhash(mask, self.seed);
        let Some(bucket) = self.buckets.get_mut(&hash_key) else {
            return Err(FlowerError::invalid("mask not registered"));
        };
        let Some(pos) = bucket.iter().position(|e| &*e.bytes == mask) else {
            return Err(FlowerError::invalid("mask not registered"));
        };

        bucket[pos].ref_cnt -= 1;
        if bucket[pos].ref_cnt > 0 {
            return Ok(false);
        }

        let entry = bucket.swap_remove(pos);
        if bucket.is_empty() {
            self.buckets.remove(&hash_key);
        }
        debug!(hash_key, mask_id = entry.mask_id, "mask freed");
        self.ids
            .free(entry.mask_id as u32)
            .map_err(FlowerError::from)?;
        Ok(true)
    }

    /// Exactly undo the most recent `lookup_or_insert` of `mask`
    pub fn undo_insert(&mut self, mask: &[u8], was_new: bool) -> FlowerResult<()> {
        if !was_new {
            return self.release(mask).map(|_| ());
        }

        let hash_key = jhash(mask, self.seed);
        let entry = {
            let Some(bucket) = self.buckets.get_mut(&hash_key) else {
                return Err(FlowerError::invalid("mask not registered"));
            };
            let Some(pos) = bucket.iter().position(|e| &*e.bytes == mask) else {
                return Err(FlowerError::invalid("mask not registered"));
            };
            let entry = bucket.remove(pos);
            if bucket.is_empty() {
                self.buckets.remove(&hash_key);
            }
            entry
        };
        self.ids
            .rollback(entry.allocation)
            .map_err(FlowerError::from)
    }

    /// References held on `mask`
    pub fn ref_count(&self, mask: &[u8]) -> Option<u32> {
        let hash_key = jhash(mask, self.seed);
        self.buckets
            .get(&hash_key)?
            .iter()
            .find(|e| &*e.bytes == mask)
            .map(|e| e.ref_cnt)
    }

    /// Number of distinct masks
    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Snapshot for diffing
    pub fn snapshot(&self) -> MaskSnapshot {
        let mut entries: Vec<(u32, u8, u32)> = self
            .buckets
            .values()
            .flatten()
            .map(|e| (e.hash_key, e.mask_id, e.ref_cnt))
            .collect();
        entries.sort_by_key(|&(_, id, _)| id);
        MaskSnapshot {
            entries,
            pool: self.ids.state(),
        }
    }
}
