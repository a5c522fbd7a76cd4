//! Small Integer ID Pools
//!
//! Free-list allocators for hardware-indexed ids (mask ids, stats
//! contexts, pre-tunnel MAC indices).
//!
//! # Design
//!
//! - Fresh ids come from an "unallocated" counter before the free list is consulted
//! - Freed ids go through a fixed-capacity ring (push at head, pop at tail)
//! - Every allocation can be rolled back exactly, in LIFO order
//! - A failed allocation leaves the pool untouched

use flower_common::FlowerError;

/// Pool errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("id pool exhausted")]
    Exhausted,

    #[error("id {0} freed twice")]
    DoubleFree(u32),

    #[error("id {0} is outside the pool")]
    OutOfRange(u32),

    #[error("id {0} is not the most recent allocation")]
    NotLatest(u32),
}

impl From<PoolError> for FlowerError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Exhausted => FlowerError::ResourceExhausted("id pool"),
            other => FlowerError::invalid(other.to_string()),
        }
    }
}

/// Where an allocated id came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Never handed out before
    Fresh,
    /// Popped from the free ring
    Recycled,
}

/// An id handed out by a pool, with enough context to undo the allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// The id itself
    pub id: u32,
    /// How it was obtained
    pub origin: Origin,
}

/// Fixed-capacity ring of freed ids.
///
/// One slot is kept empty so that `head == tail` always means empty.
#[derive(Debug, Clone)]
pub struct FreeRing {
    buf: Vec<u32>,
    head: usize,
    tail: usize,
}

impl FreeRing {
    /// Ring able to hold `capacity` ids
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity + 1],
            head: 0,
            tail: 0,
        }
    }

    /// Maximum number of ids the ring holds
    pub fn capacity(&self) -> usize {
        self.buf.len() - 1
    }

    /// Number of ids currently queued
    pub fn len(&self) -> usize {
        (self.head + self.buf.len() - self.tail) % self.buf.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Check if full
    pub fn is_full(&self) -> bool {
        (self.head + 1) % self.buf.len() == self.tail
    }

    /// Queue an id at the head. Returns `false` when full.
    pub fn push(&mut self, id: u32) -> bool {
        if self.is_full() {
            return false;
        }
        self.buf[self.head] = id;
        self.head = (self.head + 1) % self.buf.len();
        true
    }

    /// Take the oldest id from the tail
    pub fn pop(&mut self) -> Option<u32> {
        if self.is_empty() {
            return None;
        }
        let id = self.buf[self.tail];
        self.tail = (self.tail + 1) % self.buf.len();
        Some(id)
    }

    /// Put `id` back at the tail, undoing the last `pop`
    pub fn unpop(&mut self, id: u32) -> bool {
        if self.is_full() {
            return false;
        }
        self.tail = (self.tail + self.buf.len() - 1) % self.buf.len();
        self.buf[self.tail] = id;
        true
    }

    /// Queued ids, oldest first
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len()).map(move |i| self.buf[(self.tail + i) % self.buf.len()])
    }
}

/// Comparable view of a pool's allocation state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolState {
    /// Fresh ids not yet handed out
    pub unallocated: u32,
    /// Free ring contents, oldest first
    pub free: Vec<u32>,
}

/// Id pool over `first..first + capacity`.
///
/// Fresh ids are issued from the top of the range downwards, so a mask
/// pool over `1..=255` hands out 255 first and never issues 0.
#[derive(Debug, Clone)]
pub struct IdPool {
    first: u32,
    capacity: u32,
    unallocated: u32,
    ring: FreeRing,
}

impl IdPool {
    /// Create a pool of `capacity` ids starting at `first`
    pub fn new(first: u32, capacity: u32) -> Self {
        Self {
            first,
            capacity,
            unallocated: capacity,
            ring: FreeRing::with_capacity(capacity as usize),
        }
    }

    /// Allocate an id
    pub fn alloc(&mut self) -> Result<Allocation, PoolError> {
        if self.unallocated > 0 {
            self.unallocated -= 1;
            return Ok(Allocation {
                id: self.first + self.unallocated,
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

    /// Return an id to the pool
    pub fn free(&mut self, id: u32) -> Result<(), PoolError> {
        if !self.contains(id) {
            return Err(PoolError::OutOfRange(id));
        }
        // Ids below the fresh watermark were never issued.
        if id < self.first + self.unallocated {
            return Err(PoolError::DoubleFree(id));
        }
        if !self.ring.push(id) {
            return Err(PoolError::DoubleFree(id));
        }
        Ok(())
    }

    /// Undo the most recent allocation
    pub fn rollback(&mut self, alloc: Allocation) -> Result<(), PoolError> {
        match alloc.origin {
            Origin::Fresh => {
                if alloc.id != self.first + self.unallocated || self.unallocated == self.capacity {
                    return Err(PoolError::NotLatest(alloc.id));
                }
                self.unallocated += 1;
            }
            Origin::Recycled => {
                if !self.ring.unpop(alloc.id) {
                    return Err(PoolError::NotLatest(alloc.id));
                }
            }
        }
        Ok(())
    }

    /// Check whether `id` belongs to this pool's range
    pub fn contains(&self, id: u32) -> bool {
        id >= self.first && id - self.first < self.capacity
    }

    /// Ids that can still be allocated
    pub fn available(&self) -> usize {
        self.unallocated as usize + self.ring.len()
    }

    /// Total ids managed by the pool
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Snapshot for diffing
    pub fn state(&self) -> PoolState {
        PoolState {
            unallocated: self.unallocated,
            free: self.ring.iter().collect(),
        }
    }
}

/// Occupancy bitmap for a small index space; index 0 is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexBitmap {
    bits: u64,
    limit: u16,
}

impl IndexBitmap {
    /// Bitmap over `0..limit` (at most 64)
    pub fn new(limit: u16) -> Self {
        Self {
            bits: 0,
            limit: limit.min(64),
        }
    }

    /// Number of indices, reserved index included
    pub fn limit(&self) -> u16 {
        self.limit
    }

    /// Check whether `index` is in use
    pub fn is_set(&self, index: u16) -> bool {
        index < self.limit && self.bits & (1u64 << index) != 0
    }

    /// Mark `index` in use
    pub fn set(&mut self, index: u16) {
        if index < self.limit {
            self.bits |= 1u64 << index;
        }
    }

    /// Mark `index` free
    pub fn clear(&mut self, index: u16) {
        if index < self.limit {
            self.bits &= !(1u64 << index);
        }
    }

    /// Lowest free non-reserved index
    pub fn first_free(&self) -> Option<u16> {
        (1..self.limit).find(|&i| !self.is_set(i))
    }

    /// Indices in use, ascending
    pub fn iter_set(&self) -> impl Iterator<Item = u16> + '_ {
        (1..self.limit).filter(move |&i| self.is_set(i))
    }
}
