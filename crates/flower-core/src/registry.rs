//! Flow Registry
//!
//! Content-addressed store of compiled flows, keyed by the digest of the
//! exact key.
//!
//! # Design
//!
//! - One record per digest; identical mergeable rules share it
//! - Merge records are reference counted and stay until the last user leaves

use std::collections::HashMap;

use flower_common::FlowerError;
use tracing::debug;

use crate::flow::CompiledFlow;

/// Registry errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// A non-mergeable record with the same digest exists
    #[error("rule with hash key {0:#010x} already exists")]
    Conflict(u32),

    /// No record with that digest
    #[error("no rule with hash key {0:#010x}")]
    NotFound(u32),
}

impl From<RegistryError> for FlowerError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Conflict(hash_key) => FlowerError::DuplicateRule { hash_key },
            RegistryError::NotFound(_) => FlowerError::invalid(err.to_string()),
        }
    }
}

/// Outcome of [`FlowRegistry::insert_merge`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The flow is now registered
    Inserted,
    /// An identical record took another reference; the flow was dropped
    Merged,
}

#[derive(Debug)]
struct Entry {
    flow: CompiledFlow,
    ref_cnt: u32,
}

/// Flow registry
#[derive(Debug, Default)]
pub struct FlowRegistry {
    flows: HashMap<u32, Entry>,
}

impl FlowRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `flow`, merging with an existing record where allowed
    pub fn insert_merge(&mut self, flow: CompiledFlow) -> Result<InsertOutcome, RegistryError> {
        let hash_key = flow.hash_key;
        match self.flows.get_mut(&hash_key) {
            None => {
                self.flows.insert(hash_key, Entry { flow, ref_cnt: 1 });
                Ok(InsertOutcome::Inserted)
            }
            Some(existing) => {
                if !existing.flow.merge && !flow.merge {
                    return Err(RegistryError::Conflict(hash_key));
                }
                existing.flow.merge = true;
                existing.ref_cnt += 1;
                debug!(hash_key, ref_cnt = existing.ref_cnt, "flow merged");
                Ok(InsertOutcome::Merged)
            }
        }
    }

    /// Drop one reference. Returns the flow once its record is removed.
    pub fn remove_merge(&mut self, hash_key: u32) -> Result<Option<CompiledFlow>, RegistryError> {
        let entry = self
            .flows
            .get_mut(&hash_key)
            .ok_or(RegistryError::NotFound(hash_key))?;

        if entry.flow.merge && entry.ref_cnt > 1 {
            entry.ref_cnt -= 1;
            return Ok(None);
        }
        Ok(self.flows.remove(&hash_key).map(|e| e.flow))
    }

    /// Look up a flow
    pub fn find(&self, hash_key: u32) -> Option<&CompiledFlow> {
        self.flows.get(&hash_key).map(|e| &e.flow)
    }

    /// Look up a flow for update
    pub fn find_mut(&mut self, hash_key: u32) -> Option<&mut CompiledFlow> {
        self.flows.get_mut(&hash_key).map(|e| &mut e.flow)
    }

    /// References held on a record
    pub fn ref_count(&self, hash_key: u32) -> Option<u32> {
        self.flows.get(&hash_key).map(|e| e.ref_cnt)
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// All records
    pub fn iter(&self) -> impl Iterator<Item = &CompiledFlow> {
        self.flows.values().map(|e| &e.flow)
    }
}
