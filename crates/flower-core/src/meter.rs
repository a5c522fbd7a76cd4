//! Meter references
//!
//! Meters are configured outside the flow path. Flows only take and drop
//! references; an unshared meter serves at most one flow.

use std::collections::HashMap;

use flower_common::{FlowerError, FlowerResult, MeterConfig};
use tracing::debug;

/// A configured meter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meter {
    /// Hardware profile id written into meter action records
    pub profile_id: u32,
    /// May be referenced by more than one flow
    pub shared: bool,
    /// Accepts new references
    pub enabled: bool,
    /// Flows referencing this meter
    pub ref_cnt: u32,
}

/// Meter table
#[derive(Debug, Default, Clone)]
pub struct MeterTable {
    meters: HashMap<u32, Meter>,
}

impl MeterTable {
    /// Build from configuration
    pub fn from_config(meters: &[MeterConfig]) -> Self {
        let mut table = Self::default();
        for m in meters {
            table.add(m.id, m.profile_id, m.shared, m.enabled);
        }
        table
    }

    /// Register a meter, keeping the reference count of an existing one
    pub fn add(&mut self, id: u32, profile_id: u32, shared: bool, enabled: bool) {
        let meter = self.meters.entry(id).or_insert(Meter {
            profile_id,
            shared,
            enabled,
            ref_cnt: 0,
        });
        meter.profile_id = profile_id;
        meter.shared = shared;
        meter.enabled = enabled;
    }

    /// Enable or disable a meter
    pub fn set_enabled(&mut self, id: u32, enabled: bool) -> FlowerResult<()> {
        let meter = self
            .meters
            .get_mut(&id)
            .ok_or_else(|| FlowerError::invalid(format!("meter {id} does not exist")))?;
        meter.enabled = enabled;
        Ok(())
    }

    /// Remove an unreferenced meter
    pub fn remove(&mut self, id: u32) -> FlowerResult<()> {
        match self.meters.get(&id) {
            None => Err(FlowerError::invalid(format!("meter {id} does not exist"))),
            Some(m) if m.ref_cnt > 0 => Err(FlowerError::invalid(format!("meter {id} is in use"))),
            Some(_) => {
                self.meters.remove(&id);
                Ok(())
            }
        }
    }

    /// Look up a meter
    pub fn get(&self, id: u32) -> Option<&Meter> {
        self.meters.get(&id)
    }

    /// Check that a flow may reference `id`; returns its profile id
    pub fn check(&self, id: u32) -> FlowerResult<u32> {
        let meter = self
            .meters
            .get(&id)
            .ok_or_else(|| FlowerError::invalid(format!("meter {id} does not exist")))?;
        if !meter.enabled {
            return Err(FlowerError::invalid(format!("meter {id} is disabled")));
        }
        if !meter.shared && meter.ref_cnt > 0 {
            return Err(FlowerError::invalid(format!("meter {id} is not shared and already in use")));
        }
        Ok(meter.profile_id)
    }

    /// Take a reference
    pub fn acquire(&mut self, id: u32) -> FlowerResult<()> {
        self.check(id)?;
        if let Some(meter) = self.meters.get_mut(&id) {
            meter.ref_cnt += 1;
            debug!(meter = id, ref_cnt = meter.ref_cnt, "meter referenced");
        }
        Ok(())
    }

    /// Drop a reference
    pub fn release(&mut self, id: u32) -> FlowerResult<()> {
        let meter = self
            .meters
            .get_mut(&id)
            .ok_or_else(|| FlowerError::invalid(format!("meter {id} does not exist")))?;
        if meter.ref_cnt == 0 {
            return Err(FlowerError::invalid(format!("meter {id} is not referenced")));
        }
        meter.ref_cnt -= 1;
        Ok(())
    }

    /// `(id, ref_cnt)` pairs sorted by id
    pub fn ref_counts(&self) -> Vec<(u32, u32)> {
        let mut counts: Vec<(u32, u32)> = self.meters.iter().map(|(&id, m)| (id, m.ref_cnt)).collect();
        counts.sort_unstable();
        counts
    }
}
