use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    errors::ResourceError,
    ledger::{Reaped, UsageLedger},
    profile::resource_key,
    usage::ResourceUsage,
};

/// Persisted form of a resource pool's state.
///
/// Only the allocations and their recording order are persisted: the total is always recomputed after loading.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct StoredResource {
    /// Tenant owning the pool.
    pub tenant: String,

    /// Pool identifier.
    pub id: String,

    /// Allocations currently held.
    #[serde(default)]
    pub usages: Vec<ResourceUsage>,

    /// Allocation IDs in the order they were recorded.
    #[serde(default)]
    pub ttl_idx: Vec<String>,
}

impl StoredResource {
    /// Returns the key identifying the pool across tenants.
    pub fn key(&self) -> String {
        resource_key(&self.tenant, &self.id)
    }
}

/// Point-in-time view of a resource pool.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    /// Tenant owning the pool.
    pub tenant: String,

    /// Pool identifier.
    pub id: String,

    /// Allocations held, in the order they were recorded.
    pub usages: Vec<ResourceUsage>,

    /// Total units held.
    pub total_usage: f64,
}

/// Runtime state of a resource pool.
#[derive(Debug)]
pub struct Resource {
    tenant: String,
    id: String,
    ledger: UsageLedger,
    dirty: bool,
    // Bumped on every mutation, so a flush can tell whether what it wrote is still current.
    generation: u64,
}

impl Resource {
    pub fn new(tenant: &str, id: &str) -> Self {
        Self {
            tenant: tenant.to_string(),
            id: id.to_string(),
            ledger: UsageLedger::default(),
            dirty: false,
            generation: 0,
        }
    }

    pub fn from_stored(stored: StoredResource) -> Self {
        Self {
            tenant: stored.tenant,
            id: stored.id,
            ledger: UsageLedger::from_parts(stored.usages, stored.ttl_idx),
            dirty: false,
            generation: 0,
        }
    }

    pub fn to_stored(&self) -> StoredResource {
        StoredResource {
            tenant: self.tenant.clone(),
            id: self.id.clone(),
            usages: self.ledger.iter().cloned().collect(),
            ttl_idx: self.ledger.order().map(str::to_string).collect(),
        }
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            tenant: self.tenant.clone(),
            id: self.id.clone(),
            usages: self.ledger.iter().cloned().collect(),
            total_usage: self.ledger.total(),
        }
    }

    pub fn key(&self) -> String {
        resource_key(&self.tenant, &self.id)
    }

    pub fn has_usage(&self, usage_id: &str) -> bool {
        self.ledger.contains(usage_id)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Records an allocation.
    ///
    /// # Errors
    ///
    /// If an allocation with the same ID is already held, an error is returned and nothing changes.
    pub fn record_usage(&mut self, usage: ResourceUsage) -> Result<(), ResourceError> {
        match self.ledger.record(usage) {
            Ok(()) => {
                self.touch();
                Ok(())
            }
            Err(rejected) => Err(ResourceError::DuplicateUsage {
                resource: self.key(),
                usage_id: rejected.id,
            }),
        }
    }

    /// Clears an allocation, returning `true` if it was held.
    pub fn clear_usage(&mut self, usage_id: &str) -> bool {
        let cleared = self.ledger.clear(usage_id).is_some();
        if cleared {
            self.touch();
        }
        cleared
    }

    /// Removes every allocation that has lapsed as of `now`, returning how many were removed.
    pub fn remove_expired_units(&mut self, now: DateTime<Utc>) -> usize {
        let Reaped { removed, total_reset } = self.ledger.remove_expired(now);
        if total_reset {
            warn!(resource = %self.key(), "Total usage of resource went negative. Recomputing on next mutation.");
        }
        if removed > 0 {
            self.touch();
        }
        removed
    }

    /// Returns the total units held, without reaping lapsed allocations first.
    pub fn total_usage(&self) -> f64 {
        self.ledger.total()
    }

    /// Reaps lapsed allocations and returns the total units still held.
    pub fn total_usage_at(&mut self, now: DateTime<Utc>) -> f64 {
        self.remove_expired_units(now);
        self.ledger.total()
    }

    /// Returns the total units held by allocations that have not lapsed as of `now`, without mutating anything.
    pub fn active_total(&self, now: DateTime<Utc>) -> f64 {
        self.ledger.active_total(now)
    }

    /// Marks the resource clean if nothing changed since `generation` was observed.
    pub fn settle(&mut self, generation: u64) -> bool {
        if self.generation == generation {
            self.dirty = false;
        }
        !self.dirty
    }

    fn touch(&mut self) {
        self.dirty = true;
        self.generation += 1;
    }
}

/// Shared handle to the live instance of a resource pool.
#[derive(Debug)]
pub struct ResourceHandle {
    key: String,
    state: Mutex<Resource>,
}

impl ResourceHandle {
    pub fn new(resource: Resource) -> Self {
        Self {
            key: resource.key(),
            state: Mutex::new(resource),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Locks the pool state.
    ///
    /// The guard must never be held across an await point: callers that need to keep other requests off the pool for
    /// longer hold its key lock instead.
    pub fn state(&self) -> MutexGuard<'_, Resource> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub type SharedResource = Arc<ResourceHandle>;
