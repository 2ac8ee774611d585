use chrono::{DateTime, Utc};
use tally_common::collections::FastHashMap;

use crate::{expiry::ExpiryIndex, usage::ResourceUsage};

/// Sums the units held by `usages`.
pub fn recompute_total<'a, I>(usages: I) -> f64
where
    I: IntoIterator<Item = &'a ResourceUsage>,
{
    usages.into_iter().map(|usage| usage.units).sum()
}

/// Outcome of reaping lapsed allocations.
#[derive(Debug, Default, PartialEq)]
pub struct Reaped {
    /// Number of allocations removed.
    pub removed: usize,

    /// Whether the cached total went negative and had to be discarded.
    pub total_reset: bool,
}

/// The allocations held against one resource, plus their cached total.
#[derive(Clone, Debug, Default)]
pub struct UsageLedger {
    usages: FastHashMap<String, ResourceUsage>,
    index: ExpiryIndex,
    // `None` until the next mutation recomputes it.
    total: Option<f64>,
}

impl UsageLedger {
    /// Rebuilds a ledger from persisted allocations and their recording order.
    ///
    /// Index entries without an allocation are dropped, and allocations missing from the index are appended, so the
    /// two always describe the same set of IDs.
    pub fn from_parts(usages: impl IntoIterator<Item = ResourceUsage>, order: Vec<String>) -> Self {
        let usages: FastHashMap<_, _> = usages.into_iter().map(|usage| (usage.id.clone(), usage)).collect();
        let mut index: ExpiryIndex = order.into_iter().filter(|id| usages.contains_key(id)).collect();
        let mut missing = usages
            .keys()
            .filter(|id| !index.contains(id))
            .cloned()
            .collect::<Vec<_>>();
        missing.sort_unstable();
        for id in missing {
            index.push(id);
        }

        Self {
            usages,
            index,
            total: None,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.usages.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.usages.len()
    }

    /// Returns the allocations in recording order.
    pub fn iter(&self) -> impl Iterator<Item = &ResourceUsage> {
        self.index.iter().filter_map(|id| self.usages.get(id))
    }

    pub fn order(&self) -> impl Iterator<Item = &str> {
        self.index.iter()
    }

    /// Records an allocation.
    ///
    /// If an allocation with the same ID is already held, the ledger is left untouched and the allocation is handed
    /// back.
    pub fn record(&mut self, usage: ResourceUsage) -> Result<(), ResourceUsage> {
        if self.usages.contains_key(&usage.id) {
            return Err(usage);
        }

        let total = self.total.unwrap_or_else(|| recompute_total(self.usages.values()));
        self.total = Some(total + usage.units);
        self.index.push(usage.id.clone());
        self.usages.insert(usage.id.clone(), usage);
        self.debug_check();
        Ok(())
    }

    /// Clears an allocation, returning it if it was held.
    pub fn clear(&mut self, id: &str) -> Option<ResourceUsage> {
        let usage = self.usages.remove(id)?;
        self.index.remove(id);
        self.subtract(usage.units);
        self.debug_check();
        Some(usage)
    }

    /// Removes every allocation that has lapsed as of `now`.
    pub fn remove_expired(&mut self, now: DateTime<Utc>) -> Reaped {
        let expired = self
            .index
            .iter()
            .filter(|id| self.usages.get(*id).is_some_and(|usage| usage.is_expired(now)))
            .map(str::to_string)
            .collect::<Vec<_>>();

        let mut reaped = Reaped::default();
        for id in expired {
            if let Some(usage) = self.usages.remove(&id) {
                self.index.remove(&id);
                reaped.removed += 1;
                reaped.total_reset |= self.subtract(usage.units);
            }
        }
        self.debug_check();
        reaped
    }

    /// Returns the cached total, or a recomputation of it if it isn't known.
    ///
    /// The recomputed value is not cached, so this never mutates the ledger.
    pub fn total(&self) -> f64 {
        self.total.unwrap_or_else(|| recompute_total(self.usages.values()))
    }

    /// Returns the units held by allocations that have not lapsed as of `now`, without reaping anything.
    pub fn active_total(&self, now: DateTime<Utc>) -> f64 {
        recompute_total(self.usages.values().filter(|usage| !usage.is_expired(now)))
    }

    // Returns `true` if the cached total had to be discarded.
    fn subtract(&mut self, units: f64) -> bool {
        match self.total {
            Some(total) if total - units < 0.0 => {
                self.total = None;
                true
            }
            Some(total) => {
                self.total = Some(total - units);
                false
            }
            None => false,
        }
    }

    fn debug_check(&self) {
        debug_assert_eq!(self.index.len(), self.usages.len());
    }
}
