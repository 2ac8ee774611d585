//! Admission control for shared, limited-capacity resource pools.
//!
//! A [`ResourceProfile`] describes a pool: which events it governs (through filters evaluated by a [`FilterEngine`]),
//! how many units may be outstanding at once, and how long each allocation lives. [`ResourceService`] matches incoming
//! events against profiles, admits or rejects allocations against the matching pools in weight order, and reclaims
//! allocations once they expire or are released.
//!
//! Pool state is cached in memory and written back to a [`DataStore`], either on every mutation (for profiles marked
//! `stored`) or periodically in the background.
#![deny(missing_docs)]

mod allocator;
mod cache;
mod config;
mod errors;
mod event;
mod expiry;
mod filter;
mod index;
mod ledger;
mod lock;
mod matcher;
mod persistence;
mod profile;
mod resource;
mod service;
mod store;
mod threshold;
mod usage;

#[cfg(test)]
mod test_util;

pub use self::config::ResourceServiceConfiguration;
pub use self::errors::ResourceError;
pub use self::event::{Event, EventValue};
pub use self::filter::FilterEngine;
pub use self::index::ProfileIndex;
pub use self::ledger::recompute_total;
pub use self::lock::{KeyGuard, LockError, LockManager};
pub use self::profile::{ActivationInterval, ResourceProfile};
pub use self::resource::{ResourceSnapshot, StoredResource};
pub use self::service::{ResourceService, ResourceServiceBuilder, UsageRequest};
pub use self::store::{DataStore, MemoryStore, StoreError};
pub use self::threshold::ThresholdNotifier;
pub use self::usage::ResourceUsage;

tally_metrics::static_metrics! {
    name => Telemetry,
    prefix => resources,
    metrics => [
        counter(allocations_total),
        counter(authorizations_total),
        counter(rejections_total),
        counter(duplicates_total),
        counter(releases_total),
        counter(expired_usages_total),
        counter(flushes_total),
        counter(flush_failures_total),
        counter(threshold_notifications_dropped_total),
    ],
}
