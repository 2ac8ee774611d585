use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::{
    cache::ResourceCache, errors::ResourceError, matcher::MatchedResource, threshold::ThresholdDispatcher,
    ResourceProfile, ResourceUsage,
};

/// The outcome of a successful allocation.
#[derive(Debug)]
pub(crate) struct Allocation {
    /// Message to hand back to the caller.
    pub message: String,

    /// Profile of the pool that granted the allocation.
    pub winner: Arc<ResourceProfile>,
}

enum Attempt {
    Granted { total: f64 },
    Full,
    Duplicate,
}

/// Admits allocations against weight-ordered pools.
pub(crate) struct Allocator {
    resources: Arc<ResourceCache>,
    thresholds: Arc<ThresholdDispatcher>,
}

impl Allocator {
    pub fn new(resources: Arc<ResourceCache>, thresholds: Arc<ThresholdDispatcher>) -> Self {
        Self { resources, thresholds }
    }

    /// Grants `usage` from the first candidate with room for it.
    ///
    /// Candidates are tried in the order given, locking one at a time. A dry run performs every check but changes
    /// nothing, and so also never rejects an allocation ID already held.
    ///
    /// When `usage` carries no expiry time, it is derived from the TTL of the candidate granting it.
    ///
    /// # Errors
    ///
    /// If no candidate has room, or a full candidate is a blocker, `ResourceUnavailable` is returned. If the granting
    /// candidate already holds an allocation with the same ID, `DuplicateUsage` is returned.
    pub async fn allocate(
        &self, candidates: &[MatchedResource], usage: &ResourceUsage, dry_run: bool,
    ) -> Result<Allocation, ResourceError> {
        let telemetry = &self.resources.telemetry;

        for candidate in candidates {
            let profile = &candidate.profile;
            let now = Utc::now();

            let locked = self.resources.lock_resource(&profile.tenant, &profile.id).await?;
            if self.resources.is_removed(locked.handle.key()) {
                debug!(resource = %profile.key(), "Resource profile removed while allocating. Skipping.");
                continue;
            }

            let (attempt, reaped) = {
                let mut state = locked.handle.state();
                let fits =
                    |total: f64| usage.units == 0.0 || profile.is_unlimited() || total + usage.units <= profile.limit;

                if dry_run {
                    let total = state.active_total(now);
                    let attempt = if fits(total) { Attempt::Granted { total } } else { Attempt::Full };
                    (attempt, 0)
                } else {
                    let reaped = state.remove_expired_units(now);
                    let total = state.total_usage();
                    let attempt = if state.has_usage(&usage.id) {
                        Attempt::Duplicate
                    } else if fits(total) {
                        let mut granted = usage.clone();
                        if granted.expiry_time.is_none() {
                            granted.expiry_time = candidate.usage_expiry(now);
                        }
                        state.record_usage(granted)?;
                        Attempt::Granted {
                            total: state.total_usage(),
                        }
                    } else {
                        Attempt::Full
                    };
                    (attempt, reaped)
                }
            };

            let granted = !dry_run && matches!(attempt, Attempt::Granted { .. });
            let mutated = reaped > 0 || granted;
            if mutated {
                self.resources.mark_dirty(&locked.handle);
            }
            if granted {
                self.resources.add_holder(&profile.tenant, &usage.id, &profile.id);
            }
            let handle = Arc::clone(&locked.handle);
            drop(locked);

            if reaped > 0 {
                telemetry.expired_usages_total().increment(reaped as u64);
            }
            if mutated && profile.stored {
                self.resources.flush_logged(&handle).await;
            }

            match attempt {
                Attempt::Granted { total } => {
                    if dry_run {
                        telemetry.authorizations_total().increment(1);
                    } else {
                        telemetry.allocations_total().increment(1);
                        self.thresholds.notify(profile, total);
                    }
                    return Ok(Allocation {
                        message: profile.allocation_message().to_string(),
                        winner: Arc::clone(profile),
                    });
                }
                Attempt::Duplicate => {
                    telemetry.duplicates_total().increment(1);
                    return Err(ResourceError::DuplicateUsage {
                        resource: profile.key(),
                        usage_id: usage.id.clone(),
                    });
                }
                Attempt::Full if profile.blocker => {
                    debug!(resource = %profile.key(), usage_id = %usage.id, "Blocking resource full. Stopping search.");
                    telemetry.rejections_total().increment(1);
                    return Err(ResourceError::ResourceUnavailable);
                }
                Attempt::Full => {
                    debug!(resource = %profile.key(), usage_id = %usage.id, "Resource is full. Trying next candidate.");
                }
            }
        }

        telemetry.rejections_total().increment(1);
        Err(ResourceError::ResourceUnavailable)
    }
}
