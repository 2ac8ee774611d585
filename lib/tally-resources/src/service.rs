use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::Utc;
use tally_common::task::spawn_traced_named;
use tally_error::GenericError;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    allocator::Allocator,
    cache::ResourceCache,
    errors::ResourceError,
    matcher::ProfileMatcher,
    persistence::run_backup_loop,
    threshold::ThresholdDispatcher,
    DataStore, Event, FilterEngine, ProfileIndex, ResourceProfile, ResourceServiceConfiguration, ResourceSnapshot,
    ResourceUsage, Telemetry, ThresholdNotifier,
};

/// A request to authorize or allocate units of capacity.
#[derive(Clone, Debug)]
pub struct UsageRequest {
    /// Tenant the request belongs to.
    pub tenant: String,

    /// Event the allocation is for.
    pub event: Event,

    /// Caller-chosen ID of the allocation, used to release it later.
    pub usage_id: String,

    /// Number of units to allocate.
    pub units: f64,

    /// Lifetime of the allocation, overriding the TTL of whichever profile grants it.
    ///
    /// A zero duration makes the allocation permanent.
    pub ttl_override: Option<Duration>,
}

impl UsageRequest {
    /// Creates a new `UsageRequest` for the tenant of `event`.
    pub fn new<U: Into<String>>(event: Event, usage_id: U, units: f64) -> Self {
        Self {
            tenant: event.tenant().to_string(),
            event,
            usage_id: usage_id.into(),
            units,
            ttl_override: None,
        }
    }

    /// Sets the lifetime of the allocation.
    pub fn with_ttl_override(mut self, ttl: Duration) -> Self {
        self.ttl_override = Some(ttl);
        self
    }

    fn validate(&self) -> Result<(), ResourceError> {
        let mut fields = Vec::new();
        if self.tenant.is_empty() {
            fields.push("Tenant");
        }
        if self.event.id().is_empty() {
            fields.push("ID");
        }
        if self.usage_id.is_empty() {
            fields.push("UsageID");
        }
        if !fields.is_empty() {
            return Err(ResourceError::MandatoryIeMissing { fields });
        }

        check_tenant(&self.tenant)?;

        if !self.units.is_finite() || self.units < 0.0 {
            return Err(ResourceError::InvalidUnits { units: self.units });
        }
        Ok(())
    }

    fn usage(&self) -> ResourceUsage {
        ResourceUsage::new(&self.tenant, &self.usage_id, self.units)
    }
}

// Tenants prefix every cache and lock key, so they can't contain the separator.
fn check_tenant(tenant: &str) -> Result<(), ResourceError> {
    if tenant.contains(':') {
        return Err(ResourceError::InvalidTenant {
            tenant: tenant.to_string(),
        });
    }
    Ok(())
}

/// Builder for creating a [`ResourceService`].
pub struct ResourceServiceBuilder {
    store: Arc<dyn DataStore>,
    filters: Arc<dyn FilterEngine>,
    index: Option<Arc<dyn ProfileIndex>>,
    notifier: Option<Arc<dyn ThresholdNotifier>>,
    config: ResourceServiceConfiguration,
}

impl ResourceServiceBuilder {
    /// Creates a new `ResourceServiceBuilder` backed by the given store and filter engine.
    pub fn new(store: Arc<dyn DataStore>, filters: Arc<dyn FilterEngine>) -> Self {
        Self {
            store,
            filters,
            index: None,
            notifier: None,
            config: ResourceServiceConfiguration::default(),
        }
    }

    /// Sets the index used to select candidate profiles for an event.
    ///
    /// Without an index, or when indexed selects are disabled in the configuration, every profile of the tenant is a
    /// candidate.
    pub fn with_index(mut self, index: Arc<dyn ProfileIndex>) -> Self {
        self.index = Some(index);
        self
    }

    /// Sets the notifier to send usage updates to.
    ///
    /// Without one, usage updates are discarded.
    pub fn with_threshold_notifier(mut self, notifier: Arc<dyn ThresholdNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Sets the configuration.
    pub fn with_configuration(mut self, config: ResourceServiceConfiguration) -> Self {
        self.config = config;
        self
    }

    /// Builds the [`ResourceService`].
    ///
    /// When a threshold notifier is set, this must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// If the caches cannot be created, an error is returned.
    pub fn build(self) -> Result<ResourceService, GenericError> {
        let Self {
            store,
            filters,
            index,
            notifier,
            config,
        } = self;

        let telemetry = Telemetry::new();
        let resources = Arc::new(ResourceCache::new(
            config.cached_resources_limit,
            Arc::clone(&store),
            config.locking_timeout(),
            telemetry.clone(),
        )?);

        let index = index.filter(|_| config.indexed_selects);
        let matcher = ProfileMatcher::new(
            Arc::clone(&store),
            filters,
            index,
            Arc::clone(&resources),
            config.cached_profiles_limit,
            config.cached_event_matches_limit,
        )?;

        let thresholds = Arc::new(match notifier {
            Some(notifier) => ThresholdDispatcher::spawn(notifier, config.threshold_queue_capacity, telemetry),
            None => ThresholdDispatcher::disabled(telemetry),
        });
        let allocator = Allocator::new(Arc::clone(&resources), Arc::clone(&thresholds));

        info!(
            store_interval = ?config.store_interval(),
            locking_timeout = ?config.locking_timeout(),
            "Resource service created."
        );

        Ok(ResourceService {
            inner: Arc::new(Inner {
                config,
                store,
                resources,
                matcher,
                allocator,
                thresholds,
                backup: Mutex::new(None),
            }),
        })
    }
}

struct BackupTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Inner {
    config: ResourceServiceConfiguration,
    store: Arc<dyn DataStore>,
    resources: Arc<ResourceCache>,
    matcher: ProfileMatcher,
    allocator: Allocator,
    thresholds: Arc<ThresholdDispatcher>,
    backup: Mutex<Option<BackupTask>>,
}

/// Admission control over resource pools.
///
/// Cloning a `ResourceService` is cheap, and every clone operates on the same state.
#[derive(Clone)]
pub struct ResourceService {
    inner: Arc<Inner>,
}

impl ResourceService {
    /// Checks whether an allocation would be granted, without allocating anything.
    ///
    /// Returns the message the allocation would be granted with.
    ///
    /// # Errors
    ///
    /// If the request is malformed, nothing matches the event, no matching pool has room, or a collaborator fails, an
    /// error is returned.
    pub async fn authorize_resources(&self, request: &UsageRequest) -> Result<String, ResourceError> {
        request.validate()?;
        let candidates = self
            .inner
            .matcher
            .match_event(&request.tenant, &request.event, &request.usage_id, request.ttl_override)
            .await?;
        if candidates.is_empty() {
            return Err(ResourceError::NotFound);
        }

        let allocation = self.inner.allocator.allocate(&candidates, &request.usage(), true).await?;
        Ok(allocation.message)
    }

    /// Allocates units from the highest-weight matching pool with room for them.
    ///
    /// Returns the message of the granting pool.
    ///
    /// # Errors
    ///
    /// If the request is malformed, nothing matches the event, no matching pool has room, the granting pool already
    /// holds `usage_id`, or a collaborator fails, an error is returned and nothing is allocated.
    pub async fn allocate_resources(&self, request: &UsageRequest) -> Result<String, ResourceError> {
        request.validate()?;
        let candidates = self
            .inner
            .matcher
            .match_event(&request.tenant, &request.event, &request.usage_id, request.ttl_override)
            .await?;
        if candidates.is_empty() {
            return Err(ResourceError::NotFound);
        }

        let allocation = self
            .inner
            .allocator
            .allocate(&candidates, &request.usage(), false)
            .await?;
        debug!(
            tenant = %request.tenant,
            usage_id = %request.usage_id,
            resource = %allocation.winner.id,
            "Allocated resources."
        );
        Ok(allocation.message)
    }

    /// Releases an allocation from every pool holding it.
    ///
    /// The pools that granted the allocation are remembered when it is granted. When they aren't known, every pool of
    /// the tenant is checked. Releasing an allocation that isn't held is not an error.
    ///
    /// # Errors
    ///
    /// If the request is malformed or a collaborator fails, an error is returned.
    pub async fn release_resources(&self, tenant: &str, usage_id: &str) -> Result<(), ResourceError> {
        let mut fields = Vec::new();
        if tenant.is_empty() {
            fields.push("Tenant");
        }
        if usage_id.is_empty() {
            fields.push("UsageID");
        }
        if !fields.is_empty() {
            return Err(ResourceError::MandatoryIeMissing { fields });
        }
        check_tenant(tenant)?;

        let profile_ids: Vec<String> = match self.inner.resources.take_holders(tenant, usage_id) {
            Some(ids) => ids.to_vec(),
            None => self.inner.store.resource_profile_ids(tenant).await?,
        };

        // Nothing is cleared until every lookup has succeeded.
        let mut profiles = Vec::with_capacity(profile_ids.len());
        for id in &profile_ids {
            match self.inner.matcher.profile(tenant, id).await? {
                Some(profile) => profiles.push(profile),
                None => debug!(tenant, id = %id, usage_id, "Resource profile no longer exists. Skipping release."),
            }
        }

        let mut released = false;
        for profile in &profiles {
            let locked = self.inner.resources.lock_resource(tenant, &profile.id).await?;
            let remaining = {
                let mut state = locked.handle.state();
                state.clear_usage(usage_id).then(|| state.total_usage())
            };
            let Some(remaining) = remaining else {
                continue;
            };
            self.inner.resources.mark_dirty(&locked.handle);
            let handle = Arc::clone(&locked.handle);
            drop(locked);
            released = true;

            if profile.stored {
                self.inner.resources.flush_logged(&handle).await;
            }
            self.inner.thresholds.notify(profile, remaining);
        }

        self.inner.matcher.forget_matches(tenant, usage_id);
        if released {
            self.inner.resources.telemetry.releases_total().increment(1);
            debug!(tenant, usage_id, "Released resources.");
        }
        Ok(())
    }

    /// Returns the current state of every pool governing an event, highest weight first.
    ///
    /// # Errors
    ///
    /// If the request is malformed, nothing matches the event, or a collaborator fails, an error is returned.
    pub async fn resources_for_event(&self, request: &UsageRequest) -> Result<Vec<ResourceSnapshot>, ResourceError> {
        request.validate()?;
        let matched = self
            .inner
            .matcher
            .match_event(&request.tenant, &request.event, &request.usage_id, request.ttl_override)
            .await?;
        if matched.is_empty() {
            return Err(ResourceError::NotFound);
        }

        let mut snapshots = Vec::with_capacity(matched.len());
        for resource in &matched {
            snapshots.push(self.reaped_snapshot(&resource.profile.tenant, &resource.profile.id).await?);
        }
        Ok(snapshots)
    }

    /// Returns the current state of a pool.
    ///
    /// # Errors
    ///
    /// If the pool's profile doesn't exist, `NotFound` is returned. If a collaborator fails, an error is returned.
    pub async fn get_resource(&self, tenant: &str, id: &str) -> Result<ResourceSnapshot, ResourceError> {
        check_tenant(tenant)?;
        if self.inner.matcher.profile(tenant, id).await?.is_none() {
            return Err(ResourceError::NotFound);
        }
        self.reaped_snapshot(tenant, id).await
    }

    async fn reaped_snapshot(&self, tenant: &str, id: &str) -> Result<ResourceSnapshot, ResourceError> {
        let locked = self.inner.resources.lock_resource(tenant, id).await?;
        let (snapshot, reaped) = {
            let mut state = locked.handle.state();
            let reaped = state.remove_expired_units(Utc::now());
            (state.snapshot(), reaped)
        };
        if reaped > 0 {
            self.inner.resources.mark_dirty(&locked.handle);
            self.inner
                .resources
                .telemetry
                .expired_usages_total()
                .increment(reaped as u64);
        }
        Ok(snapshot)
    }

    /// Creates or replaces a profile.
    ///
    /// # Errors
    ///
    /// If the tenant ID is invalid or the store fails, an error is returned.
    pub async fn set_resource_profile(&self, profile: ResourceProfile) -> Result<(), ResourceError> {
        check_tenant(&profile.tenant)?;
        self.inner.store.set_resource_profile(&profile).await?;
        self.inner.resources.revive(&profile.tenant, &profile.id);
        debug!(resource = %profile.key(), "Resource profile updated.");
        self.inner.matcher.replace_profile(profile);
        Ok(())
    }

    /// Removes a profile along with the state of its pool.
    ///
    /// # Errors
    ///
    /// If the tenant ID is invalid or the store fails, an error is returned.
    pub async fn remove_resource_profile(&self, tenant: &str, id: &str) -> Result<(), ResourceError> {
        check_tenant(tenant)?;
        self.inner.store.remove_resource_profile(tenant, id).await?;
        self.inner.matcher.forget_profile(tenant, id);
        self.inner.resources.destroy(tenant, id).await?;
        debug!(tenant, id, "Resource profile removed.");
        Ok(())
    }

    /// Flushes every modified pool to the store, returning how many were written.
    ///
    /// Pools that fail to flush are logged and stay pending.
    pub async fn store_resources(&self) -> usize {
        self.inner.resources.store_resources().await
    }

    /// Starts flushing modified pools in the background, at the configured interval.
    ///
    /// Returns `true` if the background flush is running, which isn't the case when it's disabled by the
    /// configuration. Must be called from within a Tokio runtime.
    pub fn spawn_backup_loop(&self) -> bool {
        let Some(interval) = self.inner.config.store_interval() else {
            debug!("Background flushing of resources disabled.");
            return false;
        };

        let mut backup = self.inner.backup.lock().unwrap_or_else(|e| e.into_inner());
        if backup.is_none() {
            let (shutdown, shutdown_rx) = watch::channel(false);
            let handle = spawn_traced_named(
                "resources-backup",
                run_backup_loop(Arc::clone(&self.inner.resources), interval, shutdown_rx),
            );
            *backup = Some(BackupTask { shutdown, handle });
        }
        true
    }

    /// Stops background flushing and flushes whatever is still pending.
    ///
    /// Returns how many pools were written by the final flush.
    pub async fn shutdown(&self) -> usize {
        let backup = self.inner.backup.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(BackupTask { shutdown, handle }) = backup {
            let _ = shutdown.send(true);
            if let Err(e) = handle.await {
                warn!(error = %e, "Resource backup loop ended abnormally.");
            }
        }

        let flushed = self.inner.resources.store_resources().await;
        let pending = self.inner.resources.dirty_handles().len();
        if pending > 0 {
            warn!(pending, "Some resources could not be flushed during shutdown.");
        }
        info!(flushed, "Resource service stopped.");
        flushed
    }
}
