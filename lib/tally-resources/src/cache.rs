use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use tally_common::{
    cache::{Cache, CacheBuilder},
    collections::{FastHashMap, FastHashSet},
    hash::hash_single_fast,
};
use tally_error::GenericError;
use tracing::trace;

use crate::{
    errors::ResourceError,
    lock::{KeyGuard, LockManager},
    profile::resource_key,
    resource::{Resource, ResourceHandle, SharedResource},
    store::DataStore,
    Telemetry,
};

const FLUSH_EPOCH_SLOTS: usize = 64;

/// A resource handle together with exclusive access to it.
pub(crate) struct LockedResource {
    pub handle: SharedResource,
    _guard: KeyGuard,
}

/// Live resource state, backed by the data store.
///
/// At most one instance of a given resource is ever live. Lookups go to the bounded cache first, then to the set of
/// modified resources that haven't been flushed yet, and only then to the store. Modified resources stay in that set
/// until flushed, so evicting one from the cache loses nothing: the next lookup simply picks it back up.
pub(crate) struct ResourceCache {
    pub(crate) resources: Cache<String, SharedResource>,
    dirty: Mutex<FastHashMap<String, SharedResource>>,
    pub(crate) store: Arc<dyn DataStore>,
    pub(crate) locks: LockManager,
    // Serializes flushes of a key without contending with ledger mutations of it.
    pub(crate) flush_locks: LockManager,
    // Bumped whenever a flush lands, so that a load racing with it knows it may have read stale state.
    flush_epochs: Box<[AtomicU64]>,
    // Keys of resources whose profile was removed. Nothing is recorded into, or flushed for, these.
    removed: Mutex<FastHashSet<String>>,
    // Allocation (`tenant:usage_id`) to the IDs of the resources it was granted by.
    holders: Cache<String, Arc<[String]>>,
    holders_update: Mutex<()>,
    pub(crate) telemetry: Telemetry,
}

impl ResourceCache {
    pub fn new(
        capacity: NonZeroUsize, store: Arc<dyn DataStore>, locking_timeout: Option<Duration>, telemetry: Telemetry,
    ) -> Result<Self, GenericError> {
        let resources = CacheBuilder::from_identifier("resources")?
            .with_capacity(capacity)
            .build();
        let holders = CacheBuilder::from_identifier("usage_holders")?
            .with_capacity(capacity)
            .build();

        Ok(Self {
            resources,
            dirty: Mutex::new(FastHashMap::default()),
            store,
            locks: LockManager::new(locking_timeout),
            flush_locks: LockManager::new(locking_timeout),
            flush_epochs: (0..FLUSH_EPOCH_SLOTS).map(|_| AtomicU64::new(0)).collect(),
            removed: Mutex::new(FastHashSet::default()),
            holders,
            holders_update: Mutex::new(()),
            telemetry,
        })
    }

    fn dirty(&self) -> MutexGuard<'_, FastHashMap<String, SharedResource>> {
        self.dirty.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn removed(&self) -> MutexGuard<'_, FastHashSet<String>> {
        self.removed.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns `true` if the profile of the resource under `key` was removed.
    pub fn is_removed(&self, key: &str) -> bool {
        self.removed().contains(key)
    }

    /// Allows state to be kept for a resource again, after its profile has been recreated.
    pub fn revive(&self, tenant: &str, id: &str) {
        self.removed().remove(&resource_key(tenant, id));
    }

    /// Remembers that the resource `id` granted the allocation `usage_id`.
    ///
    /// Only called while holding the key lock of the resource.
    pub fn add_holder(&self, tenant: &str, usage_id: &str, id: &str) {
        let key = resource_key(tenant, usage_id);
        let _update = self.holders_update.lock().unwrap_or_else(|e| e.into_inner());
        let holders: Arc<[String]> = match self.holders.get(&key) {
            Some(holders) if holders.iter().any(|holder| holder == id) => return,
            Some(holders) => holders.iter().cloned().chain(std::iter::once(id.to_string())).collect(),
            None => vec![id.to_string()].into(),
        };
        self.holders.insert(key, holders);
    }

    /// Takes the IDs of the resources known to hold the allocation `usage_id`.
    ///
    /// `None` means the holders aren't known, not that there are none.
    pub fn take_holders(&self, tenant: &str, usage_id: &str) -> Option<Arc<[String]>> {
        let _update = self.holders_update.lock().unwrap_or_else(|e| e.into_inner());
        self.holders.remove(&resource_key(tenant, usage_id))
    }

    fn flush_epoch(&self, key: &str) -> &AtomicU64 {
        &self.flush_epochs[hash_single_fast(key) as usize % FLUSH_EPOCH_SLOTS]
    }

    pub(crate) fn bump_flush_epoch(&self, key: &str) {
        self.flush_epoch(key).fetch_add(1, Ordering::AcqRel);
    }

    // Only called while holding the key lock.
    fn live(&self, key: &str) -> Option<SharedResource> {
        let key = key.to_string();
        if let Some(handle) = self.resources.get(&key) {
            return Some(handle);
        }

        let handle = self.dirty().get(&key).cloned()?;
        trace!(resource = %key, "Re-adopting modified resource evicted from cache.");
        self.resources.insert(key, Arc::clone(&handle));
        Some(handle)
    }

    async fn load(&self, tenant: &str, id: &str) -> Result<Resource, ResourceError> {
        match self.store.get_resource(tenant, id).await {
            Ok(stored) => Ok(Resource::from_stored(stored)),
            Err(e) if e.is_not_found() => Ok(Resource::new(tenant, id)),
            Err(source) => Err(ResourceError::Store { source }),
        }
    }

    /// Returns the live instance of a resource, loading it from the store if needed.
    pub async fn get_or_load(&self, tenant: &str, id: &str) -> Result<SharedResource, ResourceError> {
        if let Some(handle) = self.resources.get(&resource_key(tenant, id)) {
            return Ok(handle);
        }

        Ok(self.lock_resource(tenant, id).await?.handle)
    }

    /// Acquires exclusive access to the live instance of a resource, loading it from the store if needed.
    ///
    /// The store is never read while holding the lock.
    pub async fn lock_resource(&self, tenant: &str, id: &str) -> Result<LockedResource, ResourceError> {
        let key = resource_key(tenant, id);
        loop {
            let guard = self.locks.lock(&key).await?;
            if let Some(handle) = self.live(&key) {
                return Ok(LockedResource { handle, _guard: guard });
            }
            drop(guard);

            let epoch = self.flush_epoch(&key).load(Ordering::Acquire);
            let loaded = self.load(tenant, id).await?;

            let guard = self.locks.lock(&key).await?;
            if let Some(handle) = self.live(&key) {
                return Ok(LockedResource { handle, _guard: guard });
            }
            if self.flush_epoch(&key).load(Ordering::Acquire) != epoch {
                trace!(resource = %key, "Resource flushed while loading. Reloading.");
                continue;
            }

            let handle = Arc::new(ResourceHandle::new(loaded));
            self.resources.insert(key, Arc::clone(&handle));
            return Ok(LockedResource { handle, _guard: guard });
        }
    }

    /// Tracks `handle` as modified until it is flushed.
    pub fn mark_dirty(&self, handle: &SharedResource) {
        self.dirty().insert(handle.key().to_string(), Arc::clone(handle));
    }

    /// Returns every resource waiting to be flushed.
    pub fn dirty_handles(&self) -> Vec<SharedResource> {
        self.dirty().values().cloned().collect()
    }

    /// Marks `handle` clean if it hasn't changed since `generation`, and stops tracking it if so.
    pub(crate) fn settle(&self, handle: &SharedResource, generation: u64) -> bool {
        let mut state = handle.state();
        let clean = state.settle(generation);
        if clean {
            self.untrack(handle);
        }
        clean
    }

    pub(crate) fn untrack(&self, handle: &SharedResource) {
        let mut dirty = self.dirty();
        if dirty.get(handle.key()).is_some_and(|tracked| Arc::ptr_eq(tracked, handle)) {
            dirty.remove(handle.key());
        }
    }

    /// Drops a resource from memory and stops keeping state for it until it is revived.
    ///
    /// Its persisted state is left alone.
    pub async fn bury(&self, tenant: &str, id: &str) -> Result<(), ResourceError> {
        let key = resource_key(tenant, id);
        let _guard = self.locks.lock(&key).await?;
        self.resources.remove(&key);
        self.dirty().remove(&key);
        self.removed().insert(key);
        Ok(())
    }
}
