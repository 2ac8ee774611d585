use std::time::Duration;

use tokio::{sync::watch, time::sleep};
use tracing::{debug, warn};

use crate::{
    cache::ResourceCache,
    errors::ResourceError,
    profile::resource_key,
    resource::SharedResource,
};

impl ResourceCache {
    /// Writes a resource to the store if it has unflushed changes.
    ///
    /// Returns `true` if anything was written. Flushes of the same resource are serialized, but never wait on, or
    /// block, mutations of it: if the resource changes while its snapshot is being written, it simply stays dirty.
    ///
    /// Resources whose profile was removed are never written.
    ///
    /// # Errors
    ///
    /// If the store fails, an error is returned and the resource stays dirty.
    pub async fn flush(&self, handle: &SharedResource) -> Result<bool, ResourceError> {
        let _flush_guard = self.flush_locks.lock(handle.key()).await?;
        if self.is_removed(handle.key()) {
            self.untrack(handle);
            return Ok(false);
        }

        let (stored, generation) = {
            let state = handle.state();
            (state.is_dirty().then(|| state.to_stored()), state.generation())
        };

        let Some(stored) = stored else {
            // Already flushed by someone else, so just make sure it isn't tracked anymore.
            self.settle(handle, generation);
            return Ok(false);
        };

        self.store.set_resource(&stored).await?;
        self.bump_flush_epoch(handle.key());
        self.settle(handle, generation);
        self.telemetry.flushes_total().increment(1);
        Ok(true)
    }

    /// Flushes a resource, logging any failure instead of returning it.
    pub async fn flush_logged(&self, handle: &SharedResource) {
        if let Err(e) = self.flush(handle).await {
            warn!(error = %e, resource = %handle.key(), "Failed to flush resource. Will retry on next cycle.");
            self.telemetry.flush_failures_total().increment(1);
        }
    }

    /// Flushes every resource with unflushed changes, returning how many were written.
    ///
    /// Failures are logged, and the affected resources are retried on the next call.
    pub async fn store_resources(&self) -> usize {
        let mut flushed = 0;
        for handle in self.dirty_handles() {
            match self.flush(&handle).await {
                Ok(true) => flushed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(error = %e, resource = %handle.key(), "Failed to flush resource. Will retry on next cycle.");
                    self.telemetry.flush_failures_total().increment(1);
                }
            }

            // Don't hog the worker when there's a large backlog.
            tokio::task::yield_now().await;
        }
        flushed
    }

    /// Drops a resource from memory and from the store.
    ///
    /// Until the resource is revived, nothing is recorded into it or written for it.
    pub async fn destroy(&self, tenant: &str, id: &str) -> Result<(), ResourceError> {
        let _flush_guard = self.flush_locks.lock(&resource_key(tenant, id)).await?;
        self.bury(tenant, id).await?;
        self.store.remove_resource(tenant, id).await?;
        Ok(())
    }
}

/// Periodically flushes modified resources until `shutdown` fires.
pub(crate) async fn run_backup_loop(
    cache: std::sync::Arc<ResourceCache>, interval: Duration, mut shutdown: watch::Receiver<bool>,
) {
    debug!(?interval, "Resource backup loop started.");

    loop {
        tokio::select! {
            _ = sleep(interval) => {
                let flushed = cache.store_resources().await;
                if flushed > 0 {
                    debug!(flushed, "Flushed modified resources.");
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    debug!("Resource backup loop stopped.");
}

#[cfg(test)]
mod tests {
    use std::{num::NonZeroUsize, sync::Arc};

    use metrics::Key;
    use tally_metrics::test::TestRecorder;

    use super::*;
    use crate::{store::DataStore, test_util::FlakyStore, ResourceUsage, Telemetry};

    fn cache(store: Arc<FlakyStore>, telemetry: Telemetry) -> Arc<ResourceCache> {
        Arc::new(
            ResourceCache::new(NonZeroUsize::new(16).unwrap(), store, None, telemetry).unwrap(),
        )
    }

    async fn modify(cache: &ResourceCache, id: &str, usage_id: &str) -> SharedResource {
        let locked = cache.lock_resource("cgrates.org", id).await.unwrap();
        locked
            .handle
            .state()
            .record_usage(ResourceUsage::new("cgrates.org", usage_id, 1.0))
            .unwrap();
        cache.mark_dirty(&locked.handle);
        locked.handle
    }

    #[tokio::test]
    async fn flush_writes_dirty_resources_once() {
        let store = Arc::new(FlakyStore::default());
        let cache = cache(store.clone(), Telemetry::new());

        let handle = modify(&cache, "trunk-1", "u1").await;
        assert!(cache.flush(&handle).await.unwrap());
        assert!(!handle.state().is_dirty());
        assert!(!cache.flush(&handle).await.unwrap());
        assert_eq!(store.resource_writes(), 1);

        let stored = store.get_resource("cgrates.org", "trunk-1").await.unwrap();
        assert_eq!(stored.ttl_idx, vec!["u1"]);
    }

    #[tokio::test]
    async fn failed_flushes_stay_dirty() {
        let recorder = TestRecorder::default();
        let telemetry = metrics::with_local_recorder(&recorder, Telemetry::new);
        let store = Arc::new(FlakyStore::default());
        let cache = cache(store.clone(), telemetry);

        modify(&cache, "trunk-1", "u1").await;
        modify(&cache, "trunk-2", "u1").await;

        store.fail_writes(true);
        assert_eq!(cache.store_resources().await, 0);
        assert_eq!(cache.dirty_handles().len(), 2);
        assert_eq!(recorder.counter(Key::from_name("resources_flush_failures_total")), Some(2));

        store.fail_writes(false);
        assert_eq!(cache.store_resources().await, 2);
        assert!(cache.dirty_handles().is_empty());
        assert_eq!(recorder.counter(Key::from_name("resources_flushes_total")), Some(2));
    }

    #[tokio::test]
    async fn destroy_removes_everything() {
        let store = Arc::new(FlakyStore::default());
        let cache = cache(store.clone(), Telemetry::new());

        let handle = modify(&cache, "trunk-1", "u1").await;
        cache.flush(&handle).await.unwrap();
        modify(&cache, "trunk-1", "u2").await;

        cache.destroy("cgrates.org", "trunk-1").await.unwrap();
        assert!(cache.dirty_handles().is_empty());
        assert!(cache.resources.is_empty());
        assert!(store.get_resource("cgrates.org", "trunk-1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn stale_handles_of_destroyed_resources_are_not_written() {
        let store = Arc::new(FlakyStore::default());
        let cache = cache(store.clone(), Telemetry::new());

        let stale = modify(&cache, "trunk-1", "u1").await;
        cache.destroy("cgrates.org", "trunk-1").await.unwrap();

        assert!(!cache.flush(&stale).await.unwrap());
        assert_eq!(store.resource_writes(), 0);
        assert!(store.get_resource("cgrates.org", "trunk-1").await.unwrap_err().is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn backup_loop_flushes_periodically() {
        let store = Arc::new(FlakyStore::default());
        let cache = cache(store.clone(), Telemetry::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let backup = tokio::spawn(run_backup_loop(Arc::clone(&cache), Duration::from_secs(10), shutdown_rx));

        modify(&cache, "trunk-1", "u1").await;
        sleep(Duration::from_secs(11)).await;
        assert_eq!(store.resource_writes(), 1);
        assert!(cache.dirty_handles().is_empty());

        shutdown_tx.send(true).unwrap();
        backup.await.unwrap();
    }
}
