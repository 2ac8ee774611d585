//! A bounded, concurrent cache.

use std::{hash::Hash, num::NonZeroUsize, sync::Arc};

use quick_cache::{Lifecycle, UnitWeighter};
use tally_error::{generic_error, GenericError};
use tally_metrics::static_metrics;

use crate::hash::FastBuildHasher;

type InnerCache<K, V> = quick_cache::sync::Cache<K, V, UnitWeighter, FastBuildHasher, TelemetryLifecycle>;

static_metrics! {
    name => Telemetry,
    prefix => cache,
    labels => [cache_id: String],
    metrics => [
        gauge(current_items),
        gauge(capacity),
        counter(hits_total),
        counter(misses_total),
        counter(items_inserted_total),
        counter(items_removed_total),
        counter(items_evicted_total),
    ],
}

/// Builder for creating a [`Cache`].
pub struct CacheBuilder {
    identifier: String,
    capacity: NonZeroUsize,
}

impl CacheBuilder {
    /// Creates a new `CacheBuilder` with the given cache identifier.
    ///
    /// The identifier is attached as the `cache_id` label to all cache telemetry, so it should be unique per cache.
    ///
    /// # Errors
    ///
    /// If the given cache identifier is empty, an error is returned.
    pub fn from_identifier<N: Into<String>>(identifier: N) -> Result<Self, GenericError> {
        let identifier = identifier.into();
        if identifier.is_empty() {
            return Err(generic_error!("cache identifier must not be empty"));
        }

        Ok(Self {
            identifier,
            capacity: NonZeroUsize::MAX,
        })
    }

    /// Sets the maximum number of items held by the cache.
    ///
    /// When the cache is full, inserting a new item evicts an existing one.
    ///
    /// Defaults to unlimited capacity.
    pub fn with_capacity(mut self, capacity: NonZeroUsize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Builds a [`Cache`] from the current configuration.
    pub fn build<K, V>(self) -> Cache<K, V>
    where
        K: Eq + Hash + Clone,
        V: Clone,
    {
        let capacity = self.capacity.get();
        let telemetry = Telemetry::new(self.identifier);
        telemetry.capacity().set(capacity as f64);

        // `quick_cache` preallocates based on the estimated item count, so don't hand it an unbounded capacity as-is.
        let estimated_items = capacity.min(1024);

        Cache {
            inner: Arc::new(InnerCache::with(
                estimated_items,
                capacity as u64,
                UnitWeighter,
                FastBuildHasher::default(),
                TelemetryLifecycle {
                    telemetry: telemetry.clone(),
                },
            )),
            telemetry,
        }
    }
}

/// A concurrent cache holding up to a fixed number of items.
///
/// Cloning a `Cache` is cheap and every clone refers to the same underlying storage.
#[derive(Clone)]
pub struct Cache<K, V> {
    inner: Arc<InnerCache<K, V>>,
    telemetry: Telemetry,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Returns `true` if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns the number of items currently in the cache.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Inserts an item, replacing any existing item with the same key.
    ///
    /// If the cache is full, another item is evicted to make room.
    pub fn insert(&self, key: K, value: V) {
        self.inner.insert(key, value);
        self.telemetry.items_inserted_total().increment(1);
        self.telemetry.current_items().set(self.inner.len() as f64);
    }

    /// Gets a clone of the item stored under `key`, if any.
    pub fn get(&self, key: &K) -> Option<V> {
        let value = self.inner.get(key);
        if value.is_some() {
            self.telemetry.hits_total().increment(1);
        } else {
            self.telemetry.misses_total().increment(1);
        }
        value
    }

    /// Removes the item stored under `key`, returning it if it was present.
    pub fn remove(&self, key: &K) -> Option<V> {
        let removed = self.inner.remove(key).map(|(_, value)| value);
        if removed.is_some() {
            self.telemetry.items_removed_total().increment(1);
            self.telemetry.current_items().set(self.inner.len() as f64);
        }
        removed
    }

    /// Removes every item from the cache.
    pub fn clear(&self) {
        let removed = self.inner.len();
        self.inner.clear();
        self.telemetry.items_removed_total().increment(removed as u64);
        self.telemetry.current_items().set(0.0);
    }
}

/// Counts evictions made by the underlying cache to stay within its capacity.
#[derive(Clone)]
struct TelemetryLifecycle {
    telemetry: Telemetry,
}

impl<K, V> Lifecycle<K, V> for TelemetryLifecycle {
    type RequestState = ();

    #[inline]
    fn begin_request(&self) -> Self::RequestState {}

    #[inline]
    fn on_evict(&self, _state: &mut Self::RequestState, _key: K, _value: V) {
        self.telemetry.items_evicted_total().increment(1);
    }
}

#[cfg(test)]
mod tests {
    use metrics::{Key, Label};
    use tally_metrics::test::TestRecorder;

    use super::*;

    fn cache_with_capacity(capacity: usize) -> Cache<usize, &'static str> {
        CacheBuilder::from_identifier("test")
            .unwrap()
            .with_capacity(NonZeroUsize::new(capacity).unwrap())
            .build()
    }

    #[test]
    fn empty_cache_identifier() {
        assert!(CacheBuilder::from_identifier("").is_err());
    }

    #[test]
    fn insert_get_remove() {
        let cache = cache_with_capacity(16);
        assert!(cache.is_empty());

        cache.insert(1, "one");
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&1), Some("one"));

        cache.insert(1, "uno");
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&1), Some("uno"));

        assert_eq!(cache.remove(&1), Some("uno"));
        assert_eq!(cache.remove(&1), None);
        assert_eq!(cache.get(&1), None);
    }

    #[test]
    fn clear_removes_everything() {
        let cache = cache_with_capacity(16);
        for i in 0..4 {
            cache.insert(i, "value");
        }

        cache.clear();
        assert!(cache.is_empty());
        assert!((0..4).all(|i| cache.get(&i).is_none()));
    }

    #[test]
    fn evicts_at_capacity() {
        const CAPACITY: usize = 3;

        let cache = cache_with_capacity(CAPACITY);
        for i in 0..CAPACITY {
            cache.insert(i, "value");
        }
        assert_eq!(cache.len(), CAPACITY);

        cache.insert(CAPACITY, "new_value");
        assert_eq!(cache.len(), CAPACITY);
        assert!((0..CAPACITY).any(|i| cache.get(&i).is_none()));
    }

    #[test]
    fn telemetry() {
        let recorder = TestRecorder::default();
        let cache = metrics::with_local_recorder(&recorder, || {
            CacheBuilder::from_identifier("profiles")
                .unwrap()
                .with_capacity(NonZeroUsize::new(3).unwrap())
                .build::<usize, usize>()
        });

        for i in 0..3 {
            cache.insert(i, i);
        }
        assert_eq!(cache.get(&1), Some(1));
        assert_eq!(cache.get(&7), None);
        cache.insert(3, 3);

        let key = |name: &'static str| Key::from_parts(name, vec![Label::new("cache_id", "profiles")]);
        assert_eq!(recorder.counter(key("cache_hits_total")), Some(1));
        assert_eq!(recorder.counter(key("cache_misses_total")), Some(1));
        assert_eq!(recorder.counter(key("cache_items_inserted_total")), Some(4));
        assert_eq!(recorder.counter(key("cache_items_evicted_total")), Some(1));
        assert_eq!(recorder.gauge(key("cache_capacity")), Some(3.0));
        assert_eq!(recorder.gauge(key("cache_current_items")), Some(3.0));
    }
}
