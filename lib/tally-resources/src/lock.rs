use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use snafu::Snafu;
use tally_common::{collections::FastHashMap, hash::hash_single_fast};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

const DEFAULT_SHARDS: usize = 32;

/// A lock manager error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum LockError {
    /// Timed out waiting for the lock.
    #[snafu(display("Timed out after {:?} waiting for lock on '{}'.", timeout, key))]
    Timeout {
        /// The contended key.
        key: String,

        /// How long the caller waited.
        timeout: Duration,
    },
}

type Shard = Mutex<FastHashMap<String, Arc<AsyncMutex<()>>>>;

#[derive(Debug)]
struct Shards {
    shards: Box<[Shard]>,
}

impl Shards {
    fn shard(&self, key: &str) -> &Shard {
        let idx = hash_single_fast(key) as usize % self.shards.len();
        &self.shards[idx]
    }

    fn entry(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut shard = self.shard(key).lock().unwrap_or_else(|e| e.into_inner());
        match shard.get(key) {
            Some(entry) => Arc::clone(entry),
            None => {
                let entry = Arc::new(AsyncMutex::new(()));
                shard.insert(key.to_string(), Arc::clone(&entry));
                entry
            }
        }
    }

    fn release(&self, key: &str) {
        let mut shard = self.shard(key).lock().unwrap_or_else(|e| e.into_inner());
        // Every clone of an entry is handed out under the shard lock, so a count of one means only the table still
        // refers to it.
        if shard.get(key).is_some_and(|entry| Arc::strong_count(entry) == 1) {
            shard.remove(key);
        }
    }

    fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().unwrap_or_else(|e| e.into_inner()).len())
            .sum()
    }
}

/// Removes the table entry for a key once nobody holds or waits on it anymore.
struct EntryCleanup {
    shards: Arc<Shards>,
    key: String,
}

impl Drop for EntryCleanup {
    fn drop(&mut self) {
        self.shards.release(&self.key);
    }
}

/// Exclusive access to a key, released when dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct KeyGuard {
    // Field order matters: the mutex guard has to be gone before the cleanup checks whether the entry is still in use.
    _guard: OwnedMutexGuard<()>,
    _cleanup: EntryCleanup,
}

/// Name-keyed asynchronous locks.
///
/// Keys live in a sharded table and only exist while someone holds or waits on them. Guards are released on every exit
/// path, including when the future waiting on a lock is dropped before it resolves.
#[derive(Clone, Debug)]
pub struct LockManager {
    shards: Arc<Shards>,
    timeout: Option<Duration>,
}

impl LockManager {
    /// Creates a lock manager whose acquisitions give up after `timeout`, or wait forever if `timeout` is `None`.
    pub fn new(timeout: Option<Duration>) -> Self {
        let shards = (0..DEFAULT_SHARDS)
            .map(|_| Mutex::new(FastHashMap::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            shards: Arc::new(Shards { shards }),
            timeout,
        }
    }

    /// Acquires the lock for `key`.
    ///
    /// # Errors
    ///
    /// If an acquisition timeout is configured and the lock isn't acquired in time, an error is returned.
    pub async fn lock(&self, key: &str) -> Result<KeyGuard, LockError> {
        let entry = self.shards.entry(key);
        let cleanup = EntryCleanup {
            shards: Arc::clone(&self.shards),
            key: key.to_string(),
        };

        let acquire = entry.lock_owned();
        let guard = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, acquire).await {
                Ok(guard) => guard,
                Err(_) => {
                    return Err(LockError::Timeout {
                        key: key.to_string(),
                        timeout,
                    })
                }
            },
            None => acquire.await,
        };

        Ok(KeyGuard {
            _guard: guard,
            _cleanup: cleanup,
        })
    }

    /// Returns the number of keys currently held or waited on.
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// Returns `true` if no key is held or waited on.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
