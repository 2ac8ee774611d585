//! Hashing primitives.

use std::{
    hash::{BuildHasher as _, Hash, Hasher as _},
    sync::LazyLock,
};

/// A fast, non-cryptographic hasher with good distribution, suitable for hash tables and sharding.
///
/// Backed by [`foldhash`][foldhash].
///
/// [foldhash]: https://github.com/orlp/foldhash
pub type FastHasher = foldhash::quality::FoldHasher;

/// [`BuildHasher`][std::hash::BuildHasher] implementation for [`FastHasher`].
pub type FastBuildHasher = foldhash::quality::RandomState;

// Process-wide seed so that `hash_single_fast` is stable for the lifetime of the process.
static SHARED_STATE: LazyLock<FastBuildHasher> = LazyLock::new(FastBuildHasher::default);

/// Hashes a single value with [`FastHasher`].
///
/// The result is consistent within a process, which makes it suitable for picking a shard for a key, but is not stable
/// across process restarts.
#[inline]
pub fn hash_single_fast<H: Hash>(value: H) -> u64 {
    let mut hasher = SHARED_STATE.build_hasher();
    value.hash(&mut hasher);
    hasher.finish()
}
