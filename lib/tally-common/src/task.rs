//! Helpers for working with asynchronous tasks.

use std::future::Future;

use tokio::task::JoinHandle;
use tracing::{debug_span, Instrument as _};

/// Spawns a new asynchronous task, returning a [`JoinHandle`] for it.
///
/// This is a thin wrapper over [`tokio::spawn`] that attaches the task to the current `tracing` span, so that anything
/// the task logs carries the context of whoever spawned it.
#[track_caller]
pub fn spawn_traced<F, T>(f: F) -> JoinHandle<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn(f.in_current_span())
}

/// Spawns a new named asynchronous task, returning a [`JoinHandle`] for it.
///
/// Like [`spawn_traced`], but the task runs inside a child span carrying `task_name`.
#[track_caller]
pub fn spawn_traced_named<S, F, T>(name: S, f: F) -> JoinHandle<T>
where
    S: Into<String>,
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let name = name.into();
    tokio::task::spawn(f.instrument(debug_span!("task", task_name = %name)))
}
