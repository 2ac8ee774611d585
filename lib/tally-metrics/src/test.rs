//! In-memory metrics recorder for asserting on emitted telemetry in tests.
//!
//! Pair with [`metrics::with_local_recorder`] so that handles created inside the closure report into the recorder
//! without installing a global recorder.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering::Relaxed},
        Arc, Mutex,
    },
};

use metrics::{Counter, Gauge, Histogram, HistogramFn, Key, KeyName, Metadata, Recorder, SharedString, Unit};

#[derive(Default)]
struct Samples(Mutex<Vec<f64>>);

impl HistogramFn for Samples {
    fn record(&self, value: f64) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).push(value);
    }
}

#[derive(Default)]
struct Registry {
    // `metrics` implements the counter and gauge traits directly on `AtomicU64`; gauges store `f64` bits.
    counters: HashMap<Key, Arc<AtomicU64>>,
    gauges: HashMap<Key, Arc<AtomicU64>>,
    histograms: HashMap<Key, Arc<Samples>>,
}

/// A recorder that keeps every registered metric in memory.
#[derive(Default)]
pub struct TestRecorder {
    registry: Mutex<Registry>,
}

impl TestRecorder {
    fn with_registry<T>(&self, f: impl FnOnce(&mut Registry) -> T) -> T {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut registry)
    }

    /// Returns the value of the counter registered under `key`, if any.
    pub fn counter<K: Into<Key>>(&self, key: K) -> Option<u64> {
        let key = key.into();
        self.with_registry(|r| r.counters.get(&key).map(|c| c.load(Relaxed)))
    }

    /// Returns the value of the gauge registered under `key`, if any.
    pub fn gauge<K: Into<Key>>(&self, key: K) -> Option<f64> {
        let key = key.into();
        self.with_registry(|r| r.gauges.get(&key).map(|g| f64::from_bits(g.load(Relaxed))))
    }

    /// Returns every sample recorded by the histogram registered under `key`, if any.
    pub fn histogram<K: Into<Key>>(&self, key: K) -> Option<Vec<f64>> {
        let key = key.into();
        self.with_registry(|r| {
            r.histograms
                .get(&key)
                .map(|h| h.0.lock().unwrap_or_else(|e| e.into_inner()).clone())
        })
    }
}

impl Recorder for TestRecorder {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        let storage = self.with_registry(|r| Arc::clone(r.counters.entry(key.clone()).or_default()));
        Counter::from_arc(storage)
    }

    fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
        let storage = self.with_registry(|r| {
            Arc::clone(
                r.gauges
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(AtomicU64::new(0.0f64.to_bits()))),
            )
        });
        Gauge::from_arc(storage)
    }

    fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> Histogram {
        let storage = self.with_registry(|r| Arc::clone(r.histograms.entry(key.clone()).or_default()));
        Histogram::from_arc(storage)
    }
}
