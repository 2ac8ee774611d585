use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single allocation against a resource pool.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ResourceUsage {
    /// Tenant owning the allocation.
    pub tenant: String,

    /// Allocation identifier, supplied by the caller.
    pub id: String,

    /// When the allocation lapses. `None` means it never expires on its own.
    #[serde(default)]
    pub expiry_time: Option<DateTime<Utc>>,

    /// Number of units held.
    pub units: f64,
}

impl ResourceUsage {
    /// Creates a non-expiring allocation.
    pub fn new<T, I>(tenant: T, id: I, units: f64) -> Self
    where
        T: Into<String>,
        I: Into<String>,
    {
        Self {
            tenant: tenant.into(),
            id: id.into(),
            expiry_time: None,
            units,
        }
    }

    /// Sets when the allocation lapses.
    pub fn with_expiry_time(mut self, expiry_time: DateTime<Utc>) -> Self {
        self.expiry_time = Some(expiry_time);
        self
    }

    /// Returns `true` if the allocation has lapsed as of `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry_time.is_some_and(|expiry| expiry <= now)
    }
}
