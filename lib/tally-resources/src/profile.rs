use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Threshold ID that disables threshold notifications for a profile.
pub(crate) const NO_THRESHOLDS: &str = "*none";

/// Time window during which a profile is active.
///
/// The window is half-open: active from `activation_time` (inclusive) until `expiry_time` (exclusive). A missing bound
/// leaves that side of the window open.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ActivationInterval {
    /// Start of the window.
    #[serde(default)]
    pub activation_time: Option<DateTime<Utc>>,

    /// End of the window.
    #[serde(default)]
    pub expiry_time: Option<DateTime<Utc>>,
}

impl ActivationInterval {
    /// Returns `true` if `time` falls within the window.
    pub fn is_active_at(&self, time: DateTime<Utc>) -> bool {
        self.activation_time.is_none_or(|start| time >= start) && self.expiry_time.is_none_or(|end| time < end)
    }
}

/// Configuration of a resource pool.
///
/// Profiles are immutable once loaded: updating one replaces it wholesale.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ResourceProfile {
    /// Tenant owning the pool.
    pub tenant: String,

    /// Pool identifier, unique within the tenant.
    pub id: String,

    /// Filters an event must pass for the pool to govern it.
    #[serde(default)]
    pub filter_ids: Vec<String>,

    /// Window during which the pool is active.
    #[serde(default)]
    pub activation_interval: Option<ActivationInterval>,

    /// Default lifetime of an allocation.
    ///
    /// `None` and zero both mean allocations never expire on their own.
    #[serde(default)]
    pub usage_ttl: Option<Duration>,

    /// Maximum number of units outstanding at once. Negative means unlimited.
    pub limit: f64,

    /// Message returned to the caller on a successful allocation.
    ///
    /// Falls back to the profile ID when empty.
    #[serde(default)]
    pub allocation_message: String,

    /// Priority relative to other pools matching the same event. Higher is tried first.
    #[serde(default)]
    pub weight: f64,

    /// Whether a full pool stops the search instead of falling through to lower-weight pools.
    #[serde(default)]
    pub blocker: bool,

    /// Thresholds to notify when the pool's usage changes.
    #[serde(default)]
    pub threshold_ids: Vec<String>,

    /// Whether every mutation is written to the store before the mutating call returns.
    #[serde(default)]
    pub stored: bool,
}

impl ResourceProfile {
    /// Creates a profile with the given limit and every other setting at its default.
    pub fn new<T, I>(tenant: T, id: I, limit: f64) -> Self
    where
        T: Into<String>,
        I: Into<String>,
    {
        Self {
            tenant: tenant.into(),
            id: id.into(),
            filter_ids: Vec::new(),
            activation_interval: None,
            usage_ttl: None,
            limit,
            allocation_message: String::new(),
            weight: 0.0,
            blocker: false,
            threshold_ids: Vec::new(),
            stored: false,
        }
    }

    /// Returns the key identifying the profile, and the pool it describes, across tenants.
    pub fn key(&self) -> String {
        resource_key(&self.tenant, &self.id)
    }

    /// Returns the message granted on a successful allocation.
    pub fn allocation_message(&self) -> &str {
        if self.allocation_message.is_empty() {
            &self.id
        } else {
            &self.allocation_message
        }
    }

    /// Returns `true` if the pool never rejects an allocation for lack of capacity.
    pub fn is_unlimited(&self) -> bool {
        self.limit < 0.0
    }

    pub(crate) fn notifies_thresholds(&self) -> bool {
        !matches!(self.threshold_ids.as_slice(), [only] if only == NO_THRESHOLDS)
    }
}

pub(crate) fn resource_key(tenant: &str, id: &str) -> String {
    format!("{}:{}", tenant, id)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;

    use super::*;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn activation_interval_bounds() {
        let interval = ActivationInterval {
            activation_time: Some(at(8)),
            expiry_time: Some(at(18)),
        };
        assert!(!interval.is_active_at(at(7)));
        assert!(interval.is_active_at(at(8)));
        assert!(interval.is_active_at(at(17)));
        assert!(!interval.is_active_at(at(18)));

        let open_ended = ActivationInterval {
            activation_time: Some(at(8)),
            expiry_time: None,
        };
        assert!(open_ended.is_active_at(at(23)));
        assert!(ActivationInterval::default().is_active_at(at(0)));
    }

    #[test]
    fn allocation_message_falls_back_to_id() {
        let mut profile = ResourceProfile::new("cgrates.org", "trunk-1", 10.0);
        assert_eq!(profile.allocation_message(), "trunk-1");

        profile.allocation_message = "approved".to_string();
        assert_eq!(profile.allocation_message(), "approved");
    }

    #[test]
    fn threshold_opt_out() {
        let mut profile = ResourceProfile::new("cgrates.org", "trunk-1", 10.0);
        assert!(profile.notifies_thresholds());

        profile.threshold_ids = vec![NO_THRESHOLDS.to_string()];
        assert!(!profile.notifies_thresholds());

        profile.threshold_ids = vec![NO_THRESHOLDS.to_string(), "th-1".to_string()];
        assert!(profile.notifies_thresholds());
    }

    #[test]
    fn deserialize_with_defaults() {
        let profile: ResourceProfile =
            serde_json::from_str(r#"{ "tenant": "cgrates.org", "id": "trunk-1", "limit": -1 }"#).unwrap();
        assert_eq!(profile, ResourceProfile::new("cgrates.org", "trunk-1", -1.0));
        assert!(profile.is_unlimited());
        assert_eq!(profile.key(), "cgrates.org:trunk-1");
    }
}
