use std::{num::NonZeroUsize, time::Duration};

use serde::Deserialize;
use tally_config::GenericConfiguration;
use tally_error::GenericError;

const fn non_zero(value: usize) -> NonZeroUsize {
    match NonZeroUsize::new(value) {
        Some(value) => value,
        None => panic!("value must be non-zero"),
    }
}

const fn default_true() -> bool {
    true
}

const fn default_cached_profiles_limit() -> NonZeroUsize {
    non_zero(10_000)
}

const fn default_cached_resources_limit() -> NonZeroUsize {
    non_zero(100_000)
}

const fn default_cached_event_matches_limit() -> NonZeroUsize {
    non_zero(100_000)
}

const fn default_threshold_queue_capacity() -> NonZeroUsize {
    non_zero(1024)
}

/// Resource service configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct ResourceServiceConfiguration {
    /// Interval between background flushes of modified resources, in seconds.
    ///
    /// Zero disables background flushing: only resources of `stored` profiles are then written, on every mutation, plus
    /// whatever is still pending at shutdown.
    ///
    /// Defaults to 0.
    #[serde(rename = "resources_store_interval_secs", default)]
    pub store_interval_secs: u64,

    /// How long to wait for exclusive access to a resource before giving up, in milliseconds.
    ///
    /// Zero waits forever.
    ///
    /// Defaults to 0.
    #[serde(rename = "resources_locking_timeout_ms", default)]
    pub locking_timeout_ms: u64,

    /// Whether to select candidate profiles through the profile index, when one is configured.
    ///
    /// Defaults to `true`.
    #[serde(rename = "resources_indexed_selects", default = "default_true")]
    pub indexed_selects: bool,

    /// Maximum number of profiles to cache.
    ///
    /// Defaults to 10000.
    #[serde(rename = "resources_cached_profiles_limit", default = "default_cached_profiles_limit")]
    pub cached_profiles_limit: NonZeroUsize,

    /// Maximum number of resources to cache.
    ///
    /// Modified resources that haven't been flushed yet are kept regardless.
    ///
    /// Defaults to 100000.
    #[serde(rename = "resources_cached_resources_limit", default = "default_cached_resources_limit")]
    pub cached_resources_limit: NonZeroUsize,

    /// Maximum number of allocation IDs whose matching profiles are remembered.
    ///
    /// Defaults to 100000.
    #[serde(
        rename = "resources_cached_event_matches_limit",
        default = "default_cached_event_matches_limit"
    )]
    pub cached_event_matches_limit: NonZeroUsize,

    /// Maximum number of threshold notifications waiting to be delivered.
    ///
    /// Notifications beyond this are dropped.
    ///
    /// Defaults to 1024.
    #[serde(
        rename = "resources_threshold_queue_capacity",
        default = "default_threshold_queue_capacity"
    )]
    pub threshold_queue_capacity: NonZeroUsize,
}

impl ResourceServiceConfiguration {
    /// Creates a new `ResourceServiceConfiguration` from the given configuration.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be deserialized, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        Ok(config.as_typed()?)
    }

    /// Returns the interval between background flushes, or `None` if background flushing is disabled.
    pub fn store_interval(&self) -> Option<Duration> {
        (self.store_interval_secs > 0).then(|| Duration::from_secs(self.store_interval_secs))
    }

    /// Returns the lock acquisition timeout, or `None` to wait forever.
    pub fn locking_timeout(&self) -> Option<Duration> {
        (self.locking_timeout_ms > 0).then(|| Duration::from_millis(self.locking_timeout_ms))
    }
}

impl Default for ResourceServiceConfiguration {
    fn default() -> Self {
        Self {
            store_interval_secs: 0,
            locking_timeout_ms: 0,
            indexed_selects: true,
            cached_profiles_limit: default_cached_profiles_limit(),
            cached_resources_limit: default_cached_resources_limit(),
            cached_event_matches_limit: default_cached_event_matches_limit(),
            threshold_queue_capacity: default_threshold_queue_capacity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use tally_config::ConfigurationLoader;

    use super::*;

    #[test]
    fn defaults() {
        let config = ConfigurationLoader::default().into_generic();
        let config = ResourceServiceConfiguration::from_configuration(&config).unwrap();

        assert_eq!(config.store_interval(), None);
        assert_eq!(config.locking_timeout(), None);
        assert!(config.indexed_selects);
        assert_eq!(config.cached_resources_limit.get(), 100_000);
    }

    #[test]
    fn overrides() {
        #[derive(serde::Serialize)]
        struct Overrides {
            resources_store_interval_secs: u64,
            resources_locking_timeout_ms: u64,
            resources_indexed_selects: bool,
            resources_threshold_queue_capacity: usize,
        }

        let config = ConfigurationLoader::default()
            .with_defaults(Overrides {
                resources_store_interval_secs: 30,
                resources_locking_timeout_ms: 250,
                resources_indexed_selects: false,
                resources_threshold_queue_capacity: 16,
            })
            .into_generic();
        let config = ResourceServiceConfiguration::from_configuration(&config).unwrap();

        assert_eq!(config.store_interval(), Some(Duration::from_secs(30)));
        assert_eq!(config.locking_timeout(), Some(Duration::from_millis(250)));
        assert!(!config.indexed_selects);
        assert_eq!(config.threshold_queue_capacity.get(), 16);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        #[derive(serde::Serialize)]
        struct Overrides {
            resources_cached_profiles_limit: usize,
        }

        let config = ConfigurationLoader::default()
            .with_defaults(Overrides {
                resources_cached_profiles_limit: 0,
            })
            .into_generic();
        assert!(ResourceServiceConfiguration::from_configuration(&config).is_err());
    }
}
