use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use snafu::ResultExt as _;
use tally_common::cache::{Cache, CacheBuilder};
use tally_error::GenericError;
use tracing::trace;

use crate::{
    cache::ResourceCache,
    errors::{self, ResourceError},
    profile::resource_key,
    resource::SharedResource,
    DataStore, Event, FilterEngine, ProfileIndex, ResourceProfile,
};

/// A resource matched for a request, along with what the request needs to know about it.
#[derive(Clone)]
pub(crate) struct MatchedResource {
    pub profile: Arc<ResourceProfile>,
    pub handle: SharedResource,

    /// Lifetime granted to allocations made through this match.
    ///
    /// This is the request's TTL override if it had one, and the profile's own TTL otherwise.
    pub ttl: Option<Duration>,
}

impl MatchedResource {
    /// Returns when an allocation made at `now` lapses, if ever.
    pub fn usage_expiry(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let ttl = self.ttl.filter(|ttl| !ttl.is_zero())?;
        TimeDelta::from_std(ttl).ok().and_then(|ttl| now.checked_add_signed(ttl))
    }
}

/// Orders matched resources by profile weight, highest first.
///
/// The sort is stable: resources of equal weight keep the order they were discovered in.
pub(crate) fn sort_by_weight(resources: &mut [MatchedResource]) {
    resources.sort_by(|a, b| b.profile.weight.total_cmp(&a.profile.weight));
}

/// Finds the resources governing an event.
pub(crate) struct ProfileMatcher {
    store: Arc<dyn DataStore>,
    filters: Arc<dyn FilterEngine>,
    index: Option<Arc<dyn ProfileIndex>>,
    profiles: Cache<String, Arc<ResourceProfile>>,
    // Allocation (`tenant:usage_id`) to the IDs of the profiles it last matched. Empty when nothing matched.
    matches: Cache<String, Arc<[String]>>,
    resources: Arc<ResourceCache>,
}

impl ProfileMatcher {
    pub fn new(
        store: Arc<dyn DataStore>, filters: Arc<dyn FilterEngine>, index: Option<Arc<dyn ProfileIndex>>,
        resources: Arc<ResourceCache>, profiles_capacity: NonZeroUsize, matches_capacity: NonZeroUsize,
    ) -> Result<Self, GenericError> {
        Ok(Self {
            store,
            filters,
            index,
            profiles: CacheBuilder::from_identifier("resource_profiles")?
                .with_capacity(profiles_capacity)
                .build(),
            matches: CacheBuilder::from_identifier("event_resources")?
                .with_capacity(matches_capacity)
                .build(),
            resources,
        })
    }

    /// Gets a profile, going to the store if it isn't cached.
    ///
    /// Returns `None` if the profile doesn't exist.
    pub async fn profile(&self, tenant: &str, id: &str) -> Result<Option<Arc<ResourceProfile>>, ResourceError> {
        let key = resource_key(tenant, id);
        if let Some(profile) = self.profiles.get(&key) {
            return Ok(Some(profile));
        }

        match self.store.get_resource_profile(tenant, id).await {
            Ok(profile) => {
                let profile = Arc::new(profile);
                self.profiles.insert(key, Arc::clone(&profile));
                Ok(Some(profile))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(source) => Err(ResourceError::Store { source }),
        }
    }

    /// Replaces the cached copy of a profile.
    pub fn replace_profile(&self, profile: ResourceProfile) {
        self.profiles.insert(profile.key(), Arc::new(profile));
        // Profile changes can change what any event matches.
        self.matches.clear();
    }

    /// Drops the cached copy of a profile.
    pub fn forget_profile(&self, tenant: &str, id: &str) {
        self.profiles.remove(&resource_key(tenant, id));
        self.matches.clear();
    }

    /// Returns the IDs of the profiles an allocation last matched, if known.
    #[cfg(test)]
    pub fn cached_matches(&self, tenant: &str, usage_id: &str) -> Option<Arc<[String]>> {
        self.matches.get(&resource_key(tenant, usage_id))
    }

    /// Forgets what an allocation matched.
    pub fn forget_matches(&self, tenant: &str, usage_id: &str) {
        self.matches.remove(&resource_key(tenant, usage_id));
    }

    /// Returns the resources governing `event`, highest weight first.
    ///
    /// What matched is remembered per allocation, so later requests for the same `usage_id` skip candidate selection.
    /// An empty result means no pool governs the event. On error, nothing is remembered.
    pub async fn match_event(
        &self, tenant: &str, event: &Event, usage_id: &str, ttl_override: Option<Duration>,
    ) -> Result<Vec<MatchedResource>, ResourceError> {
        let match_key = resource_key(tenant, usage_id);
        match self.match_uncached(tenant, event, &match_key, ttl_override).await {
            Ok(matched) => {
                let ids = matched.iter().map(|m| m.profile.id.clone()).collect::<Vec<_>>();
                self.matches.insert(match_key, ids.into());
                Ok(matched)
            }
            Err(e) => {
                self.matches.remove(&match_key);
                Err(e)
            }
        }
    }

    async fn candidate_ids(
        &self, tenant: &str, event: &Event, match_key: &String,
    ) -> Result<Arc<[String]>, ResourceError> {
        if let Some(ids) = self.matches.get(match_key) {
            return Ok(ids);
        }

        let ids = match &self.index {
            Some(index) => index
                .matching_profile_ids(tenant, event)
                .await
                .context(errors::Filter)?,
            None => self.store.resource_profile_ids(tenant).await?,
        };
        Ok(ids.into())
    }

    async fn match_uncached(
        &self, tenant: &str, event: &Event, match_key: &String, ttl_override: Option<Duration>,
    ) -> Result<Vec<MatchedResource>, ResourceError> {
        let candidate_ids = self.candidate_ids(tenant, event, match_key).await?;
        let when = event.time().unwrap_or_else(Utc::now);

        let mut matched = Vec::new();
        for id in candidate_ids.iter() {
            let Some(profile) = self.profile(tenant, id).await? else {
                trace!(tenant, profile_id = %id, "Candidate profile no longer exists. Skipping.");
                continue;
            };

            if let Some(interval) = &profile.activation_interval {
                if !interval.is_active_at(when) {
                    trace!(tenant, profile_id = %id, "Candidate profile not active. Skipping.");
                    continue;
                }
            }

            let passed = self
                .filters
                .pass_filters_for_event(tenant, event, &profile.filter_ids)
                .await
                .context(errors::Filter)?;
            if !passed {
                continue;
            }

            let handle = self.resources.get_or_load(tenant, id).await?;
            let ttl = ttl_override.or(profile.usage_ttl);
            matched.push(MatchedResource { profile, handle, ttl });
        }

        sort_by_weight(&mut matched);
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;

    use super::*;
    use crate::{
        test_util::{FieldFilters, FlakyStore, StaticIndex},
        ActivationInterval, Telemetry,
    };

    struct Fixture {
        store: Arc<FlakyStore>,
        matcher: ProfileMatcher,
    }

    fn fixture(index: Option<Arc<dyn ProfileIndex>>) -> Fixture {
        let store = Arc::new(FlakyStore::default());
        let resources = Arc::new(
            ResourceCache::new(
                NonZeroUsize::new(64).unwrap(),
                store.clone(),
                None,
                Telemetry::new(),
            )
            .unwrap(),
        );
        let matcher = ProfileMatcher::new(
            store.clone(),
            Arc::new(FieldFilters),
            index,
            resources,
            NonZeroUsize::new(64).unwrap(),
            NonZeroUsize::new(64).unwrap(),
        )
        .unwrap();
        Fixture { store, matcher }
    }

    async fn add_profile(store: &FlakyStore, id: &str, weight: f64, filter_ids: &[&str]) -> ResourceProfile {
        let mut profile = ResourceProfile::new("cgrates.org", id, 10.0);
        profile.weight = weight;
        profile.filter_ids = filter_ids.iter().map(|f| f.to_string()).collect();
        store.set_resource_profile(&profile).await.unwrap();
        profile
    }

    fn event() -> Event {
        Event::new("cgrates.org", "ev-1").with_field("Account", "1001")
    }

    fn ids(matched: &[MatchedResource]) -> Vec<&str> {
        matched.iter().map(|m| m.profile.id.as_str()).collect()
    }

    #[test]
    fn weight_ordering_is_stable() {
        let handle = |id: &str| Arc::new(crate::resource::ResourceHandle::new(crate::resource::Resource::new("t", id)));
        let resource = |id: &str, weight: f64| {
            let mut profile = ResourceProfile::new("t", id, 1.0);
            profile.weight = weight;
            MatchedResource {
                profile: Arc::new(profile),
                handle: handle(id),
                ttl: None,
            }
        };

        let mut resources = vec![
            resource("a", 50.0),
            resource("b", 100.0),
            resource("c", 10.0),
            resource("d", 50.0),
        ];
        sort_by_weight(&mut resources);
        assert_eq!(ids(&resources), vec!["b", "a", "d", "c"]);
    }

    #[test]
    fn usage_expiry() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let mut matched = MatchedResource {
            profile: Arc::new(ResourceProfile::new("t", "a", 1.0)),
            handle: Arc::new(crate::resource::ResourceHandle::new(crate::resource::Resource::new("t", "a"))),
            ttl: None,
        };
        assert_eq!(matched.usage_expiry(now), None);

        matched.ttl = Some(Duration::ZERO);
        assert_eq!(matched.usage_expiry(now), None);

        matched.ttl = Some(Duration::from_secs(60));
        assert_eq!(matched.usage_expiry(now), Some(now + TimeDelta::seconds(60)));
    }

    #[tokio::test]
    async fn filters_and_sorts() {
        let Fixture { store, matcher } = fixture(None);
        add_profile(&store, "low", 10.0, &[]).await;
        add_profile(&store, "high", 100.0, &["Account=1001"]).await;
        add_profile(&store, "other", 50.0, &["Account=1002"]).await;

        let matched = matcher.match_event("cgrates.org", &event(), "u1", None).await.unwrap();
        assert_eq!(ids(&matched), vec!["high", "low"]);
        assert_eq!(
            matcher.cached_matches("cgrates.org", "u1").as_deref(),
            Some(&["high".to_string(), "low".to_string()][..])
        );
    }

    #[tokio::test]
    async fn activation_interval_uses_event_time() {
        let Fixture { store, matcher } = fixture(None);
        let mut profile = ResourceProfile::new("cgrates.org", "business-hours", 10.0);
        profile.activation_interval = Some(ActivationInterval {
            activation_time: Some(Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap()),
            expiry_time: Some(Utc.with_ymd_and_hms(2024, 1, 1, 18, 0, 0).unwrap()),
        });
        store.set_resource_profile(&profile).await.unwrap();

        let inside = event().with_time(Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap());
        let outside = event().with_time(Utc.with_ymd_and_hms(2024, 1, 1, 19, 0, 0).unwrap());

        assert_eq!(matcher.match_event("cgrates.org", &inside, "u1", None).await.unwrap().len(), 1);
        assert!(matcher.match_event("cgrates.org", &outside, "u2", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ttl_override_does_not_touch_profile() {
        let Fixture { store, matcher } = fixture(None);
        let mut profile = ResourceProfile::new("cgrates.org", "trunk-1", 10.0);
        profile.usage_ttl = Some(Duration::from_secs(60));
        store.set_resource_profile(&profile).await.unwrap();

        let matched = matcher.match_event("cgrates.org", &event(), "u1", None).await.unwrap();
        assert_eq!(matched[0].ttl, Some(Duration::from_secs(60)));

        let matched = matcher
            .match_event("cgrates.org", &event(), "u2", Some(Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(matched[0].ttl, Some(Duration::ZERO));
        assert_eq!(matched[0].profile.usage_ttl, Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn negative_matches_are_cached() {
        let Fixture { store, matcher } = fixture(None);
        add_profile(&store, "other", 50.0, &["Account=1002"]).await;

        assert!(matcher.match_event("cgrates.org", &event(), "u1", None).await.unwrap().is_empty());

        // A profile added behind the matcher's back isn't seen for the same allocation.
        add_profile(&store, "late", 50.0, &[]).await;
        assert!(matcher.match_event("cgrates.org", &event(), "u1", None).await.unwrap().is_empty());
        assert_eq!(ids(&matcher.match_event("cgrates.org", &event(), "u2", None).await.unwrap()), vec!["late"]);
    }

    #[tokio::test]
    async fn uses_index_when_configured() {
        let index: Arc<dyn ProfileIndex> = Arc::new(StaticIndex(vec!["indexed".to_string(), "missing".to_string()]));
        let Fixture { store, matcher } = fixture(Some(index));
        add_profile(&store, "indexed", 10.0, &[]).await;
        add_profile(&store, "unindexed", 10.0, &[]).await;

        let matched = matcher.match_event("cgrates.org", &event(), "u1", None).await.unwrap();
        assert_eq!(ids(&matched), vec!["indexed"]);
    }

    #[tokio::test]
    async fn filter_errors_abort_and_forget() {
        let Fixture { store, matcher } = fixture(None);
        add_profile(&store, "good", 10.0, &[]).await;
        add_profile(&store, "picky", 20.0, &["!Account"]).await;

        // Without the field, the picky filter passes.
        let matched = matcher
            .match_event("cgrates.org", &Event::new("cgrates.org", "ev-0"), "u1", None)
            .await
            .unwrap();
        assert_eq!(ids(&matched), vec!["picky", "good"]);
        assert!(matcher.cached_matches("cgrates.org", "u1").is_some());

        let result = matcher.match_event("cgrates.org", &event(), "u1", None).await;
        assert!(matches!(result, Err(ResourceError::Filter { .. })));
        assert!(matcher.cached_matches("cgrates.org", "u1").is_none());
    }

    #[tokio::test]
    async fn store_errors_abort() {
        let Fixture { store, matcher } = fixture(None);
        add_profile(&store, "trunk-1", 10.0, &[]).await;
        store.fail_reads(true);

        let result = matcher.match_event("cgrates.org", &event(), "u1", None).await;
        assert!(matches!(result, Err(ResourceError::Store { .. })));
    }
}
