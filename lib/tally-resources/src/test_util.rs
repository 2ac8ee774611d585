//! Test doubles for the collaborators of the resource service.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tally_error::{generic_error, GenericError};
use tokio::sync::mpsc;

use crate::{
    DataStore, Event, EventValue, FilterEngine, MemoryStore, ProfileIndex, ResourceProfile, StoreError, StoredResource,
    ThresholdNotifier,
};

/// An in-memory store that can be told to fail, and that counts resource traffic.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    fail_profile_reads: AtomicBool,
    resource_reads: AtomicUsize,
    resource_writes: AtomicUsize,
}

impl FlakyStore {
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    pub fn fail_profile_reads(&self, fail: bool) {
        self.fail_profile_reads.store(fail, Ordering::Relaxed);
    }

    pub fn resource_reads(&self) -> usize {
        self.resource_reads.load(Ordering::Relaxed)
    }

    pub fn resource_writes(&self) -> usize {
        self.resource_writes.load(Ordering::Relaxed)
    }

    fn check_read(&self) -> Result<(), StoreError> {
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(StoreError::Backend {
                source: generic_error!("read failure"),
            });
        }
        Ok(())
    }

    fn check_write(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(StoreError::Backend {
                source: generic_error!("write failure"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DataStore for FlakyStore {
    async fn get_resource_profile(&self, tenant: &str, id: &str) -> Result<ResourceProfile, StoreError> {
        self.check_read()?;
        if self.fail_profile_reads.load(Ordering::Relaxed) {
            return Err(StoreError::Backend {
                source: generic_error!("profile read failure"),
            });
        }
        self.inner.get_resource_profile(tenant, id).await
    }

    async fn set_resource_profile(&self, profile: &ResourceProfile) -> Result<(), StoreError> {
        self.check_write()?;
        self.inner.set_resource_profile(profile).await
    }

    async fn remove_resource_profile(&self, tenant: &str, id: &str) -> Result<(), StoreError> {
        self.check_write()?;
        self.inner.remove_resource_profile(tenant, id).await
    }

    async fn resource_profile_ids(&self, tenant: &str) -> Result<Vec<String>, StoreError> {
        self.check_read()?;
        self.inner.resource_profile_ids(tenant).await
    }

    async fn get_resource(&self, tenant: &str, id: &str) -> Result<StoredResource, StoreError> {
        self.resource_reads.fetch_add(1, Ordering::Relaxed);
        self.check_read()?;
        self.inner.get_resource(tenant, id).await
    }

    async fn set_resource(&self, resource: &StoredResource) -> Result<(), StoreError> {
        self.check_write()?;
        self.resource_writes.fetch_add(1, Ordering::Relaxed);
        self.inner.set_resource(resource).await
    }

    async fn remove_resource(&self, tenant: &str, id: &str) -> Result<(), StoreError> {
        self.check_write()?;
        self.inner.remove_resource(tenant, id).await
    }
}

/// Filters over string fields.
///
/// `Field=Value` passes when the event's `Field` is the string `Value`. `!Field` fails to evaluate when the event has
/// `Field`, and passes otherwise.
pub struct FieldFilters;

#[async_trait]
impl FilterEngine for FieldFilters {
    async fn pass_filters_for_event(
        &self, _tenant: &str, event: &Event, filter_ids: &[String],
    ) -> Result<bool, GenericError> {
        for filter_id in filter_ids {
            if let Some(field) = filter_id.strip_prefix('!') {
                if event.field(field).is_some() {
                    return Err(generic_error!("filter '{}' cannot be evaluated", filter_id));
                }
                continue;
            }

            let Some((field, expected)) = filter_id.split_once('=') else {
                return Err(generic_error!("malformed filter '{}'", filter_id));
            };
            match event.field(field) {
                Some(EventValue::String(value)) if value == expected => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }
}

/// An index returning the same candidates for every event.
pub struct StaticIndex(pub Vec<String>);

#[async_trait]
impl ProfileIndex for StaticIndex {
    async fn matching_profile_ids(&self, _tenant: &str, _event: &Event) -> Result<Vec<String>, GenericError> {
        Ok(self.0.clone())
    }
}

/// A notifier forwarding everything it receives to a channel.
pub struct ChannelNotifier {
    events: mpsc::UnboundedSender<(Vec<String>, Event)>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(Vec<String>, Event)>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (Self { events }, receiver)
    }
}

#[async_trait]
impl ThresholdNotifier for ChannelNotifier {
    async fn process_event(&self, threshold_ids: &[String], event: Event) -> Result<(), GenericError> {
        let _ = self.events.send((threshold_ids.to_vec(), event));
        Ok(())
    }
}
