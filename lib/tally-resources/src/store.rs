use std::{collections::BTreeMap, sync::RwLock};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use snafu::Snafu;
use tally_error::GenericError;

use crate::{profile::resource_key, resource::StoredResource, ResourceProfile};

/// A data store error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum StoreError {
    /// The requested item does not exist.
    #[snafu(display("Item '{}' not found.", key))]
    NotFound {
        /// Key of the missing item.
        key: String,
    },

    /// The store backend failed.
    #[snafu(display("Data store backend failed."))]
    Backend {
        /// Error source.
        source: GenericError,
    },
}

impl StoreError {
    /// Returns `true` if the error signals a missing item.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Persistent storage for resource profiles and resource state.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Gets a resource profile.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the profile does not exist.
    async fn get_resource_profile(&self, tenant: &str, id: &str) -> Result<ResourceProfile, StoreError>;

    /// Creates or replaces a resource profile.
    async fn set_resource_profile(&self, profile: &ResourceProfile) -> Result<(), StoreError>;

    /// Removes a resource profile. Removing a profile that doesn't exist is not an error.
    async fn remove_resource_profile(&self, tenant: &str, id: &str) -> Result<(), StoreError>;

    /// Returns the IDs of every resource profile of `tenant`.
    async fn resource_profile_ids(&self, tenant: &str) -> Result<Vec<String>, StoreError>;

    /// Gets the persisted state of a resource.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no state was ever persisted for the resource.
    async fn get_resource(&self, tenant: &str, id: &str) -> Result<StoredResource, StoreError>;

    /// Creates or replaces the persisted state of a resource.
    async fn set_resource(&self, resource: &StoredResource) -> Result<(), StoreError>;

    /// Removes the persisted state of a resource. Removing state that doesn't exist is not an error.
    async fn remove_resource(&self, tenant: &str, id: &str) -> Result<(), StoreError>;
}

#[derive(Default)]
struct Tables {
    profiles: BTreeMap<String, Vec<u8>>,
    resources: BTreeMap<String, Vec<u8>>,
}

/// An in-process [`DataStore`].
///
/// Values are kept serialized as JSON, so what comes back out is always a fresh copy, exactly as with a remote store.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    fn read<T, F>(&self, key: String, table: F) -> Result<T, StoreError>
    where
        T: DeserializeOwned,
        F: FnOnce(&Tables) -> &BTreeMap<String, Vec<u8>>,
    {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        match table(&*tables).get(&key) {
            Some(bytes) => serde_json::from_slice(bytes).map_err(|e| StoreError::Backend { source: e.into() }),
            None => Err(StoreError::NotFound { key }),
        }
    }

    fn write<T, F>(&self, key: String, value: &T, table: F) -> Result<(), StoreError>
    where
        T: Serialize,
        F: FnOnce(&mut Tables) -> &mut BTreeMap<String, Vec<u8>>,
    {
        let bytes = serde_json::to_vec(value).map_err(|e| StoreError::Backend { source: e.into() })?;
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        table(&mut *tables).insert(key, bytes);
        Ok(())
    }

    fn remove<F>(&self, key: &str, table: F)
    where
        F: FnOnce(&mut Tables) -> &mut BTreeMap<String, Vec<u8>>,
    {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        table(&mut *tables).remove(key);
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn get_resource_profile(&self, tenant: &str, id: &str) -> Result<ResourceProfile, StoreError> {
        self.read(resource_key(tenant, id), |t| &t.profiles)
    }

    async fn set_resource_profile(&self, profile: &ResourceProfile) -> Result<(), StoreError> {
        self.write(profile.key(), profile, |t| &mut t.profiles)
    }

    async fn remove_resource_profile(&self, tenant: &str, id: &str) -> Result<(), StoreError> {
        self.remove(&resource_key(tenant, id), |t| &mut t.profiles);
        Ok(())
    }

    async fn resource_profile_ids(&self, tenant: &str) -> Result<Vec<String>, StoreError> {
        let prefix = resource_key(tenant, "");
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        Ok(tables
            .profiles
            .range(prefix.clone()..)
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(&prefix))
            .map(|key| key[prefix.len()..].to_string())
            .collect())
    }

    async fn get_resource(&self, tenant: &str, id: &str) -> Result<StoredResource, StoreError> {
        self.read(resource_key(tenant, id), |t| &t.resources)
    }

    async fn set_resource(&self, resource: &StoredResource) -> Result<(), StoreError> {
        self.write(resource.key(), resource, |t| &mut t.resources)
    }

    async fn remove_resource(&self, tenant: &str, id: &str) -> Result<(), StoreError> {
        self.remove(&resource_key(tenant, id), |t| &mut t.resources);
        Ok(())
    }
}
