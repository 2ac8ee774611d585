use std::time::Duration;

use snafu::Snafu;
use tally_error::GenericError;

use crate::{lock::LockError, store::StoreError};

/// A resource service error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum ResourceError {
    /// The request is missing mandatory fields.
    #[snafu(display("MANDATORY_IE_MISSING: [{}]", fields.join(" ")))]
    MandatoryIeMissing {
        /// Names of the missing fields.
        fields: Vec<&'static str>,
    },

    /// The requested number of units is negative or not a finite number.
    #[snafu(display("Invalid number of units requested: {}.", units))]
    InvalidUnits {
        /// The requested units.
        units: f64,
    },

    /// The tenant ID contains the key separator.
    #[snafu(display("Invalid tenant '{}': tenant IDs must not contain ':'.", tenant))]
    InvalidTenant {
        /// The rejected tenant ID.
        tenant: String,
    },

    /// No matching pool had room for the allocation.
    #[snafu(display("RESOURCE_UNAVAILABLE"))]
    ResourceUnavailable,

    /// Nothing matched the request.
    #[snafu(display("NOT_FOUND"))]
    NotFound,

    /// The allocation ID is already held by the pool.
    #[snafu(display("Allocation '{}' is already held by resource '{}'.", usage_id, resource))]
    DuplicateUsage {
        /// Key of the pool holding the allocation.
        resource: String,

        /// The allocation ID.
        usage_id: String,
    },

    /// Timed out waiting for exclusive access to a pool.
    #[snafu(display("Timed out after {:?} waiting for lock on '{}'.", timeout, key))]
    LockTimeout {
        /// The contended key.
        key: String,

        /// How long the caller waited.
        timeout: Duration,
    },

    /// The filter engine or profile index failed.
    #[snafu(display("Failed to evaluate filters."))]
    Filter {
        /// Error source.
        source: GenericError,
    },

    /// The data store failed.
    #[snafu(display("Data store operation failed."))]
    Store {
        /// Error source.
        source: StoreError,
    },
}

impl From<LockError> for ResourceError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Timeout { key, timeout } => Self::LockTimeout { key, timeout },
        }
    }
}

impl From<StoreError> for ResourceError {
    fn from(source: StoreError) -> Self {
        Self::Store { source }
    }
}
