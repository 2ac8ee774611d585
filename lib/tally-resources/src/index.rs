use async_trait::async_trait;
use tally_error::GenericError;

use crate::Event;

/// Narrows down which profiles could match an event.
///
/// Without an index, every profile of the tenant is a candidate for every event.
#[async_trait]
pub trait ProfileIndex: Send + Sync {
    /// Returns the IDs of the profiles of `tenant` that could match `event`.
    ///
    /// Returned profiles still have their filters evaluated, so an index may return false positives but must never
    /// leave out a profile that would match.
    async fn matching_profile_ids(&self, tenant: &str, event: &Event) -> Result<Vec<String>, GenericError>;
}
