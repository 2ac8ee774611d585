use async_trait::async_trait;
use tally_error::GenericError;

use crate::Event;

/// Evaluates filters against events.
#[async_trait]
pub trait FilterEngine: Send + Sync {
    /// Returns `true` if `event` passes every filter in `filter_ids`.
    ///
    /// An empty set of filters always passes.
    async fn pass_filters_for_event(&self, tenant: &str, event: &Event, filter_ids: &[String])
        -> Result<bool, GenericError>;
}
