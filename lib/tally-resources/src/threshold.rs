use std::{num::NonZeroUsize, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use tally_common::task::spawn_traced_named;
use tally_error::GenericError;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::{Event, ResourceProfile, Telemetry};

pub(crate) const EVENT_TYPE_FIELD: &str = "EventType";
pub(crate) const RESOURCE_UPDATE: &str = "ResourceUpdate";
pub(crate) const RESOURCE_ID_FIELD: &str = "ResourceID";
pub(crate) const USAGE_FIELD: &str = "Usage";

/// Receives notifications about changes in resource usage.
#[async_trait]
pub trait ThresholdNotifier: Send + Sync {
    /// Processes a usage update against the thresholds in `threshold_ids`.
    ///
    /// An empty `threshold_ids` leaves it to the notifier to decide which thresholds apply.
    async fn process_event(&self, threshold_ids: &[String], event: Event) -> Result<(), GenericError>;
}

struct Notification {
    threshold_ids: Vec<String>,
    event: Event,
}

/// Hands usage updates off to a [`ThresholdNotifier`] without waiting on it.
///
/// Updates are queued and delivered by a background task. When the queue is full, updates are dropped.
pub(crate) struct ThresholdDispatcher {
    sender: Option<mpsc::Sender<Notification>>,
    telemetry: Telemetry,
}

impl ThresholdDispatcher {
    /// Creates a dispatcher that drops every update.
    pub fn disabled(telemetry: Telemetry) -> Self {
        Self {
            sender: None,
            telemetry,
        }
    }

    /// Creates a dispatcher delivering updates to `notifier`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(notifier: Arc<dyn ThresholdNotifier>, capacity: NonZeroUsize, telemetry: Telemetry) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.get());
        spawn_traced_named("resources-threshold-dispatcher", deliver(receiver, notifier));

        Self {
            sender: Some(sender),
            telemetry,
        }
    }

    /// Queues an update reporting `usage` as the current total of the pool described by `profile`.
    pub fn notify(&self, profile: &ResourceProfile, usage: f64) {
        let Some(sender) = &self.sender else {
            return;
        };
        if !profile.notifies_thresholds() {
            return;
        }

        let event = Event::new(&profile.tenant, profile.key())
            .with_time(Utc::now())
            .with_field(EVENT_TYPE_FIELD, RESOURCE_UPDATE)
            .with_field(RESOURCE_ID_FIELD, profile.id.as_str())
            .with_field(USAGE_FIELD, usage);
        let notification = Notification {
            threshold_ids: profile.threshold_ids.clone(),
            event,
        };

        match sender.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(resource = %profile.key(), "Threshold notification queue is full. Dropping usage update.");
                self.telemetry.threshold_notifications_dropped_total().increment(1);
            }
            Err(TrySendError::Closed(_)) => {
                debug!(resource = %profile.key(), "Threshold dispatcher stopped. Dropping usage update.");
            }
        }
    }
}

async fn deliver(mut receiver: mpsc::Receiver<Notification>, notifier: Arc<dyn ThresholdNotifier>) {
    while let Some(Notification { threshold_ids, event }) = receiver.recv().await {
        let event_id = event.id().to_string();
        if let Err(e) = notifier.process_event(&threshold_ids, event).await {
            warn!(error = %e, event_id, "Failed to process usage update against thresholds.");
        }
    }

    debug!("Threshold dispatcher stopped.");
}
