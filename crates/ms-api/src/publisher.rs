use std::sync::Arc;

use async_trait::async_trait;
use ms_infra::{ProgressReporter, Stage};
use tracing::debug;

use crate::events::{EventKind, EventStatus, ProgressEvent};
use crate::hub::EventHub;

/// Outbound side for progress events.
#[async_trait]
pub trait EventPublisher: Send + Sync + 'static {
    async fn publish(&self, kind: EventKind, event: ProgressEvent);
}

/// Publishes straight into the in-process hub.
#[derive(Clone)]
pub struct HubPublisher {
    hub: EventHub,
}

impl HubPublisher {
    pub fn new(hub: EventHub) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl EventPublisher for HubPublisher {
    async fn publish(&self, kind: EventKind, event: ProgressEvent) {
        debug!(key = kind.key(), server_id = %event.server_id, status = %event.status, "publishing event");
        self.hub.publish(event);
    }
}

/// Forwards orchestrator stage notifications as `building` events.
pub struct StageReporter {
    publisher: Arc<dyn EventPublisher>,
}

impl StageReporter {
    pub fn new(publisher: Arc<dyn EventPublisher>) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl ProgressReporter for StageReporter {
    async fn stage_started(&self, server_id: &str, stage: Stage, message: &str) {
        self.publisher
            .publish(
                EventKind::BuildProgress,
                ProgressEvent::new(server_id, EventStatus::Building, stage.as_str(), message),
            )
            .await;
    }
}
