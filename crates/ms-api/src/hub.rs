//! Fan-out of progress events to stream subscribers.
//!
//! The registry is owned by a single actor task; subscribe, unsubscribe and
//! publish are commands on one channel and are applied in arrival order.
//! Each subscriber gets its own bounded broadcast channel, so a slow reader
//! loses its oldest events instead of stalling delivery to everyone else.

use std::collections::HashMap;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::events::ProgressEvent;

/// Per-subscriber queue capacity. The broadcast channel rounds this up to
/// the next power of two.
pub const SUBSCRIBER_CAPACITY: usize = 20;

#[derive(Debug, thiserror::Error)]
#[error("event hub is no longer running")]
pub struct HubClosed;

enum Command {
    Subscribe {
        filter: Option<String>,
        reply: oneshot::Sender<(Uuid, broadcast::Receiver<ProgressEvent>)>,
    },
    Unsubscribe(Uuid),
    Publish(ProgressEvent),
    Count(oneshot::Sender<usize>),
}

struct Entry {
    filter: Option<String>,
    tx: broadcast::Sender<ProgressEvent>,
}

impl Entry {
    fn wants(&self, event: &ProgressEvent) -> bool {
        self.filter
            .as_deref()
            .is_none_or(|server_id| server_id == event.server_id)
    }
}

/// Handle to the hub actor. Cheap to clone.
#[derive(Clone)]
pub struct EventHub {
    commands: mpsc::UnboundedSender<Command>,
}

impl EventHub {
    /// Start the actor on the current runtime.
    pub fn spawn() -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx));
        Self { commands }
    }

    /// Register a subscriber, optionally limited to one server id.
    pub async fn subscribe(&self, filter: Option<String>) -> Result<Subscriber, HubClosed> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Subscribe {
                filter: filter.clone(),
                reply,
            })
            .map_err(|_| HubClosed)?;
        let (id, rx) = response.await.map_err(|_| HubClosed)?;

        Ok(Subscriber {
            id,
            filter,
            rx,
            hub: self.clone(),
            dropped: 0,
        })
    }

    pub fn unsubscribe(&self, id: Uuid) {
        let _ = self.commands.send(Command::Unsubscribe(id));
    }

    /// Deliver to every matching subscriber without waiting on any of them.
    pub fn publish(&self, event: ProgressEvent) {
        if self.commands.send(Command::Publish(event)).is_err() {
            warn!("event hub stopped, dropping event");
        }
    }

    /// Number of registered subscribers, observed after all earlier commands.
    pub async fn subscriber_count(&self) -> Result<usize, HubClosed> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Count(reply))
            .map_err(|_| HubClosed)?;
        response.await.map_err(|_| HubClosed)
    }
}

async fn run(mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut registry: HashMap<Uuid, Entry> = HashMap::new();

    while let Some(command) = commands.recv().await {
        match command {
            Command::Subscribe { filter, reply } => {
                let id = Uuid::new_v4();
                let (tx, rx) = broadcast::channel(SUBSCRIBER_CAPACITY);
                debug!(subscriber = %id, filter = ?filter, "subscriber registered");
                registry.insert(id, Entry { filter, tx });
                let _ = reply.send((id, rx));
            }
            Command::Unsubscribe(id) => {
                if registry.remove(&id).is_some() {
                    debug!(subscriber = %id, "subscriber removed");
                }
            }
            Command::Publish(event) => {
                let terminal = event.is_terminal();
                registry.retain(|id, entry| {
                    if !entry.wants(&event) {
                        return true;
                    }
                    if entry.tx.send(event.clone()).is_err() {
                        debug!(subscriber = %id, "subscriber gone, removing");
                        return false;
                    }
                    // Stream ends after its first terminal event.
                    !terminal
                });
            }
            Command::Count(reply) => {
                let _ = reply.send(registry.len());
            }
        }
    }
}

/// Receiving side of a subscription. Dropping it unsubscribes.
pub struct Subscriber {
    id: Uuid,
    filter: Option<String>,
    rx: broadcast::Receiver<ProgressEvent>,
    hub: EventHub,
    dropped: u64,
}

impl Subscriber {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    /// Events discarded because this subscriber fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Next event, or `None` once the hub has removed this subscriber.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    self.dropped += skipped;
                    warn!(subscriber = %self.id, skipped, "subscriber lagging, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}
