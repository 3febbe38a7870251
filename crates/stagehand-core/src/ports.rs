//! Port traits at the boundary between the core and external consumers.

use crate::events::EventRecord;
use futures::Stream;
use futures::stream::{self, StreamExt};
use std::pin::Pin;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Stream of published events.
pub type EventStream = Pin<Box<dyn Stream<Item = EventRecord> + Send>>;

/// Fire-and-forget publication of lifecycle events.
///
/// `publish` must never block on, or fail because of, a consumer.
pub trait EventBus: Send + Sync {
    fn publish(&self, event: EventRecord);

    /// Receive every event published after this call.
    fn subscribe(&self) -> EventStream;
}

/// Process-local event bus backed by a broadcast channel.
///
/// Slow subscribers skip the events they lagged behind on.
#[derive(Clone)]
pub struct InMemoryEventBus {
    tx: broadcast::Sender<EventRecord>,
}

impl InMemoryEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(&self, event: EventRecord) {
        debug!(subject = %event.subject(), "Publishing event");
        // No receivers is fine.
        let _ = self.tx.send(event);
    }

    fn subscribe(&self) -> EventStream {
        let rx = self.tx.subscribe();
        stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}
