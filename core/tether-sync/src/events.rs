//! Conflict notifications.

use crate::conflict::{Conflict, ResolutionStrategy};
use tether_types::{ConflictId, EntityKey};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

/// A change in the active conflict set.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictEvent {
    Raised(Conflict),
    Resolved {
        conflict_id: ConflictId,
        entity: EntityKey,
        strategy: ResolutionStrategy,
    },
}

/// Fan-out of [`ConflictEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct ConflictBus {
    tx: broadcast::Sender<ConflictEvent>,
}

impl ConflictBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConflictEvent> {
        self.tx.subscribe()
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn publish(&self, event: ConflictEvent) {
        let _ = self.tx.send(event);
    }

    /// Runs `callback` for every raised conflict until the bus is dropped.
    pub fn on_conflict<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(Conflict) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ConflictEvent::Raised(conflict)) => callback(conflict),
                    Ok(ConflictEvent::Resolved { .. }) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Conflict listener lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Default for ConflictBus {
    fn default() -> Self {
        Self::new(64)
    }
}
