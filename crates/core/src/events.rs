//! Typed publish/subscribe bus for transfer and import events.
//!
//! Every component that raises events receives a cloned [`EventBus`]. UI
//! observers call [`EventBus::subscribe`] and drop the receiver to
//! unsubscribe. The orchestrator itself never depends on the bus for
//! correctness: transfer completions reach it through the return value of
//! `TransferEngine::tick`.

use std::path::PathBuf;

use tokio::sync::broadcast;

use crate::models::{AssetIdentifier, BatchStatus, ImportStatus, TransferId, TransferStatus};

/// Events raised by the transfer engine.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// Throttled progress update for an active job.
    Progress {
        id: TransferId,
        progress: f64,
        bytes: u64,
    },
    /// The job reached a terminal status.
    Finalized {
        id: TransferId,
        status: TransferStatus,
        error: Option<String>,
    },
}

impl TransferEvent {
    pub fn id(&self) -> TransferId {
        match self {
            Self::Progress { id, .. } | Self::Finalized { id, .. } => *id,
        }
    }
}

/// Events raised by the import orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum ImportEvent {
    Progress {
        asset: AssetIdentifier,
        progress: f64,
    },
    /// The operation reached a terminal status (files may not be placed yet).
    Finalized {
        asset: AssetIdentifier,
        status: ImportStatus,
        error: Option<String>,
    },
    /// The batch's single placement pass has run.
    BatchFinalized {
        batch_id: String,
        status: BatchStatus,
        placed: Vec<PathBuf>,
    },
}

/// Union of all events carried by the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Transfer(TransferEvent),
    Import(ImportEvent),
}

impl From<TransferEvent> for Event {
    fn from(event: TransferEvent) -> Self {
        Self::Transfer(event)
    }
}

impl From<ImportEvent> for Event {
    fn from(event: ImportEvent) -> Self {
        Self::Import(event)
    }
}

/// Broadcast bus shared by the engine, the orchestrator, and observers.
///
/// If there are no subscribers, events are silently dropped. Slow
/// subscribers receive `RecvError::Lagged(n)` instead of blocking producers.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish<E: Into<Event>>(&self, event: E) {
        let _ = self.tx.send(event.into());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new(4);
        bus.publish(TransferEvent::Progress {
            id: TransferId(1),
            progress: 0.5,
            bytes: 10,
        });
    }

    #[tokio::test]
    async fn subscribers_each_receive() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.clone().subscribe();
        bus.publish(TransferEvent::Finalized {
            id: TransferId(7),
            status: TransferStatus::Success,
            error: None,
        });
        for rx in [&mut rx1, &mut rx2] {
            let event = rx.recv().await.unwrap();
            assert!(matches!(
                event,
                Event::Transfer(TransferEvent::Finalized { id: TransferId(7), .. })
            ));
        }
    }
}
