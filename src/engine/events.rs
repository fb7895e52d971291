//! Event sink the engines push to.
//!
//! Write-only from the engine's perspective and fire-and-forget: sends never
//! block the trading loop, and having no subscribers is not an error.

use tokio::sync::broadcast;

use crate::domain::LedgerSnapshot;

/// Notification pushed by an engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Human-readable event line
    Message(String),
    /// Immutable state copy for display/monitoring
    Snapshot(LedgerSnapshot),
}

/// Broadcast channel wrapper the engines emit through.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, message: impl Into<String>) {
        let _ = self.tx.send(EngineEvent::Message(message.into()));
    }

    pub fn push_snapshot(&self, snapshot: LedgerSnapshot) {
        let _ = self.tx.send(EngineEvent::Snapshot(snapshot));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
