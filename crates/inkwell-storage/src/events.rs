//! Typed engine notifications
//!
//! Published on a broadcast channel; sending never blocks and never fails the
//! operation that produced the event. Subscribers that lag lose the oldest
//! events.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::document::DocumentId;

/// How a pending external change was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExternalResolution {
    /// Keep the in-memory content; the note stays dirty so it overwrites disk
    KeepLocal,
    /// Replace the in-memory content with what is on disk
    KeepExternal,
}

/// Something the engine wants the UI to know
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceEvent {
    SaveStarted {
        document_id: DocumentId,
    },
    Saved {
        document_id: DocumentId,
        path: PathBuf,
        bytes: usize,
    },
    SaveFailed {
        document_id: DocumentId,
        reason: String,
    },
    /// Writes for this note now fail fast until the breaker resets
    CircuitOpened {
        document_id: DocumentId,
        failure_count: u32,
    },
    /// The note file changed outside the engine
    ///
    /// `conflict` is false when the note was clean and the new content has
    /// already been applied.
    ExternalChangeDetected {
        document_id: DocumentId,
        path: PathBuf,
        conflict: bool,
    },
    ExternalChangeResolved {
        document_id: DocumentId,
        resolution: ExternalResolution,
    },
    /// Unsaved content from a previous session was restored on open
    Recovered {
        document_id: DocumentId,
    },
    /// The write-ahead log cannot currently protect this note
    RecoveryDegraded {
        document_id: DocumentId,
    },
}

impl PersistenceEvent {
    /// The note the event is about
    pub fn document_id(&self) -> &DocumentId {
        match self {
            PersistenceEvent::SaveStarted { document_id }
            | PersistenceEvent::Saved { document_id, .. }
            | PersistenceEvent::SaveFailed { document_id, .. }
            | PersistenceEvent::CircuitOpened { document_id, .. }
            | PersistenceEvent::ExternalChangeDetected { document_id, .. }
            | PersistenceEvent::ExternalChangeResolved { document_id, .. }
            | PersistenceEvent::Recovered { document_id }
            | PersistenceEvent::RecoveryDegraded { document_id } => document_id,
        }
    }
}

/// Fire-and-forget publisher
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PersistenceEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event; dropped silently when nobody listens
    pub fn publish(&self, event: PersistenceEvent) {
        trace!(?event, "Publishing event");
        let _ = self.tx.send(event);
    }

    /// New receiver seeing events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<PersistenceEvent> {
        self.tx.subscribe()
    }
}
