//! File lifecycle events
//!
//! The engine only emits; delivery and retry belong to whatever subscribes.

use archivum_catalog::CleanupAction;
use archivum_common::{FileId, NodeId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FileEvent {
    Uploaded {
        file_id: FileId,
        node_id: NodeId,
        sha256: String,
        file_size: u64,
    },
    Finalized {
        file_id: FileId,
        source_node: NodeId,
        target_node: NodeId,
        finalized_at: DateTime<Utc>,
    },
    Deleted {
        file_id: FileId,
        node_id: NodeId,
    },
    SourceReclaimed {
        file_id: FileId,
        node_id: NodeId,
    },
    TaskParked {
        file_id: FileId,
        node_id: NodeId,
        action: CleanupAction,
        attempts: u32,
        last_error: Option<String>,
    },
}

/// Broadcast channel for [`FileEvent`]s
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FileEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<FileEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: FileEvent) {
        // No subscribers is fine
        if self.tx.send(event).is_err() {
            trace!("File event dropped, no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
