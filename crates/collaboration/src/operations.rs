/// Operation envelopes exchanged between replicas and the room.
/// The payload is a batch of by-value document changes.
use mindmap::{apply_changes, Document, DocumentChange, MindmapError};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{SessionId, UserId};

/// Client-generated operation identifier, echoed back by the room so the
/// origin can match confirmations against its pending list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub uuid::Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A typed, timestamped mutation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: OperationId,

    /// Session that submitted the operation. `None` for room-originated
    /// operations such as restores performed on load.
    #[serde(default)]
    pub origin: Option<SessionId>,

    #[serde(default)]
    pub actor: Option<UserId>,

    /// Position in the room's total order. Zero until sequenced.
    #[serde(default)]
    pub seq: u64,

    pub timestamp: chrono::DateTime<chrono::Utc>,

    pub changes: Vec<DocumentChange>,
}

impl Operation {
    pub fn new(changes: Vec<DocumentChange>) -> Self {
        Self {
            id: OperationId::new(),
            origin: None,
            actor: None,
            seq: 0,
            timestamp: chrono::Utc::now(),
            changes,
        }
    }

    pub fn with_id(mut self, id: OperationId) -> Self {
        self.id = id;
        self
    }

    pub fn with_origin(mut self, origin: SessionId, actor: Option<UserId>) -> Self {
        self.origin = Some(origin);
        self.actor = actor;
        self
    }

    /// Viewport-only operations are broadcast but never logged or undone.
    pub fn is_cosmetic(&self) -> bool {
        !self.changes.is_empty() && self.changes.iter().all(DocumentChange::is_viewport)
    }

    pub fn replaces_document(&self) -> bool {
        self.changes
            .iter()
            .any(|c| matches!(c, DocumentChange::DocumentReplaced { .. }))
    }

    /// Applies the batch atomically and returns its inverse.
    pub fn apply(&self, doc: &mut Document) -> Result<Vec<DocumentChange>, MindmapError> {
        apply_changes(doc, self.changes.clone())
    }
}

/// Replays operations in order against `base`. Operations that fail are
/// skipped, as the room rejected them when they were first received.
pub fn replay<'a>(base: &Document, ops: impl IntoIterator<Item = &'a Operation>) -> Document {
    let mut doc = base.clone();
    for op in ops {
        let _ = op.apply(&mut doc);
    }
    doc
}
