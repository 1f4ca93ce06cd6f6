/// Client-side copy of a room's document. Local edits apply immediately
/// and stay pending until the room echoes them; remote operations are
/// applied underneath the pending ones.
use mindmap::{apply_change, apply_changes, Document, DocumentChange, EdgeId, EdgeIdGenerator, MindmapError};
use std::collections::HashSet;
use tracing::warn;

use crate::{Operation, OperationId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingStatus {
    /// Applied locally, waiting for the echo.
    Pending,
    /// Could not be replayed on top of newer remote state; not applied
    /// locally. The room's verdict decides.
    Conflicted,
}

#[derive(Debug, Clone)]
pub struct PendingOperation {
    pub operation: Operation,
    pub status: PendingStatus,
    inverse: Vec<DocumentChange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// Already seen; nothing changed.
    Duplicate,
    /// Echo of one of our own pending operations.
    Confirmed,
    Applied,
}

#[derive(Debug, Clone, Default)]
pub struct LocalReplica {
    document: Document,
    pending: Vec<PendingOperation>,
    last_seq: u64,
    ids: EdgeIdGenerator,
}

impl LocalReplica {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(document: Document, seq: u64) -> Self {
        let mut replica = Self::new();
        replica.reset(document, seq);
        replica
    }

    /// Replaces everything with a fresh snapshot. Pending operations are
    /// dropped: after a reconnect the room never saw them.
    pub fn reset(&mut self, document: Document, seq: u64) {
        self.document = document;
        self.pending.clear();
        self.last_seq = seq;
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn pending(&self) -> &[PendingOperation] {
        &self.pending
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Applies a local edit optimistically. New edges without an id get
    /// one here so the echo can be matched by value.
    pub fn apply_local(&mut self, mut changes: Vec<DocumentChange>) -> Result<Operation, MindmapError> {
        let mut taken: HashSet<EdgeId> = self.document.edges.iter().map(|e| e.id.clone()).collect();
        for change in changes.iter_mut() {
            if let DocumentChange::EdgeAdd { edge } = change {
                if edge.id.is_empty() {
                    edge.id = self.ids.edge_id(edge, &taken)?;
                }
                taken.insert(edge.id.clone());
            }
        }

        let operation = Operation::new(changes);
        let inverse = operation.apply(&mut self.document)?;
        self.pending.push(PendingOperation {
            operation: operation.clone(),
            status: PendingStatus::Pending,
            inverse,
        });
        Ok(operation)
    }

    /// Applies an authoritative operation from the room.
    pub fn apply_remote(&mut self, operation: &Operation) -> RemoteOutcome {
        if operation.seq != 0 && operation.seq <= self.last_seq {
            return RemoteOutcome::Duplicate;
        }

        self.rollback();
        if let Err(err) = operation.apply(&mut self.document) {
            warn!(operation = %operation.id, error = %err, "remote operation did not apply locally");
        }
        if operation.seq != 0 {
            self.last_seq = operation.seq;
        }

        let before = self.pending.len();
        self.pending.retain(|p| p.operation.id != operation.id);
        let confirmed = self.pending.len() < before;

        self.replay();
        if confirmed {
            RemoteOutcome::Confirmed
        } else {
            RemoteOutcome::Applied
        }
    }

    /// Drops a refused operation and adopts the room's values for what it
    /// touched. Returns whether the operation was pending here.
    pub fn reject(&mut self, operation_id: OperationId, corrections: &[DocumentChange]) -> bool {
        let Some(index) = self
            .pending
            .iter()
            .position(|p| p.operation.id == operation_id)
        else {
            return false;
        };

        self.rollback();
        self.pending.remove(index);
        for change in corrections {
            upsert(&mut self.document, change.clone());
        }
        self.replay();
        true
    }

    fn rollback(&mut self) {
        for pending in self.pending.iter_mut().rev() {
            if pending.status == PendingStatus::Pending {
                let inverse = std::mem::take(&mut pending.inverse);
                if let Err(err) = apply_changes(&mut self.document, inverse) {
                    warn!(operation = %pending.operation.id, error = %err, "failed to roll back pending operation");
                }
            }
        }
    }

    fn replay(&mut self) {
        for pending in self.pending.iter_mut() {
            match pending.operation.apply(&mut self.document) {
                Ok(inverse) => {
                    pending.inverse = inverse;
                    pending.status = PendingStatus::Pending;
                }
                Err(_) => {
                    pending.inverse.clear();
                    pending.status = PendingStatus::Conflicted;
                }
            }
        }
    }
}

/// Applies a correction, inserting the value when an update finds no
/// target.
fn upsert(doc: &mut Document, change: DocumentChange) {
    let change = match change {
        DocumentChange::NodeUpdate { node } if !doc.contains_node(&node.id) => {
            DocumentChange::add_node(node)
        }
        DocumentChange::EdgeUpdate { edge } if doc.edge(&edge.id).is_none() => {
            DocumentChange::EdgeAdd { edge }
        }
        other => other,
    };
    if let Err(err) = apply_change(doc, change) {
        warn!(error = %err, "correction did not apply");
    }
}
