/// Append-only audit ledger of applied operations.
use mindmap::{DocumentChange, Snapshot};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HistoryId(pub uuid::Uuid);

impl HistoryId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for HistoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HistoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryAction {
    Nodes,
    Edges,
    Mixed,
    Undo,
    Redo,
    Restore,
}

impl HistoryAction {
    /// Kind of an ordinary edit batch.
    pub fn classify(changes: &[DocumentChange]) -> Self {
        let nodes = changes.iter().any(DocumentChange::is_node_change);
        let edges = changes.iter().any(DocumentChange::is_edge_change);
        match (nodes, edges) {
            (true, false) => Self::Nodes,
            (false, true) => Self::Edges,
            _ => Self::Mixed,
        }
    }
}

/// Counts of affected items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSummary {
    pub nodes_added: usize,
    pub nodes_updated: usize,
    pub nodes_deleted: usize,
    pub edges_added: usize,
    pub edges_updated: usize,
    pub edges_deleted: usize,
    pub viewport_changed: bool,
    pub replaced: bool,
}

impl ChangeSummary {
    pub fn of(changes: &[DocumentChange]) -> Self {
        let mut summary = Self::default();
        for change in changes {
            match change {
                DocumentChange::NodeAdd { edges, .. } => {
                    summary.nodes_added += 1;
                    summary.edges_added += edges.len();
                }
                DocumentChange::NodeUpdate { .. } => summary.nodes_updated += 1,
                DocumentChange::NodeDelete { .. } => summary.nodes_deleted += 1,
                DocumentChange::EdgeAdd { .. } => summary.edges_added += 1,
                DocumentChange::EdgeUpdate { .. } => summary.edges_updated += 1,
                DocumentChange::EdgeDelete { .. } => summary.edges_deleted += 1,
                DocumentChange::ViewportChange { .. } => summary.viewport_changed = true,
                DocumentChange::DocumentReplaced { .. } => summary.replaced = true,
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.nodes_added
            + self.nodes_updated
            + self.nodes_deleted
            + self.edges_added
            + self.edges_updated
            + self.edges_deleted
    }
}

/// Immutable record of one applied operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: HistoryId,
    pub action: HistoryAction,
    pub actor: Option<UserId>,
    pub summary: ChangeSummary,
    /// Document state right after the operation, when snapshots are on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Snapshot>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Entry a restore went back to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restored_from: Option<HistoryId>,
    /// Room sequence number of the operation.
    pub seq: u64,
}

impl HistoryEntry {
    pub fn new(action: HistoryAction, actor: Option<UserId>, changes: &[DocumentChange]) -> Self {
        Self {
            id: HistoryId::new(),
            action,
            actor,
            summary: ChangeSummary::of(changes),
            snapshot: None,
            created_at: chrono::Utc::now(),
            restored_from: None,
            seq: 0,
        }
    }

    pub fn with_snapshot(mut self, snapshot: Snapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    pub fn restored_from(mut self, id: HistoryId) -> Self {
        self.restored_from = Some(id);
        self
    }

    /// Same entry without its snapshot, for list views.
    pub fn summarized(&self) -> Self {
        Self {
            snapshot: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryFilter {
    #[serde(default)]
    pub actor: Option<UserId>,
    #[serde(default)]
    pub action: Option<HistoryAction>,
    #[serde(default)]
    pub since: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub until: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub limit: Option<usize>,
    /// Include snapshots in the result.
    #[serde(default)]
    pub with_snapshots: bool,
}

impl HistoryFilter {
    pub fn matches(&self, entry: &HistoryEntry) -> bool {
        if let Some(actor) = &self.actor {
            if entry.actor.as_ref() != Some(actor) {
                return false;
            }
        }
        if let Some(action) = self.action {
            if entry.action != action {
                return false;
            }
        }
        if let Some(since) = self.since {
            if entry.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if entry.created_at > until {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default)]
pub struct HistoryLedger {
    entries: Vec<HistoryEntry>,
}

impl HistoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, entry: HistoryEntry) -> &HistoryEntry {
        self.entries.push(entry);
        &self.entries[self.entries.len() - 1]
    }

    /// Matching entries, newest first.
    pub fn query(&self, filter: &HistoryFilter) -> Vec<HistoryEntry> {
        let limit = filter.limit.unwrap_or(usize::MAX);
        self.entries
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .take(limit)
            .map(|e| {
                if filter.with_snapshots {
                    e.clone()
                } else {
                    e.summarized()
                }
            })
            .collect()
    }

    pub fn get(&self, id: &HistoryId) -> Option<&HistoryEntry> {
        self.entries.iter().find(|e| &e.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
