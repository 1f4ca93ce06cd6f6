use serde::{Deserialize, Serialize};

use crate::{Document, Edge, EdgeId, MindmapError, Node, NodeId, Snapshot, Viewport};

pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// A single mutation of a [`Document`], carried by full value so that
/// applying it twice is the same as applying it once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DocumentChange {
    NodeAdd {
        node: Node,
        /// Edges restored together with the node (undo of a delete).
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        edges: Vec<Edge>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<usize>,
    },
    NodeUpdate {
        node: Node,
    },
    NodeDelete {
        id: NodeId,
    },
    EdgeAdd {
        edge: Edge,
    },
    EdgeUpdate {
        edge: Edge,
    },
    EdgeDelete {
        id: EdgeId,
    },
    ViewportChange {
        viewport: Viewport,
    },
    DocumentReplaced {
        snapshot: Snapshot,
    },
}

impl DocumentChange {
    pub fn add_node(node: Node) -> Self {
        Self::NodeAdd {
            node,
            edges: Vec::new(),
            index: None,
        }
    }

    pub fn is_viewport(&self) -> bool {
        matches!(self, Self::ViewportChange { .. })
    }

    pub fn is_node_change(&self) -> bool {
        matches!(
            self,
            Self::NodeAdd { .. } | Self::NodeUpdate { .. } | Self::NodeDelete { .. }
        )
    }

    pub fn is_edge_change(&self) -> bool {
        matches!(
            self,
            Self::EdgeAdd { .. } | Self::EdgeUpdate { .. } | Self::EdgeDelete { .. }
        )
    }
}

/// Applies `change` and returns the change that reverts it, or `None`
/// when the change had no effect (already applied, or target gone).
pub fn apply_change(
    doc: &mut Document,
    change: DocumentChange,
) -> Result<Option<DocumentChange>, MindmapError> {
    match change {
        DocumentChange::NodeAdd { node, edges, index } => add_node(doc, node, edges, index),
        DocumentChange::NodeUpdate { node } => update_node(doc, node),
        DocumentChange::NodeDelete { id } => delete_node(doc, id),
        DocumentChange::EdgeAdd { edge } => add_edge(doc, edge),
        DocumentChange::EdgeUpdate { edge } => update_edge(doc, edge),
        DocumentChange::EdgeDelete { id } => delete_edge(doc, id),
        DocumentChange::ViewportChange { viewport } => change_viewport(doc, viewport),
        DocumentChange::DocumentReplaced { snapshot } => replace_document(doc, snapshot),
    }
}

/// Applies a batch atomically. On error the document is left untouched.
/// The returned changes revert the batch when applied in order.
pub fn apply_changes(
    doc: &mut Document,
    changes: Vec<DocumentChange>,
) -> Result<Vec<DocumentChange>, MindmapError> {
    let original = doc.clone();
    let mut inverse = Vec::with_capacity(changes.len());
    for change in changes {
        match apply_change(doc, change) {
            Ok(Some(undo)) => inverse.push(undo),
            Ok(None) => {}
            Err(err) => {
                *doc = original;
                return Err(err);
            }
        }
    }
    inverse.reverse();
    Ok(inverse)
}

fn add_node(
    doc: &mut Document,
    node: Node,
    edges: Vec<Edge>,
    index: Option<usize>,
) -> Result<Option<DocumentChange>, MindmapError> {
    if node.id.is_empty() {
        return Err(MindmapError::InvalidOp("node id must not be empty".into()));
    }
    if let Some(existing) = doc.node(&node.id) {
        if existing == &node {
            return Ok(None);
        }
        return Err(MindmapError::NodeExists(node.id));
    }

    for edge in &edges {
        for endpoint in [&edge.source, &edge.target] {
            if endpoint != &node.id && !doc.contains_node(endpoint) {
                return Err(MindmapError::DanglingEdge {
                    edge: edge.id.clone(),
                    node: endpoint.clone(),
                });
            }
        }
        if let Some(existing) = doc.edge(&edge.id) {
            if existing != edge {
                return Err(MindmapError::EdgeExists(edge.id.clone()));
            }
        }
    }

    let node_id = node.id.clone();
    match index {
        Some(idx) => doc.nodes.insert(idx.min(doc.nodes.len()), node),
        None => doc.nodes.push(node),
    }
    for edge in edges {
        if doc.edge(&edge.id).is_none() && doc.edge_by_signature(&edge.signature()).is_none() {
            doc.edges.push(edge);
        }
    }

    Ok(Some(DocumentChange::NodeDelete { id: node_id }))
}

fn update_node(doc: &mut Document, node: Node) -> Result<Option<DocumentChange>, MindmapError> {
    let Some(idx) = doc.node_index(&node.id) else {
        return Ok(None);
    };
    if doc.nodes[idx] == node {
        return Ok(None);
    }
    let previous = std::mem::replace(&mut doc.nodes[idx], node);
    Ok(Some(DocumentChange::NodeUpdate { node: previous }))
}

fn delete_node(doc: &mut Document, id: NodeId) -> Result<Option<DocumentChange>, MindmapError> {
    let Some(idx) = doc.node_index(&id) else {
        return Ok(None);
    };
    let node = doc.nodes.remove(idx);

    let mut edges = Vec::new();
    let mut i = 0;
    while i < doc.edges.len() {
        if doc.edges[i].touches(&id) {
            edges.push(doc.edges.remove(i));
        } else {
            i += 1;
        }
    }

    Ok(Some(DocumentChange::NodeAdd {
        node,
        edges,
        index: Some(idx),
    }))
}

fn check_endpoints(doc: &Document, edge: &Edge) -> Result<(), MindmapError> {
    for endpoint in [&edge.source, &edge.target] {
        if !doc.contains_node(endpoint) {
            return Err(MindmapError::DanglingEdge {
                edge: edge.id.clone(),
                node: endpoint.clone(),
            });
        }
    }
    Ok(())
}

fn add_edge(doc: &mut Document, edge: Edge) -> Result<Option<DocumentChange>, MindmapError> {
    if edge.id.is_empty() {
        return Err(MindmapError::InvalidOp("edge id must not be empty".into()));
    }
    if let Some(existing) = doc.edge(&edge.id) {
        if existing == &edge {
            return Ok(None);
        }
        return Err(MindmapError::EdgeExists(edge.id));
    }
    check_endpoints(doc, &edge)?;
    // Same endpoints and handles as an existing edge: dropped silently.
    if doc.edge_by_signature(&edge.signature()).is_some() {
        return Ok(None);
    }
    let id = edge.id.clone();
    doc.edges.push(edge);
    Ok(Some(DocumentChange::EdgeDelete { id }))
}

fn update_edge(doc: &mut Document, edge: Edge) -> Result<Option<DocumentChange>, MindmapError> {
    let Some(idx) = doc.edge_index(&edge.id) else {
        return Ok(None);
    };
    if doc.edges[idx] == edge {
        return Ok(None);
    }
    check_endpoints(doc, &edge)?;
    let signature = edge.signature();
    if doc
        .edges
        .iter()
        .any(|e| e.id != edge.id && e.signature() == signature)
    {
        return Ok(None);
    }
    let previous = std::mem::replace(&mut doc.edges[idx], edge);
    Ok(Some(DocumentChange::EdgeUpdate { edge: previous }))
}

fn delete_edge(doc: &mut Document, id: EdgeId) -> Result<Option<DocumentChange>, MindmapError> {
    let Some(idx) = doc.edge_index(&id) else {
        return Ok(None);
    };
    let edge = doc.edges.remove(idx);
    Ok(Some(DocumentChange::EdgeAdd { edge }))
}

fn change_viewport(
    doc: &mut Document,
    viewport: Viewport,
) -> Result<Option<DocumentChange>, MindmapError> {
    if doc.viewport == viewport {
        return Ok(None);
    }
    let previous = std::mem::replace(&mut doc.viewport, viewport);
    Ok(Some(DocumentChange::ViewportChange { viewport: previous }))
}

fn replace_document(
    doc: &mut Document,
    snapshot: Snapshot,
) -> Result<Option<DocumentChange>, MindmapError> {
    if *doc == snapshot {
        return Ok(None);
    }
    let previous = std::mem::replace(doc, snapshot);
    Ok(Some(DocumentChange::DocumentReplaced { snapshot: previous }))
}

/// Linear undo/redo stack of inverse change batches.
#[derive(Debug, Clone)]
pub struct EditHistory {
    undo_stack: Vec<Vec<DocumentChange>>,
    redo_stack: Vec<Vec<DocumentChange>>,
    limit: usize,
}

impl Default for EditHistory {
    fn default() -> Self {
        Self::with_limit(DEFAULT_HISTORY_LIMIT)
    }
}

impl EditHistory {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            limit: limit.max(1),
        }
    }

    /// Applies `changes` and records their inverse. Returns whether the
    /// document changed.
    pub fn apply(
        &mut self,
        doc: &mut Document,
        changes: Vec<DocumentChange>,
    ) -> Result<bool, MindmapError> {
        let inverse = apply_changes(doc, changes)?;
        let changed = !inverse.is_empty();
        self.record(inverse);
        Ok(changed)
    }

    /// Records the inverse of an already-applied batch. A new edit
    /// invalidates everything that could have been redone.
    pub fn record(&mut self, inverse: Vec<DocumentChange>) {
        if inverse.is_empty() {
            return;
        }
        self.undo_stack.push(inverse);
        if self.undo_stack.len() > self.limit {
            self.undo_stack.remove(0);
        }
        self.redo_stack.clear();
    }

    /// Reverts the latest batch and returns the changes that were applied.
    pub fn undo(&mut self, doc: &mut Document) -> Result<Vec<DocumentChange>, MindmapError> {
        let changes = self
            .undo_stack
            .pop()
            .ok_or(MindmapError::HistoryEmpty("undo stack"))?;
        let inverse = match apply_changes(doc, changes.clone()) {
            Ok(inverse) => inverse,
            Err(err) => {
                self.undo_stack.push(changes);
                return Err(err);
            }
        };
        if !inverse.is_empty() {
            self.redo_stack.push(inverse);
        }
        Ok(changes)
    }

    pub fn redo(&mut self, doc: &mut Document) -> Result<Vec<DocumentChange>, MindmapError> {
        let changes = self
            .redo_stack
            .pop()
            .ok_or(MindmapError::HistoryEmpty("redo stack"))?;
        let inverse = match apply_changes(doc, changes.clone()) {
            Ok(inverse) => inverse,
            Err(err) => {
                self.redo_stack.push(changes);
                return Err(err);
            }
        };
        if !inverse.is_empty() {
            self.undo_stack.push(inverse);
        }
        Ok(changes)
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
    }
}
