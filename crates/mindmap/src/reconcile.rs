//! Document reconciliation: turns loosely-shaped client or store payloads
//! into a canonical [`Document`].
//!
//! Rules, applied in input order:
//! - node shape comes from `shape`, then `data.shape`, then `type`; unknown
//!   values fall back to [`ShapeKind::default`] and missing style keys are
//!   filled from [`default_node_style`]
//! - later nodes repeating an earlier id are dropped
//! - edges whose endpoints are not nodes of the document are dropped
//! - edges repeating an earlier (source, target, handles) signature are dropped
//! - edges with no id, or an id already used by an earlier edge, get a
//!   fresh one that no input edge carries
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use uuid::Uuid;

use crate::{
    Document, Edge, EdgeId, EdgeSignature, MindmapError, Node, NodeId, Position, ShapeKind, Style,
    Viewport,
};

/// Upper bound on id candidates tried before giving up.
pub const MAX_ID_ATTEMPTS: usize = 16;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawDocument {
    #[serde(default)]
    pub nodes: Vec<RawNode>,
    #[serde(default)]
    pub edges: Vec<RawEdge>,
    #[serde(default)]
    pub viewport: Option<Viewport>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawNode {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub shape: Option<String>,
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub style: Option<Style>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEdge {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub source_handle: Option<String>,
    #[serde(default)]
    pub target_handle: Option<String>,
    #[serde(default)]
    pub style: Option<Style>,
    #[serde(default)]
    pub label: Option<String>,
}

impl From<&Node> for RawNode {
    fn from(node: &Node) -> Self {
        Self {
            id: Some(node.id.0.clone()),
            kind: None,
            shape: Some(node.shape.as_str().to_string()),
            position: Some(node.position),
            label: Some(node.label.clone()),
            description: node.description.clone(),
            style: Some(node.style.clone()),
            data: node.data.clone(),
        }
    }
}

impl From<&Edge> for RawEdge {
    fn from(edge: &Edge) -> Self {
        Self {
            id: Some(edge.id.0.clone()),
            source: Some(edge.source.0.clone()),
            target: Some(edge.target.0.clone()),
            source_handle: edge.source_handle.clone(),
            target_handle: edge.target_handle.clone(),
            style: Some(edge.style.clone()),
            label: edge.label.clone(),
        }
    }
}

impl From<&Document> for RawDocument {
    fn from(doc: &Document) -> Self {
        Self {
            nodes: doc.nodes.iter().map(RawNode::from).collect(),
            edges: doc.edges.iter().map(RawEdge::from).collect(),
            viewport: Some(doc.viewport),
        }
    }
}

#[derive(Debug, Clone)]
enum IdStrategy {
    Random,
    Sequential { prefix: String, next: u64 },
}

/// Bounded-retry id source for edges (and for nodes that arrive without
/// one).
#[derive(Debug, Clone)]
pub struct EdgeIdGenerator {
    strategy: IdStrategy,
}

impl Default for EdgeIdGenerator {
    fn default() -> Self {
        Self::random()
    }
}

impl EdgeIdGenerator {
    pub fn random() -> Self {
        Self {
            strategy: IdStrategy::Random,
        }
    }

    /// Room-scoped monotonic ids: `{prefix}1`, `{prefix}2`, ...
    pub fn sequential(prefix: impl Into<String>) -> Self {
        Self {
            strategy: IdStrategy::Sequential {
                prefix: prefix.into(),
                next: 1,
            },
        }
    }

    fn candidate(&mut self, stem: &str) -> String {
        match &mut self.strategy {
            IdStrategy::Random => {
                let suffix = Uuid::new_v4().simple().to_string();
                format!("{stem}-{}", &suffix[..8])
            }
            IdStrategy::Sequential { prefix, next } => {
                let id = format!("{prefix}{next}");
                *next += 1;
                id
            }
        }
    }

    /// Returns an edge id not contained in `taken`.
    pub fn edge_id(
        &mut self,
        edge: &Edge,
        taken: &HashSet<EdgeId>,
    ) -> Result<EdgeId, MindmapError> {
        let stem = format!("e{}-{}", edge.source, edge.target);
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = EdgeId(self.candidate(&stem));
            if !taken.contains(&id) {
                return Ok(id);
            }
        }
        Err(MindmapError::IdSpaceExhausted(MAX_ID_ATTEMPTS))
    }

    pub fn node_id(&mut self, taken: &HashSet<NodeId>) -> Result<NodeId, MindmapError> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = NodeId(self.candidate("node"));
            if !taken.contains(&id) {
                return Ok(id);
            }
        }
        Err(MindmapError::IdSpaceExhausted(MAX_ID_ATTEMPTS))
    }
}

pub fn default_node_style(shape: ShapeKind) -> Style {
    let background = match shape {
        ShapeKind::Text => "transparent",
        _ => "#ffffff",
    };
    let defaults = json!({
        "backgroundColor": background,
        "borderColor": "#94a3b8",
        "textColor": "#0f172a",
        "borderWidth": 1,
    });
    match defaults {
        Value::Object(map) => map,
        _ => Style::new(),
    }
}

/// Normalizes with a random id generator.
pub fn normalize(raw: RawDocument) -> Result<Document, MindmapError> {
    normalize_with(raw, &mut EdgeIdGenerator::random())
}

pub fn normalize_with(
    raw: RawDocument,
    ids: &mut EdgeIdGenerator,
) -> Result<Document, MindmapError> {
    let mut doc = Document {
        nodes: Vec::with_capacity(raw.nodes.len()),
        edges: Vec::with_capacity(raw.edges.len()),
        viewport: raw.viewport.unwrap_or_default(),
    };

    let mut node_ids: HashSet<NodeId> = raw
        .nodes
        .iter()
        .filter_map(|n| n.id.as_deref())
        .filter(|id| !id.is_empty())
        .map(NodeId::from)
        .collect();
    let mut seen_nodes = HashSet::new();
    for raw_node in raw.nodes {
        let id = match raw_node.id.as_deref() {
            Some(id) if !id.is_empty() => NodeId::from(id),
            _ => {
                let id = ids.node_id(&node_ids)?;
                node_ids.insert(id.clone());
                id
            }
        };
        if !seen_nodes.insert(id.clone()) {
            continue;
        }
        doc.nodes.push(normalize_node(id, raw_node));
    }

    // Every id present in the input is reserved, so a generated id never
    // takes one that a later edge already carries.
    let mut reserved: HashSet<EdgeId> = raw
        .edges
        .iter()
        .filter_map(|e| e.id.as_deref())
        .filter(|id| !id.is_empty())
        .map(EdgeId::from)
        .collect();
    let mut signatures: HashSet<EdgeSignature> = HashSet::new();
    let mut claimed: HashSet<EdgeId> = HashSet::new();
    for raw_edge in raw.edges {
        let Some(mut edge) = edge_from_raw(raw_edge) else {
            continue;
        };
        if !seen_nodes.contains(&edge.source) || !seen_nodes.contains(&edge.target) {
            continue;
        }
        if !signatures.insert(edge.signature()) {
            continue;
        }
        if edge.id.is_empty() || claimed.contains(&edge.id) {
            edge.id = ids.edge_id(&edge, &reserved)?;
            reserved.insert(edge.id.clone());
        }
        claimed.insert(edge.id.clone());
        doc.edges.push(edge);
    }

    Ok(doc)
}

fn take_string(data: &mut Map<String, Value>, key: &str) -> Option<String> {
    match data.remove(key) {
        Some(Value::String(s)) => Some(s),
        Some(other) => {
            data.insert(key.to_string(), other);
            None
        }
        None => None,
    }
}

/// Canonical form of a single node payload, as carried by node edits.
pub fn reconcile_node(raw: RawNode) -> Result<Node, MindmapError> {
    match raw.id.as_deref() {
        Some(id) if !id.is_empty() => {
            let id = NodeId::from(id);
            Ok(normalize_node(id, raw))
        }
        _ => Err(MindmapError::InvalidOp("node without id".into())),
    }
}

/// `data` keys are only taken out when their value is the one used.
fn normalize_node(id: NodeId, raw: RawNode) -> Node {
    let mut data = raw.data;
    let label = match raw.label {
        Some(label) => Some(label),
        None => take_string(&mut data, "label"),
    };
    let description = match raw.description {
        Some(description) => Some(description),
        None => take_string(&mut data, "description"),
    };

    let shape = match raw.shape.as_deref().and_then(ShapeKind::from_alias) {
        Some(shape) => shape,
        None => {
            let from_data = data
                .get("shape")
                .and_then(Value::as_str)
                .and_then(ShapeKind::from_alias);
            match from_data {
                Some(shape) => {
                    data.remove("shape");
                    shape
                }
                None => raw
                    .kind
                    .as_deref()
                    .and_then(ShapeKind::from_alias)
                    .unwrap_or_default(),
            }
        }
    };

    let mut style = raw.style.unwrap_or_default();
    for (key, value) in default_node_style(shape) {
        style.entry(key).or_insert(value);
    }

    Node {
        id,
        shape,
        position: raw.position.unwrap_or_default(),
        label: label.unwrap_or_default(),
        description,
        style,
        data,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

fn edge_from_raw(raw: RawEdge) -> Option<Edge> {
    let source = non_empty(raw.source)?;
    let target = non_empty(raw.target)?;
    Some(Edge {
        id: EdgeId(raw.id.unwrap_or_default()),
        source: NodeId(source),
        target: NodeId(target),
        source_handle: non_empty(raw.source_handle),
        target_handle: non_empty(raw.target_handle),
        style: raw.style.unwrap_or_default(),
        label: non_empty(raw.label),
    })
}
