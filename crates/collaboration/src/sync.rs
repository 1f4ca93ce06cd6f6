/// Wire protocol between transport clients and the collaboration server.
/// Every frame is a JSON text message tagged by `type`.
use mindmap::{
    reconcile_node, Document, DocumentChange, Edge, EdgeId, Node, NodeId, RawDocument, RawNode,
    Style, Viewport,
};
use serde::{de, Deserialize, Deserializer, Serialize};

use crate::{
    CollaborationError, DocumentId, FocusTarget, HistoryEntry, HistoryFilter, HistoryId,
    Operation, OperationId, Participant, PresenceEvent, Result, Role, RoomKey, SessionId,
};

/// Client-assigned correlation id for request/response round trips.
pub type RequestId = u64;

/// Incoming nodes are reconciled, so legacy shape names and missing
/// style keys are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum NodeChange {
    Add {
        #[serde(deserialize_with = "loose_node")]
        node: Node,
    },
    Update {
        #[serde(deserialize_with = "loose_node")]
        node: Node,
    },
    Delete { id: NodeId },
}

fn loose_node<'de, D>(deserializer: D) -> std::result::Result<Node, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = RawNode::deserialize(deserializer)?;
    reconcile_node(raw).map_err(de::Error::custom)
}

impl From<NodeChange> for DocumentChange {
    fn from(change: NodeChange) -> Self {
        match change {
            NodeChange::Add { node } => DocumentChange::add_node(node),
            NodeChange::Update { node } => DocumentChange::NodeUpdate { node },
            NodeChange::Delete { id } => DocumentChange::NodeDelete { id },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EdgeChange {
    Add { edge: Edge },
    Update { edge: Edge },
    Delete { id: EdgeId },
}

impl From<EdgeChange> for DocumentChange {
    fn from(change: EdgeChange) -> Self {
        match change {
            EdgeChange::Add { edge } => DocumentChange::EdgeAdd { edge },
            EdgeChange::Update { edge } => DocumentChange::EdgeUpdate { edge },
            EdgeChange::Delete { id } => DocumentChange::EdgeDelete { id },
        }
    }
}

/// A new edge drawn between two handles. The server assigns an id when
/// none is given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    #[serde(default)]
    pub id: Option<EdgeId>,
    pub source: NodeId,
    pub target: NodeId,
    #[serde(default)]
    pub source_handle: Option<String>,
    #[serde(default)]
    pub target_handle: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub style: Style,
}

impl From<Connection> for Edge {
    fn from(connection: Connection) -> Self {
        Edge {
            id: connection.id.unwrap_or_default(),
            source: connection.source,
            target: connection.target,
            source_handle: connection.source_handle.filter(|h| !h.is_empty()),
            target_handle: connection.target_handle.filter(|h| !h.is_empty()),
            style: connection.style,
            label: connection.label.filter(|l| !l.is_empty()),
        }
    }
}

/// Error as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl From<&CollaborationError> for ErrorBody {
    fn from(err: &CollaborationError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<ErrorBody> for CollaborationError {
    fn from(body: ErrorBody) -> Self {
        CollaborationError::from_wire(&body.code, body.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "join")]
    Join {
        room: RoomKey,
        #[serde(default)]
        token: Option<String>,
    },

    #[serde(rename = "leave")]
    Leave,

    #[serde(rename = "presence:announce", rename_all = "camelCase")]
    Announce {
        name: String,
        #[serde(default)]
        color: Option<String>,
        #[serde(default)]
        user_id: Option<String>,
    },

    #[serde(rename = "presence:active")]
    Active {
        #[serde(default)]
        target: Option<FocusTarget>,
    },

    #[serde(rename = "presence:clear")]
    Clear,

    #[serde(rename = "cursor:move")]
    CursorMove { x: f64, y: f64 },

    #[serde(rename = "op:nodes", rename_all = "camelCase")]
    Nodes {
        operation_id: OperationId,
        changes: Vec<NodeChange>,
    },

    #[serde(rename = "op:edges", rename_all = "camelCase")]
    Edges {
        operation_id: OperationId,
        changes: Vec<EdgeChange>,
    },

    #[serde(rename = "op:connect", rename_all = "camelCase")]
    Connect {
        operation_id: OperationId,
        connection: Connection,
    },

    #[serde(rename = "op:viewport", rename_all = "camelCase")]
    Viewport {
        operation_id: OperationId,
        viewport: Viewport,
    },

    #[serde(rename = "undo", rename_all = "camelCase")]
    Undo { request_id: RequestId },

    #[serde(rename = "redo", rename_all = "camelCase")]
    Redo { request_id: RequestId },

    /// `snapshot` is used only when the server no longer has the entry.
    #[serde(rename = "history:restore", rename_all = "camelCase")]
    Restore {
        request_id: RequestId,
        history_id: HistoryId,
        #[serde(default)]
        snapshot: Option<RawDocument>,
    },

    #[serde(rename = "history:query", rename_all = "camelCase")]
    Query {
        request_id: RequestId,
        #[serde(default)]
        filter: HistoryFilter,
    },

    #[serde(rename = "ping")]
    Ping,
}

impl ClientMessage {
    pub fn from_text(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Operation id of an `op:*` frame that failed to parse, when the id
    /// itself is readable.
    pub fn operation_id_of(text: &str) -> Option<OperationId> {
        let value: serde_json::Value = serde_json::from_str(text).ok()?;
        let kind = value.get("type")?.as_str()?;
        if !kind.starts_with("op:") {
            return None;
        }
        serde_json::from_value(value.get("operationId")?.clone()).ok()
    }

    /// Operation carried by an `op:*` message, or `None` for other kinds.
    pub fn into_operation(self) -> Option<Operation> {
        let (id, changes): (OperationId, Vec<DocumentChange>) = match self {
            ClientMessage::Nodes {
                operation_id,
                changes,
            } => (operation_id, changes.into_iter().map(Into::into).collect()),
            ClientMessage::Edges {
                operation_id,
                changes,
            } => (operation_id, changes.into_iter().map(Into::into).collect()),
            ClientMessage::Connect {
                operation_id,
                connection,
            } => (
                operation_id,
                vec![DocumentChange::EdgeAdd {
                    edge: connection.into(),
                }],
            ),
            ClientMessage::Viewport {
                operation_id,
                viewport,
            } => (operation_id, vec![DocumentChange::ViewportChange { viewport }]),
            _ => return None,
        };
        Some(Operation::new(changes).with_id(id))
    }

    /// Presence event carried by a presence or cursor message.
    pub fn into_presence(self) -> Option<PresenceEvent> {
        match self {
            ClientMessage::Announce {
                name,
                color,
                user_id,
            } => Some(PresenceEvent::Announce {
                name,
                color,
                user_id,
            }),
            ClientMessage::Active { target } => Some(PresenceEvent::Active { target }),
            ClientMessage::Clear => Some(PresenceEvent::Clear),
            ClientMessage::CursorMove { x, y } => Some(PresenceEvent::CursorMove { x, y }),
            _ => None,
        }
    }
}

/// What a joining session receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub session_id: SessionId,
    pub document_id: DocumentId,
    pub role: Role,
    pub document: Document,
    pub roster: Vec<Participant>,
    /// Sequence number of the last operation folded into `document`.
    pub seq: u64,
    pub can_undo: bool,
    pub can_redo: bool,
}

/// Whether the room's shared undo and redo stacks have entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoAvailability {
    pub can_undo: bool,
    pub can_redo: bool,
}

/// Result of an undo, redo or restore round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestReply {
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<Document>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl RequestReply {
    pub fn new(request_id: RequestId, result: Result<Document>) -> Self {
        match result {
            Ok(document) => Self {
                request_id,
                document: Some(document),
                error: None,
            },
            Err(err) => Self {
                request_id,
                document: None,
                error: Some(ErrorBody::from(&err)),
            },
        }
    }

    pub fn into_result(self) -> Result<Document> {
        match (self.document, self.error) {
            (_, Some(error)) => Err(error.into()),
            (Some(document), None) => Ok(document),
            (None, None) => Err(CollaborationError::InvalidOp("empty reply".into())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "joined")]
    Joined(RoomSnapshot),

    #[serde(rename = "join:error")]
    JoinError { error: ErrorBody },

    #[serde(rename = "presence:joined")]
    PresenceJoined { participant: Participant },

    #[serde(rename = "presence:left", rename_all = "camelCase")]
    PresenceLeft { session_id: SessionId },

    #[serde(rename = "presence:update")]
    PresenceUpdate { participant: Participant },

    /// Sent to every session, the origin included.
    #[serde(rename = "op:applied")]
    OpApplied { operation: Operation },

    /// Sent only to the origin. `corrections` carry the authoritative
    /// value of everything the operation touched.
    #[serde(rename = "op:rejected", rename_all = "camelCase")]
    OpRejected {
        operation_id: OperationId,
        error: ErrorBody,
        #[serde(default)]
        corrections: Vec<DocumentChange>,
    },

    /// Carries no snapshot; `history:query` with snapshots returns them.
    #[serde(rename = "history:log")]
    HistoryLog { entry: HistoryEntry },

    /// Sent whenever undo or redo availability changes.
    #[serde(rename = "history:state")]
    HistoryState(UndoAvailability),

    #[serde(rename = "undo:result")]
    UndoResult(RequestReply),

    #[serde(rename = "restore:result")]
    RestoreResult(RequestReply),

    #[serde(rename = "history:entries", rename_all = "camelCase")]
    HistoryEntries {
        request_id: RequestId,
        entries: Vec<HistoryEntry>,
    },

    #[serde(rename = "access:revoked")]
    AccessRevoked { reason: String },

    #[serde(rename = "error")]
    Error { error: ErrorBody },

    #[serde(rename = "pong")]
    Pong,
}

impl ServerMessage {
    pub fn error(err: &CollaborationError) -> Self {
        ServerMessage::Error {
            error: ErrorBody::from(err),
        }
    }

    pub fn from_text(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// The connection is closed once this message has been written.
    pub fn closes_connection(&self) -> bool {
        matches!(self, ServerMessage::AccessRevoked { .. })
    }
}
