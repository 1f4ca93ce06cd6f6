/// Room actor: the single sequencing authority for one document.
/// Every mutation goes through the room's mailbox and is applied and
/// broadcast before the next command is looked at.
use mindmap::{
    apply_changes, normalize_with, Document, DocumentChange, Edge, EdgeId, EdgeIdGenerator,
    EditHistory, MindmapError, RawDocument,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};

use crate::{
    AccessProvider, CollaborationError, DocumentAccess, DocumentId, DocumentStore, ErrorBody,
    HistoryAction, HistoryEntry, HistoryFilter, HistoryId, HistoryLedger, Operation,
    PresenceEvent, PresenceRoster, Result, Role, RoomConfig, RoomKey, RoomSnapshot,
    ServerMessage, SessionId, UndoAvailability, UserId,
};

/// Per-connection queue of outgoing server messages.
pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

type RoomMap = Arc<RwLock<HashMap<DocumentId, RoomHandle>>>;

/// A join racing a closing room is retried this many times.
const JOIN_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoDirection {
    Undo,
    Redo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub document_id: DocumentId,
    pub sessions: usize,
    pub seq: u64,
    pub ledger_len: usize,
    pub can_undo: bool,
    pub can_redo: bool,
}

enum RoomCommand {
    Join {
        session_id: SessionId,
        user_id: Option<UserId>,
        role: Role,
        outbox: Outbox,
        reply: oneshot::Sender<Result<RoomSnapshot>>,
    },
    Leave {
        session_id: SessionId,
    },
    Presence {
        session_id: SessionId,
        event: PresenceEvent,
    },
    Emit {
        session_id: SessionId,
        operation: Operation,
    },
    Step {
        session_id: SessionId,
        direction: UndoDirection,
        reply: oneshot::Sender<Result<Document>>,
    },
    Restore {
        session_id: SessionId,
        history_id: HistoryId,
        fallback: Option<RawDocument>,
        reply: oneshot::Sender<Result<Document>>,
    },
    Query {
        filter: HistoryFilter,
        reply: oneshot::Sender<Vec<HistoryEntry>>,
    },
    UpdateAccess {
        access: DocumentAccess,
        reply: oneshot::Sender<Vec<SessionId>>,
    },
    Info {
        reply: oneshot::Sender<RoomInfo>,
    },
    Snapshot {
        reply: oneshot::Sender<(Document, u64)>,
    },
    /// Saves and stops the room; answered once the document is stored.
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap cloneable address of a running room.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    document_id: DocumentId,
    generation: u64,
    tx: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn closed(&self) -> CollaborationError {
        CollaborationError::RoomClosed(self.document_id.to_string())
    }

    async fn send(&self, command: RoomCommand) -> Result<()> {
        self.tx.send(command).await.map_err(|_| self.closed())
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> RoomCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(command(reply)).await?;
        rx.await.map_err(|_| self.closed())
    }

    pub async fn join(
        &self,
        session_id: SessionId,
        user_id: Option<UserId>,
        role: Role,
        outbox: Outbox,
    ) -> Result<RoomSnapshot> {
        self.request(|reply| RoomCommand::Join {
            session_id,
            user_id,
            role,
            outbox,
            reply,
        })
        .await?
    }

    pub async fn leave(&self, session_id: SessionId) -> Result<()> {
        self.send(RoomCommand::Leave { session_id }).await
    }

    /// Best effort: dropped when the mailbox is full.
    pub fn presence(&self, session_id: SessionId, event: PresenceEvent) -> Result<()> {
        match self.tx.try_send(RoomCommand::Presence { session_id, event }) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(document = %self.document_id, session = %session_id, "presence event dropped");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(self.closed()),
        }
    }

    /// Queues an operation. The outcome reaches the origin as `op:applied`
    /// or `op:rejected` on its outbox.
    pub async fn emit(&self, session_id: SessionId, operation: Operation) -> Result<()> {
        self.send(RoomCommand::Emit {
            session_id,
            operation,
        })
        .await
    }

    pub async fn undo(&self, session_id: SessionId) -> Result<Document> {
        self.step(session_id, UndoDirection::Undo).await
    }

    pub async fn redo(&self, session_id: SessionId) -> Result<Document> {
        self.step(session_id, UndoDirection::Redo).await
    }

    pub async fn step(&self, session_id: SessionId, direction: UndoDirection) -> Result<Document> {
        self.request(|reply| RoomCommand::Step {
            session_id,
            direction,
            reply,
        })
        .await?
    }

    pub async fn restore(
        &self,
        session_id: SessionId,
        history_id: HistoryId,
        fallback: Option<RawDocument>,
    ) -> Result<Document> {
        self.request(|reply| RoomCommand::Restore {
            session_id,
            history_id,
            fallback,
            reply,
        })
        .await?
    }

    pub async fn query(&self, filter: HistoryFilter) -> Result<Vec<HistoryEntry>> {
        self.request(|reply| RoomCommand::Query { filter, reply }).await
    }

    /// Applies new grants and returns the sessions that were revoked.
    pub async fn update_access(&self, access: DocumentAccess) -> Result<Vec<SessionId>> {
        self.request(|reply| RoomCommand::UpdateAccess { access, reply })
            .await
    }

    pub async fn info(&self) -> Result<RoomInfo> {
        self.request(|reply| RoomCommand::Info { reply }).await
    }

    /// Current authoritative document and its sequence number.
    pub async fn snapshot(&self) -> Result<(Document, u64)> {
        self.request(|reply| RoomCommand::Snapshot { reply }).await
    }

    /// Stops the room after persisting its document.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| RoomCommand::Shutdown { reply }).await
    }
}

struct Room {
    document_id: DocumentId,
    access: DocumentAccess,
    document: Document,
    history: EditHistory,
    ledger: HistoryLedger,
    roster: PresenceRoster,
    outboxes: HashMap<SessionId, Outbox>,
    ids: EdgeIdGenerator,
    seq: u64,
    unsaved: u64,
    /// Last undo/redo availability sent to the sessions.
    availability: UndoAvailability,
    had_sessions: bool,
    config: RoomConfig,
    store: Arc<dyn DocumentStore>,
}

impl Room {
    fn new(
        access: DocumentAccess,
        document: Document,
        config: RoomConfig,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            document_id: access.document_id.clone(),
            access,
            document,
            history: EditHistory::with_limit(config.undo_limit),
            ledger: HistoryLedger::new(),
            roster: PresenceRoster::new(),
            outboxes: HashMap::new(),
            ids: EdgeIdGenerator::random(),
            seq: 0,
            unsaved: 0,
            availability: UndoAvailability::default(),
            had_sessions: false,
            config,
            store,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<RoomCommand>, rooms: RoomMap, generation: u64) {
        info!(document = %self.document_id, generation, "room opened");

        let mut stopped_by = None;
        while let Some(command) = rx.recv().await {
            if let RoomCommand::Shutdown { reply } = command {
                stopped_by = Some(reply);
                break;
            }
            self.handle(command).await;
            if self.had_sessions && self.roster.is_empty() {
                break;
            }
        }

        // Save before closing the mailbox so a room reopened by a racing
        // join loads the latest content.
        self.persist().await;
        rx.close();
        while let Some(command) = rx.recv().await {
            match command {
                RoomCommand::Join { reply, .. } => {
                    let _ = reply.send(Err(CollaborationError::RoomClosed(
                        self.document_id.to_string(),
                    )));
                }
                RoomCommand::Shutdown { reply } => {
                    let _ = reply.send(());
                }
                _ => {}
            }
        }

        let mut rooms = rooms.write().await;
        if rooms
            .get(&self.document_id)
            .is_some_and(|handle| handle.generation == generation)
        {
            rooms.remove(&self.document_id);
        }
        drop(rooms);
        info!(document = %self.document_id, seq = self.seq, "room closed");
        if let Some(reply) = stopped_by {
            let _ = reply.send(());
        }
    }

    async fn handle(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::Join {
                session_id,
                user_id,
                role,
                outbox,
                reply,
            } => {
                let snapshot = self.join(session_id, user_id, role, outbox);
                let _ = reply.send(Ok(snapshot));
            }
            RoomCommand::Leave { session_id } => self.leave(session_id),
            RoomCommand::Presence { session_id, event } => {
                if let Some(participant) = self.roster.apply(&session_id, event) {
                    self.broadcast(ServerMessage::PresenceUpdate { participant }, Some(session_id));
                }
            }
            RoomCommand::Emit {
                session_id,
                operation,
            } => self.emit(session_id, operation).await,
            RoomCommand::Step {
                session_id,
                direction,
                reply,
            } => {
                let result = self.step(session_id, direction).await;
                let _ = reply.send(result);
            }
            RoomCommand::Restore {
                session_id,
                history_id,
                fallback,
                reply,
            } => {
                let result = self.restore(session_id, history_id, fallback).await;
                let _ = reply.send(result);
            }
            RoomCommand::Query { filter, reply } => {
                let _ = reply.send(self.ledger.query(&filter));
            }
            RoomCommand::UpdateAccess { access, reply } => {
                let revoked = self.update_access(access);
                let _ = reply.send(revoked);
            }
            RoomCommand::Info { reply } => {
                let _ = reply.send(RoomInfo {
                    document_id: self.document_id.clone(),
                    sessions: self.roster.len(),
                    seq: self.seq,
                    ledger_len: self.ledger.len(),
                    can_undo: self.history.can_undo(),
                    can_redo: self.history.can_redo(),
                });
            }
            RoomCommand::Snapshot { reply } => {
                let _ = reply.send((self.document.clone(), self.seq));
            }
            // Handled by `run`.
            RoomCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn join(
        &mut self,
        session_id: SessionId,
        user_id: Option<UserId>,
        role: Role,
        outbox: Outbox,
    ) -> RoomSnapshot {
        let participant = self.roster.join(session_id, user_id, role);
        let snapshot = RoomSnapshot {
            session_id,
            document_id: self.document_id.clone(),
            role,
            document: self.document.clone(),
            roster: self.roster.snapshot(),
            seq: self.seq,
            can_undo: self.history.can_undo(),
            can_redo: self.history.can_redo(),
        };

        // The joiner sees its snapshot before anything else from this room.
        let _ = outbox.send(ServerMessage::Joined(snapshot.clone()));
        self.outboxes.insert(session_id, outbox);
        self.had_sessions = true;
        self.broadcast(ServerMessage::PresenceJoined { participant }, Some(session_id));

        info!(
            document = %self.document_id,
            session = %session_id,
            role = role.level(),
            sessions = self.roster.len(),
            "session joined"
        );
        snapshot
    }

    fn leave(&mut self, session_id: SessionId) {
        self.outboxes.remove(&session_id);
        if self.roster.leave(&session_id).is_some() {
            self.broadcast(ServerMessage::PresenceLeft { session_id }, None);
            info!(
                document = %self.document_id,
                session = %session_id,
                sessions = self.roster.len(),
                "session left"
            );
        }
    }

    fn require_edit(&self, session_id: &SessionId) -> Result<Option<UserId>> {
        let participant = self.roster.get(session_id).ok_or_else(|| {
            CollaborationError::AccessDenied(format!("session {session_id} is not in this room"))
        })?;
        if !participant.role.can_edit() {
            return Err(CollaborationError::InsufficientAccess(format!(
                "{} access cannot modify the document",
                participant.role.level()
            )));
        }
        Ok(participant.user_id.clone())
    }

    async fn emit(&mut self, session_id: SessionId, mut operation: Operation) {
        let actor = match self.require_edit(&session_id) {
            Ok(actor) => actor,
            Err(err) => {
                warn!(
                    document = %self.document_id,
                    session = %session_id,
                    operation = %operation.id,
                    error = %err,
                    "operation refused"
                );
                self.reject(session_id, &operation, err, Vec::new());
                return;
            }
        };

        if let Err(err) = self.assign_edge_ids(&mut operation.changes) {
            self.reject(session_id, &operation, err.into(), Vec::new());
            return;
        }

        operation.origin = Some(session_id);
        operation.actor = actor.clone();
        operation.timestamp = chrono::Utc::now();

        match operation.apply(&mut self.document) {
            Ok(inverse) => {
                self.seq += 1;
                operation.seq = self.seq;
                let recorded = !operation.is_cosmetic() && !inverse.is_empty();
                let entry = recorded.then(|| {
                    HistoryEntry::new(
                        HistoryAction::classify(&operation.changes),
                        actor,
                        &operation.changes,
                    )
                });

                debug!(
                    document = %self.document_id,
                    operation = %operation.id,
                    seq = self.seq,
                    changes = operation.changes.len(),
                    "operation applied"
                );
                self.broadcast(ServerMessage::OpApplied { operation }, None);

                if let Some(entry) = entry {
                    self.history.record(inverse);
                    self.log(entry);
                    self.publish_availability();
                    self.note_applied().await;
                }
            }
            Err(err) => {
                let corrections = self.corrections(&operation.changes);
                debug!(
                    document = %self.document_id,
                    operation = %operation.id,
                    error = %err,
                    "operation rejected"
                );
                self.reject(session_id, &operation, err.into(), corrections);
            }
        }
    }

    fn reject(
        &self,
        session_id: SessionId,
        operation: &Operation,
        err: CollaborationError,
        corrections: Vec<DocumentChange>,
    ) {
        self.send_to(
            &session_id,
            ServerMessage::OpRejected {
                operation_id: operation.id,
                error: ErrorBody::from(&err),
                corrections,
            },
        );
    }

    /// Gives every new edge without an id one that is unique in the room.
    fn assign_edge_ids(&mut self, changes: &mut [DocumentChange]) -> std::result::Result<(), MindmapError> {
        let mut taken: HashSet<EdgeId> = self.document.edges.iter().map(|e| e.id.clone()).collect();
        for change in changes.iter_mut() {
            let edges: Vec<&mut Edge> = match change {
                DocumentChange::EdgeAdd { edge } => vec![edge],
                DocumentChange::NodeAdd { edges, .. } => edges.iter_mut().collect(),
                _ => continue,
            };
            for edge in edges {
                if edge.id.is_empty() {
                    edge.id = self.ids.edge_id(edge, &taken)?;
                }
                taken.insert(edge.id.clone());
            }
        }
        Ok(())
    }

    /// Authoritative state of everything `changes` touched, as upserts or
    /// deletes.
    fn corrections(&self, changes: &[DocumentChange]) -> Vec<DocumentChange> {
        let mut nodes = Vec::new();
        let mut edges = Vec::new();
        let mut out = Vec::new();
        for change in changes {
            match change {
                DocumentChange::NodeAdd {
                    node,
                    edges: attached,
                    ..
                } => {
                    nodes.push(node.id.clone());
                    edges.extend(attached.iter().map(|e| e.id.clone()));
                }
                DocumentChange::NodeUpdate { node } => nodes.push(node.id.clone()),
                DocumentChange::NodeDelete { id } => nodes.push(id.clone()),
                DocumentChange::EdgeAdd { edge } | DocumentChange::EdgeUpdate { edge } => {
                    edges.push(edge.id.clone())
                }
                DocumentChange::EdgeDelete { id } => edges.push(id.clone()),
                DocumentChange::ViewportChange { .. } => out.push(DocumentChange::ViewportChange {
                    viewport: self.document.viewport,
                }),
                DocumentChange::DocumentReplaced { .. } => {
                    return vec![DocumentChange::DocumentReplaced {
                        snapshot: self.document.clone(),
                    }]
                }
            }
        }

        for id in nodes {
            out.push(match self.document.node(&id) {
                Some(node) => DocumentChange::NodeUpdate { node: node.clone() },
                None => DocumentChange::NodeDelete { id },
            });
        }
        for id in edges {
            out.push(match self.document.edge(&id) {
                Some(edge) => DocumentChange::EdgeUpdate { edge: edge.clone() },
                None => DocumentChange::EdgeDelete { id },
            });
        }
        out
    }

    async fn step(&mut self, session_id: SessionId, direction: UndoDirection) -> Result<Document> {
        let actor = self.require_edit(&session_id)?;
        let changes = match direction {
            UndoDirection::Undo => self.history.undo(&mut self.document)?,
            UndoDirection::Redo => self.history.redo(&mut self.document)?,
        };

        self.seq += 1;
        let mut operation = Operation::new(changes).with_origin(session_id, actor.clone());
        operation.seq = self.seq;
        let action = match direction {
            UndoDirection::Undo => HistoryAction::Undo,
            UndoDirection::Redo => HistoryAction::Redo,
        };
        let entry = HistoryEntry::new(action, actor, &operation.changes);

        info!(
            document = %self.document_id,
            session = %session_id,
            ?direction,
            seq = self.seq,
            "history step applied"
        );
        self.broadcast(ServerMessage::OpApplied { operation }, None);
        self.log(entry);
        self.publish_availability();
        self.note_applied().await;
        Ok(self.document.clone())
    }

    async fn restore(
        &mut self,
        session_id: SessionId,
        history_id: HistoryId,
        fallback: Option<RawDocument>,
    ) -> Result<Document> {
        let actor = self.require_edit(&session_id)?;

        let stored = self
            .ledger
            .get(&history_id)
            .and_then(|entry| entry.snapshot.clone());
        let snapshot = match (stored, fallback) {
            (Some(snapshot), _) => snapshot,
            (None, Some(raw)) => normalize_with(raw, &mut self.ids)?,
            (None, None) => {
                return Err(CollaborationError::InvalidOp(format!(
                    "history entry {history_id} has no snapshot"
                )))
            }
        };

        let changes = vec![DocumentChange::DocumentReplaced { snapshot }];
        apply_changes(&mut self.document, changes.clone())?;
        // A restore starts a new branch; the old stacks no longer apply.
        self.history.clear();

        self.seq += 1;
        let mut operation = Operation::new(changes).with_origin(session_id, actor.clone());
        operation.seq = self.seq;
        let entry = HistoryEntry::new(HistoryAction::Restore, actor, &operation.changes)
            .restored_from(history_id);

        info!(
            document = %self.document_id,
            session = %session_id,
            restored_from = %history_id,
            seq = self.seq,
            "document restored"
        );
        self.broadcast(ServerMessage::OpApplied { operation }, None);
        self.log(entry);
        self.publish_availability();
        self.persist().await;
        Ok(self.document.clone())
    }

    fn update_access(&mut self, access: DocumentAccess) -> Vec<SessionId> {
        self.access = access;
        let sessions: Vec<SessionId> = self.roster.sessions().copied().collect();
        let mut revoked = Vec::new();

        for session_id in sessions {
            let Some(participant) = self.roster.get(&session_id) else {
                continue;
            };
            let previous = participant.role;
            let role = Role::resolve(&self.access, participant.user_id.as_ref());

            if role.rank() < previous.rank() {
                if let Some(outbox) = self.outboxes.remove(&session_id) {
                    let _ = outbox.send(ServerMessage::AccessRevoked {
                        reason: format!("access changed from {} to {}", previous.level(), role.level()),
                    });
                }
                self.roster.leave(&session_id);
                self.broadcast(ServerMessage::PresenceLeft { session_id }, None);
                warn!(
                    document = %self.document_id,
                    session = %session_id,
                    from = previous.level(),
                    to = role.level(),
                    "session access revoked"
                );
                revoked.push(session_id);
            } else if role != previous {
                if let Some(participant) = self.roster.set_role(&session_id, role) {
                    self.broadcast(ServerMessage::PresenceUpdate { participant }, None);
                }
            }
        }
        revoked
    }

    fn log(&mut self, entry: HistoryEntry) {
        let mut entry = entry.with_seq(self.seq);
        if self.config.snapshot_history {
            entry = entry.with_snapshot(self.document.clone());
        }
        // Snapshots stay in the ledger; sessions fetch them by query.
        let entry = self.ledger.append(entry).summarized();
        self.broadcast(ServerMessage::HistoryLog { entry }, None);
    }

    fn publish_availability(&mut self) {
        let current = UndoAvailability {
            can_undo: self.history.can_undo(),
            can_redo: self.history.can_redo(),
        };
        if current != self.availability {
            self.availability = current;
            self.broadcast(ServerMessage::HistoryState(current), None);
        }
    }

    async fn note_applied(&mut self) {
        self.unsaved += 1;
        if self.config.persist_every > 0 && self.unsaved >= self.config.persist_every {
            self.persist().await;
        }
    }

    async fn persist(&mut self) {
        match self.store.save(&self.document_id, &self.document).await {
            Ok(()) => {
                self.unsaved = 0;
                debug!(document = %self.document_id, seq = self.seq, "document persisted");
            }
            Err(err) => {
                warn!(document = %self.document_id, error = %err, "failed to persist document");
            }
        }
    }

    fn broadcast(&self, message: ServerMessage, exclude: Option<SessionId>) {
        for (session_id, outbox) in &self.outboxes {
            if Some(*session_id) == exclude {
                continue;
            }
            if outbox.send(message.clone()).is_err() {
                debug!(document = %self.document_id, session = %session_id, "outbox closed");
            }
        }
    }

    fn send_to(&self, session_id: &SessionId, message: ServerMessage) {
        if let Some(outbox) = self.outboxes.get(session_id) {
            let _ = outbox.send(message);
        }
    }
}

/// Directory of live rooms. Joins authenticate, resolve the caller's
/// role and then open or reuse the document's room.
#[derive(Clone)]
pub struct RoomRegistry {
    rooms: RoomMap,
    access: Arc<dyn AccessProvider>,
    store: Arc<dyn DocumentStore>,
    config: RoomConfig,
    generation: Arc<AtomicU64>,
}

impl RoomRegistry {
    pub fn new(
        access: Arc<dyn AccessProvider>,
        store: Arc<dyn DocumentStore>,
        config: RoomConfig,
    ) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            access,
            store,
            config,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn join(
        &self,
        key: &RoomKey,
        token: Option<&str>,
        outbox: Outbox,
    ) -> Result<(RoomHandle, RoomSnapshot)> {
        let user_id = self.access.authenticate(token).await?;
        let access = self.access.resolve(key).await?;
        let role = Role::resolve(&access, user_id.as_ref());
        if !role.can_view() {
            info!(room = %key, user = ?user_id, "join denied");
            return Err(CollaborationError::AccessDenied(format!(
                "no access to document {}",
                access.document_id
            )));
        }

        let session_id = SessionId::new();
        for attempt in 1..=JOIN_ATTEMPTS {
            let handle = self.open(&access).await?;
            match handle
                .join(session_id, user_id.clone(), role, outbox.clone())
                .await
            {
                Err(CollaborationError::RoomClosed(_)) => {
                    debug!(room = %key, attempt, "room closed during join, retrying");
                }
                result => return result.map(|snapshot| (handle, snapshot)),
            }
        }
        Err(CollaborationError::RoomClosed(access.document_id.to_string()))
    }

    /// Pushes new grants into the document's room, if it is open.
    pub async fn update_access(&self, access: DocumentAccess) -> Result<Vec<SessionId>> {
        match self.room(&access.document_id).await {
            Some(handle) => handle.update_access(access).await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn room(&self, document_id: &DocumentId) -> Option<RoomHandle> {
        self.rooms
            .read()
            .await
            .get(document_id)
            .filter(|handle| !handle.is_closed())
            .cloned()
    }

    pub async fn info(&self, document_id: &DocumentId) -> Option<RoomInfo> {
        self.room(document_id).await?.info().await.ok()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Stops every open room and waits until each has saved its document.
    pub async fn shutdown(&self) {
        let handles: Vec<RoomHandle> = self.rooms.read().await.values().cloned().collect();
        for handle in handles {
            match handle.shutdown().await {
                Ok(()) => debug!(document = %handle.document_id, "room flushed"),
                Err(err) => {
                    debug!(document = %handle.document_id, error = %err, "room already closed")
                }
            }
        }
        info!("all rooms flushed");
    }

    async fn open(&self, access: &DocumentAccess) -> Result<RoomHandle> {
        if let Some(handle) = self.room(&access.document_id).await {
            return Ok(handle);
        }

        let mut rooms = self.rooms.write().await;
        if let Some(handle) = rooms
            .get(&access.document_id)
            .filter(|handle| !handle.is_closed())
        {
            return Ok(handle.clone());
        }

        let document = self.load(&access.document_id).await?;
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.config.mailbox_capacity.max(1));
        let handle = RoomHandle {
            document_id: access.document_id.clone(),
            generation,
            tx,
        };
        let room = Room::new(
            access.clone(),
            document,
            self.config.clone(),
            self.store.clone(),
        );
        tokio::spawn(room.run(rx, self.rooms.clone(), generation));

        rooms.insert(access.document_id.clone(), handle.clone());
        Ok(handle)
    }

    async fn load(&self, document_id: &DocumentId) -> Result<Document> {
        match self.store.load(document_id).await? {
            Some(raw) => Ok(normalize_with(raw, &mut EdgeIdGenerator::random())?),
            None => Ok(Document::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Access, MemoryStore, SharingPolicy, StaticAccessProvider};
    use mindmap::Node;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn setup() -> (RoomRegistry, Arc<StaticAccessProvider>, Arc<MemoryStore>) {
        let access = Arc::new(StaticAccessProvider::new());
        access.add_user("t-alice", "alice");
        access.add_user("t-bob", "bob");
        access.upsert_document(
            DocumentAccess::new("doc", "alice")
                .with_collaborator("bob", Access::Edit)
                .with_sharing(SharingPolicy::View, Some("public-link")),
        );
        let store = Arc::new(MemoryStore::new());
        let registry = RoomRegistry::new(access.clone(), store.clone(), RoomConfig::default());
        (registry, access, store)
    }

    async fn join(
        registry: &RoomRegistry,
        token: Option<&str>,
    ) -> (RoomHandle, RoomSnapshot, UnboundedReceiver<ServerMessage>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (handle, snapshot) = registry
            .join(&RoomKey::Document(DocumentId::new("doc")), token, tx)
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(ServerMessage::Joined(_))));
        (handle, snapshot, rx)
    }

    async fn next(rx: &mut UnboundedReceiver<ServerMessage>) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("outbox closed")
    }

    #[tokio::test]
    async fn test_join_broadcasts_presence_to_others() {
        let (registry, _, _) = setup();
        let (_, alice, mut alice_rx) = join(&registry, Some("t-alice")).await;
        assert_eq!(alice.role, Role::Owner);

        let (_, bob, _) = join(&registry, Some("t-bob")).await;
        assert_eq!(bob.roster.len(), 2);

        match next(&mut alice_rx).await {
            ServerMessage::PresenceJoined { participant } => {
                assert_eq!(participant.session_id, bob.session_id)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_anonymous_private_join_is_denied() {
        let (registry, access, _) = setup();
        access.upsert_document(DocumentAccess::new("secret", "alice"));
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = registry
            .join(&RoomKey::Document(DocumentId::new("secret")), None, tx.clone())
            .await;
        assert!(matches!(result, Err(CollaborationError::AccessDenied(_))));

        let result = registry
            .join(&RoomKey::ShareToken("nope".into()), None, tx)
            .await;
        assert!(matches!(result, Err(CollaborationError::RoomNotFound(_))));
    }

    #[tokio::test]
    async fn test_server_assigns_missing_edge_ids() {
        let (registry, _, _) = setup();
        let (handle, alice, mut rx) = join(&registry, Some("t-alice")).await;

        let op = Operation::new(vec![
            DocumentChange::add_node(Node::new("a", "A")),
            DocumentChange::add_node(Node::new("b", "B")),
            DocumentChange::EdgeAdd {
                edge: Edge::new("", "a", "b"),
            },
        ]);
        handle.emit(alice.session_id, op).await.unwrap();

        match next(&mut rx).await {
            ServerMessage::OpApplied { operation } => {
                assert_eq!(operation.seq, 1);
                assert_eq!(operation.actor, Some(UserId::new("alice")));
                match &operation.changes[2] {
                    DocumentChange::EdgeAdd { edge } => assert!(!edge.id.is_empty()),
                    other => panic!("unexpected {other:?}"),
                }
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(next(&mut rx).await, ServerMessage::HistoryLog { .. }));

        let (doc, seq) = handle.snapshot().await.unwrap();
        assert_eq!(seq, 1);
        assert_eq!(doc.edges.len(), 1);
    }

    #[tokio::test]
    async fn test_viewport_is_broadcast_but_not_logged() {
        let (registry, _, _) = setup();
        let (handle, alice, mut rx) = join(&registry, Some("t-alice")).await;

        let op = Operation::new(vec![DocumentChange::ViewportChange {
            viewport: mindmap::Viewport {
                x: 5.0,
                y: 5.0,
                zoom: 2.0,
            },
        }]);
        handle.emit(alice.session_id, op).await.unwrap();
        assert!(matches!(next(&mut rx).await, ServerMessage::OpApplied { .. }));

        let info = handle.info().await.unwrap();
        assert_eq!(info.ledger_len, 0);
        assert!(!info.can_undo);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_downgrade_revokes_session() {
        let (registry, _, _) = setup();
        let (_, _alice, mut alice_rx) = join(&registry, Some("t-alice")).await;
        let (_, bob, mut bob_rx) = join(&registry, Some("t-bob")).await;
        let _ = next(&mut alice_rx).await;

        let downgraded = DocumentAccess::new("doc", "alice")
            .with_collaborator("bob", Access::View)
            .with_sharing(SharingPolicy::View, Some("public-link"));
        let revoked = registry.update_access(downgraded).await.unwrap();
        assert_eq!(revoked, vec![bob.session_id]);

        assert!(matches!(
            next(&mut bob_rx).await,
            ServerMessage::AccessRevoked { .. }
        ));
        match next(&mut alice_rx).await {
            ServerMessage::PresenceLeft { session_id } => assert_eq!(session_id, bob.session_id),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_history_state_follows_undo_stacks() {
        let (registry, _, _) = setup();
        let (handle, alice, mut rx) = join(&registry, Some("t-alice")).await;
        handle
            .emit(
                alice.session_id,
                Operation::new(vec![DocumentChange::add_node(Node::new("n1", "One"))]),
            )
            .await
            .unwrap();

        assert!(matches!(next(&mut rx).await, ServerMessage::OpApplied { .. }));
        match next(&mut rx).await {
            ServerMessage::HistoryLog { entry } => assert!(entry.snapshot.is_none()),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            next(&mut rx).await,
            ServerMessage::HistoryState(UndoAvailability {
                can_undo: true,
                can_redo: false,
            })
        );

        handle.undo(alice.session_id).await.unwrap();
        assert!(matches!(next(&mut rx).await, ServerMessage::OpApplied { .. }));
        assert!(matches!(next(&mut rx).await, ServerMessage::HistoryLog { .. }));
        assert_eq!(
            next(&mut rx).await,
            ServerMessage::HistoryState(UndoAvailability {
                can_undo: false,
                can_redo: true,
            })
        );

        let entries = handle
            .query(HistoryFilter {
                with_snapshots: true,
                ..HistoryFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.snapshot.is_some()));
    }

    #[tokio::test]
    async fn test_shutdown_saves_unpersisted_rooms() {
        let (registry, _, store) = setup();
        let (handle, alice, mut rx) = join(&registry, Some("t-alice")).await;
        handle
            .emit(
                alice.session_id,
                Operation::new(vec![DocumentChange::add_node(Node::new("n1", "Unsaved"))]),
            )
            .await
            .unwrap();
        assert!(matches!(next(&mut rx).await, ServerMessage::OpApplied { .. }));
        assert_eq!(store.save_count(), 0);

        registry.shutdown().await;

        assert_eq!(store.save_count(), 1);
        assert!(handle.is_closed());
        assert_eq!(registry.room_count().await, 0);
        let saved = store.get(&DocumentId::new("doc")).unwrap();
        assert_eq!(saved.nodes[0].label.as_deref(), Some("Unsaved"));
    }

    #[tokio::test]
    async fn test_last_leave_persists_and_closes() {
        let (registry, _, store) = setup();
        let (handle, alice, _rx) = join(&registry, Some("t-alice")).await;
        handle
            .emit(
                alice.session_id,
                Operation::new(vec![DocumentChange::add_node(Node::new("n1", "Saved"))]),
            )
            .await
            .unwrap();
        handle.leave(alice.session_id).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while registry.room_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(handle.is_closed());
        assert!(store.save_count() >= 1);

        // Reopening loads what was saved.
        let (_, again, _) = join(&registry, Some("t-alice")).await;
        assert_eq!(again.document.nodes[0].label, "Saved");
        assert_eq!(again.seq, 0);
    }
}
