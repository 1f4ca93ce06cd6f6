/// Client side of a collaboration session: owns the WebSocket, keeps a
/// local replica in step with the room and reconnects with backoff.
use futures::{Sink, SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use mindmap::{Document, DocumentChange, RawDocument, Snapshot, Viewport};

use crate::{
    ClientConfig, ClientEvent, ClientMessage, CollaborationError, Connection, EdgeChange,
    EventBus, FocusTarget, HistoryEntry, HistoryFilter, HistoryId, LocalReplica, NodeChange,
    Operation, OperationId, RemoteOutcome, RequestId, Result, Role, RoomKey, RoomSnapshot,
    ServerMessage, SessionId, SubscriptionId, UndoAvailability, UndoDirection, UserColor,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UndoState {
    #[default]
    Idle,
    Undoing,
    Redoing,
}

/// Allows one undo or redo round trip at a time.
#[derive(Debug, Default)]
pub struct UndoController {
    state: Mutex<UndoState>,
}

impl UndoController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> UndoState {
        *self.state.lock()
    }

    /// Marks a request as in flight until the returned guard drops.
    pub fn begin(&self, direction: UndoDirection) -> Result<UndoGuard<'_>> {
        let mut state = self.state.lock();
        match *state {
            UndoState::Idle => {}
            UndoState::Undoing => {
                return Err(CollaborationError::InvalidOp("undo already in progress".into()))
            }
            UndoState::Redoing => {
                return Err(CollaborationError::InvalidOp("redo already in progress".into()))
            }
        }
        *state = match direction {
            UndoDirection::Undo => UndoState::Undoing,
            UndoDirection::Redo => UndoState::Redoing,
        };
        Ok(UndoGuard { state: &self.state })
    }
}

#[derive(Debug)]
pub struct UndoGuard<'a> {
    state: &'a Mutex<UndoState>,
}

impl Drop for UndoGuard<'_> {
    fn drop(&mut self) {
        *self.state.lock() = UndoState::Idle;
    }
}

#[derive(Debug)]
enum Reply {
    Document(Result<Document>),
    Entries(Vec<HistoryEntry>),
}

impl Reply {
    fn into_document(self) -> Result<Document> {
        match self {
            Reply::Document(result) => result,
            Reply::Entries(_) => Err(CollaborationError::InvalidOp("unexpected reply".into())),
        }
    }
}

/// State shared between the public handle and the connection task.
#[derive(Default)]
struct Shared {
    replica: Mutex<LocalReplica>,
    /// Present while joined; replaced on every re-join so that messages
    /// queued for a dead connection are dropped with it.
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientMessage>>>,
    session: Mutex<Option<(SessionId, Role)>>,
    availability: Mutex<UndoAvailability>,
    requests: Mutex<HashMap<RequestId, oneshot::Sender<Reply>>>,
    next_request: AtomicU64,
    events: EventBus<ClientEvent>,
}

enum Flow {
    Continue,
    Retry,
    Terminal(CollaborationError),
}

enum SessionEnd {
    Shutdown,
    Dropped,
    Terminal(CollaborationError),
}

type Ready = Option<oneshot::Sender<Result<RoomSnapshot>>>;

impl Shared {
    fn send(&self, msg: ClientMessage) -> Result<()> {
        let outbound = self.outbound.lock();
        let tx = outbound
            .as_ref()
            .ok_or_else(|| CollaborationError::TransientNetwork("not connected".into()))?;
        tx.send(msg)
            .map_err(|_| CollaborationError::TransientNetwork("connection closed".into()))
    }

    /// Returns whether the client was joined.
    fn go_offline(&self) -> bool {
        let was_joined = self.outbound.lock().take().is_some();
        // Dropping the senders fails every outstanding request.
        self.requests.lock().clear();
        was_joined
    }

    fn complete(&self, request_id: RequestId, reply: Reply) {
        match self.requests.lock().remove(&request_id) {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => debug!(request_id, "reply for unknown request"),
        }
    }

    fn handle(
        &self,
        msg: ServerMessage,
        out: &mpsc::UnboundedSender<ClientMessage>,
        ready: &mut Ready,
    ) -> Flow {
        match msg {
            ServerMessage::Joined(snapshot) => {
                self.replica
                    .lock()
                    .reset(snapshot.document.clone(), snapshot.seq);
                *self.session.lock() = Some((snapshot.session_id, snapshot.role));
                *self.availability.lock() = UndoAvailability {
                    can_undo: snapshot.can_undo,
                    can_redo: snapshot.can_redo,
                };
                *self.outbound.lock() = Some(out.clone());
                info!(
                    document = %snapshot.document_id,
                    session = %snapshot.session_id,
                    role = snapshot.role.level(),
                    "joined room"
                );
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Ok(snapshot.clone()));
                }
                self.events.publish(&ClientEvent::Connected(snapshot));
            }
            ServerMessage::JoinError { error } => {
                let err = CollaborationError::from(error);
                if err.is_terminal() {
                    return Flow::Terminal(err);
                }
                warn!(error = %err, "join failed, retrying");
                return Flow::Retry;
            }
            ServerMessage::PresenceJoined { participant } => {
                self.events.publish(&ClientEvent::PresenceJoined(participant));
            }
            ServerMessage::PresenceUpdate { participant } => {
                if let Some((session_id, role)) = self.session.lock().as_mut() {
                    if *session_id == participant.session_id {
                        *role = participant.role;
                    }
                }
                self.events.publish(&ClientEvent::PresenceUpdated(participant));
            }
            ServerMessage::PresenceLeft { session_id } => {
                self.events.publish(&ClientEvent::PresenceLeft(session_id));
            }
            ServerMessage::OpApplied { operation } => {
                let document = {
                    let mut replica = self.replica.lock();
                    match replica.apply_remote(&operation) {
                        RemoteOutcome::Duplicate => None,
                        RemoteOutcome::Confirmed | RemoteOutcome::Applied => {
                            Some(replica.document().clone())
                        }
                    }
                };
                if let Some(document) = document {
                    self.events.publish(&ClientEvent::DocumentChanged {
                        document,
                        operation,
                    });
                }
            }
            ServerMessage::OpRejected {
                operation_id,
                error,
                corrections,
            } => {
                let known = self.replica.lock().reject(operation_id, &corrections);
                let error = CollaborationError::from(error);
                debug!(operation = %operation_id, known, error = %error, "operation rejected");
                self.events.publish(&ClientEvent::OperationRejected {
                    operation_id,
                    error,
                    corrections,
                });
            }
            ServerMessage::HistoryLog { entry } => {
                self.events.publish(&ClientEvent::HistoryAppended(entry));
            }
            ServerMessage::HistoryState(availability) => {
                *self.availability.lock() = availability;
                self.events
                    .publish(&ClientEvent::UndoAvailabilityChanged(availability));
            }
            ServerMessage::UndoResult(reply) | ServerMessage::RestoreResult(reply) => {
                let request_id = reply.request_id;
                self.complete(request_id, Reply::Document(reply.into_result()));
            }
            ServerMessage::HistoryEntries {
                request_id,
                entries,
            } => {
                self.complete(request_id, Reply::Entries(entries));
            }
            ServerMessage::AccessRevoked { reason } => {
                return Flow::Terminal(CollaborationError::AccessRevoked(reason));
            }
            ServerMessage::Error { error } => {
                warn!(code = %error.code, "server error: {}", error.message);
            }
            ServerMessage::Pong => debug!("pong"),
        }
        Flow::Continue
    }
}

async fn send_frame<S>(sink: &mut S, msg: &ClientMessage) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let text = msg.to_text()?;
    sink.send(Message::Text(text))
        .await
        .map_err(|e| CollaborationError::TransientNetwork(e.to_string()))
}

/// One connection attempt, from handshake to disconnect.
async fn session(
    shared: &Shared,
    config: &ClientConfig,
    room: &RoomKey,
    shutdown: &mut watch::Receiver<bool>,
    ready: &mut Ready,
) -> SessionEnd {
    let connected = tokio::select! {
        result = tokio_tungstenite::connect_async(config.url.as_str()) => result,
        _ = shutdown.changed() => return SessionEnd::Shutdown,
    };
    let ws_stream = match connected {
        Ok((ws, _)) => ws,
        Err(e) => {
            debug!(url = %config.url, error = %e, "connect failed");
            return SessionEnd::Dropped;
        }
    };
    let (mut sink, mut stream) = ws_stream.split();

    let join = ClientMessage::Join {
        room: room.clone(),
        token: config.token.clone(),
    };
    if let Err(e) = send_frame(&mut sink, &join).await {
        debug!(error = %e, "failed to send join");
        return SessionEnd::Dropped;
    }

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();
    let mut heartbeat = tokio::time::interval(config.heartbeat);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = send_frame(&mut sink, &ClientMessage::Leave).await;
                let _ = sink.close().await;
                return SessionEnd::Shutdown;
            }
            Some(msg) = out_rx.recv() => {
                if let Err(e) = send_frame(&mut sink, &msg).await {
                    debug!(error = %e, "send failed");
                    return SessionEnd::Dropped;
                }
            }
            _ = heartbeat.tick() => {
                if send_frame(&mut sink, &ClientMessage::Ping).await.is_err() {
                    return SessionEnd::Dropped;
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match ServerMessage::from_text(&text) {
                    Ok(msg) => match shared.handle(msg, &out_tx, ready) {
                        Flow::Continue => {}
                        Flow::Retry => return SessionEnd::Dropped,
                        Flow::Terminal(err) => {
                            let _ = sink.close().await;
                            return SessionEnd::Terminal(err);
                        }
                    },
                    Err(e) => warn!("Failed to parse server message: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => return SessionEnd::Dropped,
                Some(Err(e)) => {
                    debug!(error = %e, "connection error");
                    return SessionEnd::Dropped;
                }
                Some(Ok(_)) => {}
            }
        }
    }
}

fn finish(ready: &mut Ready, result: Result<RoomSnapshot>) {
    if let Some(ready) = ready.take() {
        let _ = ready.send(result);
    }
}

async fn run(
    shared: Arc<Shared>,
    config: ClientConfig,
    room: RoomKey,
    mut shutdown: watch::Receiver<bool>,
    ready: oneshot::Sender<Result<RoomSnapshot>>,
) {
    let mut ready = Some(ready);
    let mut attempt: u32 = 0;

    loop {
        let end = session(&shared, &config, &room, &mut shutdown, &mut ready).await;
        if shared.go_offline() {
            shared.events.publish(&ClientEvent::Disconnected);
            attempt = 0;
        }

        match end {
            SessionEnd::Shutdown => break,
            SessionEnd::Terminal(err) => {
                warn!(room = %room, error = %err, "session ended");
                let event = match &err {
                    CollaborationError::AccessRevoked(reason) => {
                        ClientEvent::AccessRevoked(reason.clone())
                    }
                    other => ClientEvent::JoinFailed(other.clone()),
                };
                shared.events.publish(&event);
                finish(&mut ready, Err(err));
                break;
            }
            SessionEnd::Dropped => {}
        }

        if config.backoff.exhausted(attempt) {
            let err = CollaborationError::ReconnectExhausted(attempt);
            warn!(room = %room, "giving up: {}", err);
            shared.events.publish(&ClientEvent::ReconnectFailed(err.clone()));
            finish(&mut ready, Err(err));
            break;
        }

        let delay = config.backoff.delay(attempt);
        attempt += 1;
        info!(room = %room, attempt, ?delay, "reconnecting");
        shared.events.publish(&ClientEvent::Reconnecting { attempt });

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    finish(
        &mut ready,
        Err(CollaborationError::TransientNetwork("client disconnected".into())),
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireKind {
    Nodes,
    Edges,
    Viewport,
}

/// The `op:*` message an operation can travel as. Node additions carrying
/// edges and mixed operations have no wire form.
fn wire_kind(changes: &[DocumentChange]) -> Result<WireKind> {
    match changes {
        [] => Err(CollaborationError::InvalidOp("empty operation".into())),
        [DocumentChange::ViewportChange { .. }] => Ok(WireKind::Viewport),
        _ if changes.iter().all(|c| match c {
            DocumentChange::NodeAdd { edges, .. } => edges.is_empty(),
            other => other.is_node_change(),
        }) =>
        {
            Ok(WireKind::Nodes)
        }
        _ if changes.iter().all(DocumentChange::is_edge_change) => Ok(WireKind::Edges),
        _ => Err(CollaborationError::InvalidOp(
            "operation mixes change kinds".into(),
        )),
    }
}

fn encode(kind: WireKind, operation: &Operation) -> ClientMessage {
    let operation_id = operation.id;
    match kind {
        WireKind::Nodes => ClientMessage::Nodes {
            operation_id,
            changes: operation
                .changes
                .iter()
                .filter_map(|change| match change.clone() {
                    DocumentChange::NodeAdd { node, .. } => Some(NodeChange::Add { node }),
                    DocumentChange::NodeUpdate { node } => Some(NodeChange::Update { node }),
                    DocumentChange::NodeDelete { id } => Some(NodeChange::Delete { id }),
                    _ => None,
                })
                .collect(),
        },
        WireKind::Edges => ClientMessage::Edges {
            operation_id,
            changes: operation
                .changes
                .iter()
                .filter_map(|change| match change.clone() {
                    DocumentChange::EdgeAdd { edge } => Some(EdgeChange::Add { edge }),
                    DocumentChange::EdgeUpdate { edge } => Some(EdgeChange::Update { edge }),
                    DocumentChange::EdgeDelete { id } => Some(EdgeChange::Delete { id }),
                    _ => None,
                })
                .collect(),
        },
        WireKind::Viewport => {
            let viewport = operation
                .changes
                .iter()
                .find_map(|change| match change {
                    DocumentChange::ViewportChange { viewport } => Some(*viewport),
                    _ => None,
                })
                .unwrap_or_default();
            ClientMessage::Viewport {
                operation_id,
                viewport,
            }
        }
    }
}

/// Connection to one room. Construct it, subscribe to [`ClientEvent`]s,
/// then call [`TransportClient::connect`].
pub struct TransportClient {
    config: ClientConfig,
    room: RoomKey,
    shared: Arc<Shared>,
    undo: UndoController,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl TransportClient {
    pub fn new(config: ClientConfig, room: RoomKey) -> Self {
        Self {
            config,
            room,
            shared: Arc::new(Shared {
                next_request: AtomicU64::new(1),
                ..Default::default()
            }),
            undo: UndoController::new(),
            shutdown: None,
            task: None,
        }
    }

    pub fn events(&self) -> &EventBus<ClientEvent> {
        &self.shared.events
    }

    pub fn subscribe(
        &self,
        handler: impl Fn(&ClientEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.shared.events.subscribe(handler)
    }

    /// Starts the connection task and waits for the first join. Drops and
    /// failed joins are retried per the backoff policy; access errors are
    /// returned immediately.
    pub async fn connect(&mut self) -> Result<RoomSnapshot> {
        if self.task.as_ref().is_some_and(|task| !task.is_finished()) {
            return Err(CollaborationError::InvalidOp("already connected".into()));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();
        info!(url = %self.config.url, room = %self.room, "connecting");
        self.task = Some(tokio::spawn(run(
            self.shared.clone(),
            self.config.clone(),
            self.room.clone(),
            shutdown_rx,
            ready_tx,
        )));
        self.shutdown = Some(shutdown_tx);

        ready_rx.await.unwrap_or_else(|_| {
            Err(CollaborationError::TransientNetwork(
                "connection task ended".into(),
            ))
        })
    }

    /// Leaves the room and stops reconnecting.
    pub async fn disconnect(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.shared.go_offline();
    }

    pub fn is_connected(&self) -> bool {
        self.shared.outbound.lock().is_some()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.shared.session.lock().as_ref().map(|(id, _)| *id)
    }

    pub fn role(&self) -> Option<Role> {
        self.shared.session.lock().as_ref().map(|(_, role)| *role)
    }

    /// Local view of the document, pending edits included.
    pub fn document(&self) -> Document {
        self.shared.replica.lock().document().clone()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.replica.lock().pending().len()
    }

    pub fn undo_state(&self) -> UndoState {
        self.undo.state()
    }

    /// Room-wide undo/redo availability as last reported by the server.
    pub fn undo_availability(&self) -> UndoAvailability {
        *self.shared.availability.lock()
    }

    pub fn can_undo(&self) -> bool {
        self.undo_availability().can_undo
    }

    pub fn can_redo(&self) -> bool {
        self.undo_availability().can_redo
    }

    fn submit(
        &self,
        changes: Vec<DocumentChange>,
        wrap: impl FnOnce(&Operation) -> ClientMessage,
    ) -> Result<OperationId> {
        if !self.is_connected() {
            return Err(CollaborationError::TransientNetwork("not connected".into()));
        }

        let (operation, document) = {
            let mut replica = self.shared.replica.lock();
            let operation = replica.apply_local(changes)?;
            (operation, replica.document().clone())
        };
        if let Err(err) = self.shared.send(wrap(&operation)) {
            self.shared.replica.lock().reject(operation.id, &[]);
            return Err(err);
        }

        let operation_id = operation.id;
        self.shared.events.publish(&ClientEvent::DocumentChanged {
            document,
            operation,
        });
        Ok(operation_id)
    }

    /// Applies `changes` locally and sends them to the room.
    pub fn emit(&self, changes: Vec<DocumentChange>) -> Result<OperationId> {
        let kind = wire_kind(&changes)?;
        self.submit(changes, |operation| encode(kind, operation))
    }

    pub fn emit_nodes(&self, changes: Vec<NodeChange>) -> Result<OperationId> {
        self.emit(changes.into_iter().map(Into::into).collect())
    }

    pub fn emit_edges(&self, changes: Vec<EdgeChange>) -> Result<OperationId> {
        self.emit(changes.into_iter().map(Into::into).collect())
    }

    /// Draws an edge. A missing id is generated locally.
    pub fn connect_nodes(&self, connection: Connection) -> Result<OperationId> {
        let template = connection.clone();
        self.submit(
            vec![DocumentChange::EdgeAdd {
                edge: connection.into(),
            }],
            |operation| {
                let id = operation.changes.iter().find_map(|change| match change {
                    DocumentChange::EdgeAdd { edge } => Some(edge.id.clone()),
                    _ => None,
                });
                ClientMessage::Connect {
                    operation_id: operation.id,
                    connection: Connection { id, ..template },
                }
            },
        )
    }

    pub fn set_viewport(&self, viewport: Viewport) -> Result<OperationId> {
        self.emit(vec![DocumentChange::ViewportChange { viewport }])
    }

    fn presence(&self, msg: ClientMessage) {
        if let Err(err) = self.shared.send(msg) {
            debug!(error = %err, "presence update dropped");
        }
    }

    pub fn announce(&self, name: impl Into<String>, color: Option<UserColor>) {
        self.presence(ClientMessage::Announce {
            name: name.into(),
            color: color.map(|c| c.to_hex()),
            user_id: None,
        });
    }

    pub fn set_active(&self, target: Option<FocusTarget>) {
        self.presence(ClientMessage::Active { target });
    }

    pub fn clear_active(&self) {
        self.presence(ClientMessage::Clear);
    }

    pub fn move_cursor(&self, x: f64, y: f64) {
        self.presence(ClientMessage::CursorMove { x, y });
    }

    async fn request(&self, build: impl FnOnce(RequestId) -> ClientMessage) -> Result<Reply> {
        let request_id = self.shared.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.requests.lock().insert(request_id, tx);

        if let Err(err) = self.shared.send(build(request_id)) {
            self.shared.requests.lock().remove(&request_id);
            return Err(err);
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(CollaborationError::TransientNetwork(
                "connection lost before reply".into(),
            )),
            Err(_) => {
                self.shared.requests.lock().remove(&request_id);
                Err(CollaborationError::TransientNetwork(
                    "request timed out".into(),
                ))
            }
        }
    }

    async fn step(&self, direction: UndoDirection) -> Result<Document> {
        let _guard = self.undo.begin(direction)?;
        let reply = self
            .request(|request_id| match direction {
                UndoDirection::Undo => ClientMessage::Undo { request_id },
                UndoDirection::Redo => ClientMessage::Redo { request_id },
            })
            .await?;
        reply.into_document()
    }

    /// Reverts the room's most recent recorded change.
    pub async fn undo(&self) -> Result<Document> {
        self.step(UndoDirection::Undo).await
    }

    pub async fn redo(&self) -> Result<Document> {
        self.step(UndoDirection::Redo).await
    }

    /// Returns the room to a ledger entry. `fallback` is sent along and
    /// used only if the room no longer holds the entry's snapshot.
    pub async fn restore(
        &self,
        history_id: HistoryId,
        fallback: Option<&Snapshot>,
    ) -> Result<Document> {
        let snapshot = fallback.map(RawDocument::from);
        self.request(|request_id| ClientMessage::Restore {
            request_id,
            history_id,
            snapshot,
        })
        .await?
        .into_document()
    }

    pub async fn query_history(&self, filter: HistoryFilter) -> Result<Vec<HistoryEntry>> {
        match self
            .request(|request_id| ClientMessage::Query { request_id, filter })
            .await?
        {
            Reply::Entries(entries) => Ok(entries),
            Reply::Document(_) => Err(CollaborationError::InvalidOp("unexpected reply".into())),
        }
    }
}
