/// Multi-session scenarios against live rooms, and end-to-end runs over
/// a real WebSocket listener.
use collaboration::*;
use mindmap::{Document, DocumentChange, Node};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::sync::mpsc::{self, UnboundedReceiver};

fn setup() -> (RoomRegistry, Arc<StaticAccessProvider>) {
    let access = Arc::new(StaticAccessProvider::new());
    access.add_user("t-alice", "alice");
    access.add_user("t-bob", "bob");
    access.upsert_document(
        DocumentAccess::new("doc", "alice")
            .with_collaborator("bob", Access::Edit)
            .with_sharing(SharingPolicy::View, Some("public-link")),
    );
    access.upsert_document(DocumentAccess::new("secret", "alice"));
    let registry = RoomRegistry::new(
        access.clone(),
        Arc::new(MemoryStore::new()),
        RoomConfig::default(),
    );
    (registry, access)
}

struct Member {
    handle: RoomHandle,
    session: RoomSnapshot,
    rx: UnboundedReceiver<ServerMessage>,
}

impl Member {
    fn id(&self) -> SessionId {
        self.session.session_id
    }

    async fn next(&mut self) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("outbox closed")
    }

    /// Skips messages until `pick` accepts one.
    async fn until<T>(&mut self, mut pick: impl FnMut(ServerMessage) -> Option<T>) -> T {
        loop {
            if let Some(found) = pick(self.next().await) {
                return found;
            }
        }
    }

    async fn applied(&mut self) -> Operation {
        self.until(|msg| match msg {
            ServerMessage::OpApplied { operation } => Some(operation),
            _ => None,
        })
        .await
    }

    async fn logged(&mut self) -> HistoryEntry {
        self.until(|msg| match msg {
            ServerMessage::HistoryLog { entry } => Some(entry),
            _ => None,
        })
        .await
    }
}

async fn enter(registry: &RoomRegistry, key: RoomKey, token: Option<&str>) -> Member {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (handle, session) = registry.join(&key, token, tx).await.unwrap();
    assert!(matches!(rx.recv().await, Some(ServerMessage::Joined(_))));
    Member { handle, session, rx }
}

fn doc_key() -> RoomKey {
    RoomKey::Document(DocumentId::new("doc"))
}

fn add(id: &str, label: &str) -> Operation {
    Operation::new(vec![DocumentChange::add_node(Node::new(id, label))])
}

fn relabel(id: &str, label: &str) -> Operation {
    Operation::new(vec![DocumentChange::NodeUpdate {
        node: Node::new(id, label),
    }])
}

#[tokio::test]
async fn test_concurrent_add_with_same_id_keeps_first() {
    let (registry, _) = setup();
    let mut alice = enter(&registry, doc_key(), Some("t-alice")).await;
    let mut bob = enter(&registry, doc_key(), Some("t-bob")).await;

    // Both clients guessed "n1" locally.
    let mut bob_replica = LocalReplica::from_snapshot(bob.session.document.clone(), bob.session.seq);
    let bob_op = bob_replica
        .apply_local(vec![DocumentChange::add_node(Node::new("n1", "from bob"))])
        .unwrap();

    alice.handle.emit(alice.id(), add("n1", "from alice")).await.unwrap();
    bob.handle.emit(bob.id(), bob_op.clone()).await.unwrap();

    let winner = bob.applied().await;
    bob_replica.apply_remote(&winner);

    let (operation_id, error, corrections) = bob
        .until(|msg| match msg {
            ServerMessage::OpRejected {
                operation_id,
                error,
                corrections,
            } => Some((operation_id, error, corrections)),
            _ => None,
        })
        .await;
    assert_eq!(operation_id, bob_op.id);
    assert_eq!(CollaborationError::from(error).code(), "conflict");
    assert!(bob_replica.reject(operation_id, &corrections));

    let (doc, seq) = alice.handle.snapshot().await.unwrap();
    assert_eq!(seq, 1);
    assert_eq!(doc.nodes.len(), 1);
    assert_eq!(doc.nodes[0].label, "from alice");
    assert_eq!(bob_replica.document(), &doc);
    assert_eq!(alice.applied().await.id, winner.id);
}

#[tokio::test]
async fn test_two_undos_after_three_updates() {
    let (registry, _) = setup();
    let alice = enter(&registry, doc_key(), Some("t-alice")).await;
    let id = alice.id();

    alice.handle.emit(id, add("n1", "v0")).await.unwrap();
    for label in ["v1", "v2", "v3"] {
        alice.handle.emit(id, relabel("n1", label)).await.unwrap();
    }

    alice.handle.undo(id).await.unwrap();
    let doc = alice.handle.undo(id).await.unwrap();
    assert_eq!(doc.nodes[0].label, "v1");

    let doc = alice.handle.redo(id).await.unwrap();
    assert_eq!(doc.nodes[0].label, "v2");

    let info = alice.handle.info().await.unwrap();
    assert!(info.can_undo);
    assert!(info.can_redo);
    // Four edits, two undos and a redo.
    assert_eq!(info.ledger_len, 7);
}

#[tokio::test]
async fn test_undo_on_fresh_room_is_no_op() {
    let (registry, _) = setup();
    let alice = enter(&registry, doc_key(), Some("t-alice")).await;
    let err = alice.handle.undo(alice.id()).await.unwrap_err();
    assert_eq!(err, CollaborationError::NoOp("undo".into()));
}

#[tokio::test]
async fn test_public_viewer_edit_is_rejected_and_not_broadcast() {
    let (registry, _) = setup();
    let mut alice = enter(&registry, doc_key(), Some("t-alice")).await;
    let mut viewer = enter(&registry, RoomKey::ShareToken("public-link".into()), None).await;
    assert_eq!(
        viewer.session.role,
        Role::Public {
            access: Access::View
        }
    );
    assert!(matches!(
        alice.next().await,
        ServerMessage::PresenceJoined { .. }
    ));

    let op = add("n1", "sneaky");
    viewer.handle.emit(viewer.id(), op.clone()).await.unwrap();
    match viewer.next().await {
        ServerMessage::OpRejected {
            operation_id,
            error,
            ..
        } => {
            assert_eq!(operation_id, op.id);
            assert_eq!(error.code, "insufficient_access");
        }
        other => panic!("unexpected {other:?}"),
    }

    let (doc, seq) = alice.handle.snapshot().await.unwrap();
    assert!(doc.is_empty());
    assert_eq!(seq, 0);
    assert!(alice.rx.try_recv().is_err());
}

#[tokio::test]
async fn test_viewer_restore_is_refused() {
    let (registry, _) = setup();
    let mut alice = enter(&registry, doc_key(), Some("t-alice")).await;
    alice.handle.emit(alice.id(), add("n1", "kept")).await.unwrap();
    let entry = alice.logged().await;

    let viewer = enter(&registry, RoomKey::ShareToken("public-link".into()), None).await;
    let err = viewer
        .handle
        .restore(viewer.id(), entry.id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CollaborationError::InsufficientAccess(_)));

    let (doc, _) = alice.handle.snapshot().await.unwrap();
    assert_eq!(doc.nodes.len(), 1);
}

#[tokio::test]
async fn test_restore_appends_and_keeps_history() {
    let (registry, _) = setup();
    let mut alice = enter(&registry, doc_key(), Some("t-alice")).await;
    let id = alice.id();

    alice.handle.emit(id, add("n1", "first")).await.unwrap();
    let first = alice.logged().await;
    assert!(first.snapshot.is_none());
    alice.handle.emit(id, add("n2", "second")).await.unwrap();
    alice.logged().await;

    let doc = alice.handle.restore(id, first.id, None).await.unwrap();
    assert_eq!(doc.nodes.len(), 1);
    assert_eq!(doc.nodes[0].id.as_str(), "n1");

    let entries = alice.handle.query(HistoryFilter::default()).await.unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].action, HistoryAction::Restore);
    assert_eq!(entries[0].restored_from, Some(first.id));
    assert!(entries.iter().all(|e| e.snapshot.is_none()));

    let kept = alice
        .handle
        .query(HistoryFilter {
            with_snapshots: true,
            ..HistoryFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(kept[2].snapshot.as_ref().map(|d| d.nodes.len()), Some(1));

    let info = alice.handle.info().await.unwrap();
    assert!(!info.can_undo);
    assert!(!info.can_redo);
}

#[tokio::test]
async fn test_broadcast_log_replays_to_room_state() {
    let (registry, _) = setup();
    let mut alice = enter(&registry, doc_key(), Some("t-alice")).await;
    let bob = enter(&registry, doc_key(), Some("t-bob")).await;

    alice.handle.emit(alice.id(), add("a", "A")).await.unwrap();
    bob.handle.emit(bob.id(), add("b", "B")).await.unwrap();
    bob.handle.emit(bob.id(), relabel("a", "A2")).await.unwrap();
    alice.handle.undo(alice.id()).await.unwrap();

    let mut log = Vec::new();
    for _ in 0..4 {
        log.push(alice.applied().await);
    }
    let seqs: Vec<u64> = log.iter().map(|op| op.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4]);

    let (doc, _) = alice.handle.snapshot().await.unwrap();
    assert_eq!(replay(&Document::new(), &log), doc);
    assert_eq!(doc.node(&"a".into()).map(|n| n.label.as_str()), Some("A"));
}

async fn start_server() -> (String, RoomRegistry, Arc<StaticAccessProvider>) {
    let (registry, access) = setup();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, registry.clone()));
    (format!("ws://{addr}"), registry, access)
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_clients_converge_over_websocket() {
    let (url, _, _) = start_server().await;
    let mut alice = TransportClient::new(ClientConfig::new(&url).with_token("t-alice"), doc_key());
    let mut bob = TransportClient::new(ClientConfig::new(&url).with_token("t-bob"), doc_key());

    let joined = alice.connect().await.unwrap();
    assert_eq!(joined.role, Role::Owner);
    bob.connect().await.unwrap();

    alice
        .emit_nodes(vec![
            NodeChange::Add {
                node: Node::new("n1", "hello"),
            },
            NodeChange::Add {
                node: Node::new("n2", "world"),
            },
        ])
        .unwrap();
    assert_eq!(alice.document().nodes.len(), 2);
    eventually(|| bob.document().nodes.len() == 2).await;
    eventually(|| alice.pending_count() == 0).await;

    bob.connect_nodes(Connection {
        id: None,
        source: "n1".into(),
        target: "n2".into(),
        source_handle: Some("right".into()),
        target_handle: Some("left".into()),
        label: None,
        style: Default::default(),
    })
    .unwrap();
    eventually(|| alice.document().edges.len() == 1).await;
    assert_eq!(alice.document().edges[0].id, bob.document().edges[0].id);

    let doc = alice.undo().await.unwrap();
    assert!(doc.edges.is_empty());
    eventually(|| bob.document().edges.is_empty()).await;
    eventually(|| bob.can_undo() && bob.can_redo()).await;

    let entries = bob.query_history(HistoryFilter::default()).await.unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].action, HistoryAction::Undo);

    alice.disconnect().await;
    bob.disconnect().await;
    assert!(!alice.is_connected());
}

#[tokio::test]
async fn test_client_join_errors_are_terminal() {
    let (url, _, _) = start_server().await;
    let failures = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let mut client = TransportClient::new(
        ClientConfig::new(&url),
        RoomKey::Document(DocumentId::new("secret")),
    );
    let seen = failures.clone();
    client.subscribe(move |event| {
        if let ClientEvent::JoinFailed(err) = event {
            seen.lock().push(err.code());
        }
    });

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, CollaborationError::AccessDenied(_)));
    assert_eq!(*failures.lock(), vec!["access_denied"]);
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_client_gives_up_after_retry_budget() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = ClientConfig::new(format!("ws://{addr}")).with_backoff(BackoffPolicy {
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(10),
        max_retries: Some(2),
    });
    let mut client = TransportClient::new(config, doc_key());
    let attempts = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let seen = attempts.clone();
    client.subscribe(move |event| {
        if let ClientEvent::Reconnecting { attempt } = event {
            seen.lock().push(*attempt);
        }
    });

    let err = client.connect().await.unwrap_err();
    assert_eq!(err, CollaborationError::ReconnectExhausted(2));
    assert_eq!(*attempts.lock(), vec![1, 2]);
}

#[tokio::test]
async fn test_revoked_client_stops() {
    let (url, registry, _) = start_server().await;
    let mut bob = TransportClient::new(ClientConfig::new(&url).with_token("t-bob"), doc_key());
    let revoked = Arc::new(parking_lot::Mutex::new(None));
    let seen = revoked.clone();
    bob.subscribe(move |event| {
        if let ClientEvent::AccessRevoked(reason) = event {
            *seen.lock() = Some(reason.clone());
        }
    });
    bob.connect().await.unwrap();

    let downgraded = DocumentAccess::new("doc", "alice")
        .with_collaborator("bob", Access::View)
        .with_sharing(SharingPolicy::View, Some("public-link"));
    registry.update_access(downgraded).await.unwrap();

    eventually(|| revoked.lock().is_some()).await;
    eventually(|| !bob.is_connected()).await;
}

/// TCP relay in front of a server, so tests can stall or sever client
/// connections.
struct Relay {
    url: String,
    frozen: Arc<AtomicBool>,
    links: Arc<parking_lot::Mutex<Vec<JoinHandle<()>>>>,
}

impl Relay {
    async fn start(upstream: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let frozen = Arc::new(AtomicBool::new(false));
        let links = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let (flag, tasks) = (frozen.clone(), links.clone());
        tokio::spawn(async move {
            while let Ok((client, _)) = listener.accept().await {
                let Ok(server) = TcpStream::connect(upstream).await else {
                    continue;
                };
                tasks.lock().push(tokio::spawn(pipe(client, server, flag.clone())));
            }
        });
        Self { url, frozen, links }
    }

    /// Client bytes are dropped until the next `cut`.
    fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    /// Closes every relayed connection; later ones pass through again.
    fn cut(&self) {
        for link in self.links.lock().drain(..) {
            link.abort();
        }
        self.frozen.store(false, Ordering::SeqCst);
    }
}

async fn pipe(client: TcpStream, server: TcpStream, frozen: Arc<AtomicBool>) {
    let (mut client_rx, mut client_tx) = client.into_split();
    let (mut server_rx, mut server_tx) = server.into_split();
    let upstream = async {
        let mut buf = [0u8; 4096];
        loop {
            let n = match client_rx.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if frozen.load(Ordering::SeqCst) {
                continue;
            }
            if server_tx.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
    };
    let downstream = tokio::io::copy(&mut server_rx, &mut client_tx);
    tokio::select! {
        _ = upstream => {}
        _ = downstream => {}
    }
}

#[tokio::test]
async fn test_client_rejoins_after_dropped_connection() {
    let (registry, _) = setup();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, registry.clone()));
    let relay = Relay::start(upstream).await;

    let config = ClientConfig::new(&relay.url)
        .with_token("t-alice")
        .with_backoff(BackoffPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            max_retries: Some(20),
        });
    let mut client = TransportClient::new(config, doc_key());
    let connects = Arc::new(AtomicUsize::new(0));
    let drops = Arc::new(AtomicUsize::new(0));
    let (joined, dropped) = (connects.clone(), drops.clone());
    client.subscribe(move |event| match event {
        ClientEvent::Connected(_) => {
            joined.fetch_add(1, Ordering::SeqCst);
        }
        ClientEvent::Disconnected => {
            dropped.fetch_add(1, Ordering::SeqCst);
        }
        _ => {}
    });

    client.connect().await.unwrap();
    client
        .emit_nodes(vec![NodeChange::Add {
            node: Node::new("n1", "kept"),
        }])
        .unwrap();
    eventually(|| client.pending_count() == 0).await;

    // This edit never reaches the server.
    relay.freeze();
    client
        .emit_nodes(vec![NodeChange::Add {
            node: Node::new("n2", "lost"),
        }])
        .unwrap();
    assert_eq!(client.pending_count(), 1);
    assert_eq!(client.document().nodes.len(), 2);

    relay.cut();
    eventually(|| connects.load(Ordering::SeqCst) == 2).await;
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert!(client.is_connected());
    assert_eq!(client.pending_count(), 0);

    let room = registry.room(&DocumentId::new("doc")).await.unwrap();
    let (doc, _) = room.snapshot().await.unwrap();
    assert_eq!(doc.nodes.len(), 1);
    assert_eq!(client.document(), doc);

    client.disconnect().await;
}
