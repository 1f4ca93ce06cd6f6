/// WebSocket front end: one task per connection, bridging frames to the
/// room the connection has joined.
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::{
    ClientMessage, CollaborationError, ErrorBody, Outbox, RequestReply, Result, RoomHandle,
    RoomRegistry, ServerMessage, SessionId, UndoDirection,
};

pub async fn serve(listener: TcpListener, registry: RoomRegistry) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Collaboration server listening on: {}", addr);
    }
    loop {
        let (stream, addr) = listener
            .accept()
            .await
            .map_err(|e| CollaborationError::TransientNetwork(e.to_string()))?;
        debug!("New connection from: {}", addr);
        tokio::spawn(handle_connection(stream, addr, registry.clone()));
    }
}

pub async fn handle_connection(stream: TcpStream, addr: SocketAddr, registry: RoomRegistry) {
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };
    info!("WebSocket connection established: {}", addr);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let (control_tx, mut control_rx) = mpsc::unbounded_channel::<Message>();

    // Writes room and reply messages; stops after a message that ends
    // the connection.
    let mut send_task = tokio::spawn(async move {
        loop {
            let (frame, closing) = tokio::select! {
                Some(msg) = rx.recv() => {
                    let closing = msg.closes_connection();
                    match msg.to_text() {
                        Ok(text) => (Message::Text(text), closing),
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    }
                }
                Some(frame) = control_rx.recv() => (frame, false),
                else => break,
            };
            if let Err(e) = ws_sender.send(frame).await {
                debug!("Failed to send message: {}", e);
                break;
            }
            if closing {
                let _ = ws_sender.send(Message::Close(None)).await;
                break;
            }
        }
    });

    let mut current: Option<(RoomHandle, SessionId)> = None;

    loop {
        let msg = tokio::select! {
            msg = ws_receiver.next() => msg,
            _ = &mut send_task => {
                debug!("Writer finished for {}", addr);
                break;
            }
        };
        let msg = match msg {
            Some(Ok(m)) => m,
            Some(Err(e)) => {
                debug!("Error receiving message from {}: {}", addr, e);
                break;
            }
            None => break,
        };

        match msg {
            Message::Text(text) => {
                if let Err(err) = handle_message(&text, &registry, &tx, &mut current).await {
                    debug!("Error handling message from {}: {}", addr, err);
                    let _ = tx.send(ServerMessage::error(&err));
                }
            }
            Message::Ping(data) => {
                let _ = control_tx.send(Message::Pong(data));
            }
            Message::Close(_) => {
                debug!("Client {} requested close", addr);
                break;
            }
            _ => {}
        }
    }

    // Implicit leave on disconnect.
    if let Some((handle, session_id)) = current.take() {
        let _ = handle.leave(session_id).await;
    }
    send_task.abort();
    info!("Connection closed: {}", addr);
}

fn joined(current: &Option<(RoomHandle, SessionId)>) -> Result<(&RoomHandle, SessionId)> {
    current
        .as_ref()
        .map(|(handle, session_id)| (handle, *session_id))
        .ok_or_else(|| CollaborationError::InvalidOp("not joined to a room".into()))
}

/// Handles one client frame. Errors are reported back to the client as
/// an `error` message by the caller.
pub async fn handle_message(
    text: &str,
    registry: &RoomRegistry,
    tx: &Outbox,
    current: &mut Option<(RoomHandle, SessionId)>,
) -> Result<()> {
    let msg = match ClientMessage::from_text(text) {
        Ok(msg) => msg,
        Err(err) => {
            // The sender rolls back an unreadable edit once it hears its id.
            let Some(operation_id) = ClientMessage::operation_id_of(text) else {
                return Err(err);
            };
            debug!(operation = %operation_id, error = %err, "unreadable operation");
            let _ = tx.send(ServerMessage::OpRejected {
                operation_id,
                error: ErrorBody::from(&CollaborationError::InvalidOp(err.to_string())),
                corrections: Vec::new(),
            });
            return Ok(());
        }
    };

    match msg {
        ClientMessage::Join { room, token } => {
            if let Some((handle, session_id)) = current.take() {
                let _ = handle.leave(session_id).await;
            }
            match registry.join(&room, token.as_deref(), tx.clone()).await {
                Ok((handle, snapshot)) => {
                    *current = Some((handle, snapshot.session_id));
                }
                Err(err) => {
                    info!(room = %room, error = %err, "join failed");
                    let _ = tx.send(ServerMessage::JoinError {
                        error: ErrorBody::from(&err),
                    });
                }
            }
        }
        ClientMessage::Leave => {
            if let Some((handle, session_id)) = current.take() {
                handle.leave(session_id).await?;
            }
        }
        ClientMessage::Ping => {
            let _ = tx.send(ServerMessage::Pong);
        }
        ClientMessage::Undo { request_id } => {
            step(current, tx, request_id, UndoDirection::Undo).await?;
        }
        ClientMessage::Redo { request_id } => {
            step(current, tx, request_id, UndoDirection::Redo).await?;
        }
        ClientMessage::Restore {
            request_id,
            history_id,
            snapshot,
        } => {
            let (handle, session_id) = joined(current)?;
            let result = handle.restore(session_id, history_id, snapshot).await;
            let _ = tx.send(ServerMessage::RestoreResult(RequestReply::new(
                request_id, result,
            )));
        }
        ClientMessage::Query { request_id, filter } => {
            let (handle, _) = joined(current)?;
            let entries = handle.query(filter).await?;
            let _ = tx.send(ServerMessage::HistoryEntries {
                request_id,
                entries,
            });
        }
        msg @ (ClientMessage::Announce { .. }
        | ClientMessage::Active { .. }
        | ClientMessage::Clear
        | ClientMessage::CursorMove { .. }) => {
            let (handle, session_id) = joined(current)?;
            if let Some(event) = msg.into_presence() {
                handle.presence(session_id, event)?;
            }
        }
        msg @ (ClientMessage::Nodes { .. }
        | ClientMessage::Edges { .. }
        | ClientMessage::Connect { .. }
        | ClientMessage::Viewport { .. }) => {
            let (handle, session_id) = joined(current)?;
            if let Some(operation) = msg.into_operation() {
                handle.emit(session_id, operation).await?;
            }
        }
    }

    Ok(())
}

async fn step(
    current: &Option<(RoomHandle, SessionId)>,
    tx: &Outbox,
    request_id: u64,
    direction: UndoDirection,
) -> Result<()> {
    let (handle, session_id) = joined(current)?;
    let result = handle.step(session_id, direction).await;
    let _ = tx.send(ServerMessage::UndoResult(RequestReply::new(request_id, result)));
    Ok(())
}
