use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};

use parley_core::{ClientFrame, UserId, UserRole};

use crate::registry::{ConnectionHandle, Outbound};
use crate::server::AppState;

/// RFC 6455 policy-violation close code; used for unknown identities at
/// handshake and for malformed inbound frames.
pub const POLICY_VIOLATION: u16 = 1008;

/// Drive one authenticated connection: register it, pump inbound events in
/// arrival order, and guarantee deregistration on every exit path — normal
/// close, transport error, supersession by a reconnect, or a protocol
/// violation.
pub async fn run(socket: WebSocket, identity: UserId, role: UserRole, state: AppState) {
    let (handle, mut rx) = ConnectionHandle::new(state.config.max_send_queue);
    let conn_id = handle.conn_id.clone();
    let cancel = handle.cancel_token();

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer: forwards queued frames to the transport, sends heartbeat
    // pings, honors close instructions. Ends when the channel closes, which
    // happens as soon as the registry entry is dropped.
    let heartbeat = state.config.heartbeat_interval;
    let writer_conn = conn_id.clone();
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(Outbound::Frame(text)) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        Some(Outbound::Close { code, reason }) => {
                            let _ = ws_tx
                                .send(WsMessage::Close(Some(CloseFrame {
                                    code,
                                    reason: reason.into(),
                                })))
                                .await;
                            break;
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(conn_id = %writer_conn, "sent ping");
                }
            }
        }
    });

    state.presence.connected(&identity, role, handle).await;

    // Inbound loop: events are processed strictly in arrival order, so
    // deliveries triggered here preserve this sender's submission order.
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(identity = %identity, conn_id = %conn_id, "session cancelled");
                break;
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(frame) => dispatch_frame(&identity, frame, &state).await,
                            Err(e) => {
                                tracing::warn!(
                                    identity = %identity,
                                    error = %e,
                                    "malformed inbound frame, closing connection"
                                );
                                state
                                    .registry
                                    .send_close(&identity, &conn_id, POLICY_VIOLATION, "malformed frame")
                                    .await;
                                break;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Pong(_))) => {
                        state.registry.record_pong(&identity, &conn_id);
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {} // axum answers pings itself; binary is ignored
                    Some(Err(e)) => {
                        tracing::debug!(identity = %identity, error = %e, "transport error");
                        break;
                    }
                }
            }
        }
    }

    // Mandatory cleanup. Conditional on this connection's identity: if a
    // reconnect superseded us, the replacement's entry stays untouched and
    // no offline event is announced.
    state.presence.disconnected(&identity, &conn_id).await;
    let _ = writer.await;
    tracing::debug!(identity = %identity, conn_id = %conn_id, "session ended");
}

async fn dispatch_frame(identity: &UserId, frame: ClientFrame, state: &AppState) {
    let result = match frame {
        ClientFrame::Message {
            conversation_id,
            content,
            message_type,
        } => {
            state
                .dispatcher
                .route_message(identity, conversation_id, &content, message_type)
                .await
        }
        ClientFrame::Read { conversation_id } => {
            state.coordinator.route_read(identity, conversation_id).await
        }
        ClientFrame::Typing {
            conversation_id,
            is_typing,
        } => {
            state
                .dispatcher
                .route_typing(identity, conversation_id, is_typing)
                .await
        }
    };

    // Storage failures are logged and surfaced no further; one bad event
    // must not end this loop, let alone anyone else's.
    if let Err(e) = result {
        tracing::error!(identity = %identity, error = %e, "event processing failed");
    }
}
