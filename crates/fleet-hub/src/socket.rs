use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::registry::ClientHandle;
use crate::state::Hub;
use fleet_core::{wire, Inbound, PeerRole, WireMessage, MAX_ENVELOPE_BYTES};

pub async fn handle_socket(hub: Arc<Hub>, socket: WebSocket, remote: SocketAddr) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(256);
    let write_timeout = hub.config.write_timeout;
    let write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match tokio::time::timeout(write_timeout, ws_sender.send(msg)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => return,
            }
        }
    });

    // The first envelope must be the registration handshake.
    let first = match ws_receiver.next().await {
        Some(Ok(msg)) => msg,
        _ => return,
    };
    let data = match message_bytes(first) {
        Some(bytes) => bytes,
        None => return,
    };
    if data.len() > MAX_ENVELOPE_BYTES {
        warn!(event = "register_too_large", remote = %remote, size = data.len());
        return;
    }

    let (identity, role, platform, capabilities) = match wire::decode_inbound(&data) {
        Ok(Inbound::Message(WireMessage::Register {
            identity,
            role,
            platform,
            capabilities,
        })) => (identity, role.unwrap_or(PeerRole::Agent), platform, capabilities),
        Ok(other) => {
            warn!(event = "expected_register", remote = %remote, got = ?other);
            return;
        }
        Err(err) => {
            warn!(event = "register_parse", remote = %remote, error = %err);
            return;
        }
    };
    if identity.trim().is_empty() {
        warn!(event = "register_missing_identity", remote = %remote);
        return;
    }

    let handle = Arc::new(ClientHandle::new(
        hub.registry.next_conn_id(),
        identity.clone(),
        role,
        platform,
        capabilities,
        tx.clone(),
    ));

    if let Some(replaced) = hub.registry.register(handle.clone()).await {
        // racing reconnect: the prior handle is stale, close it out
        replaced.close("replaced").await;
    }

    info!(
        event = "handshake_ok",
        identity = %identity,
        role = %role,
        conn_id = handle.conn_id,
        remote = %remote
    );

    if handle
        .send(&WireMessage::RegisterAck {
            accepted: true,
            reason: None,
        })
        .await
        .is_err()
    {
        hub.registry.unregister(&identity, handle.conn_id).await;
        return;
    }

    hub.broadcast_connection_stats().await;
    spawn_ping(hub.clone(), handle.clone());

    while let Some(result) = ws_receiver.next().await {
        let msg = match result {
            Ok(msg) => msg,
            Err(err) => {
                warn!(event = "read_error", identity = %identity, error = %err);
                break;
            }
        };
        let data = match msg {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(_) => {
                info!(event = "peer_close", identity = %identity);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                handle.touch();
                continue;
            }
        };
        if data.len() > MAX_ENVELOPE_BYTES {
            warn!(event = "message_too_large", identity = %identity, size = data.len());
            continue;
        }
        handle.touch();

        let inbound = match wire::decode_inbound(&data) {
            Ok(inbound) => inbound,
            Err(err) => {
                warn!(event = "message_invalid", identity = %identity, error = %err);
                continue;
            }
        };
        dispatch_inbound(&hub, &handle, inbound).await;
    }

    if hub.registry.unregister(&identity, handle.conn_id).await {
        if handle.role == PeerRole::Agent {
            hub.hvnc.clear_for_agent(&identity).await;
        }
        hub.broadcast_connection_stats().await;
    }
    drop(tx);
    let _ = write_task.await;
}

async fn dispatch_inbound(hub: &Hub, handle: &ClientHandle, inbound: Inbound) {
    match inbound {
        Inbound::Message(WireMessage::Heartbeat { identity, .. }) => {
            if identity != handle.identity {
                warn!(
                    event = "heartbeat_identity_mismatch",
                    expected = %handle.identity,
                    got = %identity
                );
                return;
            }
            handle.touch();
            let _ = handle.send(&WireMessage::HeartbeatAck).await;
        }
        Inbound::Result(result) => {
            if handle.role != PeerRole::Agent {
                warn!(event = "result_from_admin", identity = %handle.identity);
                return;
            }
            hub.on_result(result).await;
        }
        Inbound::Message(WireMessage::HvncFrame {
            frame_data,
            frame_info,
            ..
        }) => {
            if handle.role != PeerRole::Agent {
                warn!(event = "frame_from_admin", identity = %handle.identity);
                return;
            }
            hub.hvnc_frame(&handle.identity, frame_data, frame_info).await;
        }
        Inbound::Message(WireMessage::HvncResponse { session_id, status }) => {
            if handle.role != PeerRole::Agent {
                return;
            }
            hub.hvnc_response(&handle.identity, session_id, status).await;
        }
        Inbound::Message(WireMessage::Register { .. }) => {
            warn!(event = "unexpected_register", identity = %handle.identity);
        }
        Inbound::Message(other) => {
            debug!(
                event = "message_ignored",
                identity = %handle.identity,
                message = ?other
            );
        }
    }
}

fn spawn_ping(hub: Arc<Hub>, handle: Arc<ClientHandle>) {
    if hub.config.ping_interval.is_zero() {
        return;
    }
    let interval = hub.config.ping_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if handle.ping().await.is_err() {
                debug!(event = "ping_stopped", identity = %handle.identity);
                return;
            }
        }
    });
}

fn message_bytes(msg: Message) -> Option<Vec<u8>> {
    match msg {
        Message::Text(text) => Some(text.into_bytes()),
        Message::Binary(bytes) => Some(bytes),
        Message::Close(_) | Message::Ping(_) | Message::Pong(_) => None,
    }
}
