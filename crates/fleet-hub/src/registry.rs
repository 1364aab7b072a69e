use axum::extract::ws::{CloseFrame, Message};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use fleet_core::{wire, ControlError, PeerRole, WireMessage};

/// Live handle to one registered peer. The sender feeds the connection's
/// writer task; `conn_id` distinguishes this handle from a replacement for
/// the same identity.
pub struct ClientHandle {
    pub conn_id: u64,
    pub identity: String,
    pub role: PeerRole,
    pub platform: Option<String>,
    pub capabilities: Vec<String>,
    pub registered_at: DateTime<Utc>,
    sender: mpsc::Sender<Message>,
    last_heartbeat: Mutex<Instant>,
    dropped_events: AtomicU64,
}

impl ClientHandle {
    pub fn new(
        conn_id: u64,
        identity: impl Into<String>,
        role: PeerRole,
        platform: Option<String>,
        capabilities: Vec<String>,
        sender: mpsc::Sender<Message>,
    ) -> Self {
        Self {
            conn_id,
            identity: identity.into(),
            role,
            platform,
            capabilities,
            registered_at: Utc::now(),
            sender,
            last_heartbeat: Mutex::new(Instant::now()),
            dropped_events: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        let mut last = self.last_heartbeat.lock().unwrap();
        *last = Instant::now();
    }

    pub fn last_heartbeat(&self) -> Instant {
        *self.last_heartbeat.lock().unwrap()
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    /// Blocking send for dispatch traffic; the outcome decides the task
    /// transition, so the caller must see the failure.
    pub async fn send(&self, message: &WireMessage) -> Result<(), ControlError> {
        let text = wire::encode(message)
            .map_err(|err| ControlError::TransportSendFailure(err.to_string()))?;
        self.sender
            .send(Message::Text(text))
            .await
            .map_err(|_| ControlError::TransportSendFailure("connection closed".to_string()))
    }

    /// Non-blocking send for broadcast traffic. A full or closed writer queue
    /// drops the event; a slow admin must never stall the hub.
    pub fn send_event(&self, message: &WireMessage) -> bool {
        let text = match wire::encode(message) {
            Ok(text) => text,
            Err(err) => {
                warn!(event = "encode_error", error = %err);
                return false;
            }
        };
        match self.sender.try_send(Message::Text(text)) {
            Ok(()) => true,
            Err(_) => {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    pub async fn ping(&self) -> Result<(), ControlError> {
        self.sender
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|_| ControlError::TransportSendFailure("connection closed".to_string()))
    }

    pub async fn close(&self, reason: &str) {
        let _ = self
            .sender
            .send(Message::Close(Some(CloseFrame {
                code: 1000,
                reason: reason.to_string().into(),
            })))
            .await;
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct RegistryStats {
    #[serde(rename = "agentCount")]
    pub agent_count: usize,
    #[serde(rename = "adminCount")]
    pub admin_count: usize,
}

/// In-memory map from peer identity to its single live connection. All
/// mutation goes through the one RwLock; replacement is last-writer-wins.
pub struct Registry {
    conn_counter: AtomicU64,
    peers: RwLock<HashMap<String, Arc<ClientHandle>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            conn_counter: AtomicU64::new(0),
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn next_conn_id(&self) -> u64 {
        self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Registers a handle, returning the replaced one if the identity was
    /// already connected. The caller is responsible for closing the loser.
    pub async fn register(&self, handle: Arc<ClientHandle>) -> Option<Arc<ClientHandle>> {
        let replaced = {
            let mut peers = self.peers.write().await;
            peers.insert(handle.identity.clone(), handle.clone())
        };
        info!(
            event = "peer_registered",
            identity = %handle.identity,
            role = %handle.role,
            conn_id = handle.conn_id,
            replaced = replaced.is_some()
        );
        replaced
    }

    pub async fn lookup(&self, identity: &str) -> Option<Arc<ClientHandle>> {
        self.peers.read().await.get(identity).cloned()
    }

    /// Idempotent; keyed by the conn_id captured at registration so the late
    /// close of a replaced socket cannot evict its replacement.
    pub async fn unregister(&self, identity: &str, conn_id: u64) -> bool {
        let mut peers = self.peers.write().await;
        match peers.get(identity) {
            Some(current) if current.conn_id == conn_id => {
                peers.remove(identity);
                drop(peers);
                info!(event = "peer_unregistered", identity = identity, conn_id = conn_id);
                true
            }
            Some(_) => {
                debug!(event = "unregister_stale", identity = identity, conn_id = conn_id);
                false
            }
            None => false,
        }
    }

    /// Snapshot copy; safe to iterate while peers connect and disconnect.
    pub async fn list_by_role(&self, role: PeerRole) -> Vec<Arc<ClientHandle>> {
        self.peers
            .read()
            .await
            .values()
            .filter(|handle| handle.role == role)
            .cloned()
            .collect()
    }

    pub async fn stats(&self) -> RegistryStats {
        let peers = self.peers.read().await;
        let agent_count = peers.values().filter(|h| h.role == PeerRole::Agent).count();
        RegistryStats {
            agent_count,
            admin_count: peers.len() - agent_count,
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
