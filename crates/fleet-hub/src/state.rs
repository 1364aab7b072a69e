use chrono::Utc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::hvnc::HvncManager;
use crate::liveness::LivenessTracker;
use crate::registry::Registry;
use fleet_core::{PeerRole, Task, WireMessage};
use fleet_store::TaskStore;

/// Shared hub state, explicitly constructed and injected into every handler.
pub struct Hub {
    pub config: Config,
    pub registry: Registry,
    pub liveness: LivenessTracker,
    pub store: TaskStore,
    pub hvnc: HvncManager,
}

impl Hub {
    pub fn new(config: Config, store: TaskStore) -> Self {
        let liveness = LivenessTracker::new(std::time::Duration::from_secs(config.stale_seconds));
        Self {
            config,
            registry: Registry::new(),
            liveness,
            store,
            hvnc: HvncManager::new(),
        }
    }

    /// Fans an event out to every admin connection. A failed write to one
    /// recipient is logged and never aborts delivery to the rest.
    pub async fn broadcast(&self, message: &WireMessage) {
        for admin in self.registry.list_by_role(PeerRole::Admin).await {
            if !admin.send_event(message) {
                warn!(
                    event = "broadcast_drop",
                    identity = %admin.identity,
                    conn_id = admin.conn_id,
                    dropped = admin.dropped_events()
                );
            }
        }
    }

    pub async fn broadcast_task_created(&self, task: &Task) {
        self.broadcast(&WireMessage::TaskCreated {
            task: task.clone(),
            timestamp: Utc::now(),
        })
        .await;
    }

    pub async fn broadcast_task_updated(&self, task: &Task) {
        self.broadcast(&WireMessage::TaskUpdated {
            task: task.clone(),
            timestamp: Utc::now(),
        })
        .await;
    }

    pub async fn broadcast_connection_stats(&self) {
        let stats = self.registry.stats().await;
        debug!(
            event = "connection_stats",
            agents = stats.agent_count,
            admins = stats.admin_count
        );
        self.broadcast(&WireMessage::ConnectionStats {
            agent_count: stats.agent_count,
            admin_count: stats.admin_count,
            timestamp: Utc::now(),
        })
        .await;
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::registry::ClientHandle;
    use axum::extract::ws::Message;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    pub fn test_hub() -> Arc<Hub> {
        let store = TaskStore::open_in_memory().expect("open store");
        Arc::new(Hub::new(Config::default(), store))
    }

    pub async fn connect(
        hub: &Hub,
        identity: &str,
        role: PeerRole,
        capabilities: Vec<String>,
    ) -> (Arc<ClientHandle>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(32);
        let handle = Arc::new(ClientHandle::new(
            hub.registry.next_conn_id(),
            identity,
            role,
            None,
            capabilities,
            tx,
        ));
        hub.registry.register(handle.clone()).await;
        (handle, rx)
    }

    pub fn decode_text(message: Message) -> fleet_core::WireMessage {
        match message {
            Message::Text(text) => match fleet_core::wire::decode_inbound(text.as_bytes()) {
                Ok(fleet_core::Inbound::Message(decoded)) => decoded,
                other => panic!("unexpected inbound: {other:?}"),
            },
            other => panic!("unexpected ws message: {other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::{connect, decode_text, test_hub};
    use super::*;
    use axum::extract::ws::Message;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn broadcast_reaches_all_admins_and_skips_agents() {
        let hub = test_hub();
        let (_agent, mut agent_rx) = connect(&hub, "a1", PeerRole::Agent, vec![]).await;
        let (_op1, mut op1_rx) = connect(&hub, "op-1", PeerRole::Admin, vec![]).await;
        let (_op2, mut op2_rx) = connect(&hub, "op-2", PeerRole::Admin, vec![]).await;

        hub.broadcast_connection_stats().await;

        for rx in [&mut op1_rx, &mut op2_rx] {
            match decode_text(rx.recv().await.expect("event")) {
                WireMessage::ConnectionStats {
                    agent_count,
                    admin_count,
                    ..
                } => {
                    assert_eq!(agent_count, 1);
                    assert_eq!(admin_count, 2);
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(agent_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn one_dead_admin_does_not_abort_fanout() {
        let hub = test_hub();
        let (dead_tx, dead_rx) = mpsc::channel::<Message>(1);
        drop(dead_rx);
        let dead = std::sync::Arc::new(crate::registry::ClientHandle::new(
            hub.registry.next_conn_id(),
            "op-dead",
            PeerRole::Admin,
            None,
            vec![],
            dead_tx,
        ));
        hub.registry.register(dead).await;
        let (_live, mut live_rx) = connect(&hub, "op-live", PeerRole::Admin, vec![]).await;

        hub.broadcast_connection_stats().await;
        assert!(matches!(
            decode_text(live_rx.recv().await.expect("event")),
            WireMessage::ConnectionStats { .. }
        ));
    }
}
