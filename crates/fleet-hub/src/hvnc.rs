use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::state::Hub;
use fleet_core::{ControlError, HvncSession, HvncSettings, HvncStatus, PeerRole, WireMessage};

pub const HVNC_CAPABILITY: &str = "hvnc";

/// One active desktop-stream session per agent, independent of task state.
pub struct HvncManager {
    sessions: RwLock<HashMap<String, HvncSession>>,
}

impl HvncManager {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn session_for(&self, agent_identity: &str) -> Option<HvncSession> {
        self.sessions.read().await.get(agent_identity).cloned()
    }

    pub async fn clear_for_agent(&self, agent_identity: &str) -> Option<HvncSession> {
        let removed = self.sessions.write().await.remove(agent_identity);
        if let Some(session) = &removed {
            info!(
                event = "hvnc_session_cleared",
                identity = agent_identity,
                session_id = %session.session_id
            );
        }
        removed
    }

    async fn insert(&self, session: HvncSession) {
        self.sessions
            .write()
            .await
            .insert(session.agent_identity.clone(), session);
    }

    async fn mark_active(&self, agent_identity: &str) {
        if let Some(session) = self.sessions.write().await.get_mut(agent_identity) {
            session.status = HvncStatus::Active;
        }
    }
}

impl Default for HvncManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    /// Starts a stream session: the agent must be online and advertise the
    /// hvnc capability. Replaces any prior session for the same agent.
    pub async fn hvnc_start(
        &self,
        agent_identity: &str,
        settings: HvncSettings,
    ) -> Result<HvncSession, ControlError> {
        let handle = self
            .registry
            .lookup(agent_identity)
            .await
            .filter(|h| h.role == PeerRole::Agent)
            .ok_or_else(|| ControlError::OfflineTarget(agent_identity.to_string()))?;
        if !self.liveness.is_online(&handle) {
            return Err(ControlError::OfflineTarget(agent_identity.to_string()));
        }
        if !handle.has_capability(HVNC_CAPABILITY) {
            return Err(ControlError::CapabilityUnsupported {
                identity: agent_identity.to_string(),
                capability: HVNC_CAPABILITY.to_string(),
            });
        }

        let session = HvncSession::new(agent_identity, &settings);
        handle
            .send(&WireMessage::HvncStart {
                session_id: session.session_id.clone(),
                settings,
            })
            .await?;

        info!(
            event = "hvnc_started",
            identity = agent_identity,
            session_id = %session.session_id
        );
        self.hvnc.insert(session.clone()).await;
        Ok(session)
    }

    /// Stops the session. Locally honored even when the agent is unreachable:
    /// the session is cleared regardless of whether the stop envelope lands.
    pub async fn hvnc_stop(&self, agent_identity: &str) -> Option<HvncSession> {
        let session = self.hvnc.clear_for_agent(agent_identity).await?;
        if let Some(handle) = self.registry.lookup(agent_identity).await {
            if let Err(err) = handle
                .send(&WireMessage::HvncStop {
                    session_id: session.session_id.clone(),
                })
                .await
            {
                warn!(
                    event = "hvnc_stop_send_failed",
                    identity = agent_identity,
                    error = %err
                );
            }
        }
        Some(session)
    }

    /// Best-effort frame relay to every admin; frames for agents without a
    /// session are dropped. No buffering beyond each admin's writer queue.
    pub async fn hvnc_frame(&self, agent_identity: &str, frame_data: String, frame_info: Option<Value>) {
        let Some(session) = self.hvnc.session_for(agent_identity).await else {
            debug!(event = "hvnc_frame_dropped", identity = agent_identity, reason = "no session");
            return;
        };
        self.broadcast(&WireMessage::HvncFrame {
            session_id: session.session_id,
            frame_data,
            frame_info,
        })
        .await;
    }

    pub async fn hvnc_response(&self, agent_identity: &str, session_id: String, status: String) {
        self.hvnc.mark_active(agent_identity).await;
        self.broadcast(&WireMessage::HvncResponse { session_id, status })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testutil::{connect, decode_text, test_hub};

    #[tokio::test]
    async fn start_requires_hvnc_capability() {
        let hub = test_hub();
        let (_agent, _rx) = connect(&hub, "a1", PeerRole::Agent, vec!["shell".into()]).await;

        let err = hub.hvnc_start("a1", HvncSettings::default()).await.unwrap_err();
        assert!(matches!(err, ControlError::CapabilityUnsupported { .. }));
        assert!(hub.hvnc.session_for("a1").await.is_none());
    }

    #[tokio::test]
    async fn start_requires_live_connection() {
        let hub = test_hub();
        let err = hub.hvnc_start("a1", HvncSettings::default()).await.unwrap_err();
        assert!(matches!(err, ControlError::OfflineTarget(_)));
    }

    #[tokio::test]
    async fn start_sends_envelope_and_tracks_session() {
        let hub = test_hub();
        let (_agent, mut agent_rx) =
            connect(&hub, "a1", PeerRole::Agent, vec![HVNC_CAPABILITY.into()]).await;

        let session = hub
            .hvnc_start("a1", HvncSettings { quality: 80, fps: 15, compression: None })
            .await
            .expect("start");
        assert_eq!(session.status, HvncStatus::Starting);

        match decode_text(agent_rx.recv().await.expect("envelope")) {
            WireMessage::HvncStart { session_id, settings } => {
                assert_eq!(session_id, session.session_id);
                assert_eq!(settings.quality, 80);
                assert_eq!(settings.fps, 15);
            }
            other => panic!("unexpected envelope: {other:?}"),
        }

        let tracked = hub.hvnc.session_for("a1").await.expect("session");
        assert_eq!(tracked.session_id, session.session_id);
    }

    #[tokio::test]
    async fn frames_relay_to_admins_tagged_with_session() {
        let hub = test_hub();
        let (_agent, _agent_rx) =
            connect(&hub, "a1", PeerRole::Agent, vec![HVNC_CAPABILITY.into()]).await;
        let (_admin, mut admin_rx) = connect(&hub, "op-1", PeerRole::Admin, vec![]).await;
        let session = hub.hvnc_start("a1", HvncSettings::default()).await.expect("start");

        hub.hvnc_frame("a1", "base64-frame".into(), None).await;
        match decode_text(admin_rx.recv().await.expect("frame")) {
            WireMessage::HvncFrame { session_id, frame_data, .. } => {
                assert_eq!(session_id, session.session_id);
                assert_eq!(frame_data, "base64-frame");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn frames_without_session_are_dropped() {
        let hub = test_hub();
        let (_admin, mut admin_rx) = connect(&hub, "op-1", PeerRole::Admin, vec![]).await;
        hub.hvnc_frame("a1", "frame".into(), None).await;
        assert!(admin_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stop_clears_session_even_when_agent_unreachable() {
        let hub = test_hub();
        let (agent, agent_rx) =
            connect(&hub, "a1", PeerRole::Agent, vec![HVNC_CAPABILITY.into()]).await;
        let session = hub.hvnc_start("a1", HvncSettings::default()).await.expect("start");

        drop(agent_rx); // agent writer gone; stop envelope cannot land
        let stopped = hub.hvnc_stop("a1").await.expect("stopped");
        assert_eq!(stopped.session_id, session.session_id);
        assert!(hub.hvnc.session_for("a1").await.is_none());

        // second stop is a no-op
        assert!(hub.hvnc_stop("a1").await.is_none());
        let _ = agent;
    }

    #[tokio::test]
    async fn response_marks_session_active() {
        let hub = test_hub();
        let (_agent, _agent_rx) =
            connect(&hub, "a1", PeerRole::Agent, vec![HVNC_CAPABILITY.into()]).await;
        let session = hub.hvnc_start("a1", HvncSettings::default()).await.expect("start");

        hub.hvnc_response("a1", session.session_id.clone(), "ok".into()).await;
        let tracked = hub.hvnc.session_for("a1").await.expect("session");
        assert_eq!(tracked.status, HvncStatus::Active);
    }
}
