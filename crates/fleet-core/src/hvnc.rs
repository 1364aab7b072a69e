use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HvncStatus {
    Starting,
    Active,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HvncSettings {
    #[serde(default = "default_quality")]
    pub quality: u8,
    #[serde(default = "default_fps")]
    pub fps: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,
}

fn default_quality() -> u8 {
    60
}

fn default_fps() -> u8 {
    10
}

impl Default for HvncSettings {
    fn default() -> Self {
        Self {
            quality: default_quality(),
            fps: default_fps(),
            compression: None,
        }
    }
}

/// One live desktop-stream session. At most one per agent; independent of the
/// task lifecycle.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HvncSession {
    pub session_id: String,
    pub agent_identity: String,
    pub quality: u8,
    pub fps: u8,
    pub status: HvncStatus,
    pub started_at: DateTime<Utc>,
}

impl HvncSession {
    pub fn new(agent_identity: impl Into<String>, settings: &HvncSettings) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            agent_identity: agent_identity.into(),
            quality: settings.quality,
            fps: settings.fps,
            status: HvncStatus::Starting,
            started_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_fill_defaults_from_sparse_json() {
        let settings: HvncSettings = serde_json::from_str("{}").expect("decode");
        assert_eq!(settings.quality, 60);
        assert_eq!(settings.fps, 10);
        assert!(settings.compression.is_none());
    }

    #[test]
    fn new_session_starts_in_starting() {
        let session = HvncSession::new("a1", &HvncSettings::default());
        assert_eq!(session.status, HvncStatus::Starting);
        assert_eq!(session.agent_identity, "a1");
        assert!(!session.session_id.is_empty());
    }
}
