use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::hvnc::HvncSettings;
use crate::task::Task;

pub const MAX_ENVELOPE_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Agent,
    Admin,
}

impl PeerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerRole::Agent => "agent",
            PeerRole::Admin => "admin",
        }
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PeerRole {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "agent" => Ok(PeerRole::Agent),
            "admin" => Ok(PeerRole::Admin),
            other => Err(format!("Unknown peer role: {other}")),
        }
    }
}

/// Typed envelopes exchanged over the persistent connection. The `type` tag
/// is the wire discriminator; all other fields are flat on the object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    #[serde(alias = "agent_register")]
    Register {
        identity: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<PeerRole>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        platform: Option<String>,
        #[serde(default)]
        capabilities: Vec<String>,
    },
    RegisterAck {
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Heartbeat {
        identity: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<Value>,
    },
    HeartbeatAck,
    Command {
        cmd: String,
        #[serde(rename = "taskId")]
        task_id: String,
        command: String,
        #[serde(default)]
        params: Value,
        timestamp: DateTime<Utc>,
    },
    TaskCreated {
        task: Task,
        timestamp: DateTime<Utc>,
    },
    TaskUpdated {
        task: Task,
        timestamp: DateTime<Utc>,
    },
    Output {
        uuid: String,
        #[serde(rename = "taskId")]
        task_id: String,
        output: String,
        status: String,
        timestamp: DateTime<Utc>,
    },
    ConnectionStats {
        #[serde(rename = "agentCount")]
        agent_count: usize,
        #[serde(rename = "adminCount")]
        admin_count: usize,
        timestamp: DateTime<Utc>,
    },
    HvncStart {
        #[serde(rename = "sessionId")]
        session_id: String,
        settings: HvncSettings,
    },
    HvncStop {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    HvncFrame {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "frameData")]
        frame_data: String,
        #[serde(default, rename = "frameInfo", skip_serializing_if = "Option::is_none")]
        frame_info: Option<Value>,
    },
    HvncResponse {
        #[serde(rename = "sessionId")]
        session_id: String,
        status: String,
    },
}

/// Result report from an agent. Carries no `type` tag on the wire; it is
/// recognized by the presence of `taskId` when typed decoding fails.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    pub uuid: String,
    #[serde(rename = "taskId")]
    pub task_id: String,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, rename = "outputType", skip_serializing_if = "Option::is_none")]
    pub output_type: Option<String>,
    #[serde(default, rename = "fileData", skip_serializing_if = "Option::is_none")]
    pub file_data: Option<String>,
}

impl TaskResult {
    /// Permissive by protocol: only an explicit failure marker reads as
    /// failure, everything else (missing status included) reads as success.
    /// Strict mode inverts the default for absent or unrecognized statuses.
    pub fn is_failure(&self, strict: bool) -> bool {
        match self.status.as_deref().map(|s| s.trim().to_lowercase()) {
            Some(s) if matches!(s.as_str(), "error" | "failed" | "failure") => true,
            Some(s) if matches!(s.as_str(), "success" | "ok" | "completed") => false,
            Some(_) | None => strict,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Inbound {
    Message(WireMessage),
    Result(TaskResult),
}

pub fn decode_inbound(raw: &[u8]) -> Result<Inbound, serde_json::Error> {
    serde_json::from_slice(raw)
}

pub fn encode(message: &WireMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}
