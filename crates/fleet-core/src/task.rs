use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ControlError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Pending,
    Sent,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Pending => "pending",
            TaskState::Sent => "sent",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }

    /// Terminal states never leave on their own; `failed` only via explicit retry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Cancelled)
    }

    pub fn can_transition(&self, to: TaskState) -> bool {
        matches!(
            (self, to),
            (TaskState::Queued, TaskState::Pending)
                | (TaskState::Pending, TaskState::Sent)
                | (TaskState::Pending, TaskState::Failed)
                | (TaskState::Pending, TaskState::Cancelled)
                | (TaskState::Sent, TaskState::Completed)
                | (TaskState::Sent, TaskState::Failed)
                | (TaskState::Sent, TaskState::Cancelled)
                | (TaskState::Failed, TaskState::Pending)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "queued" => Ok(TaskState::Queued),
            "pending" => Ok(TaskState::Pending),
            "sent" => Ok(TaskState::Sent),
            "completed" => Ok(TaskState::Completed),
            "failed" => Ok(TaskState::Failed),
            "cancelled" | "canceled" => Ok(TaskState::Cancelled),
            other => Err(format!("Unknown task state: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueInfo {
    pub state: TaskState,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: String,
    pub agent_identity: String,
    pub command: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    pub queue: QueueInfo,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<i64>,
}

impl Task {
    pub fn new(
        agent_identity: impl Into<String>,
        command: impl Into<String>,
        params: Value,
        original_command: Option<String>,
        platform: Option<String>,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            agent_identity: agent_identity.into(),
            command: command.into(),
            params,
            original_command,
            platform,
            queue: QueueInfo {
                state: TaskState::Pending,
                attempts: 0,
                reason: None,
                last_attempt_at: None,
            },
            created_at: Utc::now(),
            sent_at: None,
            completed_at: None,
            output: None,
            error_message: None,
            execution_time_ms: None,
        }
    }

    pub fn state(&self) -> TaskState {
        self.queue.state
    }

    fn transition(&mut self, to: TaskState) -> Result<(), ControlError> {
        if !self.queue.state.can_transition(to) {
            return Err(ControlError::InvalidStateTransition {
                from: self.queue.state,
                to,
            });
        }
        self.queue.state = to;
        Ok(())
    }

    /// A delivery attempt was submitted to the transport.
    pub fn mark_sent(&mut self, now: DateTime<Utc>) -> Result<(), ControlError> {
        self.transition(TaskState::Sent)?;
        self.sent_at = Some(now);
        self.queue.attempts += 1;
        self.queue.last_attempt_at = Some(now);
        self.queue.reason = None;
        Ok(())
    }

    /// Delivery could not be attempted or failed to submit; the task stays
    /// pending and records why. Never counts as an attempt.
    pub fn mark_queued(&mut self, reason: impl Into<String>) -> Result<(), ControlError> {
        if self.queue.state != TaskState::Pending {
            return Err(ControlError::InvalidStateTransition {
                from: self.queue.state,
                to: TaskState::Pending,
            });
        }
        self.queue.reason = Some(reason.into());
        Ok(())
    }

    pub fn complete(&mut self, output: Option<String>, now: DateTime<Utc>) -> Result<(), ControlError> {
        self.transition(TaskState::Completed)?;
        self.output = output;
        self.error_message = None;
        self.finish(now);
        Ok(())
    }

    pub fn fail(
        &mut self,
        error_message: impl Into<String>,
        output: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), ControlError> {
        self.transition(TaskState::Failed)?;
        self.output = output;
        self.error_message = Some(error_message.into());
        self.finish(now);
        Ok(())
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), ControlError> {
        self.transition(TaskState::Cancelled)?;
        self.completed_at = Some(now);
        self.queue.reason = Some("cancelled by operator".to_string());
        Ok(())
    }

    /// Watchdog expiry of a task stuck in `sent`. Same terminal shape as an
    /// agent-reported failure, with `reason` marking the timeout.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Result<(), ControlError> {
        self.fail("timeout", None, now)?;
        self.queue.reason = Some("timeout".to_string());
        Ok(())
    }

    pub fn retry(&mut self) -> Result<(), ControlError> {
        self.transition(TaskState::Pending)?;
        self.error_message = None;
        self.output = None;
        self.completed_at = None;
        self.execution_time_ms = None;
        self.queue.reason = None;
        Ok(())
    }

    fn finish(&mut self, now: DateTime<Utc>) {
        self.completed_at = Some(now);
        let started = self.sent_at.unwrap_or(self.created_at);
        let elapsed = (now - started).num_milliseconds().max(0);
        self.execution_time_ms = Some(elapsed);
    }
}
