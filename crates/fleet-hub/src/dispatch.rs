use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::state::Hub;
use fleet_core::{PeerRole, Task, WireMessage};
use fleet_store::StoreError;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryOutcome {
    Sent,
    Queued,
}

impl Hub {
    /// Attempts delivery of a pending task. An unreachable target is the
    /// expected queued-for-later path, not a failure; only an agent-reported
    /// execution error ever moves a task to `failed`.
    pub async fn dispatch(&self, task_id: &str) -> Result<(Task, DeliveryOutcome), StoreError> {
        let task = self.store.get(task_id)?;

        let handle = match self.registry.lookup(&task.agent_identity).await {
            Some(handle)
                if handle.role == PeerRole::Agent && self.liveness.is_online(&handle) =>
            {
                handle
            }
            _ => {
                debug!(
                    event = "dispatch_queued",
                    task_id = task_id,
                    identity = %task.agent_identity,
                    reason = "agent offline"
                );
                let task = self.store.mark_queued(task_id, "agent offline")?;
                self.broadcast_task_updated(&task).await;
                return Ok((task, DeliveryOutcome::Queued));
            }
        };

        let envelope = WireMessage::Command {
            cmd: "execute".to_string(),
            task_id: task.task_id.clone(),
            command: task.command.clone(),
            params: task.params.clone(),
            timestamp: Utc::now(),
        };

        match handle.send(&envelope).await {
            Ok(()) => {
                let task = self.store.mark_sent(task_id, Utc::now())?;
                info!(
                    event = "dispatch_sent",
                    task_id = task_id,
                    identity = %task.agent_identity,
                    attempts = task.queue.attempts
                );
                self.broadcast_task_updated(&task).await;
                Ok((task, DeliveryOutcome::Sent))
            }
            Err(err) => {
                // transmit errors are transient; the task stays retryable
                warn!(
                    event = "dispatch_send_failed",
                    task_id = task_id,
                    identity = %task.agent_identity,
                    error = %err
                );
                let task = self.store.mark_queued(task_id, "send failed")?;
                self.broadcast_task_updated(&task).await;
                Ok((task, DeliveryOutcome::Queued))
            }
        }
    }
}
