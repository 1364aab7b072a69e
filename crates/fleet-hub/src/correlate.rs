use chrono::Utc;
use tracing::{info, warn};

use crate::state::Hub;
use fleet_core::{TaskResult, WireMessage};
use fleet_store::StoreError;

impl Hub {
    /// Matches an inbound result to its open task and finalizes it. Results
    /// for unknown or already-terminal tasks are dropped; a stale report must
    /// never resurrect state.
    pub async fn on_result(&self, result: TaskResult) {
        let now = Utc::now();
        let output = result.result.clone();
        let failed = result.is_failure(self.config.strict_status);

        let updated = if failed {
            let error_message = result
                .status
                .clone()
                .unwrap_or_else(|| "agent reported failure".to_string());
            self.store
                .fail(&result.task_id, &error_message, output.clone(), now)
        } else {
            self.store.complete(&result.task_id, output.clone(), now)
        };

        let task = match updated {
            Ok(task) => task,
            Err(StoreError::NotFound(_)) => {
                warn!(
                    event = "result_dropped",
                    task_id = %result.task_id,
                    uuid = %result.uuid,
                    reason = "unknown task"
                );
                return;
            }
            Err(err) => {
                warn!(
                    event = "result_rejected",
                    task_id = %result.task_id,
                    uuid = %result.uuid,
                    error = %err
                );
                return;
            }
        };

        info!(
            event = "result_correlated",
            task_id = %task.task_id,
            identity = %task.agent_identity,
            state = %task.state(),
            execution_time_ms = task.execution_time_ms
        );

        self.broadcast_task_updated(&task).await;
        self.broadcast(&WireMessage::Output {
            uuid: result.uuid,
            task_id: result.task_id,
            output: output.unwrap_or_default(),
            status: result
                .status
                .unwrap_or_else(|| if failed { "failed" } else { "success" }.to_string()),
            timestamp: now,
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testutil::{connect, decode_text, test_hub};
    use fleet_core::{PeerRole, TaskState};
    use serde_json::json;

    fn result(task_id: &str, status: Option<&str>, output: Option<&str>) -> TaskResult {
        TaskResult {
            uuid: "a1".into(),
            task_id: task_id.into(),
            result: output.map(str::to_string),
            status: status.map(str::to_string),
            output_type: None,
            file_data: None,
        }
    }

    #[tokio::test]
    async fn success_result_completes_sent_task() {
        let hub = test_hub();
        let (_agent, _agent_rx) = connect(&hub, "a1", PeerRole::Agent, vec![]).await;
        let (_admin, mut admin_rx) = connect(&hub, "op-1", PeerRole::Admin, vec![]).await;

        let task = hub
            .store
            .create("a1", "get-processes", json!(null), None, None)
            .expect("create");
        hub.dispatch(&task.task_id).await.expect("dispatch");
        let _ = admin_rx.recv().await; // task_updated from dispatch

        hub.on_result(result(&task.task_id, Some("success"), Some("[...]"))).await;

        let loaded = hub.store.get(&task.task_id).expect("get");
        assert_eq!(loaded.state(), TaskState::Completed);
        assert_eq!(loaded.output.as_deref(), Some("[...]"));
        assert!(loaded.completed_at.is_some());
        assert!(loaded.execution_time_ms.unwrap() >= 0);

        match decode_text(admin_rx.recv().await.expect("event")) {
            WireMessage::TaskUpdated { task: updated, .. } => {
                assert_eq!(updated.state(), TaskState::Completed);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match decode_text(admin_rx.recv().await.expect("event")) {
            WireMessage::Output {
                uuid,
                task_id,
                output,
                status,
                ..
            } => {
                assert_eq!(uuid, "a1");
                assert_eq!(task_id, task.task_id);
                assert_eq!(output, "[...]");
                assert_eq!(status, "success");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn failure_marker_fails_the_task() {
        let hub = test_hub();
        let (_agent, _agent_rx) = connect(&hub, "a1", PeerRole::Agent, vec![]).await;
        let task = hub
            .store
            .create("a1", "get-processes", json!(null), None, None)
            .expect("create");
        hub.dispatch(&task.task_id).await.expect("dispatch");

        hub.on_result(result(&task.task_id, Some("error"), Some("access denied"))).await;

        let loaded = hub.store.get(&task.task_id).expect("get");
        assert_eq!(loaded.state(), TaskState::Failed);
        assert_eq!(loaded.error_message.as_deref(), Some("error"));
        assert_eq!(loaded.output.as_deref(), Some("access denied"));
    }

    #[tokio::test]
    async fn missing_status_reads_as_success_pinned() {
        let hub = test_hub();
        let (_agent, _agent_rx) = connect(&hub, "a1", PeerRole::Agent, vec![]).await;
        let task = hub
            .store
            .create("a1", "get-processes", json!(null), None, None)
            .expect("create");
        hub.dispatch(&task.task_id).await.expect("dispatch");

        hub.on_result(result(&task.task_id, None, Some("out"))).await;
        assert_eq!(
            hub.store.get(&task.task_id).expect("get").state(),
            TaskState::Completed
        );
    }

    #[tokio::test]
    async fn strict_mode_fails_missing_status() {
        let hub = {
            let mut config = crate::config::Config::default();
            config.strict_status = true;
            std::sync::Arc::new(crate::state::Hub::new(
                config,
                fleet_store::TaskStore::open_in_memory().expect("store"),
            ))
        };
        let (_agent, _agent_rx) = connect(&hub, "a1", PeerRole::Agent, vec![]).await;
        let task = hub
            .store
            .create("a1", "get-processes", json!(null), None, None)
            .expect("create");
        hub.dispatch(&task.task_id).await.expect("dispatch");

        hub.on_result(result(&task.task_id, None, None)).await;
        assert_eq!(
            hub.store.get(&task.task_id).expect("get").state(),
            TaskState::Failed
        );
    }

    #[tokio::test]
    async fn strict_failure_output_event_reports_failed_not_success() {
        let hub = {
            let mut config = crate::config::Config::default();
            config.strict_status = true;
            std::sync::Arc::new(crate::state::Hub::new(
                config,
                fleet_store::TaskStore::open_in_memory().expect("store"),
            ))
        };
        let (_agent, _agent_rx) = connect(&hub, "a1", PeerRole::Agent, vec![]).await;
        let (_admin, mut admin_rx) = connect(&hub, "op-1", PeerRole::Admin, vec![]).await;
        let task = hub
            .store
            .create("a1", "get-processes", json!(null), None, None)
            .expect("create");
        hub.dispatch(&task.task_id).await.expect("dispatch");
        let _ = admin_rx.recv().await; // task_updated from dispatch

        hub.on_result(result(&task.task_id, None, None)).await;
        assert_eq!(
            hub.store.get(&task.task_id).expect("get").state(),
            TaskState::Failed
        );

        let _ = admin_rx.recv().await; // task_updated from the failure
        match decode_text(admin_rx.recv().await.expect("event")) {
            WireMessage::Output { status, .. } => assert_eq!(status, "failed"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_task_result_is_dropped() {
        let hub = test_hub();
        hub.on_result(result("no-such-task", Some("success"), None)).await;
        assert!(hub.store.list(None, None).expect("list").is_empty());
    }

    #[tokio::test]
    async fn late_result_cannot_resurrect_terminal_task() {
        let hub = test_hub();
        let (_agent, _agent_rx) = connect(&hub, "a1", PeerRole::Agent, vec![]).await;
        let task = hub
            .store
            .create("a1", "get-processes", json!(null), None, None)
            .expect("create");
        hub.dispatch(&task.task_id).await.expect("dispatch");
        hub.store.cancel(&task.task_id, Utc::now()).expect("cancel");

        hub.on_result(result(&task.task_id, Some("success"), Some("late"))).await;
        let loaded = hub.store.get(&task.task_id).expect("get");
        assert_eq!(loaded.state(), TaskState::Cancelled);
        assert!(loaded.output.is_none());
    }
}
