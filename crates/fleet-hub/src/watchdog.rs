use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::state::Hub;

/// Optional sweep that fails tasks stuck in `sent` past the configured
/// timeout. The wire protocol itself never times out a sent task; this is
/// opt-in behavior layered on top, disabled unless --sent-timeout-seconds
/// is set.
pub fn spawn_sent_watchdog(hub: Arc<Hub>) {
    let Some(timeout) = hub.config.sent_timeout else {
        return;
    };
    let interval = (timeout / 2).max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            sweep(&hub, timeout).await;
        }
    });
}

async fn sweep(hub: &Hub, timeout: Duration) {
    let cutoff = Utc::now()
        - ChronoDuration::from_std(timeout).unwrap_or_else(|_| ChronoDuration::seconds(0));
    let stale = match hub.store.stale_sent_tasks(cutoff) {
        Ok(stale) => stale,
        Err(err) => {
            warn!(event = "watchdog_query_failed", error = %err);
            return;
        }
    };
    for task in stale {
        match hub.store.expire_sent(&task.task_id, Utc::now()) {
            Ok(expired) => {
                info!(
                    event = "sent_task_expired",
                    task_id = %expired.task_id,
                    identity = %expired.agent_identity
                );
                hub.broadcast_task_updated(&expired).await;
            }
            // lost the race against a result or cancel; nothing to do
            Err(err) => {
                warn!(event = "watchdog_expire_skipped", task_id = %task.task_id, error = %err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testutil::test_hub;
    use fleet_core::TaskState;
    use serde_json::json;

    #[tokio::test]
    async fn sweep_fails_only_stale_sent_tasks() {
        let hub = test_hub();
        let stale = hub
            .store
            .create("a1", "cmd", json!(null), None, None)
            .expect("create");
        let fresh = hub
            .store
            .create("a1", "cmd", json!(null), None, None)
            .expect("create");

        hub.store
            .mark_sent(&stale.task_id, Utc::now() - ChronoDuration::minutes(10))
            .expect("sent");
        hub.store.mark_sent(&fresh.task_id, Utc::now()).expect("sent");

        sweep(&hub, Duration::from_secs(60)).await;

        let expired = hub.store.get(&stale.task_id).expect("get");
        assert_eq!(expired.state(), TaskState::Failed);
        assert_eq!(expired.queue.reason.as_deref(), Some("timeout"));
        assert_eq!(
            hub.store.get(&fresh.task_id).expect("get").state(),
            TaskState::Sent
        );
    }
}
