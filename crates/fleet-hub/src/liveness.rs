use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::registry::ClientHandle;
use crate::state::Hub;
use fleet_core::PeerRole;

/// Derives online/offline from heartbeat recency. Dispatch consults this
/// before attempting delivery; the reaper closes lapsed connections.
#[derive(Clone, Copy, Debug)]
pub struct LivenessTracker {
    stale_window: Duration,
}

impl LivenessTracker {
    pub fn new(stale_window: Duration) -> Self {
        Self { stale_window }
    }

    pub fn is_online(&self, handle: &ClientHandle) -> bool {
        // a zero window disables staleness, same as it disables the reaper
        self.stale_window.is_zero() || handle.last_heartbeat().elapsed() <= self.stale_window
    }
}

pub fn spawn_stale_reaper(hub: Arc<Hub>) {
    if hub.config.stale_seconds == 0 {
        return;
    }
    let stale_after = Duration::from_secs(hub.config.stale_seconds);
    let interval = stale_after / 2;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        loop {
            ticker.tick().await;
            for role in [PeerRole::Agent, PeerRole::Admin] {
                for handle in hub.registry.list_by_role(role).await {
                    if handle.last_heartbeat().elapsed() > stale_after {
                        warn!(
                            event = "stale_close",
                            identity = %handle.identity,
                            conn_id = handle.conn_id
                        );
                        handle.close("stale").await;
                        if hub.registry.unregister(&handle.identity, handle.conn_id).await
                            && handle.role == PeerRole::Agent
                        {
                            hub.hvnc.clear_for_agent(&handle.identity).await;
                        }
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::PeerRole;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn zero_window_means_never_stale() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = ClientHandle::new(1, "a1", PeerRole::Agent, None, Vec::new(), tx);
        handle.touch();

        assert!(LivenessTracker::new(Duration::from_secs(30)).is_online(&handle));
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!LivenessTracker::new(Duration::from_nanos(1)).is_online(&handle));
        assert!(LivenessTracker::new(Duration::ZERO).is_online(&handle));
    }
}
