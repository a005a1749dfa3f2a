//! The Snapshotter: polls the consensus module's persisted-state size and,
//! once it crosses the configured threshold, hands over a fresh snapshot so
//! the log behind it can be compacted.

use crate::server::{Replica, SNAPSHOT_POLL};

impl Replica {
    pub(crate) async fn run_snapshotter(&self) {
        loop {
            if self.is_killed() {
                break;
            }
            async_std::task::sleep(SNAPSHOT_POLL).await;
            if self.is_killed() {
                break;
            }

            let size = self.consensus.get_raft_state_size().await;
            if (size as i64) < self.max_raft_state {
                continue;
            }

            let (data, last_applied) = {
                let shared = self.shared.lock().await;
                (shared.store.encode_snapshot(), shared.store.last_applied())
            };

            if let Err(e) = self.consensus.generate_snapshot(data, last_applied).await {
                log::warn!("group {} snapshot generation failed: {}", self.gid, e);
            }
        }
    }
}
