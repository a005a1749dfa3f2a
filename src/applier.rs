//! The Log Applier: the single consumer of the consensus delivery channel,
//! and the only code path that ever mutates the [`crate::store::Store`].

use std::time::Duration;

use crate::consensus::{ApplyMsg, LogIndex};
use crate::op::LogEntry;
use crate::server::Replica;

/// How long the applier waits on an empty delivery channel before checking
/// `killed` again.
const POLL_FOR_SHUTDOWN: Duration = Duration::from_millis(200);

impl Replica {
    pub(crate) async fn run_applier(&self) {
        let rx = self.consensus.apply_channel();

        loop {
            if self.is_killed() {
                break;
            }

            let msg = match async_std::future::timeout(POLL_FOR_SHUTDOWN, rx.recv()).await {
                Ok(Ok(msg)) => msg,
                Ok(Err(_)) => break, // consensus module shut down its channel.
                Err(_) => continue,  // no entry within the poll window; recheck killed.
            };

            match msg {
                ApplyMsg::Command { index, entry } => self.apply_command(index, entry).await,
                ApplyMsg::Snapshot {
                    data,
                    last_included_index,
                } => self.apply_snapshot(data, last_included_index).await,
            }
        }

        log::debug!("group {} log applier stopped", self.gid);
    }

    async fn apply_command(&self, index: LogIndex, entry: LogEntry) {
        // Only a Request entry produces a waiter to signal; config/migration/gc
        // entries are fire-and-forget from the proposer's perspective.
        let signal = {
            let mut shared = self.shared.lock().await;
            match entry {
                LogEntry::Request(req) => {
                    let result = shared.store.apply_request(&req, index);
                    shared.channels.remove(&index).map(|sender| (sender, result))
                }
                LogEntry::Config(cfg) => {
                    shared.store.apply_config(cfg, index);
                    None
                }
                LogEntry::Migration(payload) => {
                    shared.store.apply_migration(payload, index);
                    None
                }
                LogEntry::GarbageCollection { num, shard } => {
                    shared.store.apply_garbage_collection(num, shard, index);
                    None
                }
            }
        };

        // Deliver only if we are still leader at the moment of apply: a
        // stepped-down leader's waiters are expected to time out instead.
        if let Some((sender, result)) = signal {
            let (_, is_leader) = self.consensus.get_state().await;
            if is_leader {
                // Non-blocking: at most one waiter per index, and it is
                // always ready to receive (capacity 1, registered just
                // before proposing).
                let _ = sender.try_send(result);
            }
        }
    }

    async fn apply_snapshot(&self, data: Vec<u8>, last_included_index: LogIndex) {
        let mut shared = self.shared.lock().await;
        if last_included_index > shared.store.last_applied() {
            if let Err(e) = shared.store.restore_from_snapshot(&data, last_included_index) {
                // Internal fault: a corrupt snapshot is unrecoverable.
                panic!("unable to decode persisted snapshot: {}", e);
            }
        }
    }
}
