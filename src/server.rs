//! Wires the State Machine Store, Log Applier, Request Handler,
//! Reconfiguration Driver and Snapshotter together into one replica.

use async_std::channel::Sender;
use async_std::sync::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::GroupId;
use crate::consensus::{Consensus, LogIndex};
use crate::errors::*;
use crate::group_client::GroupClient;
use crate::master_client::ShardMasterClient;
use crate::op::OpResult;
use crate::store::Store;
use crate::task_bundle::TaskBundle;

/// Config puller / shard puller / GC sender tick interval.
pub(crate) const DRIVER_TICK: Duration = Duration::from_millis(50);
/// Snapshotter poll interval.
pub(crate) const SNAPSHOT_POLL: Duration = Duration::from_millis(20);
/// How long a Request Handler waits for its proposal to apply.
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_millis(800);

/// Everything protected by the single store-wide mutex: the SMS itself plus
/// the index→waiter registry. Never held across a consensus or RPC call.
pub(crate) struct Shared {
    pub store: Store,
    pub channels: HashMap<LogIndex, Sender<OpResult>>,
}

/// Parameters needed to construct a replica: this group's id, handles to its
/// collaborators, and the snapshot threshold.
pub struct ReplicaConfig {
    pub gid: GroupId,
    pub consensus: Arc<dyn Consensus>,
    pub master: Arc<dyn ShardMasterClient>,
    pub group_client: Arc<dyn GroupClient>,
    /// Bytes; `-1` disables snapshotting entirely.
    pub max_raft_state: i64,
}

/// One replica of one replication group.
pub struct Replica {
    pub(crate) gid: GroupId,
    pub(crate) shared: Mutex<Shared>,
    pub(crate) consensus: Arc<dyn Consensus>,
    pub(crate) master: Arc<dyn ShardMasterClient>,
    pub(crate) group_client: Arc<dyn GroupClient>,
    pub(crate) max_raft_state: i64,
    pub(crate) killed: AtomicBool,
}

impl Replica {
    /// Builds a replica and restores any persisted snapshot, but does not
    /// yet start its background tasks (see [`Replica::run`]).
    pub async fn new(config: ReplicaConfig) -> Result<Arc<Self>> {
        let mut store = Store::new(config.gid);

        if let Some((data, last_included_index)) = config.consensus.get_snapshot().await {
            store.restore_from_snapshot(&data, last_included_index)?;
        }

        Ok(Arc::new(Replica {
            gid: config.gid,
            shared: Mutex::new(Shared {
                store,
                channels: HashMap::new(),
            }),
            consensus: config.consensus,
            master: config.master,
            group_client: config.group_client,
            max_raft_state: config.max_raft_state,
            killed: AtomicBool::new(false),
        }))
    }

    /// Spawns the Log Applier, Reconfiguration Driver loops and Snapshotter,
    /// returning a bundle the caller can `.join()` on for clean shutdown.
    pub fn run(self: &Arc<Self>) -> TaskBundle {
        let mut bundle = TaskBundle::new();

        let applier = self.clone();
        bundle.add("log_applier", async move { applier.run_applier().await });

        let config_puller = self.clone();
        bundle.add("config_puller", async move { config_puller.run_config_puller().await });

        let shard_puller = self.clone();
        bundle.add("shard_puller", async move { shard_puller.run_shard_puller().await });

        let gc_sender = self.clone();
        bundle.add("gc_sender", async move { gc_sender.run_gc_sender().await });

        if self.max_raft_state != -1 {
            let snapshotter = self.clone();
            bundle.add("snapshotter", async move { snapshotter.run_snapshotter().await });
        }

        bundle
    }

    /// Requests that this replica's background loops exit. Outstanding
    /// Request Handler waiters are released only by their own timeout, not
    /// by this flag.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn gid(&self) -> GroupId {
        self.gid
    }

    /// Serves an inter-group `GetMigration` request: hands back this
    /// replica's frozen copy of `(num, shard)`, if it has one. Read-only and
    /// safe from any replica, leader or not, since the data was frozen at
    /// relinquish time and never mutates again until GC'd; no consensus
    /// entry is needed to serve it.
    pub async fn serve_get_migration(&self, num: i64, shard: usize) -> Result<Option<crate::op::MigrationPayload>> {
        let shared = self.shared.lock().await;
        Ok(shared.store.get_migration(num, shard))
    }

    /// Serves an inter-group garbage-collection notice: if this replica
    /// still has `(num, shard)` frozen, proposes that it be dropped.
    pub async fn serve_garbage_collect(&self, num: i64, shard: usize) -> Result<crate::op::Err> {
        use crate::op::Err as OpErr;

        let holds_it = {
            let shared = self.shared.lock().await;
            shared.store.holds_old_shard(num, shard)
        };

        if !holds_it {
            return Ok(OpErr::Ok);
        }

        let (_, is_leader) = self.consensus.get_state().await;
        if !is_leader {
            return Ok(OpErr::WrongLeader);
        }

        let _ = self.consensus.start(crate::op::LogEntry::GarbageCollection { num, shard }).await;
        Ok(OpErr::Deleting)
    }
}
