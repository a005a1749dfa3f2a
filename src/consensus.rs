//! The interface this replica requires of its consensus module. Raft itself
//! lives elsewhere; this crate is built only against the trait surface below
//! (and, under `testkit`, a fake single-replica implementation of it for
//! tests).

use async_std::channel::Receiver;
use async_trait::async_trait;

use crate::errors::Result;
use crate::op::LogEntry;

pub type Term = u64;
pub type LogIndex = u64;

/// Outcome of proposing an entry, mirroring Raft's `Start`: the index/term it
/// would occupy if this replica is (and remains) the leader, plus whether it
/// actually is the leader right now.
#[derive(Debug, Clone, Copy)]
pub struct StartResult {
    pub index: LogIndex,
    pub term: Term,
    pub is_leader: bool,
}

/// What the consensus module delivers to the Log Applier: either a committed
/// entry, or an installed snapshot that supersedes everything before it.
#[derive(Debug, Clone)]
pub enum ApplyMsg {
    Command {
        index: LogIndex,
        entry: LogEntry,
    },
    Snapshot {
        data: Vec<u8>,
        last_included_index: LogIndex,
    },
}

/// The consensus module's interface, as consumed by this replica. A real
/// implementation additionally owns RPC transport and on-disk persistence;
/// none of that is visible here.
#[async_trait]
pub trait Consensus: Send + Sync {
    /// Proposes `entry` for replication. Returns immediately; the entry (if
    /// ever committed) is later delivered through `apply_channel`.
    async fn start(&self, entry: LogEntry) -> Result<StartResult>;

    /// Current term and whether this replica believes itself to be leader.
    async fn get_state(&self) -> (Term, bool);

    /// Size in bytes of the consensus module's persisted state, used by the
    /// Snapshotter to decide when to compact.
    async fn get_raft_state_size(&self) -> usize;

    /// Hands a freshly produced snapshot to the consensus module for atomic
    /// state+snapshot persistence, discarding log entries up to and
    /// including `last_included_index`.
    async fn generate_snapshot(&self, data: Vec<u8>, last_included_index: LogIndex) -> Result<()>;

    /// The most recently persisted snapshot, if any, used on startup.
    async fn get_snapshot(&self) -> Option<(Vec<u8>, LogIndex)>;

    /// The channel through which committed entries and installed snapshots
    /// are delivered, one at a time, in log order.
    fn apply_channel(&self) -> Receiver<ApplyMsg>;
}
