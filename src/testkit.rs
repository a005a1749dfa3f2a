//! In-process fakes for the three external collaborators this crate never
//! implements: consensus, the shard master, and inter-group RPC. Enough
//! behavior to drive a [`crate::Replica`] end to end without a network.

use async_std::channel::{self, Receiver, Sender};
use async_std::sync::Mutex;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Config;
use crate::consensus::{ApplyMsg, Consensus, LogIndex, StartResult, Term};
use crate::errors::*;
use crate::group_client::GroupClient;
use crate::master_client::ShardMasterClient;
use crate::op::{Err as OpErr, LogEntry, MigrationPayload};
use crate::server::Replica;

struct ConsensusState {
    log: Vec<LogEntry>,
    term: Term,
    is_leader: bool,
    state_size: usize,
    snapshot: Option<(Vec<u8>, LogIndex)>,
}

/// A single-replica stand-in for a real consensus module. Every proposal
/// commits immediately, in order, as long as `is_leader` is set; tests flip
/// it to simulate a step-down mid-request.
pub struct FakeConsensus {
    state: Mutex<ConsensusState>,
    sender: Sender<ApplyMsg>,
    receiver: Receiver<ApplyMsg>,
}

impl FakeConsensus {
    pub fn new() -> Arc<Self> {
        let (sender, receiver) = channel::unbounded();
        Arc::new(FakeConsensus {
            state: Mutex::new(ConsensusState {
                log: Vec::new(),
                term: 1,
                is_leader: true,
                state_size: 0,
                snapshot: None,
            }),
            sender,
            receiver,
        })
    }

    pub async fn set_leader(&self, is_leader: bool) {
        let mut state = self.state.lock().await;
        state.is_leader = is_leader;
        if is_leader {
            state.term += 1;
        }
    }

    /// Lets a test simulate raft log growth without proposing thousands of
    /// real entries, so the Snapshotter's threshold check can be exercised.
    pub async fn set_state_size(&self, size: usize) {
        self.state.lock().await.state_size = size;
    }

    pub async fn committed_len(&self) -> usize {
        self.state.lock().await.log.len()
    }
}

#[async_trait]
impl Consensus for FakeConsensus {
    async fn start(&self, entry: LogEntry) -> Result<StartResult> {
        let (index, term, is_leader) = {
            let mut state = self.state.lock().await;
            if !state.is_leader {
                return Ok(StartResult {
                    index: 0,
                    term: state.term,
                    is_leader: false,
                });
            }
            state.log.push(entry.clone());
            (state.log.len() as LogIndex, state.term, true)
        };

        self.sender
            .send(ApplyMsg::Command { index, entry })
            .await
            .map_err(|e| format_err!("fake consensus apply channel closed: {}", e))?;

        Ok(StartResult { index, term, is_leader })
    }

    async fn get_state(&self) -> (Term, bool) {
        let state = self.state.lock().await;
        (state.term, state.is_leader)
    }

    async fn get_raft_state_size(&self) -> usize {
        self.state.lock().await.state_size
    }

    async fn generate_snapshot(&self, data: Vec<u8>, last_included_index: LogIndex) -> Result<()> {
        let mut state = self.state.lock().await;
        state.snapshot = Some((data, last_included_index));
        state.state_size = 0;
        Ok(())
    }

    async fn get_snapshot(&self) -> Option<(Vec<u8>, LogIndex)> {
        self.state.lock().await.snapshot.clone()
    }

    fn apply_channel(&self) -> Receiver<ApplyMsg> {
        self.receiver.clone()
    }
}

/// Holds a sequence of published [`Config`]s, numbered from zero the way a
/// real shard master would.
pub struct FakeShardMaster {
    configs: Mutex<Vec<Config>>,
}

impl FakeShardMaster {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeShardMaster {
            configs: Mutex::new(vec![Config::bootstrap()]),
        })
    }

    /// Publishes the next config. Panics if `cfg.num` isn't the next one in
    /// sequence, since a real master never skips or reorders.
    pub async fn publish(&self, cfg: Config) {
        let mut configs = self.configs.lock().await;
        assert_eq!(cfg.num, configs.len() as i64, "configs must be published in order");
        configs.push(cfg);
    }
}

#[async_trait]
impl ShardMasterClient for FakeShardMaster {
    async fn query(&self, num: i64) -> Result<Config> {
        let configs = self.configs.lock().await;
        let idx = if num < 0 { configs.len() - 1 } else { num as usize };
        configs.get(idx).cloned().ok_or_else(|| err_msg!("no such config: {}", num))
    }
}

/// Routes inter-group RPCs to other [`Replica`]s registered under a server
/// name, in process, instead of over a real transport.
pub struct FakeGroupClient {
    registry: Mutex<HashMap<String, Arc<Replica>>>,
}

impl FakeGroupClient {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeGroupClient {
            registry: Mutex::new(HashMap::new()),
        })
    }

    pub async fn register(&self, server: &str, replica: Arc<Replica>) {
        self.registry.lock().await.insert(server.to_string(), replica);
    }
}

#[async_trait]
impl GroupClient for FakeGroupClient {
    async fn get_migration(&self, server: &str, num: i64, shard: usize) -> Result<Option<MigrationPayload>> {
        let replica = self.registry.lock().await.get(server).cloned();
        match replica {
            Some(r) => r.serve_get_migration(num, shard).await,
            None => Err(err_msg!("no such server: {}", server)),
        }
    }

    async fn garbage_collect(&self, server: &str, num: i64, shard: usize) -> Result<OpErr> {
        let replica = self.registry.lock().await.get(server).cloned();
        match replica {
            Some(r) => r.serve_garbage_collect(num, shard).await,
            None => Err(err_msg!("no such server: {}", server)),
        }
    }
}
