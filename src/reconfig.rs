//! The Reconfiguration Driver: three leader-only loops that pull the next
//! config, pull shards a new config assigned to this group, and garbage
//! collect shards once their previous owner has confirmed the handoff.

use crate::op::{Err as OpErr, LogEntry, MigrationPayload};
use crate::server::{Replica, DRIVER_TICK};
use std::collections::HashMap;

impl Replica {
    pub(crate) async fn run_config_puller(&self) {
        loop {
            if self.is_killed() {
                break;
            }
            async_std::task::sleep(DRIVER_TICK).await;
            if self.is_killed() {
                break;
            }

            let (_, is_leader) = self.consensus.get_state().await;
            if !is_leader {
                continue;
            }

            let (quiescent, next_num) = {
                let shared = self.shared.lock().await;
                (shared.store.is_quiescent(), shared.store.latest_config().num + 1)
            };

            // One reconfiguration finishes migrating shards in before the
            // next is pulled; garbage collection may still be lagging.
            if !quiescent {
                continue;
            }

            if let Ok(cfg) = self.master.query(next_num).await {
                if cfg.num == next_num {
                    let _ = self.consensus.start(LogEntry::Config(cfg)).await;
                }
            }
        }
    }

    pub(crate) async fn run_shard_puller(&self) {
        loop {
            if self.is_killed() {
                break;
            }
            async_std::task::sleep(DRIVER_TICK).await;
            if self.is_killed() {
                break;
            }

            let (_, is_leader) = self.consensus.get_state().await;
            if !is_leader {
                continue;
            }

            let (required, old_config) = {
                let shared = self.shared.lock().await;
                (shared.store.required_shards().clone(), shared.store.old_config().clone())
            };

            // One task per required shard, so a slow or unreachable previous
            // owner for one shard can't stall the rest; the batch is joined
            // before the next tick.
            let mut pulls = Vec::new();
            for shard in required {
                let source_gid = old_config.shards[shard];
                let old_config_num = old_config.num;
                let servers = old_config.servers_for_group(source_gid).to_vec();
                let consensus = self.consensus.clone();
                let group_client = self.group_client.clone();

                pulls.push(async_std::task::spawn(async move {
                    // No real previous owner: the shard was never assigned
                    // before, so there is nothing to fetch.
                    if source_gid == 0 {
                        let _ = consensus
                            .start(LogEntry::Migration(MigrationPayload {
                                num: old_config_num,
                                shard,
                                data: HashMap::new(),
                                seq: HashMap::new(),
                            }))
                            .await;
                        return;
                    }

                    for server in &servers {
                        match group_client.get_migration(server, old_config_num, shard).await {
                            Ok(Some(payload)) => {
                                let _ = consensus.start(LogEntry::Migration(payload)).await;
                                break;
                            }
                            Ok(None) | Err(_) => continue,
                        }
                    }
                }));
            }

            for pull in pulls {
                pull.await;
            }
        }
    }

    pub(crate) async fn run_gc_sender(&self) {
        loop {
            if self.is_killed() {
                break;
            }
            async_std::task::sleep(DRIVER_TICK).await;
            if self.is_killed() {
                break;
            }

            let (_, is_leader) = self.consensus.get_state().await;
            if !is_leader {
                continue;
            }

            let pending: Vec<(i64, usize)> = {
                let shared = self.shared.lock().await;
                shared
                    .store
                    .garbage_list()
                    .iter()
                    .flat_map(|(&num, shards)| shards.iter().map(move |&s| (num, s)))
                    .collect()
            };

            for (num, shard) in pending {
                let servers = {
                    let shared = self.shared.lock().await;
                    shared.store.config_at(num).map(|cfg| {
                        let gid = cfg.shards[shard];
                        cfg.servers_for_group(gid).to_vec()
                    })
                };

                let servers = match servers {
                    Some(s) => s,
                    None => continue,
                };

                for server in &servers {
                    match self.group_client.garbage_collect(server, num, shard).await {
                        // The old owner no longer holds this shard: we can
                        // stop reminding ourselves to ask about it.
                        Ok(OpErr::Ok) => {
                            let _ = self.consensus.start(LogEntry::GarbageCollection { num, shard }).await;
                            break;
                        }
                        // The old owner's leader has proposed dropping it but
                        // hasn't applied yet; stop retrying this tick and
                        // check again on the next one.
                        Ok(OpErr::Deleting) => break,
                        _ => continue,
                    }
                }
            }
        }
    }
}
