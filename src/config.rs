//! The sharding configuration published by the external shard master.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::shard::N_SHARDS;

/// Identifies a replication group. `0` is reserved to mean "no group owns
/// this shard", matching the sentinel used by the bootstrap configuration.
pub type GroupId = u64;

/// A numbered, totally ordered mapping of shards to groups, plus the set of
/// server endpoints that make up each group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub num: i64,
    pub shards: Vec<GroupId>,
    pub groups: HashMap<GroupId, Vec<String>>,
}

impl Config {
    /// The empty configuration every replica starts with before the master
    /// has published anything. No group owns any shard under it.
    pub fn bootstrap() -> Self {
        Config {
            num: 0,
            shards: vec![0; N_SHARDS],
            groups: HashMap::new(),
        }
    }

    pub fn servers_for_group(&self, gid: GroupId) -> &[String] {
        self.groups.get(&gid).map(|v| v.as_slice()).unwrap_or(&[])
    }
}
