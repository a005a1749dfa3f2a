//! Inter-group RPC client used by the Reconfiguration Driver to pull shards
//! from, and send garbage-collection notices to, groups that owned them
//! under a previous configuration.

use async_trait::async_trait;

use crate::errors::Result;
use crate::op::{Err, MigrationPayload};

/// Talks to one server of a group that may or may not still be reachable;
/// callers are expected to retry across `Config::servers_for_group`.
#[async_trait]
pub trait GroupClient: Send + Sync {
    /// Asks `server` for the frozen contents of `(num, shard)`. Returns
    /// `Ok(None)` for a clean `WrongGroup` reply (the server never held that
    /// shard at that config); network/transport failures are `Err(_)`.
    async fn get_migration(
        &self,
        server: &str,
        num: i64,
        shard: usize,
    ) -> Result<Option<MigrationPayload>>;

    /// Tells `server` it may discard `(num, shard)`. Transport failures are
    /// `Err(_)`; a reachable server always replies with one of
    /// `Ok | Deleting | WrongLeader`.
    async fn garbage_collect(&self, server: &str, num: i64, shard: usize) -> Result<Err>;
}
