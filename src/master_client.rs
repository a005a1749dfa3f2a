//! Client interface to the external shard master. Out of scope for this
//! crate beyond the trait: a real implementation polls a master replica
//! group over RPC and retries across its members.

use async_trait::async_trait;

use crate::config::Config;
use crate::errors::Result;

/// Query a past or latest configuration. `num = -1` requests the latest.
#[async_trait]
pub trait ShardMasterClient: Send + Sync {
    async fn query(&self, num: i64) -> Result<Config>;
}
