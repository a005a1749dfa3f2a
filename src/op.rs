//! The entries that flow through the consensus log, and the outcomes the
//! applier hands back to whoever is waiting on them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::Config;

pub type ClientId = i64;
pub type Seq = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    Get,
    Put,
    Append,
}

/// A client-facing Get/Put/Append, tagged with the configuration the client
/// believed was active when it was issued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRequest {
    pub kind: RequestKind,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub client_id: ClientId,
    pub seq: Seq,
    pub cfg_num: i64,
}

/// Shard contents handed over from a previous owner, as received from a
/// `GetMigration` RPC reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationPayload {
    pub num: i64,
    pub shard: usize,
    pub data: HashMap<Vec<u8>, Vec<u8>>,
    pub seq: HashMap<ClientId, Seq>,
}

/// One entry appended to the consensus log. This is the `Op` of the original
/// lab's `rf.Start(op)`, split into a proper sum type instead of one struct
/// with every field optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogEntry {
    Request(ClientRequest),
    Config(Config),
    Migration(MigrationPayload),
    GarbageCollection { num: i64, shard: usize },
}

/// Error codes shared by the client-facing and inter-group RPCs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Err {
    Ok,
    NoKey,
    WrongGroup,
    WrongLeader,
    Deleting,
}

/// The result the applier produces for a `ClientRequest` entry, delivered to
/// whichever Request Handler is waiting on that log index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpResult {
    pub err: Err,
    pub value: Vec<u8>,
}

impl OpResult {
    pub fn ok() -> Self {
        OpResult {
            err: Err::Ok,
            value: Vec::new(),
        }
    }

    pub fn err(err: Err) -> Self {
        OpResult {
            err,
            value: Vec::new(),
        }
    }
}
