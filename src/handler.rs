//! The Request Handler: the client-facing front door for Get/Put/Append.

use crate::op::{ClientRequest, Err as OpErr, LogEntry, RequestKind};
use crate::op::{ClientId, Seq};
use crate::server::{Replica, REQUEST_TIMEOUT};
use crate::shard::key2shard;

impl Replica {
    pub async fn get(&self, key: &[u8], client_id: ClientId, seq: Seq, cfg_num: i64) -> (OpErr, Vec<u8>) {
        self.handle_request(ClientRequest {
            kind: RequestKind::Get,
            key: key.to_vec(),
            value: Vec::new(),
            client_id,
            seq,
            cfg_num,
        })
        .await
    }

    pub async fn put(&self, key: &[u8], value: &[u8], client_id: ClientId, seq: Seq, cfg_num: i64) -> OpErr {
        self.put_append(RequestKind::Put, key, value, client_id, seq, cfg_num).await
    }

    pub async fn append(&self, key: &[u8], value: &[u8], client_id: ClientId, seq: Seq, cfg_num: i64) -> OpErr {
        self.put_append(RequestKind::Append, key, value, client_id, seq, cfg_num).await
    }

    async fn put_append(
        &self,
        kind: RequestKind,
        key: &[u8],
        value: &[u8],
        client_id: ClientId,
        seq: Seq,
        cfg_num: i64,
    ) -> OpErr {
        let (err, _) = self
            .handle_request(ClientRequest {
                kind,
                key: key.to_vec(),
                value: value.to_vec(),
                client_id,
                seq,
                cfg_num,
            })
            .await;
        err
    }

    /// Common Get/Put/Append path: leadership check, fast-path dedup/shard
    /// validation, then propose-and-wait through consensus.
    async fn handle_request(&self, req: ClientRequest) -> (OpErr, Vec<u8>) {
        let (_, is_leader) = self.consensus.get_state().await;
        if !is_leader {
            return (OpErr::WrongLeader, Vec::new());
        }

        let shard = key2shard(&req.key);

        // Fast path: avoids polluting the log with doomed proposals. Not
        // authoritative; the applier re-checks everything at apply time.
        {
            let shared = self.shared.lock().await;
            if req.cfg_num != shared.store.latest_config().num || !shared.store.available_shards().contains(&shard) {
                return (OpErr::WrongGroup, Vec::new());
            }

            if shared.store.is_duplicate(shard, req.client_id, req.seq) {
                return match req.kind {
                    RequestKind::Get => match shared.store.get_current(shard, &req.key) {
                        Some(v) => (OpErr::Ok, v.to_vec()),
                        None => (OpErr::NoKey, Vec::new()),
                    },
                    RequestKind::Put | RequestKind::Append => (OpErr::Ok, Vec::new()),
                };
            }
        }

        let start = match self.consensus.start(LogEntry::Request(req)).await {
            Ok(s) if s.is_leader => s,
            _ => return (OpErr::WrongLeader, Vec::new()),
        };

        let (tx, rx) = async_std::channel::bounded(1);
        {
            let mut shared = self.shared.lock().await;
            shared.channels.insert(start.index, tx);
        }

        let outcome = async_std::future::timeout(REQUEST_TIMEOUT, rx.recv()).await;

        // The waiter is responsible for removing its own registry entry,
        // whether it was delivered to or it timed out.
        {
            let mut shared = self.shared.lock().await;
            shared.channels.remove(&start.index);
        }

        match outcome {
            Ok(Ok(result)) => (result.err, result.value),
            _ => (OpErr::WrongLeader, Vec::new()),
        }
    }
}
