//! The State Machine Store (SMS): the sharded data model and the
//! deterministic mutations applied to it. Every method here is a pure
//! function of `(state, entry) -> state'`; the only caller is the Log
//! Applier, which guarantees entries arrive in consensus order.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::config::{Config, GroupId};
use crate::errors::*;
use crate::op::{ClientId, ClientRequest, Err as OpErr, MigrationPayload, OpResult, RequestKind, Seq};
use crate::shard::{key2shard, N_SHARDS};

/// Per-replica sharded key-value state plus everything needed to migrate
/// shards across reconfigurations. Mutated only by [`Store::apply_request`],
/// [`Store::apply_config`], [`Store::apply_migration`] and
/// [`Store::apply_garbage_collection`].
pub struct Store {
    gid: GroupId,

    db: Vec<HashMap<Vec<u8>, Vec<u8>>>,
    clients: Vec<HashMap<ClientId, Seq>>,

    configs: Vec<Config>,
    old_config: Config,

    available_shards: HashSet<usize>,
    required_shards: HashSet<usize>,

    old_shards: HashMap<i64, HashSet<usize>>,
    old_shards_data: HashMap<i64, HashMap<usize, HashMap<Vec<u8>, Vec<u8>>>>,
    old_shards_seq: HashMap<i64, HashMap<usize, HashMap<ClientId, Seq>>>,

    garbage_list: HashMap<i64, HashSet<usize>>,

    last_applied: u64,
}

/// The exact byte-equivalent encoding of a [`Store`], in the field order the
/// spec fixes for snapshots.
#[derive(Serialize, Deserialize)]
struct SnapshotState {
    db: Vec<HashMap<Vec<u8>, Vec<u8>>>,
    clients: Vec<HashMap<ClientId, Seq>>,
    configs: Vec<Config>,
    old_config: Config,
    available_shards: HashSet<usize>,
    old_shards: HashMap<i64, HashSet<usize>>,
    required_shards: HashSet<usize>,
    old_shards_data: HashMap<i64, HashMap<usize, HashMap<Vec<u8>, Vec<u8>>>>,
    old_shards_seq: HashMap<i64, HashMap<usize, HashMap<ClientId, Seq>>>,
    garbage_list: HashMap<i64, HashSet<usize>>,
}

impl Store {
    pub fn new(gid: GroupId) -> Self {
        Store {
            gid,
            db: (0..N_SHARDS).map(|_| HashMap::new()).collect(),
            clients: (0..N_SHARDS).map(|_| HashMap::new()).collect(),
            configs: vec![Config::bootstrap()],
            old_config: Config::bootstrap(),
            available_shards: HashSet::new(),
            required_shards: HashSet::new(),
            old_shards: HashMap::new(),
            old_shards_data: HashMap::new(),
            old_shards_seq: HashMap::new(),
            garbage_list: HashMap::new(),
            last_applied: 0,
        }
    }

    pub fn gid(&self) -> GroupId {
        self.gid
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub fn latest_config(&self) -> &Config {
        // There is always at least the bootstrap config.
        self.configs.last().unwrap()
    }

    pub fn old_config(&self) -> &Config {
        &self.old_config
    }

    /// The config with this number, if this replica has ever applied it.
    /// Configs are numbered contiguously from 0, so this is a direct index.
    pub fn config_at(&self, num: i64) -> Option<&Config> {
        if num < 0 {
            return None;
        }
        self.configs.get(num as usize)
    }

    pub fn available_shards(&self) -> &HashSet<usize> {
        &self.available_shards
    }

    pub fn required_shards(&self) -> &HashSet<usize> {
        &self.required_shards
    }

    pub fn is_quiescent(&self) -> bool {
        self.required_shards.is_empty()
    }

    pub fn garbage_list(&self) -> &HashMap<i64, HashSet<usize>> {
        &self.garbage_list
    }

    fn bump_last_applied(&mut self, index: u64) {
        if self.last_applied < index {
            self.last_applied = index;
        }
    }

    /// Whether `(client_id, seq)` on `shard` has already been applied,
    /// without touching `db`. Used both by the apply-time dedup check and by
    /// the Request Handler's non-authoritative fast path.
    pub fn is_duplicate(&self, shard: usize, client_id: ClientId, seq: Seq) -> bool {
        self.clients[shard].get(&client_id).is_some_and(|&s| s >= seq)
    }

    pub fn get_current(&self, shard: usize, key: &[u8]) -> Option<&[u8]> {
        self.db[shard].get(key).map(|v| v.as_slice())
    }

    /// Applies a committed `Get`/`Put`/`Append` entry. Always produces a
    /// result; the caller is responsible for routing it to the waiter (if
    /// any) registered for `index`.
    pub fn apply_request(&mut self, req: &ClientRequest, index: u64) -> OpResult {
        self.bump_last_applied(index);

        let shard = key2shard(&req.key);

        if !self.available_shards.contains(&shard) || req.cfg_num != self.latest_config().num {
            return OpResult::err(OpErr::WrongGroup);
        }

        if self.is_duplicate(shard, req.client_id, req.seq) {
            // Duplicate: never re-mutate. Get still needs a fresh read since
            // the value it should report was fixed at the time of the
            // original apply, which is exactly the current value because no
            // later write for this client could have raced past it.
            return match req.kind {
                RequestKind::Get => match self.db[shard].get(&req.key) {
                    Some(v) => OpResult {
                        err: OpErr::Ok,
                        value: v.clone(),
                    },
                    None => OpResult::err(OpErr::NoKey),
                },
                RequestKind::Put | RequestKind::Append => OpResult::ok(),
            };
        }

        let result = match req.kind {
            RequestKind::Put => {
                self.db[shard].insert(req.key.clone(), req.value.clone());
                OpResult::ok()
            }
            RequestKind::Append => {
                let entry = self.db[shard].entry(req.key.clone()).or_insert_with(Vec::new);
                entry.extend_from_slice(&req.value);
                OpResult::ok()
            }
            RequestKind::Get => match self.db[shard].get(&req.key) {
                Some(v) => OpResult {
                    err: OpErr::Ok,
                    value: v.clone(),
                },
                None => OpResult::err(OpErr::NoKey),
            },
        };

        self.clients[shard].insert(req.client_id, req.seq);
        result
    }

    /// Applies a committed `Config` entry. Returns whether it was accepted;
    /// a rejected config is a no-op beyond bumping `last_applied`.
    pub fn apply_config(&mut self, candidate: Config, index: u64) -> bool {
        self.bump_last_applied(index);

        if candidate.num != self.latest_config().num + 1 || !self.is_quiescent() {
            return false;
        }

        if candidate.num == 1 {
            self.available_shards = (0..N_SHARDS)
                .filter(|&s| candidate.shards[s] == self.gid)
                .collect();
            self.required_shards.clear();
            self.configs.push(candidate);
            return true;
        }

        self.old_config = self.latest_config().clone();
        let old_config_num = self.old_config.num;

        let mut new_available = HashSet::new();
        let mut new_required = HashSet::new();
        for s in 0..N_SHARDS {
            if candidate.shards[s] == self.gid {
                if self.available_shards.contains(&s) {
                    new_available.insert(s);
                } else {
                    new_required.insert(s);
                }
            }
        }

        // Shards we owned but no longer do get frozen for migration.
        let relinquished: Vec<usize> = self
            .available_shards
            .iter()
            .copied()
            .filter(|s| !new_available.contains(s))
            .collect();

        if !relinquished.is_empty() {
            let data_bucket = self.old_shards_data.entry(old_config_num).or_insert_with(HashMap::new);
            let seq_bucket = self.old_shards_seq.entry(old_config_num).or_insert_with(HashMap::new);
            let shard_set = self.old_shards.entry(old_config_num).or_insert_with(HashSet::new);

            for s in relinquished {
                data_bucket.insert(s, std::mem::take(&mut self.db[s]));
                seq_bucket.insert(s, std::mem::take(&mut self.clients[s]));
                shard_set.insert(s);
            }
        }

        self.available_shards = new_available;
        self.required_shards = new_required;
        self.configs.push(candidate);
        true
    }

    /// Applies a committed shard migration. Stale replies (for a config we
    /// have already moved past) are silently ignored.
    pub fn apply_migration(&mut self, payload: MigrationPayload, index: u64) {
        self.bump_last_applied(index);

        if payload.num != self.old_config.num {
            return;
        }

        self.required_shards.remove(&payload.shard);
        self.available_shards.insert(payload.shard);

        self.db[payload.shard] = payload.data;

        let clients = &mut self.clients[payload.shard];
        for (client_id, seq) in payload.seq {
            let slot = clients.entry(client_id).or_insert(0);
            if seq > *slot {
                *slot = seq;
            }
        }

        self.garbage_list
            .entry(payload.num)
            .or_insert_with(HashSet::new)
            .insert(payload.shard);
    }

    /// Applies a committed garbage-collection entry. Meaning depends on which
    /// side of the handoff this replica was on: the old owner drops its
    /// frozen copy of `(num, shard)`, the new owner stops reminding itself to
    /// ask for an ack. A `(num, shard)` this replica isn't tracking either
    /// way is a no-op.
    pub fn apply_garbage_collection(&mut self, num: i64, shard: usize, index: u64) {
        self.bump_last_applied(index);

        if let Some(set) = self.old_shards.get_mut(&num) {
            if set.remove(&shard) {
                if set.is_empty() {
                    self.old_shards.remove(&num);
                }
                if let Some(m) = self.old_shards_data.get_mut(&num) {
                    m.remove(&shard);
                    if m.is_empty() {
                        self.old_shards_data.remove(&num);
                    }
                }
                if let Some(m) = self.old_shards_seq.get_mut(&num) {
                    m.remove(&shard);
                    if m.is_empty() {
                        self.old_shards_seq.remove(&num);
                    }
                }
            }
        }

        if let Some(set) = self.garbage_list.get_mut(&num) {
            if set.remove(&shard) && set.is_empty() {
                self.garbage_list.remove(&num);
            }
        }
    }

    pub fn restore_from_snapshot(&mut self, data: &[u8], last_included_index: u64) -> Result<()> {
        let snap: SnapshotState = bincode::deserialize(data)
            .map_err(|e| format_err!("failed to decode state machine snapshot: {}", e))?;

        self.db = snap.db;
        self.clients = snap.clients;
        self.configs = snap.configs;
        self.old_config = snap.old_config;
        self.available_shards = snap.available_shards;
        self.old_shards = snap.old_shards;
        self.required_shards = snap.required_shards;
        self.old_shards_data = snap.old_shards_data;
        self.old_shards_seq = snap.old_shards_seq;
        self.garbage_list = snap.garbage_list;
        self.last_applied = last_included_index;
        Ok(())
    }

    /// Encodes the ten persisted fields in the fixed spec order. Restoring
    /// this elsewhere and re-encoding it must yield identical bytes.
    pub fn encode_snapshot(&self) -> Vec<u8> {
        let snap = SnapshotState {
            db: self.db.clone(),
            clients: self.clients.clone(),
            configs: self.configs.clone(),
            old_config: self.old_config.clone(),
            available_shards: self.available_shards.clone(),
            old_shards: self.old_shards.clone(),
            required_shards: self.required_shards.clone(),
            old_shards_data: self.old_shards_data.clone(),
            old_shards_seq: self.old_shards_seq.clone(),
            garbage_list: self.garbage_list.clone(),
        };
        // Only failure mode is an OOM-class allocator error, which we treat
        // the same way the rest of this crate treats internal faults: fatal.
        bincode::serialize(&snap).expect("state machine snapshot encoding is infallible")
    }

    /// Deep copy of a frozen shard, for serving `GetMigration`. `None` means
    /// this replica never held, or has already GC'd, `(num, shard)`.
    pub fn get_migration(&self, num: i64, shard: usize) -> Option<MigrationPayload> {
        if !self.old_shards.get(&num).map(|s| s.contains(&shard)).unwrap_or(false) {
            return None;
        }

        Some(MigrationPayload {
            num,
            shard,
            data: self
                .old_shards_data
                .get(&num)
                .and_then(|m| m.get(&shard))
                .cloned()
                .unwrap_or_default(),
            seq: self
                .old_shards_seq
                .get(&num)
                .and_then(|m| m.get(&shard))
                .cloned()
                .unwrap_or_default(),
        })
    }

    pub fn holds_old_shard(&self, num: i64, shard: usize) -> bool {
        self.old_shards.get(&num).map(|s| s.contains(&shard)).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::RequestKind;

    fn put(store: &mut Store, key: &str, value: &str, client: ClientId, seq: Seq, index: u64) -> OpResult {
        store.apply_request(
            &ClientRequest {
                kind: RequestKind::Put,
                key: key.as_bytes().to_vec(),
                value: value.as_bytes().to_vec(),
                client_id: client,
                seq,
                cfg_num: store.latest_config().num,
            },
            index,
        )
    }

    fn get(store: &mut Store, key: &str, client: ClientId, seq: Seq, index: u64) -> OpResult {
        store.apply_request(
            &ClientRequest {
                kind: RequestKind::Get,
                key: key.as_bytes().to_vec(),
                value: vec![],
                client_id: client,
                seq,
                cfg_num: store.latest_config().num,
            },
            index,
        )
    }

    fn own_everything(store: &mut Store) {
        let mut cfg = Config::bootstrap();
        cfg.num = 1;
        cfg.shards = vec![store.gid(); N_SHARDS];
        assert!(store.apply_config(cfg, 1));
    }

    #[test]
    fn wrong_group_before_any_config() {
        let mut store = Store::new(1);
        let res = put(&mut store, "a", "1", 7, 1, 1);
        assert_eq!(res.err, OpErr::WrongGroup);
    }

    #[test]
    fn put_then_get_roundtrip() {
        let mut store = Store::new(1);
        own_everything(&mut store);

        assert_eq!(put(&mut store, "a", "1", 7, 1, 2).err, OpErr::Ok);
        let res = get(&mut store, "a", 7, 2, 3);
        assert_eq!(res.err, OpErr::Ok);
        assert_eq!(res.value, b"1");
    }

    #[test]
    fn append_concatenates() {
        let mut store = Store::new(1);
        own_everything(&mut store);

        put(&mut store, "a", "x", 1, 1, 2);
        store.apply_request(
            &ClientRequest {
                kind: RequestKind::Append,
                key: b"a".to_vec(),
                value: b"y".to_vec(),
                client_id: 1,
                seq: 2,
                cfg_num: 1,
            },
            3,
        );
        assert_eq!(store.get_current(key2shard(b"a"), b"a"), Some(&b"xy"[..]));
    }

    #[test]
    fn duplicate_put_does_not_remutate() {
        let mut store = Store::new(1);
        own_everything(&mut store);

        put(&mut store, "a", "x", 1, 5, 2);
        // Same (client, seq) retried with a different value must be ignored.
        let res = put(&mut store, "a", "zzz", 1, 5, 3);
        assert_eq!(res.err, OpErr::Ok);
        assert_eq!(store.get_current(key2shard(b"a"), b"a"), Some(&b"x"[..]));
    }

    #[test]
    fn config_bump_requires_contiguity() {
        let mut store = Store::new(1);
        let mut cfg = Config::bootstrap();
        cfg.num = 2; // skips num=1
        assert!(!store.apply_config(cfg, 1));
        assert_eq!(store.latest_config().num, 0);
    }

    #[test]
    fn split_moves_relinquished_shard_into_old_shards() {
        let mut store = Store::new(1);
        own_everything(&mut store);
        put(&mut store, "a", "1", 1, 1, 2);

        let shard = key2shard(b"a");
        let mut cfg2 = Config::bootstrap();
        cfg2.num = 2;
        cfg2.shards = vec![1; N_SHARDS];
        cfg2.shards[shard] = 2; // hand this shard to group 2

        assert!(store.apply_config(cfg2, 3));
        assert!(!store.available_shards().contains(&shard));
        assert!(store.holds_old_shard(1, shard));
        let migration = store.get_migration(1, shard).unwrap();
        assert_eq!(migration.data.get(&b"a"[..].to_vec()), Some(&b"1".to_vec()));
    }

    #[test]
    fn migration_merges_seq_by_max() {
        let mut store = Store::new(2);
        // Pretend we are mid-migration from group 1's config 1.
        store.old_config = {
            let mut c = Config::bootstrap();
            c.num = 1;
            c
        };
        store.required_shards.insert(3);
        store.clients[3].insert(9, 10);

        let mut data = HashMap::new();
        data.insert(b"k".to_vec(), b"v".to_vec());
        let mut seq = HashMap::new();
        seq.insert(9, 4); // lower than what we already have
        seq.insert(11, 7);

        store.apply_migration(
            MigrationPayload {
                num: 1,
                shard: 3,
                data,
                seq,
            },
            5,
        );

        assert!(store.available_shards().contains(&3));
        assert!(!store.required_shards().contains(&3));
        assert_eq!(store.clients[3].get(&9), Some(&10));
        assert_eq!(store.clients[3].get(&11), Some(&7));
        assert!(store.garbage_list().get(&1).unwrap().contains(&3));
    }

    #[test]
    fn stale_migration_reply_is_ignored() {
        let mut store = Store::new(2);
        store.old_config = {
            let mut c = Config::bootstrap();
            c.num = 5;
            c
        };
        store.required_shards.insert(3);

        store.apply_migration(
            MigrationPayload {
                num: 4, // stale: we are on old_config 5 now
                shard: 3,
                data: HashMap::new(),
                seq: HashMap::new(),
            },
            1,
        );

        assert!(store.required_shards().contains(&3));
        assert!(!store.available_shards().contains(&3));
    }

    #[test]
    fn gc_of_already_collected_shard_is_a_noop() {
        let mut store = Store::new(1);
        store.apply_garbage_collection(1, 3, 1);
        assert!(!store.holds_old_shard(1, 3));
    }

    #[test]
    fn snapshot_roundtrip_is_byte_identical() {
        let mut store = Store::new(1);
        own_everything(&mut store);
        put(&mut store, "a", "1", 1, 1, 2);

        let encoded1 = store.encode_snapshot();

        let mut restored = Store::new(1);
        restored.restore_from_snapshot(&encoded1, store.last_applied()).unwrap();
        let encoded2 = restored.encode_snapshot();

        assert_eq!(encoded1, encoded2);
    }
}
