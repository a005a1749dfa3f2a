//! End-to-end scenarios driven entirely through the public API and the
//! in-process fakes in `testkit`: no real consensus, shard master, or RPC
//! transport is ever involved.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use shardkv::testkit::{FakeConsensus, FakeGroupClient, FakeShardMaster};
use shardkv::{key2shard, Config, Consensus, Err, Replica, ReplicaConfig, N_SHARDS};

/// Polls `cond` until it's true or gives up. Every scenario here is built on
/// background loops ticking on their own schedule, so tests wait rather than
/// assume a fixed number of ticks.
async fn wait_until<F, Fut>(mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if cond().await {
            return;
        }
        async_std::task::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

fn owned_by(gid: u64) -> Vec<u64> {
    vec![gid; N_SHARDS]
}

#[async_std::test]
async fn bootstrap_assigns_shards_and_serves_requests() {
    let consensus = FakeConsensus::new();
    let master = FakeShardMaster::new();
    let group_client = FakeGroupClient::new();

    master
        .publish(Config {
            num: 1,
            shards: owned_by(1),
            groups: HashMap::new(),
        })
        .await;

    let replica = Replica::new(ReplicaConfig {
        gid: 1,
        consensus: consensus.clone(),
        master: master.clone(),
        group_client: group_client.clone(),
        max_raft_state: -1,
    })
    .await
    .unwrap();

    let bundle = replica.run();

    wait_until(|| async { consensus.committed_len().await >= 1 }).await;

    assert_eq!(replica.put(b"a", b"1", 1, 1, 1).await, Err::Ok);
    let (err, value) = replica.get(b"a", 1, 2, 1).await;
    assert_eq!(err, Err::Ok);
    assert_eq!(value, b"1");

    replica.kill();
    bundle.join().await;
}

#[async_std::test]
async fn client_retry_is_deduplicated_across_reconfiguration() {
    let consensus = FakeConsensus::new();
    let master = FakeShardMaster::new();
    let group_client = FakeGroupClient::new();

    master
        .publish(Config {
            num: 1,
            shards: owned_by(1),
            groups: HashMap::new(),
        })
        .await;

    let replica = Replica::new(ReplicaConfig {
        gid: 1,
        consensus: consensus.clone(),
        master: master.clone(),
        group_client: group_client.clone(),
        max_raft_state: -1,
    })
    .await
    .unwrap();
    let bundle = replica.run();

    wait_until(|| async { consensus.committed_len().await >= 1 }).await;

    assert_eq!(replica.put(b"a", b"first", 42, 1, 1).await, Err::Ok);
    // A client retry (same client_id, same seq) must not clobber the value.
    assert_eq!(replica.put(b"a", b"second", 42, 1, 1).await, Err::Ok);

    let (err, value) = replica.get(b"a", 42, 2, 1).await;
    assert_eq!(err, Err::Ok);
    assert_eq!(value, b"first");

    replica.kill();
    bundle.join().await;
}

#[async_std::test]
async fn split_migrates_shard_and_garbage_collects_old_owner() {
    let master = FakeShardMaster::new();
    let group_client = FakeGroupClient::new();
    let consensus1 = FakeConsensus::new();
    let consensus2 = FakeConsensus::new();

    let mut groups = HashMap::new();
    groups.insert(1, vec!["g1".to_string()]);
    groups.insert(2, vec!["g2".to_string()]);

    master
        .publish(Config {
            num: 1,
            shards: owned_by(1),
            groups: groups.clone(),
        })
        .await;

    let replica1 = Replica::new(ReplicaConfig {
        gid: 1,
        consensus: consensus1.clone(),
        master: master.clone(),
        group_client: group_client.clone(),
        max_raft_state: -1,
    })
    .await
    .unwrap();
    let replica2 = Replica::new(ReplicaConfig {
        gid: 2,
        consensus: consensus2.clone(),
        master: master.clone(),
        group_client: group_client.clone(),
        max_raft_state: -1,
    })
    .await
    .unwrap();

    group_client.register("g1", replica1.clone()).await;
    group_client.register("g2", replica2.clone()).await;

    let bundle1 = replica1.run();
    let bundle2 = replica2.run();

    wait_until(|| async { consensus1.committed_len().await >= 1 }).await;
    assert_eq!(replica1.put(b"a", b"1", 1, 1, 1).await, Err::Ok);

    let shard = key2shard(b"a");
    let mut shards2 = owned_by(1);
    shards2[shard] = 2;
    master
        .publish(Config {
            num: 2,
            shards: shards2,
            groups,
        })
        .await;

    // Group 2 pulls the shard from group 1 and can serve it directly.
    wait_until(|| async {
        let (err, value) = replica2.get(b"a", 1, 2, 2).await;
        err == Err::Ok && value == b"1"
    })
    .await;

    // Group 2's gc_sender eventually notifies group 1, which drops its
    // frozen copy.
    wait_until(|| async {
        matches!(replica1.serve_get_migration(1, shard).await, Ok(None))
    })
    .await;

    replica1.kill();
    replica2.kill();
    bundle1.join().await;
    bundle2.join().await;
}

#[async_std::test]
async fn leader_check_rejects_requests_up_front() {
    let consensus = FakeConsensus::new();
    let master = FakeShardMaster::new();
    let group_client = FakeGroupClient::new();

    master
        .publish(Config {
            num: 1,
            shards: owned_by(1),
            groups: HashMap::new(),
        })
        .await;

    let replica = Replica::new(ReplicaConfig {
        gid: 1,
        consensus: consensus.clone(),
        master: master.clone(),
        group_client: group_client.clone(),
        max_raft_state: -1,
    })
    .await
    .unwrap();
    let bundle = replica.run();

    wait_until(|| async { consensus.committed_len().await >= 1 }).await;
    assert_eq!(replica.put(b"a", b"1", 1, 1, 1).await, Err::Ok);

    consensus.set_leader(false).await;
    let (err, _) = replica.get(b"a", 1, 2, 1).await;
    assert_eq!(err, Err::WrongLeader);

    replica.kill();
    bundle.join().await;
}

#[async_std::test]
async fn snapshot_is_restored_on_a_fresh_replica_sharing_the_same_consensus() {
    let consensus = FakeConsensus::new();
    let master = FakeShardMaster::new();
    let group_client = FakeGroupClient::new();

    master
        .publish(Config {
            num: 1,
            shards: owned_by(1),
            groups: HashMap::new(),
        })
        .await;

    let replica = Replica::new(ReplicaConfig {
        gid: 1,
        consensus: consensus.clone(),
        master: master.clone(),
        group_client: group_client.clone(),
        max_raft_state: 1, // smallest possible threshold: snapshot on the next poll
    })
    .await
    .unwrap();
    let bundle = replica.run();

    wait_until(|| async { consensus.committed_len().await >= 1 }).await;
    assert_eq!(replica.put(b"a", b"1", 1, 1, 1).await, Err::Ok);

    consensus.set_state_size(1_000_000).await;
    wait_until(|| async { consensus.get_snapshot().await.is_some() }).await;

    replica.kill();
    bundle.join().await;

    let recovered = Replica::new(ReplicaConfig {
        gid: 1,
        consensus: consensus.clone(),
        master: master.clone(),
        group_client: group_client.clone(),
        max_raft_state: -1,
    })
    .await
    .unwrap();

    let (err, value) = recovered.get(b"a", 1, 2, 1).await;
    assert_eq!(err, Err::Ok);
    assert_eq!(value, b"1");
}
