mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::endpoints;
use fixtures::follower_config;
use fixtures::wait_until;
use fixtures::RecordingTransport;
use fixtures::Router;
use memlog::MemLog;
use memlog::MemNodeStore;
use memlog::MemStateMachine;
use memlog::StateMachineContents;
use pretty_assertions::assert_eq;
use raft_node::network::RpcEnvelope;
use raft_node::node::Entry;
use raft_node::node::EntryPayload;
use raft_node::node::InstallSnapshotRpc;
use raft_node::node::Node;
use raft_node::storage::StateMachine;
use raft_node::Config;
use raft_node::EntryMeta;
use raft_node::RoleName;

fn normal(index: u64, term: u64, data: &str) -> Entry {
    Entry {
        index,
        term,
        payload: EntryPayload::Normal(data.as_bytes().to_vec()),
    }
}

/// A fresh follower whose needed prefix was compacted away receives the
/// leader's snapshot in chunks, then the remaining log over AppendEntries.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn snapshot_streams_to_fresh_follower() -> Result<()> {
    fixtures::init_tracing();
    let router = Router::new();

    // Node 1's log is compacted through index 3; the snapshot carries the
    // state machine contents.
    let log1 = Arc::new(MemLog::new(1));
    log1.insert_entry(normal(1, 1, "c1")).await;
    log1.insert_entry(normal(2, 1, "c2")).await;
    log1.insert_entry(normal(3, 1, "c3")).await;
    let contents = StateMachineContents {
        last_applied: 3,
        commands: vec![b"c1".to_vec(), b"c2".to_vec(), b"c3".to_vec()],
    };
    let snapshot_bytes = serde_json::to_vec(&contents)?;
    log1.compact(3, snapshot_bytes.clone(), endpoints(&[1, 2])).await?;
    let sm1 = Arc::new(MemStateMachine::new());
    sm1.restore_snapshot(EntryMeta { term: 1, index: 3 }, &snapshot_bytes).await?;
    let store1 = Arc::new(MemNodeStore::with_state(1, None));

    // A small chunk size forces several InstallSnapshot round trips.
    let config = Arc::new(
        Config::build("test".into())
            .election_timeout(50, 100)
            .log_replication_interval(20)
            .min_replication_interval(10)
            .snapshot_data_length(16)
            .validate()?,
    );
    router.new_node(2, endpoints(&[1, 2]), follower_config()).await;
    let leader = router.new_node_with(1, endpoints(&[1, 2]), config, log1, store1, sm1).await;

    leader.wait(Some(Duration::from_secs(5))).role(RoleName::Leader, "n1").await?;
    // The new term's no-op lands at index 4 and commits once node 2 holds
    // it, which requires the snapshot to have landed first.
    router.wait(2, None).await.commit(4, "n2 catches up past the snapshot").await?;

    let sm2 = router.state_machine(2).await;
    assert_eq!(sm2.commands().await, vec![b"c1".to_vec(), b"c2".to_vec(), b"c3".to_vec()]);
    assert_eq!(sm2.last_applied().await, 3);

    let installed = router.log(2).await.snapshot().await.expect("no snapshot on node 2");
    assert_eq!(installed.last_included, EntryMeta { term: 1, index: 3 });
    assert_eq!(installed.data, snapshot_bytes);
    Ok(())
}

/// Follower-side chunk ingestion: a non-final chunk parks the stream, the
/// final chunk installs the snapshot and adopts its membership.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn install_snapshot_chunks_directly() -> Result<()> {
    fixtures::init_tracing();
    let transport = RecordingTransport::new();
    let log = Arc::new(MemLog::new(1));
    let store = Arc::new(MemNodeStore::new());
    let node = Node::new(1, follower_config(), endpoints(&[1, 2]), transport.clone(), log.clone(), store.clone());
    node.register_state_machine(Arc::new(MemStateMachine::new())).await;
    node.start()?;

    let chunk = |offset: u64, data: &[u8], done: bool| InstallSnapshotRpc {
        term: 1,
        leader_id: 2,
        last_included_index: 2,
        last_included_term: 1,
        last_config: endpoints(&[1, 2, 3]),
        offset,
        data: data.to_vec(),
        done,
    };

    node.ingress().install_snapshot(RpcEnvelope {
        source: 2,
        rpc: chunk(0, b"0123", false),
    });
    assert!(wait_until(|| transport.snapshot_replies().len() == 1, Duration::from_secs(2)).await);
    assert_eq!(transport.snapshot_replies()[0].term, 1);
    // Not installed yet.
    assert!(log.snapshot().await.is_none());

    node.ingress().install_snapshot(RpcEnvelope {
        source: 2,
        rpc: chunk(4, b"4567", true),
    });
    assert!(wait_until(|| transport.snapshot_replies().len() == 2, Duration::from_secs(2)).await);

    let installed = log.snapshot().await.expect("snapshot not installed");
    assert_eq!(installed.data, b"01234567".to_vec());
    assert_eq!(installed.last_included, EntryMeta { term: 1, index: 2 });

    let metrics = node.metrics().borrow().clone();
    assert_eq!(metrics.members, vec![1, 2, 3]);
    assert_eq!(metrics.commit_index, 2);
    assert_eq!(metrics.current_term, 1);
    Ok(())
}

/// A snapshot from a stale term is refused outright.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_term_snapshot_is_refused() -> Result<()> {
    fixtures::init_tracing();
    let transport = RecordingTransport::new();
    let log = Arc::new(MemLog::new(1));
    let store = Arc::new(MemNodeStore::with_state(5, None));
    let node = Node::new(1, follower_config(), endpoints(&[1, 2]), transport.clone(), log.clone(), store);
    node.start()?;

    node.ingress().install_snapshot(RpcEnvelope {
        source: 2,
        rpc: InstallSnapshotRpc {
            term: 3,
            leader_id: 2,
            last_included_index: 9,
            last_included_term: 3,
            last_config: endpoints(&[1, 2]),
            offset: 0,
            data: b"stale".to_vec(),
            done: true,
        },
    });
    assert!(wait_until(|| transport.snapshot_replies().len() == 1, Duration::from_secs(2)).await);
    assert_eq!(transport.snapshot_replies()[0].term, 5);
    assert!(log.snapshot().await.is_none());
    Ok(())
}
