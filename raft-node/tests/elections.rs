mod fixtures;

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use anyhow::Result;
use fixtures::endpoints;
use fixtures::follower_config;
use fixtures::leader_config;
use fixtures::standby_config;
use fixtures::wait_until;
use fixtures::RecordingTransport;
use fixtures::Router;
use memlog::HardState;
use memlog::MemLog;
use memlog::MemNodeStore;
use memlog::MemStateMachine;
use pretty_assertions::assert_eq;
use raft_node::metrics::RoleState;
use raft_node::network::RpcEnvelope;
use raft_node::node::AppendEntriesResult;
use raft_node::node::AppendEntriesRpc;
use raft_node::node::Entry;
use raft_node::node::EntryPayload;
use raft_node::node::Node;
use raft_node::node::VoteRpc;
use raft_node::RoleName;

fn heartbeat(term: u64, leader_id: u64) -> AppendEntriesRpc {
    AppendEntriesRpc {
        message_id: 0,
        term,
        leader_id,
        prev_log_index: 0,
        prev_log_term: 0,
        entries: vec![],
        leader_commit: 0,
    }
}

/// A standalone active node elects itself leader when its election timer
/// elapses, and commits its no-op entry unilaterally.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_node_election() -> Result<()> {
    fixtures::init_tracing();
    let router = Router::new();
    let node = router.new_node(1, endpoints(&[1]), leader_config()).await;

    node.wait(Some(Duration::from_secs(5))).role(RoleName::Leader, "n1").await?;
    let metrics = node.wait(Some(Duration::from_secs(5))).commit(1, "no-op committed").await?;
    assert_eq!(metrics.current_term, 1);
    assert_eq!(metrics.last_log_index, 1);

    let entry = router.log(1).await.entry(1).await.expect("missing no-op entry");
    assert_eq!(entry.term, 1);
    assert_eq!(entry.payload, EntryPayload::Blank);

    let hard_state = router.store(1).await.hard_state().await;
    assert_eq!(hard_state, HardState {
        term: 1,
        voted_for: Some(1),
    });
    Ok(())
}

/// A standalone standby node never starts an election.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn standby_node_never_campaigns() -> Result<()> {
    fixtures::init_tracing();
    let router = Router::new();
    let node = router.new_node(1, endpoints(&[1]), standby_config()).await;

    // Well past several election timeouts.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let metrics = node.metrics().borrow().clone();
    assert_eq!(metrics.role, RoleName::Follower);
    assert_eq!(metrics.current_term, 0);
    Ok(())
}

/// Three nodes: the quick one campaigns, wins both peer votes, appends its
/// no-op and commits it once a majority has replicated it.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_election_and_commit() -> Result<()> {
    fixtures::init_tracing();
    let router = Router::new();
    router.new_node(2, endpoints(&[1, 2, 3]), follower_config()).await;
    router.new_node(3, endpoints(&[1, 2, 3]), follower_config()).await;
    let leader = router.new_node(1, endpoints(&[1, 2, 3]), leader_config()).await;

    leader.wait(Some(Duration::from_secs(5))).role(RoleName::Leader, "n1").await?;
    let metrics = leader.wait(Some(Duration::from_secs(5))).commit(1, "no-op committed").await?;
    assert_eq!(metrics.current_term, 1);

    for id in &[2u64, 3] {
        let metrics = router.wait(*id, None).await.commit(1, "follower commit").await?;
        assert_eq!(metrics.role, RoleName::Follower);
        assert_eq!(metrics.current_term, 1);
        assert_eq!(metrics.current_leader, Some(1));
    }

    // Both peers durably hold the winner's term; a vote for anyone but the
    // winner is impossible.
    for id in &[2u64, 3] {
        let hard_state = router.store(*id).await.hard_state().await;
        assert_eq!(hard_state.term, 1);
        assert!(hard_state.voted_for == Some(1) || hard_state.voted_for.is_none());
    }
    Ok(())
}

/// One vote beyond half the group elects; exactly half does not.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn majority_two_of_three_elects() -> Result<()> {
    fixtures::init_tracing();
    let router = Router::new();
    router.new_node(2, endpoints(&[1, 2, 3]), follower_config()).await;
    router.new_node(3, endpoints(&[1, 2, 3]), follower_config()).await;
    router.isolate(3).await;
    let node = router.new_node(1, endpoints(&[1, 2, 3]), leader_config()).await;

    // Self-vote plus node 2: two of three is a majority.
    node.wait(Some(Duration::from_secs(5))).role(RoleName::Leader, "n1").await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_of_four_is_not_a_majority() -> Result<()> {
    fixtures::init_tracing();
    let router = Router::new();
    router.new_node(2, endpoints(&[1, 2, 3, 4]), follower_config()).await;
    router.new_node(3, endpoints(&[1, 2, 3, 4]), follower_config()).await;
    router.new_node(4, endpoints(&[1, 2, 3, 4]), follower_config()).await;
    router.isolate(3).await;
    router.isolate(4).await;
    let node = router.new_node(1, endpoints(&[1, 2, 3, 4]), leader_config()).await;

    // Self-vote plus node 2 is exactly half; the node keeps campaigning
    // through new terms without winning.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(router.leader().await, None);
    let metrics = node.metrics().borrow().clone();
    assert_eq!(metrics.role, RoleName::Candidate);
    assert!(metrics.current_term > 1, "kept campaigning through terms, got {}", metrics.current_term);
    Ok(())
}

/// A leader observing a higher term in an AppendEntries result steps down
/// to follower and durably clears its vote for the new term.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn higher_term_result_preempts_leader() -> Result<()> {
    fixtures::init_tracing();
    let router = Router::new();
    router.new_node(2, endpoints(&[1, 2]), follower_config()).await;
    let leader = router.new_node(1, endpoints(&[1, 2]), leader_config()).await;
    leader.wait(Some(Duration::from_secs(5))).role(RoleName::Leader, "n1").await?;

    let seen: Arc<StdMutex<Vec<RoleState>>> = Arc::new(StdMutex::new(Vec::new()));
    let seen_by_listener = seen.clone();
    leader.add_node_role_listener(move |state| {
        seen_by_listener.lock().unwrap().push(state.clone());
    })?;

    leader.ingress().append_entries_result(
        2,
        AppendEntriesResult {
            message_id: 0,
            term: 7,
            success: false,
        },
        heartbeat(1, 1),
    );

    // The step-down is observable through the listener even if the node
    // starts campaigning in a later term right after.
    let stepped_down = wait_until(
        || {
            seen.lock()
                .unwrap()
                .iter()
                .any(|state| state.role == RoleName::Follower && state.term == 7 && state.leader_id.is_none())
        },
        Duration::from_secs(5),
    )
    .await;
    assert!(stepped_down, "leader did not step down to follower at term 7");

    let history = router.store(1).await.history().await;
    assert!(
        history.contains(&HardState {
            term: 7,
            voted_for: None
        }),
        "expected (7, none) persisted, history: {:?}",
        history
    );
    Ok(())
}

/// A duplicate RequestVote from the same candidate in the same term yields
/// the same grant without touching the store again.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_vote_request_grants_once() -> Result<()> {
    fixtures::init_tracing();
    let transport = RecordingTransport::new();
    let log = Arc::new(MemLog::new(1));
    let store = Arc::new(MemNodeStore::new());
    let node = Node::new(1, follower_config(), endpoints(&[1, 2]), transport.clone(), log, store.clone());
    node.register_state_machine(Arc::new(MemStateMachine::new())).await;
    node.start()?;

    let rpc = VoteRpc {
        term: 1,
        candidate_id: 2,
        last_log_index: 0,
        last_log_term: 0,
    };
    node.ingress().request_vote(RpcEnvelope {
        source: 2,
        rpc: rpc.clone(),
    });
    assert!(wait_until(|| transport.vote_replies().len() == 1, Duration::from_secs(2)).await);
    node.ingress().request_vote(RpcEnvelope { source: 2, rpc });
    assert!(wait_until(|| transport.vote_replies().len() == 2, Duration::from_secs(2)).await);

    let replies = transport.vote_replies();
    assert!(replies[0].vote_granted && replies[1].vote_granted);
    assert_eq!(replies[0].term, 1);
    assert_eq!(replies[1].term, 1);

    // One durable write: the vote itself. The replay changed nothing.
    assert_eq!(store.write_count(), 1);
    assert_eq!(store.hard_state().await, HardState {
        term: 1,
        voted_for: Some(2),
    });
    Ok(())
}

/// A candidate whose log is older than ours gets no vote, but our term
/// still advances.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn vote_rejected_for_older_log() -> Result<()> {
    fixtures::init_tracing();
    let transport = RecordingTransport::new();
    let log = Arc::new(MemLog::new(1));
    log.insert_entry(Entry {
        index: 1,
        term: 2,
        payload: EntryPayload::Normal(b"x".to_vec()),
    })
    .await;
    let store = Arc::new(MemNodeStore::with_state(2, None));
    let node = Node::new(1, follower_config(), endpoints(&[1, 2]), transport.clone(), log, store.clone());
    node.start()?;

    node.ingress().request_vote(RpcEnvelope {
        source: 2,
        rpc: VoteRpc {
            term: 3,
            candidate_id: 2,
            last_log_index: 1,
            last_log_term: 1,
        },
    });
    assert!(wait_until(|| transport.vote_replies().len() == 1, Duration::from_secs(2)).await);

    let reply = &transport.vote_replies()[0];
    assert!(!reply.vote_granted);
    assert_eq!(reply.term, 3);
    assert_eq!(store.hard_state().await, HardState {
        term: 3,
        voted_for: None,
    });
    Ok(())
}

/// A vote request from outside the voting membership is rejected without
/// any durable state change.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn vote_rejected_for_non_member() -> Result<()> {
    fixtures::init_tracing();
    let transport = RecordingTransport::new();
    let log = Arc::new(MemLog::new(1));
    let store = Arc::new(MemNodeStore::new());
    let node = Node::new(1, follower_config(), endpoints(&[1, 2]), transport.clone(), log, store.clone());
    node.start()?;

    node.ingress().request_vote(RpcEnvelope {
        source: 5,
        rpc: VoteRpc {
            term: 9,
            candidate_id: 5,
            last_log_index: 10,
            last_log_term: 9,
        },
    });
    assert!(wait_until(|| transport.vote_replies().len() == 1, Duration::from_secs(2)).await);
    assert!(!transport.vote_replies()[0].vote_granted);
    assert_eq!(store.write_count(), 0);
    Ok(())
}

/// An AppendEntries at the candidate's own term resolves a split vote: the
/// candidate steps down behind the sender.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn candidate_steps_down_on_append_entries() -> Result<()> {
    fixtures::init_tracing();
    let transport = RecordingTransport::new();
    let log = Arc::new(MemLog::new(1));
    let store = Arc::new(MemNodeStore::new());
    let node = Node::new(1, leader_config(), endpoints(&[1, 2, 3]), transport.clone(), log, store.clone());
    node.start()?;

    // Wait for the first campaign.
    assert!(wait_until(|| !transport.sent_votes.lock().unwrap().is_empty(), Duration::from_secs(2)).await);

    // Keep offering a heartbeat at whatever term the node is in until it
    // yields; term churn between reads only delays acceptance.
    let metrics = node.metrics();
    let became_follower = wait_until(
        || {
            let m = metrics.borrow().clone();
            if m.role == RoleName::Follower && m.current_leader == Some(2) {
                return true;
            }
            node.ingress().append_entries(RpcEnvelope {
                source: 2,
                rpc: heartbeat(m.current_term, 2),
            });
            false
        },
        Duration::from_secs(5),
    )
    .await;
    assert!(became_follower, "candidate did not step down behind the heartbeat sender");
    Ok(())
}
