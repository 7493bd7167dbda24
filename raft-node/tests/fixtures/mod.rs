//! Fixtures for testing the node.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use maplit::btreeset;
use memlog::MemLog;
use memlog::MemNodeStore;
use memlog::MemStateMachine;
use raft_node::async_trait::async_trait;
use raft_node::metrics::Wait;
use raft_node::network::RpcEnvelope;
use raft_node::network::Transport;
use raft_node::node::AppendEntriesResult;
use raft_node::node::AppendEntriesRpc;
use raft_node::node::InstallSnapshotResult;
use raft_node::node::InstallSnapshotRpc;
use raft_node::node::NodeIngress;
use raft_node::node::VoteResult;
use raft_node::node::VoteRpc;
use raft_node::Config;
use raft_node::Endpoint;
use raft_node::Node;
use raft_node::NodeId;
use raft_node::NodeMode;
use raft_node::RoleName;
use tokio::sync::RwLock;
use tracing_subscriber::prelude::*;

/// A concrete node type used during testing.
pub type MemNode = Node<RouterTransport, MemLog, MemNodeStore>;

/// A node type whose transport records instead of routing, for driving
/// handlers directly.
pub type RecordingNode = Node<RecordingTransport, MemLog, MemNodeStore>;

/// Initialize the tracing system. Safe to call from every test.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default().with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// A config with quick elections, for the node expected to take leadership.
pub fn leader_config() -> Arc<Config> {
    Arc::new(
        Config::build("test".into())
            .election_timeout(50, 100)
            .log_replication_interval(20)
            .min_replication_interval(10)
            .previous_group_config_change_timeout(300)
            .catch_up_timeout(3000)
            .validate()
            .expect("failed to build config"),
    )
}

/// A config whose election timeouts are far beyond test duration, for nodes
/// which must never campaign on their own.
pub fn follower_config() -> Arc<Config> {
    Arc::new(
        Config::build("test".into())
            .election_timeout(10_000, 20_000)
            .log_replication_interval(20)
            .min_replication_interval(10)
            .validate()
            .expect("failed to build config"),
    )
}

/// A standby config: never campaigns even when alone.
pub fn standby_config() -> Arc<Config> {
    Arc::new(
        Config::build("test".into())
            .election_timeout(50, 100)
            .log_replication_interval(20)
            .min_replication_interval(10)
            .mode(NodeMode::Standby)
            .validate()
            .expect("failed to build config"),
    )
}

/// A config with the given election timeout bounds and quick replication.
pub fn election_config(min: u64, max: u64) -> Arc<Config> {
    Arc::new(
        Config::build("test".into())
            .election_timeout(min, max)
            .log_replication_interval(20)
            .min_replication_interval(10)
            .validate()
            .expect("failed to build config"),
    )
}

pub fn endpoints(ids: &[NodeId]) -> Vec<Endpoint> {
    ids.iter().map(|id| Endpoint::new(*id, format!("mem://{}", id))).collect()
}

pub struct NodeHandles {
    pub node: MemNode,
    pub log: Arc<MemLog>,
    pub store: Arc<MemNodeStore>,
    pub state_machine: Arc<MemStateMachine>,
}

/// A type which emulates a network transport, routing messages between the
/// registered nodes in-process.
#[derive(Default)]
pub struct Router {
    routing_table: RwLock<BTreeMap<NodeId, NodeHandles>>,
    ingresses: RwLock<BTreeMap<NodeId, NodeIngress>>,
    /// Nodes which are isolated can neither send nor receive frames.
    isolated: RwLock<HashSet<NodeId>>,
}

impl Router {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create, register and start a node with fresh storage.
    pub async fn new_node(self: &Arc<Self>, id: NodeId, group: Vec<Endpoint>, config: Arc<Config>) -> MemNode {
        let log = Arc::new(MemLog::new(id));
        let store = Arc::new(MemNodeStore::new());
        let state_machine = Arc::new(MemStateMachine::new());
        self.new_node_with(id, group, config, log, store, state_machine).await
    }

    /// Create, register and start a node with the given storage handles.
    pub async fn new_node_with(
        self: &Arc<Self>,
        id: NodeId,
        group: Vec<Endpoint>,
        config: Arc<Config>,
        log: Arc<MemLog>,
        store: Arc<MemNodeStore>,
        state_machine: Arc<MemStateMachine>,
    ) -> MemNode {
        let transport = Arc::new(RouterTransport {
            id,
            router: self.clone(),
        });
        let node = Node::new(id, config, group, transport, log.clone(), store.clone());
        node.register_state_machine(state_machine.clone()).await;
        self.routing_table.write().await.insert(id, NodeHandles {
            node: node.clone(),
            log,
            store,
            state_machine,
        });
        node.start().expect("failed to start node");
        node
    }

    pub async fn node(&self, id: NodeId) -> MemNode {
        self.routing_table.read().await.get(&id).expect("node not found in routing table").node.clone()
    }

    pub async fn log(&self, id: NodeId) -> Arc<MemLog> {
        self.routing_table.read().await.get(&id).expect("node not found in routing table").log.clone()
    }

    pub async fn store(&self, id: NodeId) -> Arc<MemNodeStore> {
        self.routing_table.read().await.get(&id).expect("node not found in routing table").store.clone()
    }

    pub async fn state_machine(&self, id: NodeId) -> Arc<MemStateMachine> {
        self.routing_table.read().await.get(&id).expect("node not found in routing table").state_machine.clone()
    }

    pub async fn wait(&self, id: NodeId, timeout: Option<Duration>) -> Wait {
        self.node(id).await.wait(timeout.or_else(|| Some(Duration::from_secs(5))))
    }

    /// Isolate the network of the specified node.
    pub async fn isolate(&self, id: NodeId) {
        self.isolated.write().await.insert(id);
    }

    /// Restore the network of the specified node.
    pub async fn restore(&self, id: NodeId) {
        self.isolated.write().await.remove(&id);
    }

    /// The id of the current non-isolated leader, if any.
    pub async fn leader(&self) -> Option<NodeId> {
        let isolated = self.isolated.read().await;
        let rt = self.routing_table.read().await;
        for (id, handles) in rt.iter() {
            if isolated.contains(id) {
                continue;
            }
            if handles.node.metrics().borrow().role == RoleName::Leader {
                return Some(*id);
            }
        }
        None
    }

    async fn route(&self, from: NodeId, to: NodeId) -> Result<NodeIngress> {
        let isolated = self.isolated.read().await;
        if isolated.contains(&from) || isolated.contains(&to) {
            return Err(anyhow!("node {} or {} is isolated", from, to));
        }
        self.ingresses
            .read()
            .await
            .get(&to)
            .cloned()
            .ok_or_else(|| anyhow!("node {} not found in routing table", to))
    }
}

/// The routed transport used by cluster tests.
pub struct RouterTransport {
    pub id: NodeId,
    pub router: Arc<Router>,
}

#[async_trait]
impl Transport for RouterTransport {
    async fn initialize(&self, ingress: NodeIngress) -> Result<()> {
        self.router.ingresses.write().await.insert(self.id, ingress);
        Ok(())
    }

    async fn send_request_vote(&self, rpc: VoteRpc, targets: Vec<Endpoint>) -> Result<()> {
        for target in targets {
            let ingress = self.router.route(self.id, target.id).await?;
            ingress.request_vote(RpcEnvelope {
                source: self.id,
                rpc: rpc.clone(),
            });
        }
        Ok(())
    }

    async fn send_append_entries(&self, rpc: AppendEntriesRpc, target: Endpoint) -> Result<()> {
        let ingress = self.router.route(self.id, target.id).await?;
        ingress.append_entries(RpcEnvelope {
            source: self.id,
            rpc,
        });
        Ok(())
    }

    async fn send_install_snapshot(&self, rpc: InstallSnapshotRpc, target: Endpoint) -> Result<()> {
        let ingress = self.router.route(self.id, target.id).await?;
        ingress.install_snapshot(RpcEnvelope {
            source: self.id,
            rpc,
        });
        Ok(())
    }

    async fn reply_request_vote(&self, result: VoteResult, to: RpcEnvelope<VoteRpc>) -> Result<()> {
        let ingress = self.router.route(self.id, to.source).await?;
        ingress.request_vote_result(self.id, result);
        Ok(())
    }

    async fn reply_append_entries(&self, result: AppendEntriesResult, to: RpcEnvelope<AppendEntriesRpc>) -> Result<()> {
        let ingress = self.router.route(self.id, to.source).await?;
        ingress.append_entries_result(self.id, result, to.rpc);
        Ok(())
    }

    async fn reply_install_snapshot(
        &self,
        result: InstallSnapshotResult,
        to: RpcEnvelope<InstallSnapshotRpc>,
    ) -> Result<()> {
        let ingress = self.router.route(self.id, to.source).await?;
        ingress.install_snapshot_result(self.id, result, to.rpc);
        Ok(())
    }

    fn reset_channels(&self) {}

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A transport which records every send and reply instead of routing it,
/// for driving a single node's handlers directly through its ingress.
#[derive(Default)]
pub struct RecordingTransport {
    pub sent_votes: StdMutex<Vec<VoteRpc>>,
    pub sent_appends: StdMutex<Vec<AppendEntriesRpc>>,
    pub sent_snapshots: StdMutex<Vec<InstallSnapshotRpc>>,
    pub vote_replies: StdMutex<Vec<VoteResult>>,
    pub append_replies: StdMutex<Vec<AppendEntriesResult>>,
    pub snapshot_replies: StdMutex<Vec<InstallSnapshotResult>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn vote_replies(&self) -> Vec<VoteResult> {
        self.vote_replies.lock().unwrap().clone()
    }

    pub fn append_replies(&self) -> Vec<AppendEntriesResult> {
        self.append_replies.lock().unwrap().clone()
    }

    pub fn snapshot_replies(&self) -> Vec<InstallSnapshotResult> {
        self.snapshot_replies.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn initialize(&self, _ingress: NodeIngress) -> Result<()> {
        Ok(())
    }

    async fn send_request_vote(&self, rpc: VoteRpc, _targets: Vec<Endpoint>) -> Result<()> {
        self.sent_votes.lock().unwrap().push(rpc);
        Ok(())
    }

    async fn send_append_entries(&self, rpc: AppendEntriesRpc, _target: Endpoint) -> Result<()> {
        self.sent_appends.lock().unwrap().push(rpc);
        Ok(())
    }

    async fn send_install_snapshot(&self, rpc: InstallSnapshotRpc, _target: Endpoint) -> Result<()> {
        self.sent_snapshots.lock().unwrap().push(rpc);
        Ok(())
    }

    async fn reply_request_vote(&self, result: VoteResult, _to: RpcEnvelope<VoteRpc>) -> Result<()> {
        self.vote_replies.lock().unwrap().push(result);
        Ok(())
    }

    async fn reply_append_entries(&self, result: AppendEntriesResult, _to: RpcEnvelope<AppendEntriesRpc>) -> Result<()> {
        self.append_replies.lock().unwrap().push(result);
        Ok(())
    }

    async fn reply_install_snapshot(
        &self,
        result: InstallSnapshotResult,
        _to: RpcEnvelope<InstallSnapshotRpc>,
    ) -> Result<()> {
        self.snapshot_replies.lock().unwrap().push(result);
        Ok(())
    }

    fn reset_channels(&self) {}

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Poll `cond` every 10ms until it holds or `timeout` elapses.
pub async fn wait_until<F>(cond: F, timeout: Duration) -> bool
where F: Fn() -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A convenience for asserting set-like membership vectors.
pub fn ids(members: &[NodeId]) -> std::collections::BTreeSet<NodeId> {
    let mut set = btreeset! {};
    set.extend(members.iter().copied());
    set
}
