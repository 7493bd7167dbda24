//! Public node interface and wire types.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use futures::future::AbortHandle;
use futures::future::Abortable;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::core::NodeCore;
use crate::error::GroupConfigResult;
use crate::error::NodeError;
use crate::membership::Endpoint;
use crate::membership::Group;
use crate::metrics::NodeMetrics;
use crate::metrics::RoleName;
use crate::metrics::RoleState;
use crate::metrics::Wait;
use crate::network::RpcEnvelope;
use crate::network::Transport;
use crate::scheduler::Scheduler;
use crate::scheduler::TokioScheduler;
use crate::storage::LogEvent;
use crate::storage::LogStore;
use crate::storage::NodeStore;
use crate::storage::StateMachine;
use crate::LogIndex;
use crate::MessageSummary;
use crate::NodeId;
use crate::Term;

/// The lifecycle of a node instance. A stopped node is not restartable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    New,
    Started,
    Stopped,
}

struct NodeInner<N: Transport, L: LogStore, S: NodeStore> {
    id: NodeId,
    config: Arc<Config>,
    log: Arc<L>,
    tx_api: mpsc::UnboundedSender<NodeMsg>,
    rx_metrics: watch::Receiver<NodeMetrics>,
    core_handle: Mutex<Option<JoinHandle<anyhow::Result<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    // The node monitor: lifecycle transitions happen under this lock.
    lifecycle: StdMutex<Lifecycle>,
    boot: StdMutex<Option<Boot<N, L, S>>>,
}

/// Everything the core task consumes when the node starts.
struct Boot<N: Transport, L: LogStore, S: NodeStore> {
    group: Vec<Endpoint>,
    transport: Arc<N>,
    log: Arc<L>,
    store: Arc<S>,
    scheduler: Arc<dyn Scheduler>,
    rx_api: mpsc::UnboundedReceiver<NodeMsg>,
    tx_metrics: watch::Sender<NodeMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

/// A Raft consensus node.
///
/// The node is an actor: a single spawned task owns the role and the
/// membership registry, and every timer event, RPC, log event and API call
/// is a message into its inbox. This type is the cheap, cloneable handle to
/// that task.
///
/// Collaborators — the log store, the durable node store, the transport and
/// (optionally) the scheduler — are injected at construction. The node must
/// be started with [`Node::start`] before it does anything, and is shut
/// down for good with [`Node::stop`].
pub struct Node<N: Transport, L: LogStore, S: NodeStore> {
    inner: Arc<NodeInner<N, L, S>>,
}

impl<N: Transport, L: LogStore, S: NodeStore> Node<N, L, S> {
    /// Create a new node with the default tokio-backed scheduler.
    ///
    /// `group` is the initial cluster membership and must contain this
    /// node's own endpoint.
    pub fn new(
        id: NodeId,
        config: Arc<Config>,
        group: Vec<Endpoint>,
        transport: Arc<N>,
        log: Arc<L>,
        store: Arc<S>,
    ) -> Self {
        Self::new_with_scheduler(id, config, group, transport, log, store, Arc::new(TokioScheduler))
    }

    /// Create a new node with an explicit scheduler.
    pub fn new_with_scheduler(
        id: NodeId,
        config: Arc<Config>,
        group: Vec<Endpoint>,
        transport: Arc<N>,
        log: Arc<L>,
        store: Arc<S>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(NodeMetrics::new_initial(id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let boot = Boot {
            group,
            transport,
            log: log.clone(),
            store,
            scheduler,
            rx_api,
            tx_metrics,
            rx_shutdown,
        };
        let inner = NodeInner {
            id,
            config,
            log,
            tx_api,
            rx_metrics,
            core_handle: Mutex::new(None),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
            lifecycle: StdMutex::new(Lifecycle::New),
            boot: StdMutex::new(Some(boot)),
        };
        Self { inner: Arc::new(inner) }
    }

    /// Register the state machine committed commands are applied to.
    ///
    /// Must be called before [`Node::start`].
    pub async fn register_state_machine(&self, state_machine: Arc<dyn StateMachine>) {
        self.inner.log.set_state_machine(state_machine).await;
    }

    /// Start the node. Idempotent; must be called from within a tokio
    /// runtime. A stopped node cannot be started again.
    pub fn start(&self) -> Result<(), NodeError> {
        let mut lifecycle = self.inner.lifecycle.lock().unwrap();
        match *lifecycle {
            Lifecycle::Started => return Ok(()),
            Lifecycle::Stopped => return Err(NodeError::NotRunning),
            Lifecycle::New => {}
        }
        let boot = match self.inner.boot.lock().unwrap().take() {
            Some(boot) => boot,
            None => return Err(NodeError::NotRunning),
        };
        let handle = NodeCore::spawn(
            self.inner.id,
            self.inner.config.clone(),
            Group::new(self.inner.id, boot.group),
            boot.transport,
            boot.log,
            boot.store,
            boot.scheduler,
            self.inner.tx_api.clone(),
            boot.rx_api,
            boot.tx_metrics,
            boot.rx_shutdown,
        );
        match self.inner.core_handle.try_lock() {
            Ok(mut guard) => *guard = Some(handle),
            Err(_) => return Err(NodeError::NotRunning),
        }
        *lifecycle = Lifecycle::Started;
        Ok(())
    }

    /// Stop the node: cancel timers, close the log, transport and store,
    /// and shut the actor down. Storage close failures surface here.
    pub async fn stop(&self) -> anyhow::Result<()> {
        {
            let mut lifecycle = self.inner.lifecycle.lock().unwrap();
            if *lifecycle != Lifecycle::Started {
                return Err(NodeError::NotRunning.into());
            }
            *lifecycle = Lifecycle::Stopped;
        }
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.core_handle.lock().await.take() {
            handle.await??;
        }
        Ok(())
    }

    /// The ingress handle the transport delivers inbound messages through.
    pub fn ingress(&self) -> NodeIngress {
        NodeIngress {
            tx: self.inner.tx_api.clone(),
        }
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<NodeMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        Wait {
            timeout: timeout.unwrap_or_else(|| Duration::from_millis(500)),
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// The node's current role name and last known leader.
    pub fn get_role_name_and_leader_id(&self) -> (RoleName, Option<NodeId>) {
        let metrics = self.inner.rx_metrics.borrow();
        (metrics.role, metrics.current_leader)
    }

    /// A consistent snapshot of the node's role.
    pub fn get_role_state(&self) -> RoleState {
        let metrics = self.inner.rx_metrics.borrow();
        RoleState {
            role: metrics.role,
            term: metrics.current_term,
            voted_for: metrics.voted_for,
            leader_id: metrics.current_leader,
        }
    }

    /// Register a listener invoked on the actor task after every role
    /// change. Listeners must not block.
    pub fn add_node_role_listener<F>(&self, listener: F) -> Result<(), NodeError>
    where F: Fn(&RoleState) + Send + 'static {
        self.send(NodeMsg::AddRoleListener(Box::new(listener)))
    }

    /// Append an application command to the replicated log. Succeeds with
    /// the entry's index once the entry is appended locally; commitment and
    /// application happen asynchronously.
    ///
    /// Fails with [`NodeError::NotLeader`] on a non-leader, carrying the
    /// last known leader id.
    pub async fn append_log(&self, data: Vec<u8>) -> Result<LogIndex, NodeError> {
        let (tx, rx) = oneshot::channel();
        self.send(NodeMsg::AppendLog { data, tx })?;
        rx.await.map_err(|_| NodeError::NotRunning)?
    }

    /// Add a new node to the cluster.
    ///
    /// The prospective member is first caught up (AppendEntries, and
    /// InstallSnapshot where needed) until it is near the leader's tail;
    /// then a group config entry including it is appended and replicated.
    /// The returned handle completes when that entry commits.
    ///
    /// Fails fast with [`NodeError::NotLeader`] on a non-leader, and with
    /// [`NodeError::InvalidArgument`] for this node's own id, an existing
    /// member, or a member already being caught up.
    #[tracing::instrument(level = "debug", skip(self), fields(new_node = endpoint.id))]
    pub async fn add_node(&self, endpoint: Endpoint) -> Result<ChangeHandle, NodeError> {
        let (tx, rx) = oneshot::channel();
        self.send(NodeMsg::RegisterCatchUp {
            endpoint: endpoint.clone(),
            tx,
        })?;
        let catch_up_rx = rx.await.map_err(|_| NodeError::NotRunning)??;

        let tx_api = self.inner.tx_api.clone();
        let config = self.inner.config.clone();
        Ok(spawn_change(
            format!("add_node({})", endpoint.id),
            drive_add_node(tx_api, config, endpoint, catch_up_rx),
        ))
    }

    /// Remove a node from the cluster.
    ///
    /// The member stops counting toward the majority immediately; a group
    /// config entry without it is appended and replicated. The returned
    /// handle completes when that entry commits. Removing this node itself
    /// steps it down to a non-voting follower once the entry commits.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn remove_node(&self, id: NodeId) -> Result<ChangeHandle, NodeError> {
        let (tx, rx) = oneshot::channel();
        self.send(NodeMsg::PrecheckRemove { id, tx })?;
        rx.await.map_err(|_| NodeError::NotRunning)??;

        let tx_api = self.inner.tx_api.clone();
        let config = self.inner.config.clone();
        Ok(spawn_change(format!("remove_node({})", id), drive_remove_node(tx_api, config, id)))
    }

    fn send(&self, msg: NodeMsg) -> Result<(), NodeError> {
        self.inner.tx_api.send(msg).map_err(|_| NodeError::NotRunning)
    }
}

impl<N: Transport, L: LogStore, S: NodeStore> Clone for Node<N, L, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The write side of the node's inbox, handed to the transport at start.
#[derive(Clone)]
pub struct NodeIngress {
    tx: mpsc::UnboundedSender<NodeMsg>,
}

impl NodeIngress {
    pub(crate) fn new(tx: mpsc::UnboundedSender<NodeMsg>) -> Self {
        Self { tx }
    }

    /// Deliver an inbound AppendEntries request.
    pub fn append_entries(&self, msg: RpcEnvelope<AppendEntriesRpc>) {
        let _ = self.tx.send(NodeMsg::AppendEntries(msg));
    }

    /// Deliver an inbound RequestVote request.
    pub fn request_vote(&self, msg: RpcEnvelope<VoteRpc>) {
        let _ = self.tx.send(NodeMsg::RequestVote(msg));
    }

    /// Deliver an inbound InstallSnapshot request.
    pub fn install_snapshot(&self, msg: RpcEnvelope<InstallSnapshotRpc>) {
        let _ = self.tx.send(NodeMsg::InstallSnapshot(msg));
    }

    /// Deliver an AppendEntries result. `rpc` is the request the result
    /// answers; the node matches results to members by `from` and the RPC
    /// copy.
    pub fn append_entries_result(&self, from: NodeId, result: AppendEntriesResult, rpc: AppendEntriesRpc) {
        let _ = self.tx.send(NodeMsg::AppendEntriesResult { from, result, rpc });
    }

    /// Deliver a RequestVote result. `from` identifies the voter.
    pub fn request_vote_result(&self, from: NodeId, result: VoteResult) {
        let _ = self.tx.send(NodeMsg::RequestVoteResult { from, result });
    }

    /// Deliver an InstallSnapshot result.
    pub fn install_snapshot_result(&self, from: NodeId, result: InstallSnapshotResult, rpc: InstallSnapshotRpc) {
        let _ = self.tx.send(NodeMsg::InstallSnapshotResult { from, result, rpc });
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A handle to an in-flight group membership change.
pub struct ChangeHandle {
    rx: watch::Receiver<Option<Result<GroupConfigResult, NodeError>>>,
    abort: AbortHandle,
}

impl std::fmt::Debug for ChangeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeHandle").finish_non_exhaustive()
    }
}

impl ChangeHandle {
    /// Whether the change has reached a final result.
    pub fn is_done(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// The final result, if the change is done.
    pub fn result(&self) -> Option<Result<GroupConfigResult, NodeError>> {
        self.rx.borrow().clone()
    }

    /// Wait for the final result. A local wait deadline yields
    /// [`GroupConfigResult::Timeout`]; the change itself may still complete
    /// afterwards.
    pub async fn await_done(&self, wait: Duration) -> Result<GroupConfigResult, NodeError> {
        let mut rx = self.rx.clone();
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(res) = rx.borrow().clone() {
                return res;
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Ok(GroupConfigResult::Error),
                Err(_) => return Ok(GroupConfigResult::Timeout),
            }
        }
    }

    /// Stop driving the change. A config entry already appended still
    /// commits or fails on its own.
    pub fn cancel(&self) {
        self.abort.abort();
    }
}

fn spawn_change<F>(label: String, fut: F) -> ChangeHandle
where F: std::future::Future<Output = Result<GroupConfigResult, NodeError>> + Send + 'static {
    let (done_tx, done_rx) = watch::channel(None);
    let (abort, registration) = AbortHandle::new_pair();
    let task = async move {
        let res = fut.await;
        if let Err(ref err) = res {
            tracing::warn!(error = %err, "group config change failed");
        }
        let _ = done_tx.send(Some(res));
    };
    tokio::spawn(Abortable::new(task, registration).instrument(tracing::debug_span!("config_change", change = %label)));
    ChangeHandle { rx: done_rx, abort }
}

async fn drive_add_node(
    tx_api: mpsc::UnboundedSender<NodeMsg>,
    config: Arc<Config>,
    endpoint: Endpoint,
    catch_up_rx: oneshot::Receiver<CatchUpOutcome>,
) -> Result<GroupConfigResult, NodeError> {
    // Catch-up runs on the actor, driven by AppendEntries results; this task
    // just waits for its verdict, bounded by the overall deadline.
    let outcome = match timeout(Duration::from_millis(config.catch_up_timeout), catch_up_rx).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(_)) => return Err(NodeError::NotRunning),
        Err(_) => {
            let _ = tx_api.send(NodeMsg::CancelCatchUp { id: endpoint.id });
            return Ok(GroupConfigResult::Timeout);
        }
    };
    let (next_index, match_index) = match outcome {
        CatchUpOutcome::Caught { next_index, match_index } => (next_index, match_index),
        CatchUpOutcome::ReplicationFailed => return Ok(GroupConfigResult::ReplicationFailed),
        CatchUpOutcome::Timeout => return Ok(GroupConfigResult::Timeout),
    };

    if !await_prior_change(&tx_api, &config).await? {
        return Ok(GroupConfigResult::Timeout);
    }

    let (tx, rx) = oneshot::channel();
    tx_api
        .send(NodeMsg::InstallChange {
            change: ConfigChange::AddNode {
                endpoint,
                next_index,
                match_index,
            },
            tx,
        })
        .map_err(|_| NodeError::NotRunning)?;
    let done_rx = rx.await.map_err(|_| NodeError::NotRunning)??;
    Ok(wait_for_change_result(done_rx).await)
}

async fn drive_remove_node(
    tx_api: mpsc::UnboundedSender<NodeMsg>,
    config: Arc<Config>,
    id: NodeId,
) -> Result<GroupConfigResult, NodeError> {
    if !await_prior_change(&tx_api, &config).await? {
        return Ok(GroupConfigResult::Timeout);
    }

    let (tx, rx) = oneshot::channel();
    tx_api
        .send(NodeMsg::InstallChange {
            change: ConfigChange::RemoveNode { id },
            tx,
        })
        .map_err(|_| NodeError::NotRunning)?;
    let done_rx = rx.await.map_err(|_| NodeError::NotRunning)??;
    Ok(wait_for_change_result(done_rx).await)
}

/// Wait for a previous in-flight change to resolve. Returns false when the
/// previous change does not resolve within the configured timeout.
async fn await_prior_change(tx_api: &mpsc::UnboundedSender<NodeMsg>, config: &Config) -> Result<bool, NodeError> {
    let (tx, rx) = oneshot::channel();
    tx_api.send(NodeMsg::PriorChangeWaiter { tx }).map_err(|_| NodeError::NotRunning)?;
    let prior = rx.await.map_err(|_| NodeError::NotRunning)?;
    let prior_rx = match prior {
        Some(rx) => rx,
        None => return Ok(true),
    };
    let wait = Duration::from_millis(config.previous_group_config_change_timeout);
    match timeout(wait, wait_for_change_result(prior_rx)).await {
        Ok(prior_result) => {
            tracing::debug!(?prior_result, "previous group config change resolved");
            Ok(true)
        }
        Err(_) => {
            tracing::warn!("timeout awaiting previous group config change");
            Ok(false)
        }
    }
}

async fn wait_for_change_result(mut rx: watch::Receiver<Option<GroupConfigResult>>) -> GroupConfigResult {
    loop {
        if let Some(res) = *rx.borrow() {
            return res;
        }
        if rx.changed().await.is_err() {
            return GroupConfigResult::Error;
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The verdict of a new-node catch-up session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CatchUpOutcome {
    /// The prospective member reached the leader's tail.
    Caught { next_index: LogIndex, match_index: LogIndex },
    ReplicationFailed,
    Timeout,
}

/// A group config change ready to be appended to the log.
#[derive(Clone, Debug)]
pub(crate) enum ConfigChange {
    AddNode {
        endpoint: Endpoint,
        next_index: LogIndex,
        match_index: LogIndex,
    },
    RemoveNode {
        id: NodeId,
    },
}

/// A message in the node's inbox: RPC ingress, RPC results, timer events,
/// log events and API calls.
pub(crate) enum NodeMsg {
    AppendEntries(RpcEnvelope<AppendEntriesRpc>),
    RequestVote(RpcEnvelope<VoteRpc>),
    InstallSnapshot(RpcEnvelope<InstallSnapshotRpc>),
    AppendEntriesResult {
        from: NodeId,
        result: AppendEntriesResult,
        rpc: AppendEntriesRpc,
    },
    RequestVoteResult {
        from: NodeId,
        result: VoteResult,
    },
    InstallSnapshotResult {
        from: NodeId,
        result: InstallSnapshotResult,
        rpc: InstallSnapshotRpc,
    },
    ElectionTimeout {
        timer_id: u64,
    },
    ReplicationTick,
    LogEvent(LogEvent),
    AppendLog {
        data: Vec<u8>,
        tx: oneshot::Sender<Result<LogIndex, NodeError>>,
    },
    RegisterCatchUp {
        endpoint: Endpoint,
        tx: oneshot::Sender<Result<oneshot::Receiver<CatchUpOutcome>, NodeError>>,
    },
    CancelCatchUp {
        id: NodeId,
    },
    PriorChangeWaiter {
        tx: oneshot::Sender<Option<watch::Receiver<Option<GroupConfigResult>>>>,
    },
    InstallChange {
        change: ConfigChange,
        tx: oneshot::Sender<Result<watch::Receiver<Option<GroupConfigResult>>, NodeError>>,
    },
    PrecheckRemove {
        id: NodeId,
        tx: oneshot::Sender<Result<(), NodeError>>,
    },
    AddRoleListener(Box<dyn Fn(&RoleState) + Send + 'static>),
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A replicated log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub index: LogIndex,
    pub term: Term,
    pub payload: EntryPayload,
}

impl Entry {
    pub fn meta(&self) -> crate::EntryMeta {
        crate::EntryMeta {
            term: self.term,
            index: self.index,
        }
    }
}

impl MessageSummary for Entry {
    fn summary(&self) -> String {
        format!("{}-{}:{}", self.term, self.index, self.payload.summary())
    }
}

impl MessageSummary for &[Entry] {
    fn summary(&self) -> String {
        let entries: Vec<String> = self.iter().map(|entry| entry.summary()).collect();
        entries.join(",")
    }
}

/// Log entry payload variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// An empty payload appended by a new cluster leader.
    Blank,
    /// An application command.
    Normal(Vec<u8>),
    /// A group config entry adding `new_node` to the `base` membership set.
    AddNode { base: Vec<Endpoint>, new_node: Endpoint },
    /// A group config entry removing `node_id` from the `base` set.
    RemoveNode { base: Vec<Endpoint>, node_id: NodeId },
}

impl EntryPayload {
    pub fn is_group_config(&self) -> bool {
        matches!(self, EntryPayload::AddNode { .. } | EntryPayload::RemoveNode { .. })
    }

    /// The membership set resulting from this entry, for group config
    /// entries.
    pub fn result_endpoints(&self) -> Option<Vec<Endpoint>> {
        match self {
            EntryPayload::AddNode { base, new_node } => {
                let mut result: Vec<Endpoint> =
                    base.iter().filter(|ep| ep.id != new_node.id).cloned().collect();
                result.push(new_node.clone());
                result.sort();
                Some(result)
            }
            EntryPayload::RemoveNode { base, node_id } => {
                Some(base.iter().filter(|ep| ep.id != *node_id).cloned().collect())
            }
            _ => None,
        }
    }

    /// The membership set in force before this entry, for group config
    /// entries.
    pub fn base_endpoints(&self) -> Option<&[Endpoint]> {
        match self {
            EntryPayload::AddNode { base, .. } => Some(base),
            EntryPayload::RemoveNode { base, .. } => Some(base),
            _ => None,
        }
    }
}

impl MessageSummary for EntryPayload {
    fn summary(&self) -> String {
        match self {
            EntryPayload::Blank => "blank".to_string(),
            EntryPayload::Normal(data) => format!("normal({}B)", data.len()),
            EntryPayload::AddNode { new_node, .. } => format!("add-node({})", new_node.id),
            EntryPayload::RemoveNode { node_id, .. } => format!("remove-node({})", node_id),
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by the cluster leader to replicate log entries, and as a
/// heartbeat.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesRpc {
    /// An id echoed back in the result; assigned by the sending node.
    pub message_id: u64,
    /// The leader's current term.
    pub term: Term,
    /// The leader's ID. Useful in redirecting clients.
    pub leader_id: NodeId,
    /// The index of the entry immediately preceding the new entries.
    pub prev_log_index: LogIndex,
    /// The term of the entry at `prev_log_index`.
    pub prev_log_term: Term,
    /// The new entries to store; empty for a heartbeat.
    pub entries: Vec<Entry>,
    /// The leader's commit index.
    pub leader_commit: LogIndex,
}

impl AppendEntriesRpc {
    /// The index of the last entry carried by this message, or
    /// `prev_log_index` for a heartbeat.
    pub fn last_entry_index(&self) -> LogIndex {
        self.prev_log_index + self.entries.len() as u64
    }
}

impl MessageSummary for AppendEntriesRpc {
    fn summary(&self) -> String {
        format!(
            "id={}, term={}, leader_id={}, prev=({}, {}), leader_commit={}, n={}",
            self.message_id, self.term, self.leader_id, self.prev_log_term, self.prev_log_index, self.leader_commit,
            self.entries.len()
        )
    }
}

/// The response to an `AppendEntriesRpc`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesResult {
    /// The `message_id` of the request this answers.
    pub message_id: u64,
    /// The responding node's current term, for the leader to update itself.
    pub term: Term,
    /// True if the follower's log matched `(prev_log_index, prev_log_term)`
    /// and the entries were appended.
    pub success: bool,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by candidates to gather votes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteRpc {
    /// The candidate's current term.
    pub term: Term,
    /// The candidate's ID.
    pub candidate_id: NodeId,
    /// The index of the candidate's last log entry.
    pub last_log_index: LogIndex,
    /// The term of the candidate's last log entry.
    pub last_log_term: Term,
}

impl MessageSummary for VoteRpc {
    fn summary(&self) -> String {
        format!("{:?}", self)
    }
}

/// The response to a `VoteRpc`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteResult {
    /// The current term of the responding node, for the candidate to update
    /// itself.
    pub term: Term,
    /// Will be true if the candidate received a vote from the responder.
    pub vote_granted: bool,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by the leader to stream a chunk of its snapshot to a
/// follower whose needed log prefix has been compacted away.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotRpc {
    /// The leader's current term.
    pub term: Term,
    /// The leader's ID.
    pub leader_id: NodeId,
    /// The index of the last entry covered by the snapshot.
    pub last_included_index: LogIndex,
    /// The term of the entry at `last_included_index`.
    pub last_included_term: Term,
    /// The membership configuration covered by the snapshot.
    pub last_config: Vec<Endpoint>,
    /// The byte offset of this chunk within the snapshot.
    pub offset: u64,
    /// The raw bytes of the chunk, starting at `offset`.
    pub data: Vec<u8>,
    /// True if this is the last chunk of the snapshot.
    pub done: bool,
}

impl MessageSummary for InstallSnapshotRpc {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, last_included=({}, {}), offset={}, len={}, done={}",
            self.term,
            self.leader_id,
            self.last_included_term,
            self.last_included_index,
            self.offset,
            self.data.len(),
            self.done
        )
    }
}

/// The response to an `InstallSnapshotRpc`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotResult {
    /// The receiving node's current term, for the leader to update itself.
    pub term: Term,
}
