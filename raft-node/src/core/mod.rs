//! The core logic of a consensus node.
//!
//! `NodeCore` is the actor behind [`crate::node::Node`]: a single task
//! owning the role, the membership registry, the in-flight catch-up
//! sessions and the group config change holder. Every mutation happens on
//! this task, so handlers never race on role or membership state.

mod admin;
mod election;
mod install_snapshot;
mod replication;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::core::admin::CatchUpTask;
use crate::core::admin::ChangeInFlight;
use crate::membership::Endpoint;
use crate::membership::Group;
use crate::metrics::NodeMetrics;
use crate::metrics::RoleName;
use crate::metrics::RoleState;
use crate::network::RpcEnvelope;
use crate::network::Transport;
use crate::node::AppendEntriesResult;
use crate::node::AppendEntriesRpc;
use crate::node::InstallSnapshotResult;
use crate::node::InstallSnapshotRpc;
use crate::node::NodeIngress;
use crate::node::NodeMsg;
use crate::node::VoteResult;
use crate::node::VoteRpc;
use crate::scheduler::Scheduler;
use crate::scheduler::TimerHandle;
use crate::storage::LogEventPublisher;
use crate::storage::LogStore;
use crate::storage::NodeStore;
use crate::LogIndex;
use crate::NodeId;
use crate::Term;

/// A scheduled election timeout. The id guards against a timeout which was
/// cancelled after its callback was already enqueued.
pub(crate) struct ElectionTimer {
    id: u64,
    handle: TimerHandle,
}

/// The role of a node, with per-role state. Replacing the role drops the
/// old variant's timer or ticker, cancelling it.
pub(crate) enum Role {
    Follower {
        term: Term,
        voted_for: Option<NodeId>,
        leader_id: Option<NodeId>,
        /// Absent on a standby follower, which never starts an election.
        election_timer: Option<ElectionTimer>,
    },
    Candidate {
        term: Term,
        /// Granted votes including the self-vote.
        votes_count: u64,
        election_timer: ElectionTimer,
    },
    Leader {
        term: Term,
        replication_ticker: TimerHandle,
    },
}

impl Role {
    pub(crate) fn term(&self) -> Term {
        match self {
            Role::Follower { term, .. } => *term,
            Role::Candidate { term, .. } => *term,
            Role::Leader { term, .. } => *term,
        }
    }

    pub(crate) fn name(&self) -> RoleName {
        match self {
            Role::Follower { .. } => RoleName::Follower,
            Role::Candidate { .. } => RoleName::Candidate,
            Role::Leader { .. } => RoleName::Leader,
        }
    }

    pub(crate) fn is_leader(&self) -> bool {
        matches!(self, Role::Leader { .. })
    }

    /// The last known leader. A leader reports itself; a candidate knows of
    /// none.
    pub(crate) fn leader_id(&self, self_id: NodeId) -> Option<NodeId> {
        match self {
            Role::Follower { leader_id, .. } => *leader_id,
            Role::Candidate { .. } => None,
            Role::Leader { .. } => Some(self_id),
        }
    }

    /// The vote cast in the current term. A candidate or leader holds its
    /// own.
    pub(crate) fn voted_for(&self, self_id: NodeId) -> Option<NodeId> {
        match self {
            Role::Follower { voted_for, .. } => *voted_for,
            Role::Candidate { .. } => Some(self_id),
            Role::Leader { .. } => Some(self_id),
        }
    }

    pub(crate) fn state(&self, self_id: NodeId) -> RoleState {
        RoleState {
            role: self.name(),
            term: self.term(),
            voted_for: self.voted_for(self_id),
            leader_id: self.leader_id(self_id),
        }
    }

    fn election_timer_id(&self) -> Option<u64> {
        match self {
            Role::Follower { election_timer, .. } => election_timer.as_ref().map(|t| t.id),
            Role::Candidate { election_timer, .. } => Some(election_timer.id),
            Role::Leader { .. } => None,
        }
    }

    fn cancel_timers(&self) {
        match self {
            Role::Follower { election_timer, .. } => {
                if let Some(timer) = election_timer {
                    timer.handle.cancel();
                }
            }
            Role::Candidate { election_timer, .. } => election_timer.handle.cancel(),
            Role::Leader { replication_ticker, .. } => replication_ticker.cancel(),
        }
    }
}

/// The actor owning all node state.
pub(crate) struct NodeCore<N: Transport, L: LogStore, S: NodeStore> {
    pub(super) id: NodeId,
    pub(super) config: Arc<Config>,
    pub(super) group: Group,
    pub(super) transport: Arc<N>,
    pub(super) log: Arc<L>,
    pub(super) store: Arc<S>,
    pub(super) scheduler: Arc<dyn Scheduler>,

    pub(super) role: Role,
    /// Mirror of the log's commit index, kept for the metrics view.
    pub(super) commit_index: LogIndex,
    /// Mirror of the log's last entry index, kept for the metrics view.
    pub(super) last_log_index: LogIndex,
    /// The (term, voted_for) pair most recently written to the node store.
    last_persisted: (Term, Option<NodeId>),
    timer_seq: u64,
    message_seq: u64,

    /// In-flight catch-up sessions for prospective members, by node id.
    pub(super) catch_ups: BTreeMap<NodeId, CatchUpTask>,
    /// The at-most-one in-flight group config change.
    pub(super) change_holder: Option<ChangeInFlight>,

    listeners: Vec<Box<dyn Fn(&RoleState) + Send + 'static>>,

    pub(super) tx_api: mpsc::UnboundedSender<NodeMsg>,
    rx_api: mpsc::UnboundedReceiver<NodeMsg>,
    tx_metrics: watch::Sender<NodeMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<N: Transport, L: LogStore, S: NodeStore> NodeCore<N, L, S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: NodeId,
        config: Arc<Config>,
        group: Group,
        transport: Arc<N>,
        log: Arc<L>,
        store: Arc<S>,
        scheduler: Arc<dyn Scheduler>,
        tx_api: mpsc::UnboundedSender<NodeMsg>,
        rx_api: mpsc::UnboundedReceiver<NodeMsg>,
        tx_metrics: watch::Sender<NodeMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<Result<()>> {
        let this = Self {
            id,
            config,
            group,
            transport,
            log,
            store,
            scheduler,
            role: Role::Follower {
                term: 0,
                voted_for: None,
                leader_id: None,
                election_timer: None,
            },
            commit_index: 0,
            last_log_index: 0,
            last_persisted: (0, None),
            timer_seq: 0,
            message_seq: 0,
            catch_ups: BTreeMap::new(),
            change_holder: None,
            listeners: Vec::new(),
            tx_api,
            rx_api,
            tx_metrics,
            rx_shutdown,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("spawn")))
    }

    /// The main loop of the node.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.id, cluster=%self.config.cluster_name))]
    async fn main(mut self) -> Result<()> {
        tracing::debug!("node is initializing");

        let term = self.store.term().await?;
        let voted_for = self.store.voted_for().await?;
        self.last_persisted = (term, voted_for);
        self.last_log_index = self.log.last_entry_meta().await?.index;
        self.commit_index = self.log.commit_index().await?;

        self.log.install_event_publisher(LogEventPublisher::new(self.tx_api.clone())).await;
        self.transport.initialize(NodeIngress::new(self.tx_api.clone())).await?;

        let election_timer = Some(self.schedule_election_timer());
        self.role = Role::Follower {
            term,
            voted_for,
            leader_id: None,
            election_timer,
        };
        self.notify_role_change();
        tracing::info!(term, "node started");

        loop {
            tokio::select! {
                Some(msg) = self.rx_api.recv() => self.handle_msg(msg).await,
                Ok(_) = &mut self.rx_shutdown => {
                    return self.shutdown().await;
                }
            }
        }
    }

    async fn handle_msg(&mut self, msg: NodeMsg) {
        let res = match msg {
            NodeMsg::AppendEntries(msg) => self.handle_append_entries(msg).await,
            NodeMsg::RequestVote(msg) => self.handle_request_vote(msg).await,
            NodeMsg::InstallSnapshot(msg) => self.handle_install_snapshot(msg).await,
            NodeMsg::AppendEntriesResult { from, result, rpc } => {
                self.handle_append_entries_result(from, result, rpc).await
            }
            NodeMsg::RequestVoteResult { from, result } => self.handle_request_vote_result(from, result).await,
            NodeMsg::InstallSnapshotResult { from, result, rpc } => {
                self.handle_install_snapshot_result(from, result, rpc).await
            }
            NodeMsg::ElectionTimeout { timer_id } => self.handle_election_timeout(timer_id).await,
            NodeMsg::ReplicationTick => self.replicate().await,
            NodeMsg::LogEvent(event) => self.handle_log_event(event).await,
            NodeMsg::AppendLog { data, tx } => {
                self.handle_append_log(data, tx).await;
                Ok(())
            }
            NodeMsg::RegisterCatchUp { endpoint, tx } => {
                self.handle_register_catch_up(endpoint, tx).await;
                Ok(())
            }
            NodeMsg::CancelCatchUp { id } => {
                self.handle_cancel_catch_up(id);
                Ok(())
            }
            NodeMsg::PriorChangeWaiter { tx } => {
                let _ = tx.send(self.change_holder.as_ref().map(|change| change.done_rx()));
                Ok(())
            }
            NodeMsg::InstallChange { change, tx } => {
                self.handle_install_change(change, tx).await;
                Ok(())
            }
            NodeMsg::PrecheckRemove { id, tx } => {
                let _ = tx.send(self.precheck_remove(id));
                Ok(())
            }
            NodeMsg::AddRoleListener(listener) => {
                self.listeners.push(listener);
                Ok(())
            }
        };
        if let Err(err) = res {
            // Handler failures are logged; the actor keeps serving.
            tracing::error!(error = %err, "error in node handler");
        }
    }

    async fn shutdown(self) -> Result<()> {
        tracing::info!("node is stopping");
        self.role.cancel_timers();
        self.scheduler.stop();
        let mut result = Ok(());
        if let Err(err) = self.log.close().await {
            result = Err(err);
        }
        if let Err(err) = self.transport.close().await {
            if result.is_ok() {
                result = Err(err);
            }
        }
        if let Err(err) = self.store.close().await {
            if result.is_ok() {
                result = Err(err);
            }
        }
        result
    }

    //////////////////////////////////////////////////////////////////////////
    // Role transitions.

    /// Install a new role: the old role's timer or ticker is cancelled by
    /// being dropped, the durable (term, voted_for) pair is written if it
    /// changed, and listeners observe the new snapshot.
    pub(super) async fn change_role(&mut self, new_role: Role) -> Result<()> {
        let to_persist = (new_role.term(), new_role.voted_for(self.id));
        if to_persist != self.last_persisted {
            self.store.set_term_and_voted_for(to_persist.0, to_persist.1).await?;
            self.last_persisted = to_persist;
        }
        self.role = new_role;
        self.notify_role_change();
        Ok(())
    }

    /// Enter the follower role.
    ///
    /// Re-entering with an identical (term, voted_for, leader_id) is
    /// stable: neither the store nor the listeners are touched. The
    /// election deadline is still pushed out when `schedule_election` is
    /// set, so a quiet but healthy leader does not trigger elections.
    pub(super) async fn become_follower(
        &mut self,
        term: Term,
        voted_for: Option<NodeId>,
        leader_id: Option<NodeId>,
        schedule_election: bool,
    ) -> Result<()> {
        let stable = matches!(
            &self.role,
            Role::Follower { term: t, voted_for: v, leader_id: l, .. }
                if *t == term && *v == voted_for && *l == leader_id
        );
        if stable {
            if schedule_election {
                let timer = self.schedule_election_timer();
                if let Role::Follower { election_timer, .. } = &mut self.role {
                    *election_timer = Some(timer);
                }
            }
            return Ok(());
        }

        let election_timer = if schedule_election {
            Some(self.schedule_election_timer())
        } else {
            None
        };
        self.change_role(Role::Follower {
            term,
            voted_for,
            leader_id,
            election_timer,
        })
        .await
    }

    /// Enter the candidate role at `term` with `votes_count` votes already
    /// granted (at least the self-vote).
    pub(super) async fn become_candidate(&mut self, term: Term, votes_count: u64) -> Result<()> {
        let election_timer = self.schedule_election_timer();
        self.change_role(Role::Candidate {
            term,
            votes_count,
            election_timer,
        })
        .await
    }

    /// Enter the leader role at `term`: reset per-peer replication state,
    /// start the replication ticker, append the term's no-op entry, reset
    /// the transport's channels and kick replication.
    pub(super) async fn become_leader(&mut self, term: Term) -> Result<()> {
        let next_index = self.log.next_index().await?;
        self.group.reset_replication_states(next_index);
        let replication_ticker = self.start_replication_ticker();
        self.change_role(Role::Leader { term, replication_ticker }).await?;

        let entry = self.log.append_blank_entry(term).await?;
        self.last_log_index = entry.index;
        self.transport.reset_channels();
        self.report_metrics();
        self.replicate().await
    }

    //////////////////////////////////////////////////////////////////////////
    // Timers.

    pub(super) fn schedule_election_timer(&mut self) -> ElectionTimer {
        self.timer_seq += 1;
        let id = self.timer_seq;
        let tx = self.tx_api.clone();
        let timeout = Duration::from_millis(self.config.new_rand_election_timeout());
        tracing::debug!(timer_id = id, ?timeout, "scheduling election timeout");
        let handle = self.scheduler.schedule_election_timeout(
            timeout,
            Box::new(move || {
                let _ = tx.send(NodeMsg::ElectionTimeout { timer_id: id });
            }),
        );
        ElectionTimer { id, handle }
    }

    fn start_replication_ticker(&self) -> TimerHandle {
        let tx = self.tx_api.clone();
        let interval = Duration::from_millis(self.config.log_replication_interval);
        self.scheduler.schedule_log_replication(
            interval,
            Box::new(move || {
                let _ = tx.send(NodeMsg::ReplicationTick);
            }),
        )
    }

    /// True when `timer_id` is the role's current election timer. A stale
    /// id means the timeout was cancelled after its callback had already
    /// fired.
    pub(super) fn election_timer_is_current(&self, timer_id: u64) -> bool {
        self.role.election_timer_id() == Some(timer_id)
    }

    //////////////////////////////////////////////////////////////////////////
    // Observability.

    fn notify_role_change(&mut self) {
        let state = self.role.state(self.id);
        tracing::info!(role = %state.role, term = state.term, "role changed");
        for listener in &self.listeners {
            listener(&state);
        }
        self.report_metrics();
    }

    pub(super) fn report_metrics(&mut self) {
        let state = self.role.state(self.id);
        let metrics = NodeMetrics {
            id: self.id,
            role: state.role,
            current_term: state.term,
            voted_for: state.voted_for,
            current_leader: state.leader_id,
            last_log_index: self.last_log_index,
            commit_index: self.commit_index,
            members: self.group.major_ids(),
        };
        let _ = self.tx_metrics.send(metrics);
    }

    //////////////////////////////////////////////////////////////////////////
    // Outbound messaging. Sends run on their own tasks so a slow transport
    // never blocks the actor; failures are logged and recovered by the next
    // tick or timeout.

    pub(super) fn next_message_id(&mut self) -> u64 {
        self.message_seq += 1;
        self.message_seq
    }

    pub(super) fn send_request_vote(&self, rpc: VoteRpc, targets: Vec<Endpoint>) {
        if targets.is_empty() {
            return;
        }
        let transport = self.transport.clone();
        tokio::spawn(
            async move {
                if let Err(err) = transport.send_request_vote(rpc, targets).await {
                    tracing::warn!(error = %err, "error sending RequestVote");
                }
            }
            .instrument(tracing::debug_span!("send_request_vote")),
        );
    }

    pub(super) fn send_append_entries(&self, rpc: AppendEntriesRpc, target: Endpoint) {
        let transport = self.transport.clone();
        tokio::spawn(
            async move {
                let peer = target.id;
                if let Err(err) = transport.send_append_entries(rpc, target).await {
                    tracing::warn!(peer, error = %err, "error sending AppendEntries");
                }
            }
            .instrument(tracing::debug_span!("send_append_entries")),
        );
    }

    pub(super) fn send_install_snapshot(&self, rpc: InstallSnapshotRpc, target: Endpoint) {
        let transport = self.transport.clone();
        tokio::spawn(
            async move {
                let peer = target.id;
                if let Err(err) = transport.send_install_snapshot(rpc, target).await {
                    tracing::warn!(peer, error = %err, "error sending InstallSnapshot");
                }
            }
            .instrument(tracing::debug_span!("send_install_snapshot")),
        );
    }

    pub(super) fn reply_request_vote(&self, result: VoteResult, to: RpcEnvelope<VoteRpc>) {
        let transport = self.transport.clone();
        tokio::spawn(
            async move {
                if let Err(err) = transport.reply_request_vote(result, to).await {
                    tracing::warn!(error = %err, "error replying to RequestVote");
                }
            }
            .instrument(tracing::debug_span!("reply_request_vote")),
        );
    }

    pub(super) fn reply_append_entries(&self, result: AppendEntriesResult, to: RpcEnvelope<AppendEntriesRpc>) {
        let transport = self.transport.clone();
        tokio::spawn(
            async move {
                if let Err(err) = transport.reply_append_entries(result, to).await {
                    tracing::warn!(error = %err, "error replying to AppendEntries");
                }
            }
            .instrument(tracing::debug_span!("reply_append_entries")),
        );
    }

    pub(super) fn reply_install_snapshot(&self, result: InstallSnapshotResult, to: RpcEnvelope<InstallSnapshotRpc>) {
        let transport = self.transport.clone();
        tokio::spawn(
            async move {
                if let Err(err) = transport.reply_install_snapshot(result, to).await {
                    tracing::warn!(error = %err, "error replying to InstallSnapshot");
                }
            }
            .instrument(tracing::debug_span!("reply_install_snapshot")),
        );
    }

    pub(super) fn mark_replicating(&mut self, target: NodeId) {
        if let Some(member) = self.group.member_mut(target) {
            member.replicating = true;
            member.last_replicated_at = Some(Instant::now());
        }
    }

    pub(super) fn mark_replication_idle(&mut self, target: NodeId) {
        if let Some(member) = self.group.member_mut(target) {
            member.replicating = false;
        }
    }
}
