//! Membership change orchestration: new-node catch-up, the group config
//! change holder, and the event-driven commit path.

use std::cmp;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::core::NodeCore;
use crate::core::Role;
use crate::error::GroupConfigResult;
use crate::error::NodeError;
use crate::membership::Endpoint;
use crate::network::Transport;
use crate::node::AppendEntriesResult;
use crate::node::AppendEntriesRpc;
use crate::node::CatchUpOutcome;
use crate::node::ConfigChange;
use crate::node::EntryPayload;
use crate::node::InstallSnapshotResult;
use crate::node::InstallSnapshotRpc;
use crate::storage::EntryInSnapshot;
use crate::storage::LogEvent;
use crate::storage::LogStore;
use crate::storage::NodeStore;
use crate::LogIndex;
use crate::MessageSummary;
use crate::NodeId;
use crate::Term;

/// A catch-up session replicating the log to a prospective member before it
/// joins the voting configuration.
pub(crate) struct CatchUpTask {
    pub(super) endpoint: Endpoint,
    pub(super) next_index: LogIndex,
    pub(super) match_index: LogIndex,
    rounds: u32,
    pub(super) last_replicated_at: Instant,
    done: Option<oneshot::Sender<CatchUpOutcome>>,
}

/// The at-most-one in-flight group config change: the pending entry and the
/// channel its final result resolves through.
pub(crate) struct ChangeInFlight {
    entry_index: LogIndex,
    change: ConfigChange,
    done_tx: watch::Sender<Option<GroupConfigResult>>,
    done_rx: watch::Receiver<Option<GroupConfigResult>>,
}

impl ChangeInFlight {
    pub(crate) fn done_rx(&self) -> watch::Receiver<Option<GroupConfigResult>> {
        self.done_rx.clone()
    }

    fn resolve(self, result: GroupConfigResult) {
        let _ = self.done_tx.send(Some(result));
    }
}

enum CatchUpStep {
    Continue,
    Finish(CatchUpOutcome),
}

impl<N: Transport, L: LogStore, S: NodeStore> NodeCore<N, L, S> {
    //////////////////////////////////////////////////////////////////////////
    // Catch-up.

    pub(super) async fn handle_register_catch_up(
        &mut self,
        endpoint: Endpoint,
        tx: oneshot::Sender<Result<oneshot::Receiver<CatchUpOutcome>, NodeError>>,
    ) {
        let res = self.register_catch_up(endpoint).await;
        let _ = tx.send(res);
    }

    async fn register_catch_up(&mut self, endpoint: Endpoint) -> Result<oneshot::Receiver<CatchUpOutcome>, NodeError> {
        let term = match &self.role {
            Role::Leader { term, .. } => *term,
            _ => {
                return Err(NodeError::NotLeader {
                    role: self.role.name(),
                    leader_id: self.role.leader_id(self.id),
                })
            }
        };
        if endpoint.id == self.id {
            return Err(NodeError::InvalidArgument("a node cannot add itself".into()));
        }
        if self.group.contains(endpoint.id) {
            return Err(NodeError::InvalidArgument(format!("node {} is already a member", endpoint.id)));
        }
        if self.catch_ups.contains_key(&endpoint.id) {
            return Err(NodeError::InvalidArgument(format!(
                "a catch-up for node {} is already running",
                endpoint.id
            )));
        }

        let next_index = self.log.next_index().await.map_err(|err| NodeError::Internal(err.to_string()))?;
        let target = endpoint.id;
        let (done_tx, done_rx) = oneshot::channel();
        self.catch_ups.insert(target, CatchUpTask {
            endpoint,
            next_index,
            match_index: 0,
            rounds: 0,
            last_replicated_at: Instant::now(),
            done: Some(done_tx),
        });
        tracing::info!(peer = target, next_index, "starting catch-up for prospective member");

        if let Err(err) = self.replicate_to_new_node(target, term).await {
            tracing::error!(peer = target, error = %err, "error starting catch-up replication");
        }
        Ok(done_rx)
    }

    pub(super) fn handle_cancel_catch_up(&mut self, id: NodeId) {
        if self.catch_ups.remove(&id).is_some() {
            tracing::info!(peer = id, "catch-up cancelled");
        }
    }

    /// Send the next catch-up AppendEntries batch to `target`, or a
    /// snapshot chunk when the needed prefix has been compacted away.
    pub(super) async fn replicate_to_new_node(&mut self, target: NodeId, term: Term) -> Result<()> {
        let (next_index, endpoint) = match self.catch_ups.get(&target) {
            Some(task) => (task.next_index, task.endpoint.clone()),
            None => return Ok(()),
        };
        let max_entries = self.config.max_replication_entries_for_new_node;

        match self.log.create_append_entries_rpc(term, self.id, next_index, max_entries).await {
            Ok(mut rpc) => {
                rpc.message_id = self.next_message_id();
                self.touch_catch_up(target);
                self.send_append_entries(rpc, endpoint);
                Ok(())
            }
            Err(err) if err.downcast_ref::<EntryInSnapshot>().is_some() => {
                tracing::debug!(peer = target, next_index, "catch-up prefix compacted, streaming snapshot");
                let rpc =
                    self.log.create_install_snapshot_rpc(term, self.id, 0, self.config.snapshot_data_length).await?;
                self.touch_catch_up(target);
                self.send_install_snapshot(rpc, endpoint);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn touch_catch_up(&mut self, target: NodeId) {
        if let Some(task) = self.catch_ups.get_mut(&target) {
            task.last_replicated_at = Instant::now();
        }
    }

    /// An AppendEntries result from a node with a pending catch-up session.
    pub(super) async fn handle_catch_up_append_result(
        &mut self,
        from: NodeId,
        result: AppendEntriesResult,
        rpc: AppendEntriesRpc,
    ) -> Result<()> {
        let term = self.role.term();
        let log_next_index = self.log.next_index().await?;
        let round_deadline = Duration::from_millis(self.config.catch_up_round_timeout);
        let max_rounds = self.config.catch_up_rounds;

        let step = match self.catch_ups.get_mut(&from) {
            None => return Ok(()),
            Some(task) => {
                if result.success {
                    task.match_index = cmp::max(task.match_index, rpc.last_entry_index());
                    task.next_index = task.match_index + 1;
                    if task.next_index >= log_next_index {
                        CatchUpStep::Finish(CatchUpOutcome::Caught {
                            next_index: task.next_index,
                            match_index: task.match_index,
                        })
                    } else if task.last_replicated_at.elapsed() > round_deadline {
                        tracing::warn!(from, "catch-up round deadline exceeded");
                        CatchUpStep::Finish(CatchUpOutcome::Timeout)
                    } else {
                        task.rounds += 1;
                        if task.rounds >= max_rounds {
                            tracing::warn!(from, rounds = task.rounds, "catch-up ran out of rounds");
                            CatchUpStep::Finish(CatchUpOutcome::Timeout)
                        } else {
                            CatchUpStep::Continue
                        }
                    }
                } else if task.next_index <= 1 {
                    tracing::warn!(from, "catch-up replication rejected with next_index at 1");
                    CatchUpStep::Finish(CatchUpOutcome::ReplicationFailed)
                } else {
                    task.next_index -= 1;
                    CatchUpStep::Continue
                }
            }
        };

        match step {
            CatchUpStep::Finish(outcome) => {
                self.finish_catch_up(from, outcome);
                Ok(())
            }
            CatchUpStep::Continue => self.replicate_to_new_node(from, term).await,
        }
    }

    /// An InstallSnapshot result from a node with a pending catch-up
    /// session.
    pub(super) async fn handle_catch_up_snapshot_result(
        &mut self,
        from: NodeId,
        _result: InstallSnapshotResult,
        rpc: InstallSnapshotRpc,
    ) -> Result<()> {
        let term = self.role.term();
        if rpc.done {
            match self.catch_ups.get_mut(&from) {
                Some(task) => {
                    task.match_index = rpc.last_included_index;
                    task.next_index = rpc.last_included_index + 1;
                    task.last_replicated_at = Instant::now();
                }
                None => return Ok(()),
            }
            // Snapshot delivered; finish over AppendEntries.
            self.replicate_to_new_node(from, term).await
        } else {
            let endpoint = match self.catch_ups.get_mut(&from) {
                Some(task) => {
                    task.last_replicated_at = Instant::now();
                    task.endpoint.clone()
                }
                None => return Ok(()),
            };
            let next_offset = rpc.offset + rpc.data.len() as u64;
            let chunk = self
                .log
                .create_install_snapshot_rpc(term, self.id, next_offset, self.config.snapshot_data_length)
                .await?;
            self.send_install_snapshot(chunk, endpoint);
            Ok(())
        }
    }

    fn finish_catch_up(&mut self, id: NodeId, outcome: CatchUpOutcome) {
        if let Some(mut task) = self.catch_ups.remove(&id) {
            tracing::info!(peer = id, ?outcome, "catch-up finished");
            if let Some(done) = task.done.take() {
                let _ = done.send(outcome);
            }
        }
    }

    //////////////////////////////////////////////////////////////////////////
    // The group config change holder.

    pub(super) fn precheck_remove(&self, id: NodeId) -> Result<(), NodeError> {
        if !self.role.is_leader() {
            return Err(NodeError::NotLeader {
                role: self.role.name(),
                leader_id: self.role.leader_id(self.id),
            });
        }
        if !self.group.contains(id) {
            return Err(NodeError::InvalidArgument(format!("node {} is not a member", id)));
        }
        Ok(())
    }

    pub(super) async fn handle_install_change(
        &mut self,
        change: ConfigChange,
        tx: oneshot::Sender<Result<watch::Receiver<Option<GroupConfigResult>>, NodeError>>,
    ) {
        let res = self.install_change(change).await;
        let _ = tx.send(res);
    }

    /// Check-and-install of the change holder: append the group config
    /// entry, apply the leader-side membership mutation, kick replication
    /// and occupy the holder. Fails fast when a change is already in
    /// flight.
    async fn install_change(
        &mut self,
        change: ConfigChange,
    ) -> Result<watch::Receiver<Option<GroupConfigResult>>, NodeError> {
        let term = match &self.role {
            Role::Leader { term, .. } => *term,
            _ => {
                return Err(NodeError::NotLeader {
                    role: self.role.name(),
                    leader_id: self.role.leader_id(self.id),
                })
            }
        };
        if self.change_holder.is_some() {
            return Err(NodeError::ConcurrentChange);
        }

        let entry = match &change {
            ConfigChange::AddNode {
                endpoint,
                next_index,
                match_index,
            } => {
                let base = self.group.major_endpoints();
                let entry = self
                    .log
                    .append_add_node_entry(term, base, endpoint.clone())
                    .await
                    .map_err(|err| NodeError::Internal(err.to_string()))?;
                // The new node votes from here on; its replication state
                // carries over from the catch-up session.
                self.group.add(endpoint.clone(), *next_index, *match_index);
                tracing::info!(index = entry.index, new_node = endpoint.id, "appended add-node config entry");
                entry
            }
            ConfigChange::RemoveNode { id } => {
                let id = *id;
                if !self.group.downgrade(id) {
                    return Err(NodeError::InvalidArgument(format!("node {} is not a member", id)));
                }
                let base = self.group.endpoints();
                let entry = self
                    .log
                    .append_remove_node_entry(term, base, id)
                    .await
                    .map_err(|err| NodeError::Internal(err.to_string()))?;
                tracing::info!(index = entry.index, node_id = id, "appended remove-node config entry");
                entry
            }
        };

        self.last_log_index = entry.index;
        let (done_tx, done_rx) = watch::channel(None);
        self.change_holder = Some(ChangeInFlight {
            entry_index: entry.index,
            change,
            done_tx,
            done_rx: done_rx.clone(),
        });
        self.report_metrics();

        if let Err(err) = self.replicate().await {
            tracing::error!(error = %err, "error replicating after config change append");
        }
        Ok(done_rx)
    }

    //////////////////////////////////////////////////////////////////////////
    // Log events.

    pub(super) async fn handle_log_event(&mut self, event: LogEvent) -> Result<()> {
        match event {
            LogEvent::GroupConfigAppended { index, result } => {
                if self.role.is_leader() {
                    // The leader's membership changed when its change task
                    // appended the entry; the config takes effect for it at
                    // commit time.
                    return Ok(());
                }
                tracing::info!(index, "group config appended from leader, updating membership");
                let next_index = self.log.next_index().await?;
                self.group.update_from(&result, next_index);
                self.report_metrics();
            }
            LogEvent::GroupConfigCommitted { index, payload } => {
                self.handle_group_config_committed(index, payload).await?;
            }
            LogEvent::GroupConfigBatchRemoved { revert_to } => {
                tracing::warn!("group config entries truncated, reverting membership");
                let next_index = self.log.next_index().await?;
                self.group.update_from(&revert_to, next_index);
                self.report_metrics();
            }
        }
        Ok(())
    }

    async fn handle_group_config_committed(&mut self, index: LogIndex, payload: EntryPayload) -> Result<()> {
        let holder = match self.change_holder.take() {
            Some(holder) => holder,
            None => {
                tracing::debug!(index, payload = %payload.summary(), "group config committed with no change in flight");
                return Ok(());
            }
        };
        if holder.entry_index != index {
            // An older config entry committing (e.g. one inherited from a
            // previous term); the in-flight change is still pending.
            tracing::debug!(index, pending = holder.entry_index, "unrelated group config entry committed");
            self.change_holder = Some(holder);
            return Ok(());
        }

        if let ConfigChange::RemoveNode { id } = holder.change {
            if id == self.id && self.role.is_leader() {
                // Leave leadership without rejoining elections: a removed
                // node idles as a non-voting follower.
                tracing::info!("removed self from the group, stepping down");
                let term = self.role.term();
                let voted_for = self.role.voted_for(self.id);
                self.become_follower(term, voted_for, None, false).await?;
            }
            self.group.remove(id);
        }
        self.report_metrics();
        tracing::info!(index, payload = %payload.summary(), "group config change committed");
        holder.resolve(GroupConfigResult::Ok);
        Ok(())
    }
}
