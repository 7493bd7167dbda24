//! The leader's replication loop and AppendEntries processing.

use std::cmp;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::oneshot;

use crate::core::NodeCore;
use crate::core::Role;
use crate::error::NodeError;
use crate::network::RpcEnvelope;
use crate::network::Transport;
use crate::node::AppendEntriesResult;
use crate::node::AppendEntriesRpc;
use crate::storage::EntryInSnapshot;
use crate::storage::LogStore;
use crate::storage::NodeStore;
use crate::LogIndex;
use crate::MessageSummary;
use crate::NodeId;
use crate::Term;

impl<N: Transport, L: LogStore, S: NodeStore> NodeCore<N, L, S> {
    /// One replication pass over the group; fired by the ticker and kicked
    /// directly after appends.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn replicate(&mut self) -> Result<()> {
        let term = match &self.role {
            Role::Leader { term, .. } => *term,
            _ => return Ok(()),
        };

        if self.group.is_standalone() && self.catch_ups.is_empty() {
            // No peers; everything appended is committed.
            let next_index = self.log.next_index().await?;
            if next_index > 1 {
                self.advance_commit(next_index - 1, term).await?;
            }
            return Ok(());
        }

        let min_interval = Duration::from_millis(self.config.min_replication_interval);
        let max_entries = self.config.max_replication_entries;

        for target in self.group.replication_target_ids() {
            let due = self
                .group
                .member(target)
                .map(|member| member.should_replicate(min_interval))
                .unwrap_or(false);
            if due {
                self.replicate_to(target, max_entries, term).await?;
            }
        }

        // Catch-up sessions ride the same tick when their last round went
        // quiet (e.g. a lost message).
        let stalled: Vec<NodeId> = self
            .catch_ups
            .iter()
            .filter(|(_, task)| task.last_replicated_at.elapsed() >= min_interval)
            .map(|(id, _)| *id)
            .collect();
        for target in stalled {
            self.replicate_to_new_node(target, term).await?;
        }
        Ok(())
    }

    /// Send the next AppendEntries batch to `target`, or begin a snapshot
    /// stream when the needed prefix has been compacted away.
    pub(super) async fn replicate_to(&mut self, target: NodeId, max_entries: u64, term: Term) -> Result<()> {
        let (next_index, endpoint) = match self.group.member(target) {
            Some(member) => (member.next_index, member.endpoint.clone()),
            None => return Ok(()),
        };

        match self.log.create_append_entries_rpc(term, self.id, next_index, max_entries).await {
            Ok(mut rpc) => {
                rpc.message_id = self.next_message_id();
                tracing::trace!(peer = target, rpc = %rpc.summary(), "replicating");
                self.mark_replicating(target);
                self.send_append_entries(rpc, endpoint);
                Ok(())
            }
            Err(err) if err.downcast_ref::<EntryInSnapshot>().is_some() => {
                tracing::debug!(peer = target, next_index, "prefix compacted, streaming snapshot");
                let rpc =
                    self.log.create_install_snapshot_rpc(term, self.id, 0, self.config.snapshot_data_length).await?;
                self.mark_replicating(target);
                self.send_install_snapshot(rpc, endpoint);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Advance the commit index through the log store, which enforces both
    /// monotonicity and the current-term commit rule.
    pub(super) async fn advance_commit(&mut self, index: LogIndex, term: Term) -> Result<()> {
        self.log.advance_commit_index(index, term).await?;
        let committed = self.log.commit_index().await?;
        if committed != self.commit_index {
            tracing::debug!(commit_index = committed, "commit index advanced");
            self.commit_index = committed;
            self.report_metrics();
        }
        Ok(())
    }

    /// Handle an inbound AppendEntries RPC.
    #[tracing::instrument(level = "debug", skip(self, msg), fields(rpc = %msg.rpc.summary()))]
    pub(super) async fn handle_append_entries(&mut self, msg: RpcEnvelope<AppendEntriesRpc>) -> Result<()> {
        let current_term = self.role.term();
        let rpc_term = msg.rpc.term;
        let message_id = msg.rpc.message_id;

        if rpc_term < current_term {
            self.reply_append_entries(
                AppendEntriesResult {
                    message_id,
                    term: current_term,
                    success: false,
                },
                msg,
            );
            return Ok(());
        }

        if rpc_term > current_term {
            self.become_follower(rpc_term, None, Some(msg.rpc.leader_id), true).await?;
            let success = self.append_from_leader(&msg.rpc).await?;
            self.reply_append_entries(
                AppendEntriesResult {
                    message_id,
                    term: rpc_term,
                    success,
                },
                msg,
            );
            return Ok(());
        }

        // Equal terms.
        match &self.role {
            Role::Follower { voted_for, .. } => {
                let voted_for = *voted_for;
                self.become_follower(rpc_term, voted_for, Some(msg.rpc.leader_id), true).await?;
            }
            Role::Candidate { .. } => {
                // Another candidate won this term. The self-vote stays: this
                // term's ballot has been spent.
                self.become_follower(rpc_term, Some(self.id), Some(msg.rpc.leader_id), true).await?;
            }
            Role::Leader { .. } => {
                tracing::warn!(
                    from = msg.rpc.leader_id,
                    term = rpc_term,
                    "AppendEntries from another leader in the same term, rejecting"
                );
                self.reply_append_entries(
                    AppendEntriesResult {
                        message_id,
                        term: current_term,
                        success: false,
                    },
                    msg,
                );
                return Ok(());
            }
        }

        let success = self.append_from_leader(&msg.rpc).await?;
        self.reply_append_entries(
            AppendEntriesResult {
                message_id,
                term: rpc_term,
                success,
            },
            msg,
        );
        Ok(())
    }

    async fn append_from_leader(&mut self, rpc: &AppendEntriesRpc) -> Result<bool> {
        let success = self
            .log
            .append_entries_from_leader(rpc.prev_log_index, rpc.prev_log_term, rpc.entries.clone())
            .await?;
        if success {
            self.last_log_index = self.log.last_entry_meta().await?.index;
            let commit_to = cmp::min(rpc.leader_commit, rpc.last_entry_index());
            if commit_to > 0 {
                self.advance_commit(commit_to, rpc.term).await?;
            }
            self.report_metrics();
        } else {
            tracing::debug!(
                prev_log_index = rpc.prev_log_index,
                prev_log_term = rpc.prev_log_term,
                "log mismatch, rejecting entries"
            );
        }
        Ok(success)
    }

    /// Handle an AppendEntries result on the leader.
    #[tracing::instrument(level = "debug", skip(self, result, rpc), fields(from, success = result.success))]
    pub(super) async fn handle_append_entries_result(
        &mut self,
        from: NodeId,
        result: AppendEntriesResult,
        rpc: AppendEntriesRpc,
    ) -> Result<()> {
        let current_term = self.role.term();
        if result.term > current_term {
            tracing::info!(term = result.term, "newer term in AppendEntries result, stepping down");
            return self.become_follower(result.term, None, None, true).await;
        }
        if !self.role.is_leader() {
            tracing::debug!(from, "AppendEntries result while not leader, ignoring");
            return Ok(());
        }

        // A pending catch-up session consumes results for its target.
        if self.catch_ups.contains_key(&from) {
            return self.handle_catch_up_append_result(from, result, rpc).await;
        }

        let (is_major, is_removing) = match self.group.member(from) {
            Some(member) => (member.is_major, member.is_removing),
            None => {
                tracing::debug!(from, "AppendEntries result from a removed node, ignoring");
                return Ok(());
            }
        };

        if result.success {
            if is_removing {
                tracing::debug!(from, "replicated to a node being removed");
                self.mark_replication_idle(from);
                return Ok(());
            }
            if !is_major {
                tracing::warn!(from, "AppendEntries result from a node that is neither voting nor being removed");
                self.mark_replication_idle(from);
                return Ok(());
            }

            let last_entry_index = rpc.last_entry_index();
            if let Some(member) = self.group.member_mut(from) {
                member.match_index = cmp::max(member.match_index, last_entry_index);
                member.next_index = member.match_index + 1;
            }

            let next_index = self.log.next_index().await?;
            let majority_match = self.group.major_match_index(next_index - 1);
            if majority_match > self.commit_index {
                self.advance_commit(majority_match, current_term).await?;
            }

            let caught_up = self.group.member(from).map(|m| m.next_index >= next_index).unwrap_or(true);
            if caught_up {
                self.mark_replication_idle(from);
                return Ok(());
            }
        } else {
            // Log mismatch: back next_index off by one step and retry.
            let floored = match self.group.member_mut(from) {
                Some(member) => {
                    if member.next_index <= 1 {
                        true
                    } else {
                        member.next_index -= 1;
                        false
                    }
                }
                None => return Ok(()),
            };
            if floored {
                tracing::warn!(from, "AppendEntries rejected with next_index already at 1");
                self.mark_replication_idle(from);
                return Ok(());
            }
        }

        self.replicate_to(from, self.config.max_replication_entries, current_term).await
    }

    /// Handle an application append on the leader.
    pub(super) async fn handle_append_log(&mut self, data: Vec<u8>, tx: oneshot::Sender<Result<LogIndex, NodeError>>) {
        let term = match &self.role {
            Role::Leader { term, .. } => *term,
            _ => {
                let _ = tx.send(Err(NodeError::NotLeader {
                    role: self.role.name(),
                    leader_id: self.role.leader_id(self.id),
                }));
                return;
            }
        };

        let res = self.append_and_kick(term, data).await;
        if let Err(ref err) = res {
            tracing::error!(error = %err, "error appending log entry");
        }
        let _ = tx.send(res);
    }

    async fn append_and_kick(&mut self, term: Term, data: Vec<u8>) -> Result<LogIndex, NodeError> {
        let entry = self
            .log
            .append_entry(term, data)
            .await
            .map_err(|err| NodeError::Internal(err.to_string()))?;
        self.last_log_index = entry.index;
        self.report_metrics();
        if let Err(err) = self.replicate().await {
            tracing::error!(error = %err, "error replicating after append");
        }
        Ok(entry.index)
    }
}
