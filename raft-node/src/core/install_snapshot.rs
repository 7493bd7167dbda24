//! Snapshot transfer between the leader and lagging followers.

use anyhow::Result;

use crate::core::NodeCore;
use crate::network::RpcEnvelope;
use crate::network::Transport;
use crate::node::InstallSnapshotResult;
use crate::node::InstallSnapshotRpc;
use crate::storage::LogStore;
use crate::storage::NodeStore;
use crate::MessageSummary;
use crate::NodeId;

impl<N: Transport, L: LogStore, S: NodeStore> NodeCore<N, L, S> {
    /// Handle an inbound InstallSnapshot RPC: hand the chunk to the log
    /// store, and on the final chunk adopt the snapshot's membership.
    #[tracing::instrument(level = "debug", skip(self, msg), fields(rpc = %msg.rpc.summary()))]
    pub(super) async fn handle_install_snapshot(&mut self, msg: RpcEnvelope<InstallSnapshotRpc>) -> Result<()> {
        let current_term = self.role.term();
        if msg.rpc.term < current_term {
            self.reply_install_snapshot(InstallSnapshotResult { term: current_term }, msg);
            return Ok(());
        }

        if msg.rpc.term > current_term {
            self.become_follower(msg.rpc.term, None, Some(msg.rpc.leader_id), true).await?;
        }

        let done = msg.rpc.done;
        let last_config = msg.rpc.last_config.clone();
        self.log.install_snapshot(msg.rpc.clone()).await?;

        if done {
            // Config entries covered by the snapshot are gone from the log;
            // the snapshot's membership stands in for them.
            let next_index = self.log.next_index().await?;
            self.group.update_from(&last_config, next_index);
            self.last_log_index = next_index - 1;
            self.commit_index = self.log.commit_index().await?;
            self.report_metrics();
        }

        let term = self.role.term();
        self.reply_install_snapshot(InstallSnapshotResult { term }, msg);
        Ok(())
    }

    /// Handle an InstallSnapshot result on the leader: continue with the
    /// next chunk, or switch back to AppendEntries once the stream is done.
    #[tracing::instrument(level = "debug", skip(self, result, rpc), fields(from, result_term = result.term))]
    pub(super) async fn handle_install_snapshot_result(
        &mut self,
        from: NodeId,
        result: InstallSnapshotResult,
        rpc: InstallSnapshotRpc,
    ) -> Result<()> {
        let current_term = self.role.term();
        if result.term > current_term {
            tracing::info!(term = result.term, "newer term in InstallSnapshot result, stepping down");
            return self.become_follower(result.term, None, None, true).await;
        }
        if !self.role.is_leader() {
            tracing::debug!(from, "InstallSnapshot result while not leader, ignoring");
            return Ok(());
        }

        // A pending catch-up session consumes results for its target.
        if self.catch_ups.contains_key(&from) {
            return self.handle_catch_up_snapshot_result(from, result, rpc).await;
        }

        let endpoint = match self.group.member(from) {
            Some(member) => member.endpoint.clone(),
            None => {
                tracing::debug!(from, "InstallSnapshot result from a removed node, ignoring");
                return Ok(());
            }
        };

        if rpc.done {
            if let Some(member) = self.group.member_mut(from) {
                member.match_index = rpc.last_included_index;
                member.next_index = rpc.last_included_index + 1;
            }
            // The follower is at the snapshot boundary; resume the log.
            self.replicate_to(from, self.config.max_replication_entries, current_term).await
        } else {
            let next_offset = rpc.offset + rpc.data.len() as u64;
            let chunk = self
                .log
                .create_install_snapshot_rpc(current_term, self.id, next_offset, self.config.snapshot_data_length)
                .await?;
            self.mark_replicating(from);
            self.send_install_snapshot(chunk, endpoint);
            Ok(())
        }
    }
}
