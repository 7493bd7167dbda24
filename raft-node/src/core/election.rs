//! Election timeout handling and RequestVote processing.

use anyhow::Result;

use crate::config::NodeMode;
use crate::core::NodeCore;
use crate::core::Role;
use crate::network::RpcEnvelope;
use crate::network::Transport;
use crate::node::VoteResult;
use crate::node::VoteRpc;
use crate::storage::LogStore;
use crate::storage::NodeStore;
use crate::MessageSummary;
use crate::NodeId;

impl<N: Transport, L: LogStore, S: NodeStore> NodeCore<N, L, S> {
    /// Handle an elapsed election timeout.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn handle_election_timeout(&mut self, timer_id: u64) -> Result<()> {
        if self.role.is_leader() {
            tracing::warn!("election timeout on a leader, ignoring");
            return Ok(());
        }
        if !self.election_timer_is_current(timer_id) {
            tracing::debug!(timer_id, "stale election timeout, ignoring");
            return Ok(());
        }

        let new_term = self.role.term() + 1;

        if self.group.is_standalone() {
            if self.config.mode == NodeMode::Standby {
                tracing::info!("standalone standby node, skipping election");
                return Ok(());
            }
            // No peers to canvass; take the term uncontested.
            tracing::info!(term = new_term, "standalone node, becoming leader");
            return self.become_leader(new_term).await;
        }

        tracing::info!(term = new_term, "election timeout, starting campaign");
        self.become_candidate(new_term, 1).await?;

        let last = self.log.last_entry_meta().await?;
        let rpc = VoteRpc {
            term: new_term,
            candidate_id: self.id,
            last_log_index: last.index,
            last_log_term: last.term,
        };
        let targets = self.group.peer_endpoints_of_major();
        self.send_request_vote(rpc, targets);
        Ok(())
    }

    /// Handle an inbound RequestVote RPC.
    #[tracing::instrument(level = "debug", skip(self, msg), fields(rpc = %msg.rpc.summary()))]
    pub(super) async fn handle_request_vote(&mut self, msg: RpcEnvelope<VoteRpc>) -> Result<()> {
        let rpc = msg.rpc.clone();
        let current_term = self.role.term();

        // A candidate outside the voting membership gets no vote.
        let candidate_is_major = self.group.member(rpc.candidate_id).map(|m| m.is_major).unwrap_or(false);
        if !candidate_is_major {
            tracing::warn!(candidate = rpc.candidate_id, "vote request from a non-voting node, rejecting");
            self.reply_request_vote(
                VoteResult {
                    term: current_term,
                    vote_granted: false,
                },
                msg,
            );
            return Ok(());
        }

        if rpc.term < current_term {
            tracing::debug!(rpc_term = rpc.term, current_term, "vote request with stale term, rejecting");
            self.reply_request_vote(
                VoteResult {
                    term: current_term,
                    vote_granted: false,
                },
                msg,
            );
            return Ok(());
        }

        if rpc.term > current_term {
            let grant = !self.log.is_newer_than(rpc.last_log_index, rpc.last_log_term).await?;
            let voted_for = if grant { Some(rpc.candidate_id) } else { None };
            self.become_follower(rpc.term, voted_for, None, true).await?;
            self.reply_request_vote(
                VoteResult {
                    term: rpc.term,
                    vote_granted: grant,
                },
                msg,
            );
            return Ok(());
        }

        // Equal terms.
        match &self.role {
            Role::Follower { voted_for, leader_id, .. } => {
                let voted_for = *voted_for;
                let leader_id = *leader_id;
                let grant = match voted_for {
                    None => !self.log.is_newer_than(rpc.last_log_index, rpc.last_log_term).await?,
                    Some(v) => v == rpc.candidate_id,
                };
                if grant {
                    // Refresh the vote and the election deadline.
                    self.become_follower(current_term, Some(rpc.candidate_id), leader_id, true).await?;
                }
                self.reply_request_vote(
                    VoteResult {
                        term: current_term,
                        vote_granted: grant,
                    },
                    msg,
                );
            }
            Role::Candidate { .. } | Role::Leader { .. } => {
                // A candidate voted for itself; a leader already won.
                self.reply_request_vote(
                    VoteResult {
                        term: current_term,
                        vote_granted: false,
                    },
                    msg,
                );
            }
        }
        Ok(())
    }

    /// Handle a RequestVote result. Only meaningful while campaigning.
    #[tracing::instrument(level = "debug", skip(self, result), fields(from, granted = result.vote_granted, result_term = result.term))]
    pub(super) async fn handle_request_vote_result(&mut self, from: NodeId, result: VoteResult) -> Result<()> {
        let current_term = self.role.term();

        if result.term > current_term {
            tracing::info!(term = result.term, "newer term in vote result, stepping down");
            return self.become_follower(result.term, None, None, true).await;
        }

        if !self.group.contains(from) {
            tracing::warn!(from, "dead event: vote result from an unknown node");
            return Ok(());
        }

        let votes_count = match &self.role {
            Role::Candidate { votes_count, .. } => *votes_count,
            _ => {
                tracing::debug!(from, "vote result while not campaigning, ignoring");
                return Ok(());
            }
        };
        if !result.vote_granted {
            return Ok(());
        }
        if result.term < current_term {
            tracing::debug!(from, result_term = result.term, "vote granted for an earlier term, ignoring");
            return Ok(());
        }

        let votes_count = votes_count + 1;
        let major_count = self.group.major_count() as u64;
        if votes_count > major_count / 2 {
            tracing::info!(term = current_term, votes = votes_count, major_count, "won election");
            self.become_leader(current_term).await
        } else {
            // Not there yet; keep campaigning under a fresh deadline.
            let election_timer = self.schedule_election_timer();
            self.change_role(Role::Candidate {
                term: current_term,
                votes_count,
                election_timer,
            })
            .await
        }
    }
}
