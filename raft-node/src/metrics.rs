//! Observable node state.
//!
//! The node publishes a [`NodeMetrics`] snapshot on a watch channel after
//! every state change. [`Wait`] wraps the channel's receiver with deadline
//! helpers, which the integration tests lean on heavily.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::timeout_at;
use tokio::time::Instant;

use crate::LogIndex;
use crate::NodeId;
use crate::Term;

/// The name of a node role.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
pub enum RoleName {
    #[display(fmt = "follower")]
    Follower,
    #[display(fmt = "candidate")]
    Candidate,
    #[display(fmt = "leader")]
    Leader,
}

/// A point-in-time snapshot of a node's role.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleState {
    pub role: RoleName,
    pub term: Term,
    /// The candidate this node voted for in `term`. A candidate or leader
    /// reports itself.
    pub voted_for: Option<NodeId>,
    /// The last known leader. A leader reports itself.
    pub leader_id: Option<NodeId>,
}

/// A set of metrics describing the current state of a node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetrics {
    /// The ID of the node.
    pub id: NodeId,
    /// The role of the node.
    pub role: RoleName,
    /// The current term of the node.
    pub current_term: Term,
    /// The candidate this node voted for in the current term.
    pub voted_for: Option<NodeId>,
    /// The last known cluster leader.
    pub current_leader: Option<NodeId>,
    /// The index of the last log entry.
    pub last_log_index: LogIndex,
    /// The index of the highest entry known to be committed.
    pub commit_index: LogIndex,
    /// The ids of the voting members of the current configuration.
    pub members: Vec<NodeId>,
}

impl NodeMetrics {
    pub(crate) fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            role: RoleName::Follower,
            current_term: 0,
            voted_for: None,
            current_leader: None,
            last_log_index: 0,
            commit_index: 0,
            members: vec![id],
        }
    }
}

/// Error variants from waiting for a metrics condition.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("timeout after {0:?} when waiting for {1}")]
    Timeout(Duration, String),
    #[error("the node is shutting down")]
    Shutdown,
}

/// A handle for waiting on the metrics to satisfy some condition.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<NodeMetrics>,
}

impl Wait {
    /// Wait until the metrics satisfy `func`, or timeout.
    pub async fn metrics<T>(&self, func: T, msg: &str) -> Result<NodeMetrics, WaitError>
    where T: Fn(&NodeMetrics) -> bool + Send {
        let mut rx = self.rx.clone();
        let deadline = Instant::now() + self.timeout;
        loop {
            let latest = rx.borrow().clone();
            if func(&latest) {
                tracing::debug!(?latest, "wait condition satisfied: {}", msg);
                return Ok(latest);
            }
            match timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(WaitError::Shutdown),
                Err(_) => return Err(WaitError::Timeout(self.timeout, msg.to_string())),
            }
        }
    }

    /// Wait for the node to assume the given role.
    pub async fn role(&self, want: RoleName, msg: &str) -> Result<NodeMetrics, WaitError> {
        self.metrics(|m| m.role == want, &format!("{} role == {}", msg, want)).await
    }

    /// Wait for `current_term` to reach `want`.
    pub async fn term(&self, want: Term, msg: &str) -> Result<NodeMetrics, WaitError> {
        self.metrics(|m| m.current_term >= want, &format!("{} term >= {}", msg, want)).await
    }

    /// Wait for `last_log_index` to reach `want`.
    pub async fn log(&self, want: LogIndex, msg: &str) -> Result<NodeMetrics, WaitError> {
        self.metrics(|m| m.last_log_index >= want, &format!("{} last_log_index >= {}", msg, want)).await
    }

    /// Wait for `commit_index` to reach `want`.
    pub async fn commit(&self, want: LogIndex, msg: &str) -> Result<NodeMetrics, WaitError> {
        self.metrics(|m| m.commit_index >= want, &format!("{} commit_index >= {}", msg, want)).await
    }

    /// Wait for `current_leader` to become `want`.
    pub async fn current_leader(&self, want: NodeId, msg: &str) -> Result<NodeMetrics, WaitError> {
        self.metrics(|m| m.current_leader == Some(want), &format!("{} current_leader == {}", msg, want)).await
    }

    /// Wait for the voting membership to become exactly `want`.
    pub async fn members(&self, want: Vec<NodeId>, msg: &str) -> Result<NodeMetrics, WaitError> {
        self.metrics(|m| m.members == want, &format!("{} members == {:?}", msg, want)).await
    }
}
