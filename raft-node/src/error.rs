//! Error types exposed by this crate.

use crate::metrics::RoleName;
use crate::NodeId;

/// The typed failures surfaced by the public node API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NodeError {
    /// The operation requires the leader role.
    #[error("not the leader (role {role}, last known leader {leader_id:?})")]
    NotLeader {
        /// The role this node currently holds.
        role: RoleName,
        /// The last known leader, if any; useful for redirecting the caller.
        leader_id: Option<NodeId>,
    },

    /// The caller passed an argument the node cannot act on.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A group config change is already in flight.
    #[error("a group config change is already in flight")]
    ConcurrentChange,

    /// The node has not been started, or is shutting down.
    #[error("the node is not running")]
    NotRunning,

    /// A collaborator failed; details are in the log.
    #[error("internal error: {0}")]
    Internal(String),
}

/// The terminal, non-exceptional outcome of a group membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupConfigResult {
    /// The group config entry committed.
    Ok,
    /// Replication to the prospective member failed.
    ReplicationFailed,
    /// The change timed out: catch-up ran out of rounds or time, or a
    /// previous change did not commit within its deadline.
    Timeout,
    /// The change failed for another reason; details are in the log.
    Error,
}
