//! A Raft consensus node.
//!
//! This crate implements the role engine of a Raft node: leader election,
//! log replication, snapshot transfer and single-server membership change.
//! The node itself is an actor — a single spawned task owning all role and
//! membership state — surrounded by collaborator traits for the log store,
//! the durable node store, the RPC transport, the timer scheduler and the
//! application state machine.
//!
//! See [`node::Node`] for the public interface and [`storage`] / [`network`]
//! for the collaborator contracts.

mod config;
mod core;
mod error;
mod membership;
pub mod metrics;
pub mod network;
pub mod node;
mod quorum;
pub mod scheduler;
pub mod storage;

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

pub use async_trait;

pub use crate::config::Config;
pub use crate::config::ConfigBuilder;
pub use crate::config::ConfigError;
pub use crate::config::NodeMode;
pub use crate::error::GroupConfigResult;
pub use crate::error::NodeError;
pub use crate::membership::Endpoint;
pub use crate::metrics::NodeMetrics;
pub use crate::metrics::RoleName;
pub use crate::metrics::RoleState;
pub use crate::network::Transport;
pub use crate::node::Node;
pub use crate::storage::LogStore;
pub use crate::storage::NodeStore;
pub use crate::storage::StateMachine;

/// A Raft node's ID.
pub type NodeId = u64;

/// A Raft term; a monotonically increasing logical clock identifying an
/// election epoch.
pub type Term = u64;

/// A 1-based position in the replicated log; 0 denotes "before first entry".
pub type LogIndex = u64;

/// The term and index of a log entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryMeta {
    pub term: Term,
    pub index: LogIndex,
}

impl fmt::Display for EntryMeta {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

/// A trait implemented by messages which can produce a one-line summary for
/// logging.
pub trait MessageSummary {
    fn summary(&self) -> String;
}
