//! The log store and node store interfaces and their event types.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::membership::Endpoint;
use crate::node::AppendEntriesRpc;
use crate::node::Entry;
use crate::node::EntryPayload;
use crate::node::InstallSnapshotRpc;
use crate::node::NodeMsg;
use crate::EntryMeta;
use crate::LogIndex;
use crate::NodeId;
use crate::Term;

/// Events published by the log store into the node's inbox.
#[derive(Clone, Debug)]
pub enum LogEvent {
    /// A group config entry arrived from the leader and was appended. On a
    /// non-leader the configuration takes effect now, at append time.
    GroupConfigAppended {
        index: LogIndex,
        /// The membership set resulting from the entry.
        result: Vec<Endpoint>,
    },
    /// A group config entry committed. The leader resolves its in-flight
    /// change holder on this event.
    GroupConfigCommitted { index: LogIndex, payload: EntryPayload },
    /// A log suffix containing group config entries was truncated during
    /// conflict resolution; membership reverts to the set recorded before
    /// the first removed config entry.
    GroupConfigBatchRemoved {
        /// The membership set to revert to.
        revert_to: Vec<Endpoint>,
    },
}

/// A cloneable handle through which the log store publishes [`LogEvent`]s
/// into the node's inbox.
///
/// The node installs the publisher at start; the log store holds it instead
/// of a back-pointer to the node.
#[derive(Clone)]
pub struct LogEventPublisher {
    tx: mpsc::UnboundedSender<NodeMsg>,
}

impl LogEventPublisher {
    pub(crate) fn new(tx: mpsc::UnboundedSender<NodeMsg>) -> Self {
        Self { tx }
    }

    /// Publish an event. Events published after the node has stopped are
    /// silently dropped.
    pub fn publish(&self, event: LogEvent) {
        let _ = self.tx.send(NodeMsg::LogEvent(event));
    }
}

/// Raised by [`LogStore::create_append_entries_rpc`] when the entries a
/// follower needs have already been compacted into a snapshot; the leader
/// promotes the send into an InstallSnapshot stream.
#[derive(Debug, thiserror::Error)]
#[error("entries at index {index} are only available in the snapshot")]
pub struct EntryInSnapshot {
    pub index: LogIndex,
}

/// The replicated log of a node.
///
/// The store owns entry persistence, commit bookkeeping and applying
/// committed entries to the registered state machine. It reports group
/// config activity back to the node through the installed
/// [`LogEventPublisher`].
#[async_trait]
pub trait LogStore: Send + Sync + 'static {
    /// Register the state machine which committed commands are applied to.
    async fn set_state_machine(&self, state_machine: Arc<dyn StateMachine>);

    /// Install the publisher through which log events reach the node.
    /// Called once from node start, before any other method.
    async fn install_event_publisher(&self, publisher: LogEventPublisher);

    /// The meta of the last entry, falling back to the snapshot boundary,
    /// falling back to (0, 0).
    async fn last_entry_meta(&self) -> Result<EntryMeta>;

    /// The index the next appended entry will take.
    async fn next_index(&self) -> Result<LogIndex>;

    /// The index of the highest committed entry.
    async fn commit_index(&self) -> Result<LogIndex>;

    /// True if this log is newer than one whose last entry is
    /// `(last_index, last_term)`: compared lexicographically by
    /// (term, index).
    async fn is_newer_than(&self, last_index: LogIndex, last_term: Term) -> Result<bool>;

    /// Append a no-op entry at `term`; appended by a new leader.
    async fn append_blank_entry(&self, term: Term) -> Result<Entry>;

    /// Append an application command at `term`.
    async fn append_entry(&self, term: Term, data: Vec<u8>) -> Result<Entry>;

    /// Append a group config entry adding `new_node` to the `base` set.
    async fn append_add_node_entry(&self, term: Term, base: Vec<Endpoint>, new_node: Endpoint) -> Result<Entry>;

    /// Append a group config entry removing `node_id` from the `base` set.
    async fn append_remove_node_entry(&self, term: Term, base: Vec<Endpoint>, node_id: NodeId) -> Result<Entry>;

    /// Append entries replicated from the leader, enforcing the log-match
    /// property. Returns `false` when `(prev_log_index, prev_log_term)`
    /// does not match this log. Conflicting existing entries are truncated;
    /// entries already present are left untouched.
    async fn append_entries_from_leader(
        &self,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<Entry>,
    ) -> Result<bool>;

    /// Advance the commit index to `index` and apply newly committed
    /// entries. A no-op unless `index` is beyond the current commit index
    /// and the entry at `index` carries `term`; the commit index never
    /// moves backwards.
    async fn advance_commit_index(&self, index: LogIndex, term: Term) -> Result<()>;

    /// Build an AppendEntries RPC for a follower whose next index is
    /// `next_index`, carrying at most `max_entries` entries and this log's
    /// commit index. Fails with [`EntryInSnapshot`] when the prefix has
    /// been compacted away.
    async fn create_append_entries_rpc(
        &self,
        term: Term,
        leader_id: NodeId,
        next_index: LogIndex,
        max_entries: u64,
    ) -> Result<AppendEntriesRpc>;

    /// Build the InstallSnapshot chunk starting at `offset`, carrying at
    /// most `length` bytes of the current snapshot.
    async fn create_install_snapshot_rpc(
        &self,
        term: Term,
        leader_id: NodeId,
        offset: u64,
        length: u64,
    ) -> Result<InstallSnapshotRpc>;

    /// Ingest a snapshot chunk from the leader. When the final chunk
    /// arrives the log resets itself behind the snapshot and restores the
    /// state machine from it.
    async fn install_snapshot(&self, rpc: InstallSnapshotRpc) -> Result<()>;

    /// Close the log. Called once from node stop.
    async fn close(&self) -> Result<()>;
}

/// Durable (term, voted_for) storage.
#[async_trait]
pub trait NodeStore: Send + Sync + 'static {
    async fn term(&self) -> Result<Term>;

    async fn voted_for(&self) -> Result<Option<NodeId>>;

    /// Persist the pair. The write must be atomic and durable before any
    /// RPC reply which depends on it is sent.
    async fn set_term_and_voted_for(&self, term: Term, voted_for: Option<NodeId>) -> Result<()>;

    /// Close the store. Called once from node stop.
    async fn close(&self) -> Result<()>;
}

/// The replicated state machine committed commands are applied to.
#[async_trait]
pub trait StateMachine: Send + Sync + 'static {
    /// Apply a committed command. `index` is the log index of the command's
    /// entry, provided for dedup bookkeeping.
    async fn apply(&self, index: LogIndex, data: &[u8]) -> Result<()>;

    /// Replace the state machine's contents from a snapshot covering the
    /// log through `last_included`.
    async fn restore_snapshot(&self, last_included: EntryMeta, data: &[u8]) -> Result<()>;
}
