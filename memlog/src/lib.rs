//! An in-memory implementation of the `raft-node` storage traits.
//!
//! `MemLog` and `MemNodeStore` back the `raft-node` integration tests; a
//! real deployment would put durable implementations behind the same
//! traits. `MemStateMachine` is a minimal command recorder with JSON
//! snapshots.

use std::cmp;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;

use raft_node::node::AppendEntriesRpc;
use raft_node::node::Entry;
use raft_node::node::EntryPayload;
use raft_node::node::InstallSnapshotRpc;
use raft_node::storage::EntryInSnapshot;
use raft_node::storage::LogEvent;
use raft_node::storage::LogEventPublisher;
use raft_node::storage::LogStore;
use raft_node::storage::NodeStore;
use raft_node::storage::StateMachine;
use raft_node::Endpoint;
use raft_node::EntryMeta;
use raft_node::LogIndex;
use raft_node::NodeId;
use raft_node::Term;

/// A snapshot of the log through `last_included`.
#[derive(Clone, Debug)]
pub struct MemSnapshot {
    pub last_included: EntryMeta,
    pub last_config: Vec<Endpoint>,
    pub data: Vec<u8>,
}

/// A snapshot being streamed in from the leader.
struct PendingSnapshot {
    last_included: EntryMeta,
    last_config: Vec<Endpoint>,
    data: Vec<u8>,
}

#[derive(Default)]
struct MemLogInner {
    entries: BTreeMap<LogIndex, Entry>,
    commit_index: LogIndex,
    last_applied: LogIndex,
    snapshot: Option<MemSnapshot>,
    pending_snapshot: Option<PendingSnapshot>,
}

impl MemLogInner {
    fn last_entry_meta(&self) -> EntryMeta {
        if let Some(entry) = self.entries.values().next_back() {
            return entry.meta();
        }
        match &self.snapshot {
            Some(snapshot) => snapshot.last_included,
            None => EntryMeta::default(),
        }
    }

    fn next_index(&self) -> LogIndex {
        self.last_entry_meta().index + 1
    }
}

/// An in-memory [`LogStore`].
pub struct MemLog {
    id: NodeId,
    inner: RwLock<MemLogInner>,
    state_machine: RwLock<Option<Arc<dyn StateMachine>>>,
    publisher: RwLock<Option<LogEventPublisher>>,
}

impl MemLog {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            inner: RwLock::new(MemLogInner::default()),
            state_machine: RwLock::new(None),
            publisher: RwLock::new(None),
        }
    }

    /// Insert an entry directly, bypassing the append paths. Test helper.
    pub async fn insert_entry(&self, entry: Entry) {
        let mut inner = self.inner.write().await;
        inner.entries.insert(entry.index, entry);
    }

    /// The entry at `index`, if present. Test helper.
    pub async fn entry(&self, index: LogIndex) -> Option<Entry> {
        self.inner.read().await.entries.get(&index).cloned()
    }

    /// The current snapshot, if any. Test helper.
    pub async fn snapshot(&self) -> Option<MemSnapshot> {
        self.inner.read().await.snapshot.clone()
    }

    /// The index of the last entry applied to the state machine.
    pub async fn last_applied(&self) -> LogIndex {
        self.inner.read().await.last_applied
    }

    /// Compact the log through `through_index`, recording `data` as the
    /// snapshot contents and `last_config` as the membership it covers.
    pub async fn compact(&self, through_index: LogIndex, data: Vec<u8>, last_config: Vec<Endpoint>) -> Result<()> {
        let mut inner = self.inner.write().await;
        let last_included = inner
            .entries
            .get(&through_index)
            .map(|entry| entry.meta())
            .ok_or_else(|| anyhow!("no entry at index {}", through_index))?;
        let tail = inner.entries.split_off(&(through_index + 1));
        inner.entries = tail;
        // A snapshot covers applied state by definition.
        inner.commit_index = cmp::max(inner.commit_index, last_included.index);
        inner.last_applied = cmp::max(inner.last_applied, last_included.index);
        inner.snapshot = Some(MemSnapshot {
            last_included,
            last_config,
            data,
        });
        tracing::debug!(id = self.id, through_index, "log compacted");
        Ok(())
    }

    async fn do_append(&self, term: Term, payload: EntryPayload) -> Result<Entry> {
        let mut inner = self.inner.write().await;
        let index = inner.next_index();
        let entry = Entry { index, term, payload };
        inner.entries.insert(index, entry.clone());
        tracing::debug!(id = self.id, index, term, "appended entry");
        Ok(entry)
    }

    /// Apply entries between `last_applied` and `commit_index`: commands go
    /// to the state machine, group config entries are announced as
    /// committed.
    async fn apply_committed(&self, inner: &mut MemLogInner) -> Result<()> {
        let state_machine = self.state_machine.read().await.clone();
        let publisher = self.publisher.read().await.clone();
        while inner.last_applied < inner.commit_index {
            let index = inner.last_applied + 1;
            let entry = match inner.entries.get(&index) {
                Some(entry) => entry.clone(),
                None => return Err(anyhow!("commit index {} beyond the log", index)),
            };
            match &entry.payload {
                EntryPayload::Blank => {}
                EntryPayload::Normal(data) => {
                    if let Some(state_machine) = &state_machine {
                        state_machine.apply(index, data).await?;
                    }
                }
                payload @ EntryPayload::AddNode { .. } | payload @ EntryPayload::RemoveNode { .. } => {
                    if let Some(publisher) = &publisher {
                        publisher.publish(LogEvent::GroupConfigCommitted {
                            index,
                            payload: payload.clone(),
                        });
                    }
                }
            }
            inner.last_applied = index;
        }
        Ok(())
    }
}

#[async_trait]
impl LogStore for MemLog {
    async fn set_state_machine(&self, state_machine: Arc<dyn StateMachine>) {
        *self.state_machine.write().await = Some(state_machine);
    }

    async fn install_event_publisher(&self, publisher: LogEventPublisher) {
        *self.publisher.write().await = Some(publisher);
    }

    async fn last_entry_meta(&self) -> Result<EntryMeta> {
        Ok(self.inner.read().await.last_entry_meta())
    }

    async fn next_index(&self) -> Result<LogIndex> {
        Ok(self.inner.read().await.next_index())
    }

    async fn commit_index(&self) -> Result<LogIndex> {
        Ok(self.inner.read().await.commit_index)
    }

    async fn is_newer_than(&self, last_index: LogIndex, last_term: Term) -> Result<bool> {
        let ours = self.inner.read().await.last_entry_meta();
        Ok((ours.term, ours.index) > (last_term, last_index))
    }

    async fn append_blank_entry(&self, term: Term) -> Result<Entry> {
        self.do_append(term, EntryPayload::Blank).await
    }

    async fn append_entry(&self, term: Term, data: Vec<u8>) -> Result<Entry> {
        self.do_append(term, EntryPayload::Normal(data)).await
    }

    async fn append_add_node_entry(&self, term: Term, base: Vec<Endpoint>, new_node: Endpoint) -> Result<Entry> {
        self.do_append(term, EntryPayload::AddNode { base, new_node }).await
    }

    async fn append_remove_node_entry(&self, term: Term, base: Vec<Endpoint>, node_id: NodeId) -> Result<Entry> {
        self.do_append(term, EntryPayload::RemoveNode { base, node_id }).await
    }

    async fn append_entries_from_leader(
        &self,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<Entry>,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;

        if prev_log_index > 0 {
            let prev_matches = match inner.entries.get(&prev_log_index) {
                Some(entry) => entry.term == prev_log_term,
                None => match &inner.snapshot {
                    Some(snapshot) => {
                        snapshot.last_included.index == prev_log_index && snapshot.last_included.term == prev_log_term
                    }
                    None => false,
                },
            };
            if !prev_matches {
                return Ok(false);
            }
        }

        let mut removed_configs: Vec<Entry> = Vec::new();
        let mut appended_configs: Vec<Entry> = Vec::new();
        for entry in entries {
            match inner.entries.get(&entry.index) {
                // Already present; replaying is a no-op.
                Some(existing) if existing.term == entry.term => continue,
                Some(_) => {
                    // Conflict: the entry and everything after it go.
                    let removed = inner.entries.split_off(&entry.index);
                    for removed_entry in removed.values() {
                        if removed_entry.payload.is_group_config() {
                            removed_configs.push(removed_entry.clone());
                        }
                    }
                    if entry.payload.is_group_config() {
                        appended_configs.push(entry.clone());
                    }
                    inner.entries.insert(entry.index, entry);
                }
                None => {
                    if entry.payload.is_group_config() {
                        appended_configs.push(entry.clone());
                    }
                    inner.entries.insert(entry.index, entry);
                }
            }
        }

        let publisher = self.publisher.read().await.clone();
        if let Some(publisher) = &publisher {
            if let Some(first_removed) = removed_configs.first() {
                if let Some(base) = first_removed.payload.base_endpoints() {
                    publisher.publish(LogEvent::GroupConfigBatchRemoved {
                        revert_to: base.to_vec(),
                    });
                }
            }
            for entry in &appended_configs {
                if let Some(result) = entry.payload.result_endpoints() {
                    publisher.publish(LogEvent::GroupConfigAppended {
                        index: entry.index,
                        result,
                    });
                }
            }
        }
        Ok(true)
    }

    async fn advance_commit_index(&self, index: LogIndex, term: Term) -> Result<()> {
        let mut inner = self.inner.write().await;
        if index <= inner.commit_index {
            return Ok(());
        }
        match inner.entries.get(&index).map(|entry| entry.term) {
            Some(entry_term) if entry_term == term => {}
            Some(entry_term) => {
                tracing::debug!(index, entry_term, term, "refusing commit advance: entry term mismatch");
                return Ok(());
            }
            None => {
                tracing::debug!(index, "refusing commit advance: no entry at index");
                return Ok(());
            }
        }
        inner.commit_index = index;
        tracing::debug!(id = self.id, commit_index = index, "commit index advanced");
        self.apply_committed(&mut inner).await
    }

    async fn create_append_entries_rpc(
        &self,
        term: Term,
        leader_id: NodeId,
        next_index: LogIndex,
        max_entries: u64,
    ) -> Result<AppendEntriesRpc> {
        let inner = self.inner.read().await;
        if let Some(snapshot) = &inner.snapshot {
            if next_index <= snapshot.last_included.index {
                return Err(EntryInSnapshot { index: next_index }.into());
            }
        }
        let prev = if next_index == 1 {
            EntryMeta::default()
        } else {
            match inner.entries.get(&(next_index - 1)) {
                Some(entry) => entry.meta(),
                None => match &inner.snapshot {
                    Some(snapshot) if snapshot.last_included.index == next_index - 1 => snapshot.last_included,
                    _ => return Err(anyhow!("no entry at index {}", next_index - 1)),
                },
            }
        };
        let entries: Vec<Entry> =
            inner.entries.range(next_index..).take(max_entries as usize).map(|(_, entry)| entry.clone()).collect();
        Ok(AppendEntriesRpc {
            message_id: 0,
            term,
            leader_id,
            prev_log_index: prev.index,
            prev_log_term: prev.term,
            entries,
            leader_commit: inner.commit_index,
        })
    }

    async fn create_install_snapshot_rpc(
        &self,
        term: Term,
        leader_id: NodeId,
        offset: u64,
        length: u64,
    ) -> Result<InstallSnapshotRpc> {
        let inner = self.inner.read().await;
        let snapshot = inner.snapshot.as_ref().ok_or_else(|| anyhow!("no snapshot available"))?;
        let total = snapshot.data.len() as u64;
        if offset > total {
            return Err(anyhow!("snapshot offset {} beyond length {}", offset, total));
        }
        let end = cmp::min(total, offset + length);
        Ok(InstallSnapshotRpc {
            term,
            leader_id,
            last_included_index: snapshot.last_included.index,
            last_included_term: snapshot.last_included.term,
            last_config: snapshot.last_config.clone(),
            offset,
            data: snapshot.data[offset as usize..end as usize].to_vec(),
            done: end == total,
        })
    }

    async fn install_snapshot(&self, rpc: InstallSnapshotRpc) -> Result<()> {
        let mut inner = self.inner.write().await;
        let last_included = EntryMeta {
            term: rpc.last_included_term,
            index: rpc.last_included_index,
        };

        if rpc.offset == 0 {
            inner.pending_snapshot = Some(PendingSnapshot {
                last_included,
                last_config: rpc.last_config.clone(),
                data: rpc.data.clone(),
            });
        } else {
            match &mut inner.pending_snapshot {
                Some(pending) if pending.data.len() as u64 == rpc.offset => {
                    pending.data.extend_from_slice(&rpc.data);
                }
                _ => return Err(anyhow!("snapshot chunk at offset {} is out of order", rpc.offset)),
            }
        }

        if rpc.done {
            let pending = match inner.pending_snapshot.take() {
                Some(pending) => pending,
                None => return Err(anyhow!("snapshot finished without pending data")),
            };
            let tail = inner.entries.split_off(&(pending.last_included.index + 1));
            inner.entries = tail;
            inner.commit_index = cmp::max(inner.commit_index, pending.last_included.index);
            inner.last_applied = cmp::max(inner.last_applied, pending.last_included.index);

            let state_machine = self.state_machine.read().await.clone();
            if let Some(state_machine) = &state_machine {
                state_machine.restore_snapshot(pending.last_included, &pending.data).await?;
            }
            tracing::info!(id = self.id, last_included = %pending.last_included, "snapshot installed");
            inner.snapshot = Some(MemSnapshot {
                last_included: pending.last_included,
                last_config: pending.last_config,
                data: pending.data,
            });
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The durable (term, voted_for) pair.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: Term,
    pub voted_for: Option<NodeId>,
}

/// An in-memory [`NodeStore`] which records its writes, so tests can assert
/// when the pair is (not) persisted, and with what.
#[derive(Default)]
pub struct MemNodeStore {
    inner: RwLock<HardState>,
    writes: AtomicU64,
    history: RwLock<Vec<HardState>>,
}

impl MemNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(term: Term, voted_for: Option<NodeId>) -> Self {
        Self {
            inner: RwLock::new(HardState { term, voted_for }),
            writes: AtomicU64::new(0),
            history: RwLock::new(Vec::new()),
        }
    }

    pub async fn hard_state(&self) -> HardState {
        self.inner.read().await.clone()
    }

    /// The number of persisted writes so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Every pair persisted so far, in order.
    pub async fn history(&self) -> Vec<HardState> {
        self.history.read().await.clone()
    }
}

#[async_trait]
impl NodeStore for MemNodeStore {
    async fn term(&self) -> Result<Term> {
        Ok(self.inner.read().await.term)
    }

    async fn voted_for(&self) -> Result<Option<NodeId>> {
        Ok(self.inner.read().await.voted_for)
    }

    async fn set_term_and_voted_for(&self, term: Term, voted_for: Option<NodeId>) -> Result<()> {
        let state = HardState { term, voted_for };
        let mut inner = self.inner.write().await;
        *inner = state.clone();
        self.history.write().await.push(state);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The serialized form of [`MemStateMachine`], also used as its snapshot
/// payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StateMachineContents {
    pub last_applied: LogIndex,
    pub commands: Vec<Vec<u8>>,
}

/// A state machine which records every applied command.
#[derive(Default)]
pub struct MemStateMachine {
    inner: RwLock<StateMachineContents>,
}

impl MemStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn last_applied(&self) -> LogIndex {
        self.inner.read().await.last_applied
    }

    pub async fn commands(&self) -> Vec<Vec<u8>> {
        self.inner.read().await.commands.clone()
    }

    /// Serialize the current contents as a snapshot payload.
    pub async fn snapshot_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&*self.inner.read().await)?)
    }
}

#[async_trait]
impl StateMachine for MemStateMachine {
    async fn apply(&self, index: LogIndex, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.write().await;
        if index <= inner.last_applied {
            // Replayed entry; already recorded.
            return Ok(());
        }
        inner.commands.push(data.to_vec());
        inner.last_applied = index;
        Ok(())
    }

    async fn restore_snapshot(&self, last_included: EntryMeta, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.write().await;
        if data.is_empty() {
            *inner = StateMachineContents {
                last_applied: last_included.index,
                commands: Vec::new(),
            };
            return Ok(());
        }
        let mut contents: StateMachineContents = serde_json::from_slice(data)?;
        contents.last_applied = last_included.index;
        *inner = contents;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: LogIndex, term: Term) -> Entry {
        Entry {
            index,
            term,
            payload: EntryPayload::Normal(format!("cmd-{}", index).into_bytes()),
        }
    }

    #[tokio::test]
    async fn append_from_leader_rejects_prev_past_end() {
        let log = MemLog::new(1);
        let ok = log.append_entries_from_leader(5, 1, vec![entry(6, 1)]).await.unwrap();
        assert!(!ok);
        assert_eq!(log.next_index().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn append_from_leader_rejects_prev_term_mismatch() {
        let log = MemLog::new(1);
        log.insert_entry(entry(1, 1)).await;
        let ok = log.append_entries_from_leader(1, 2, vec![entry(2, 2)]).await.unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn replaying_present_entries_is_a_no_op() {
        let log = MemLog::new(1);
        assert!(log.append_entries_from_leader(0, 0, vec![entry(1, 1), entry(2, 1)]).await.unwrap());
        let before = log.entry(2).await.unwrap();
        assert!(log.append_entries_from_leader(0, 0, vec![entry(1, 1), entry(2, 1)]).await.unwrap());
        assert_eq!(log.entry(2).await.unwrap(), before);
        assert_eq!(log.next_index().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn conflicting_entries_truncate_the_suffix() {
        let log = MemLog::new(1);
        assert!(log
            .append_entries_from_leader(0, 0, vec![entry(1, 1), entry(2, 1), entry(3, 1)])
            .await
            .unwrap());
        // A new leader at term 2 overwrites index 2 and implicitly drops 3.
        assert!(log.append_entries_from_leader(1, 1, vec![entry(2, 2)]).await.unwrap());
        assert_eq!(log.entry(2).await.unwrap().term, 2);
        assert_eq!(log.entry(3).await, None);
        assert_eq!(log.next_index().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn commit_advance_requires_matching_term() {
        let log = MemLog::new(1);
        log.insert_entry(entry(1, 1)).await;
        log.insert_entry(entry(2, 1)).await;
        // Entry at index 2 has term 1; a term-2 leader may not commit it
        // directly.
        log.advance_commit_index(2, 2).await.unwrap();
        assert_eq!(log.commit_index().await.unwrap(), 0);
        log.advance_commit_index(2, 1).await.unwrap();
        assert_eq!(log.commit_index().await.unwrap(), 2);
        // Never backwards.
        log.advance_commit_index(1, 1).await.unwrap();
        assert_eq!(log.commit_index().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn committed_commands_reach_the_state_machine() {
        let log = MemLog::new(1);
        let sm = Arc::new(MemStateMachine::new());
        log.set_state_machine(sm.clone()).await;
        log.insert_entry(entry(1, 1)).await;
        log.insert_entry(entry(2, 1)).await;
        log.advance_commit_index(2, 1).await.unwrap();
        assert_eq!(sm.last_applied().await, 2);
        assert_eq!(sm.commands().await.len(), 2);
    }

    #[tokio::test]
    async fn is_newer_than_compares_term_then_index() {
        let log = MemLog::new(1);
        log.insert_entry(entry(1, 2)).await;
        assert!(log.is_newer_than(5, 1).await.unwrap());
        assert!(!log.is_newer_than(1, 2).await.unwrap());
        assert!(!log.is_newer_than(2, 2).await.unwrap());
        assert!(!log.is_newer_than(1, 3).await.unwrap());
    }

    #[tokio::test]
    async fn create_append_entries_rpc_reports_compacted_prefix() {
        let log = MemLog::new(1);
        log.insert_entry(entry(1, 1)).await;
        log.insert_entry(entry(2, 1)).await;
        log.insert_entry(entry(3, 1)).await;
        log.compact(2, b"snap".to_vec(), vec![Endpoint::new(1, "a")]).await.unwrap();

        let err = log.create_append_entries_rpc(1, 1, 2, 10).await.unwrap_err();
        assert!(err.downcast_ref::<EntryInSnapshot>().is_some());

        // The entry right past the boundary is still reachable, with the
        // snapshot standing in for prev.
        let rpc = log.create_append_entries_rpc(1, 1, 3, 10).await.unwrap();
        assert_eq!(rpc.prev_log_index, 2);
        assert_eq!(rpc.prev_log_term, 1);
        assert_eq!(rpc.entries.len(), 1);
    }

    #[tokio::test]
    async fn snapshot_chunks_round_trip() {
        let source = MemLog::new(1);
        source.insert_entry(entry(1, 1)).await;
        source.insert_entry(entry(2, 1)).await;
        let config = vec![Endpoint::new(1, "a"), Endpoint::new(2, "b")];
        source.compact(2, b"0123456789".to_vec(), config.clone()).await.unwrap();

        let target = MemLog::new(2);
        let mut offset = 0;
        loop {
            let chunk = source.create_install_snapshot_rpc(1, 1, offset, 4).await.unwrap();
            let done = chunk.done;
            let len = chunk.data.len() as u64;
            target.install_snapshot(chunk).await.unwrap();
            if done {
                break;
            }
            offset += len;
        }
        let installed = target.snapshot().await.unwrap();
        assert_eq!(installed.data, b"0123456789".to_vec());
        assert_eq!(installed.last_included, EntryMeta { term: 1, index: 2 });
        assert_eq!(target.next_index().await.unwrap(), 3);
        assert_eq!(target.commit_index().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn state_machine_snapshot_round_trip() {
        let sm = MemStateMachine::new();
        sm.apply(1, b"a").await.unwrap();
        sm.apply(2, b"b").await.unwrap();
        let bytes = sm.snapshot_bytes().await.unwrap();

        let restored = MemStateMachine::new();
        restored.restore_snapshot(EntryMeta { term: 1, index: 2 }, &bytes).await.unwrap();
        assert_eq!(restored.last_applied().await, 2);
        assert_eq!(restored.commands().await, vec![b"a".to_vec(), b"b".to_vec()]);
    }
}
