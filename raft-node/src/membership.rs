//! The cluster membership registry and its per-peer replication bookkeeping.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::time::Instant;

use crate::quorum;
use crate::LogIndex;
use crate::NodeId;

/// The address of a cluster member.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: NodeId,
    pub addr: String,
}

impl Endpoint {
    pub fn new(id: NodeId, addr: impl Into<String>) -> Self {
        Self { id, addr: addr.into() }
    }
}

/// A cluster member together with the leader's replication bookkeeping for it.
#[derive(Clone, Debug)]
pub struct GroupMember {
    pub endpoint: Endpoint,
    /// The index of the next entry to send to this member.
    pub next_index: LogIndex,
    /// The index of the highest entry known to be replicated on this member.
    pub match_index: LogIndex,
    /// Whether the member counts toward the majority threshold.
    pub is_major: bool,
    /// Set while a config entry removing this member is in flight.
    pub is_removing: bool,
    /// Whether a replication message to this member is in flight.
    pub replicating: bool,
    pub last_replicated_at: Option<Instant>,
}

impl GroupMember {
    fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            next_index: 1,
            match_index: 0,
            is_major: true,
            is_removing: false,
            replicating: false,
            last_replicated_at: None,
        }
    }

    /// Whether a replication message should go out to this member now:
    /// either none is in flight, or the one in flight is older than the
    /// minimum replication interval.
    pub(crate) fn should_replicate(&self, min_interval: Duration) -> bool {
        if !self.replicating {
            return true;
        }
        match self.last_replicated_at {
            Some(at) => at.elapsed() >= min_interval,
            None => true,
        }
    }
}

/// The addressable set of cluster members.
pub(crate) struct Group {
    self_id: NodeId,
    members: BTreeMap<NodeId, GroupMember>,
}

impl Group {
    pub fn new(self_id: NodeId, endpoints: Vec<Endpoint>) -> Self {
        let members = endpoints.into_iter().map(|ep| (ep.id, GroupMember::new(ep))).collect();
        Self { self_id, members }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.members.contains_key(&id)
    }

    pub fn member(&self, id: NodeId) -> Option<&GroupMember> {
        self.members.get(&id)
    }

    pub fn member_mut(&mut self, id: NodeId) -> Option<&mut GroupMember> {
        self.members.get_mut(&id)
    }

    /// True if this node is the only member of its group.
    pub fn is_standalone(&self) -> bool {
        self.members.len() == 1 && self.members.contains_key(&self.self_id)
    }

    /// The number of voting members.
    pub fn major_count(&self) -> usize {
        self.members.values().filter(|m| m.is_major).count()
    }

    /// The ids of the voting members.
    pub fn major_ids(&self) -> Vec<NodeId> {
        self.members.values().filter(|m| m.is_major).map(|m| m.endpoint.id).collect()
    }

    /// The endpoints of the voting members.
    pub fn major_endpoints(&self) -> Vec<Endpoint> {
        self.members.values().filter(|m| m.is_major).map(|m| m.endpoint.clone()).collect()
    }

    /// The endpoints of every member, voting or not.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.members.values().map(|m| m.endpoint.clone()).collect()
    }

    /// The endpoints RequestVote is broadcast to: voting members except this
    /// node.
    pub fn peer_endpoints_of_major(&self) -> Vec<Endpoint> {
        self.members
            .values()
            .filter(|m| m.is_major && m.endpoint.id != self.self_id)
            .map(|m| m.endpoint.clone())
            .collect()
    }

    /// The ids replication messages go out to: every member except this
    /// node. Members being removed still receive entries so the config
    /// entry removing them can reach them.
    pub fn replication_target_ids(&self) -> Vec<NodeId> {
        self.members.keys().copied().filter(|id| *id != self.self_id).collect()
    }

    /// Register a member which has finished catching up, with the
    /// replication state derived from its catch-up session.
    pub fn add(&mut self, endpoint: Endpoint, next_index: LogIndex, match_index: LogIndex) {
        let id = endpoint.id;
        let mut member = GroupMember::new(endpoint);
        member.next_index = next_index;
        member.match_index = match_index;
        self.members.insert(id, member);
    }

    /// Take the member out of the voting set ahead of its removal entry.
    pub fn downgrade(&mut self, id: NodeId) -> bool {
        match self.members.get_mut(&id) {
            Some(member) => {
                member.is_major = false;
                member.is_removing = true;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: NodeId) {
        self.members.remove(&id);
    }

    /// Replace the member set with `endpoints`, keeping existing replication
    /// bookkeeping for members which survive. New members start at
    /// `next_index`.
    pub fn update_from(&mut self, endpoints: &[Endpoint], next_index: LogIndex) {
        let mut members = BTreeMap::new();
        for ep in endpoints {
            let member = match self.members.remove(&ep.id) {
                Some(mut existing) => {
                    existing.endpoint = ep.clone();
                    existing.is_major = true;
                    existing.is_removing = false;
                    existing
                }
                None => {
                    let mut member = GroupMember::new(ep.clone());
                    member.next_index = next_index;
                    member
                }
            };
            members.insert(ep.id, member);
        }
        self.members = members;
    }

    /// Reset replication bookkeeping for every member; performed when this
    /// node becomes leader.
    pub fn reset_replication_states(&mut self, next_index: LogIndex) {
        for member in self.members.values_mut() {
            member.next_index = next_index;
            member.match_index = 0;
            member.replicating = false;
            member.last_replicated_at = None;
        }
    }

    /// The highest index replicated on a majority of the voting members,
    /// counting this node's own log at `self_last`.
    pub fn major_match_index(&self, self_last: LogIndex) -> LogIndex {
        let mut matched: Vec<LogIndex> = self
            .members
            .values()
            .filter(|m| m.is_major)
            .map(|m| if m.endpoint.id == self.self_id { self_last } else { m.match_index })
            .collect();
        if matched.is_empty() {
            return 0;
        }
        matched.sort_unstable();
        let majority = quorum::majority_of(matched.len());
        matched[matched.len() - majority]
    }
}
