//! The RPC transport interface.

use anyhow::Result;
use async_trait::async_trait;

use crate::membership::Endpoint;
use crate::node::AppendEntriesResult;
use crate::node::AppendEntriesRpc;
use crate::node::InstallSnapshotResult;
use crate::node::InstallSnapshotRpc;
use crate::node::NodeIngress;
use crate::node::VoteResult;
use crate::node::VoteRpc;
use crate::NodeId;

/// An inbound RPC together with the id of the node which sent it.
///
/// The envelope is handed back to the transport when replying, so the result
/// can be routed to its source.
#[derive(Clone, Debug)]
pub struct RpcEnvelope<T> {
    pub source: NodeId,
    pub rpc: T,
}

/// The network transport of a node.
///
/// Sends are one-way: a request travels to the target node, which posts it
/// into its own inbox via [`NodeIngress`]; the target's reply travels back
/// through `reply_*` and arrives at this node as a `*_result` ingress
/// message. Send failures are logged by the node and recovered by the next
/// replication tick or election timeout.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Called once from node start. The ingress is the write side of the
    /// node's inbox; the transport delivers every inbound request and result
    /// through it.
    async fn initialize(&self, ingress: NodeIngress) -> Result<()>;

    /// Send a RequestVote RPC to all `targets`.
    async fn send_request_vote(&self, rpc: VoteRpc, targets: Vec<Endpoint>) -> Result<()>;

    /// Send an AppendEntries RPC to `target`.
    async fn send_append_entries(&self, rpc: AppendEntriesRpc, target: Endpoint) -> Result<()>;

    /// Send an InstallSnapshot RPC to `target`.
    async fn send_install_snapshot(&self, rpc: InstallSnapshotRpc, target: Endpoint) -> Result<()>;

    /// Route a RequestVote result back to the sender of `to`.
    async fn reply_request_vote(&self, result: VoteResult, to: RpcEnvelope<VoteRpc>) -> Result<()>;

    /// Route an AppendEntries result back to the sender of `to`.
    async fn reply_append_entries(&self, result: AppendEntriesResult, to: RpcEnvelope<AppendEntriesRpc>) -> Result<()>;

    /// Route an InstallSnapshot result back to the sender of `to`.
    async fn reply_install_snapshot(
        &self,
        result: InstallSnapshotResult,
        to: RpcEnvelope<InstallSnapshotRpc>,
    ) -> Result<()>;

    /// Drop any buffered per-peer channel state. Called when this node
    /// becomes leader.
    fn reset_channels(&self);

    /// Close the transport. Called once from node stop.
    async fn close(&self) -> Result<()>;
}
