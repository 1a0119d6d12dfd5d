//! Raft RPC frames exchanged over the cluster transport.
//!
//! One request per connection: the caller writes a JSON [`RaftRpcRequest`],
//! half-closes, and reads back a JSON [`RaftRpcResponse`].

use openraft::error::InstallSnapshotError;
use openraft::error::RaftError;
use openraft::raft::AppendEntriesRequest;
use openraft::raft::AppendEntriesResponse;
use openraft::raft::InstallSnapshotRequest;
use openraft::raft::InstallSnapshotResponse;
use openraft::raft::VoteRequest;
use openraft::raft::VoteResponse;
use serde::Deserialize;
use serde::Serialize;

use super::types::NodeId;
use super::types::TypeConfig;

#[derive(Debug, Serialize, Deserialize)]
pub enum RaftRpcRequest {
    Vote(VoteRequest<NodeId>),
    AppendEntries(AppendEntriesRequest<TypeConfig>),
    InstallSnapshot(InstallSnapshotRequest<TypeConfig>),
}

impl RaftRpcRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Vote(_) => "vote",
            Self::AppendEntries(_) => "append_entries",
            Self::InstallSnapshot(_) => "install_snapshot",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub enum RaftRpcResponse {
    Vote(Result<VoteResponse<NodeId>, RaftError<NodeId>>),
    AppendEntries(Result<AppendEntriesResponse<NodeId>, RaftError<NodeId>>),
    InstallSnapshot(Result<InstallSnapshotResponse<NodeId>, RaftError<NodeId, InstallSnapshotError>>),
}
