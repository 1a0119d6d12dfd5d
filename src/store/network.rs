//! Outbound raft RPC over the cluster transport.

use std::io;
use std::sync::Arc;

use openraft::BasicNode;
use openraft::error::InstallSnapshotError;
use openraft::error::NetworkError;
use openraft::error::RPCError;
use openraft::error::RaftError;
use openraft::error::RemoteError;
use openraft::error::Unreachable;
use openraft::network::RPCOption;
use openraft::network::RaftNetwork;
use openraft::network::RaftNetworkFactory;
use openraft::raft::AppendEntriesRequest;
use openraft::raft::AppendEntriesResponse;
use openraft::raft::InstallSnapshotRequest;
use openraft::raft::InstallSnapshotResponse;
use openraft::raft::VoteRequest;
use openraft::raft::VoteResponse;
use tracing::warn;

use super::rpc::RaftRpcRequest;
use super::rpc::RaftRpcResponse;
use super::types::NodeId;
use super::types::TypeConfig;
use crate::constants::DIAL_TIMEOUT;
use crate::constants::MAX_MESSAGE_SIZE;
use crate::transport::Transport;
use crate::transport::round_trip;

type RpcResult<T, E = RaftError<NodeId>> = Result<T, RPCError<NodeId, BasicNode, E>>;

/// Hands out one [`TcpRaftNetwork`] per peer.
#[derive(Clone)]
pub struct TcpRaftNetworkFactory {
    transport: Arc<dyn Transport>,
}

impl TcpRaftNetworkFactory {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

impl RaftNetworkFactory<TypeConfig> for TcpRaftNetworkFactory {
    type Network = TcpRaftNetwork;

    async fn new_client(&mut self, target: NodeId, node: &BasicNode) -> Self::Network {
        TcpRaftNetwork {
            addr: node.addr.clone(),
            target,
            transport: Arc::clone(&self.transport),
        }
    }
}

pub struct TcpRaftNetwork {
    addr: String,
    target: NodeId,
    transport: Arc<dyn Transport>,
}

/// Transport-level failure, before any response was decoded.
enum SendError {
    Unreachable(io::Error),
    Network(io::Error),
}

impl SendError {
    fn into_rpc<E: std::error::Error>(self) -> RPCError<NodeId, BasicNode, E> {
        match self {
            SendError::Unreachable(e) => RPCError::Unreachable(Unreachable::new(&e)),
            SendError::Network(e) => RPCError::Network(NetworkError::new(&e)),
        }
    }
}

impl TcpRaftNetwork {
    async fn send(&self, request: RaftRpcRequest, option: &RPCOption) -> Result<RaftRpcResponse, SendError> {
        let kind = request.kind();
        let payload = serde_json::to_vec(&request)
            .map_err(|e| SendError::Network(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
        let dial_timeout = option.hard_ttl().min(DIAL_TIMEOUT);
        let stream = self.transport.dial(&self.addr, dial_timeout).await.map_err(|e| {
            warn!(target_node = self.target, addr = %self.addr, rpc = kind, error = %e, "raft peer unreachable");
            SendError::Unreachable(e)
        })?;
        let reply = tokio::time::timeout(option.hard_ttl(), round_trip(stream, &payload, MAX_MESSAGE_SIZE))
            .await
            .map_err(|_| SendError::Network(io::Error::new(io::ErrorKind::TimedOut, format!("{kind} timed out"))))?
            .map_err(SendError::Network)?;
        serde_json::from_slice(&reply)
            .map_err(|e| SendError::Network(io::Error::new(io::ErrorKind::InvalidData, e)))
    }

    fn unexpected<E: std::error::Error>(&self, kind: &str) -> RPCError<NodeId, BasicNode, E> {
        let err = io::Error::new(io::ErrorKind::InvalidData, format!("unexpected response type for {kind}"));
        RPCError::Network(NetworkError::new(&err))
    }
}

impl RaftNetwork<TypeConfig> for TcpRaftNetwork {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        option: RPCOption,
    ) -> RpcResult<AppendEntriesResponse<NodeId>> {
        match self.send(RaftRpcRequest::AppendEntries(rpc), &option).await {
            Ok(RaftRpcResponse::AppendEntries(Ok(resp))) => Ok(resp),
            Ok(RaftRpcResponse::AppendEntries(Err(e))) => Err(RPCError::RemoteError(RemoteError::new(self.target, e))),
            Ok(_) => Err(self.unexpected("append_entries")),
            Err(e) => Err(e.into_rpc()),
        }
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        option: RPCOption,
    ) -> RpcResult<InstallSnapshotResponse<NodeId>, RaftError<NodeId, InstallSnapshotError>> {
        match self.send(RaftRpcRequest::InstallSnapshot(rpc), &option).await {
            Ok(RaftRpcResponse::InstallSnapshot(Ok(resp))) => Ok(resp),
            Ok(RaftRpcResponse::InstallSnapshot(Err(e))) => {
                Err(RPCError::RemoteError(RemoteError::new(self.target, e)))
            }
            Ok(_) => Err(self.unexpected("install_snapshot")),
            Err(e) => Err(e.into_rpc()),
        }
    }

    async fn vote(&mut self, rpc: VoteRequest<NodeId>, option: RPCOption) -> RpcResult<VoteResponse<NodeId>> {
        match self.send(RaftRpcRequest::Vote(rpc), &option).await {
            Ok(RaftRpcResponse::Vote(Ok(resp))) => Ok(resp),
            Ok(RaftRpcResponse::Vote(Err(e))) => Err(RPCError::RemoteError(RemoteError::new(self.target, e))),
            Ok(_) => Err(self.unexpected("vote")),
            Err(e) => Err(e.into_rpc()),
        }
    }
}
