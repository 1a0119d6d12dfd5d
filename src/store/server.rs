//! Inbound raft RPC server.
//!
//! Accepts connections from the raft channel of the cluster transport and
//! feeds each decoded request to the local raft core.

use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use openraft::Raft;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::rpc::RaftRpcRequest;
use super::rpc::RaftRpcResponse;
use super::types::TypeConfig;
use crate::constants::MAX_CONCURRENT_CONNECTIONS;
use crate::constants::MAX_MESSAGE_SIZE;
use crate::transport::Transport;
use crate::transport::read_message;
use crate::transport::write_message;

pub struct RaftRpcServer {
    join_handle: JoinHandle<()>,
    cancel_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl RaftRpcServer {
    pub fn spawn(transport: Arc<dyn Transport>, raft: Raft<TypeConfig>) -> Self {
        let cancel_token = CancellationToken::new();
        let task_tracker = TaskTracker::new();
        let join_handle = tokio::spawn(run_server(transport, raft, cancel_token.clone(), task_tracker.clone()));
        Self {
            join_handle,
            cancel_token,
            task_tracker,
        }
    }

    pub async fn shutdown(self) -> Result<()> {
        info!("shutting down raft rpc server");
        self.cancel_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;
        self.join_handle.await.context("raft rpc server task panicked")?;
        Ok(())
    }
}

async fn run_server(
    transport: Arc<dyn Transport>,
    raft: Raft<TypeConfig>,
    cancel: CancellationToken,
    task_tracker: TaskTracker,
) {
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_CONNECTIONS));
    info!(addr = %transport.addr(), "raft rpc server listening");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = transport.accept() => {
                let stream = match accepted {
                    Ok(stream) => stream,
                    Err(err) => {
                        debug!(error = %err, "raft transport closed");
                        break;
                    }
                };
                let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                    warn!(max = MAX_CONCURRENT_CONNECTIONS, "raft rpc connection limit reached");
                    continue;
                };
                let raft = raft.clone();
                task_tracker.spawn(async move {
                    let _permit = permit;
                    if let Err(err) = handle_connection(stream, raft).await {
                        error!(error = %err, "raft rpc failed");
                    }
                });
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, raft: Raft<TypeConfig>) -> Result<()> {
    let raw = read_message(&mut stream, MAX_MESSAGE_SIZE)
        .await
        .context("failed to read raft rpc request")?;
    let request: RaftRpcRequest = serde_json::from_slice(&raw).context("failed to decode raft rpc request")?;
    let response = match request {
        RaftRpcRequest::Vote(req) => RaftRpcResponse::Vote(raft.vote(req).await),
        RaftRpcRequest::AppendEntries(req) => RaftRpcResponse::AppendEntries(raft.append_entries(req).await),
        RaftRpcRequest::InstallSnapshot(req) => RaftRpcResponse::InstallSnapshot(raft.install_snapshot(req).await),
    };
    let bytes = serde_json::to_vec(&response).context("failed to encode raft rpc response")?;
    write_message(&mut stream, &bytes)
        .await
        .context("failed to write raft rpc response")?;
    Ok(())
}
