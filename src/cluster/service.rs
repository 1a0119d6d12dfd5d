//! Leader-side forwarding listener.
//!
//! Runs on the forwarding channel of the cluster transport. Each connection
//! carries exactly one [`Message`]; the matching local store operation runs and
//! its outcome goes back as one [`Response`]. A request whose `type` is not a
//! known opcode is logged and the connection is dropped without a reply.

use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::message::Message;
use super::message::OPCODES;
use super::message::Response;
use crate::constants::MAX_CONCURRENT_CONNECTIONS;
use crate::constants::MAX_MESSAGE_SIZE;
use crate::store::Store;
use crate::transport::Transport;
use crate::transport::read_message;
use crate::transport::write_message;

pub struct ForwardingService {
    join_handle: JoinHandle<()>,
    cancel_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl ForwardingService {
    pub fn spawn(transport: Arc<dyn Transport>, store: Arc<Store>) -> Self {
        let cancel_token = CancellationToken::new();
        let task_tracker = TaskTracker::new();
        let join_handle = tokio::spawn(run_service(transport, store, cancel_token.clone(), task_tracker.clone()));
        Self {
            join_handle,
            cancel_token,
            task_tracker,
        }
    }

    pub async fn shutdown(self) -> Result<()> {
        info!("shutting down forwarding service");
        self.cancel_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;
        self.join_handle.await.context("forwarding service task panicked")?;
        Ok(())
    }
}

async fn run_service(
    transport: Arc<dyn Transport>,
    store: Arc<Store>,
    cancel: CancellationToken,
    task_tracker: TaskTracker,
) {
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_CONNECTIONS));
    info!(addr = %transport.addr(), "forwarding service listening");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = transport.accept() => {
                let stream = match accepted {
                    Ok(stream) => stream,
                    Err(err) => {
                        debug!(error = %err, "forwarding transport closed");
                        break;
                    }
                };
                let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                    warn!(max = MAX_CONCURRENT_CONNECTIONS, "forwarding connection limit reached");
                    continue;
                };
                let store = Arc::clone(&store);
                task_tracker.spawn(async move {
                    let _permit = permit;
                    if let Err(err) = handle_connection(stream, store).await {
                        error!(error = %err, "forwarded request failed");
                    }
                });
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, store: Arc<Store>) -> Result<()> {
    let raw = read_message(&mut stream, MAX_MESSAGE_SIZE)
        .await
        .context("failed to read forwarded request")?;
    let value: serde_json::Value = serde_json::from_slice(&raw).context("forwarded request is not JSON")?;
    let opcode = value.get("type").and_then(|t| t.as_str()).unwrap_or_default();
    if !OPCODES.contains(&opcode) {
        warn!(opcode, "dropping forwarded request with unknown type");
        return Ok(());
    }
    let message: Message = serde_json::from_value(value).context("failed to decode forwarded request")?;
    debug!(opcode = message.opcode(), "applying forwarded request");

    let result = dispatch(&store, message).await;
    let response = Response::from_result(&result);
    let bytes = serde_json::to_vec(&response).context("failed to encode forwarding response")?;
    write_message(&mut stream, &bytes)
        .await
        .context("failed to write forwarding response")?;
    Ok(())
}

async fn dispatch(store: &Store, message: Message) -> crate::error::Result<()> {
    match message {
        Message::Peer { peers } => store.update_api_peers(peers).await,
        Message::CreateBucket { name, if_not_exist } => {
            if if_not_exist {
                store.create_bucket_if_not_exist(&name).await
            } else {
                store.create_bucket(&name).await
            }
        }
        Message::RemoveBucket { name } => store.remove_bucket(&name).await,
        Message::Update { bucket, key, value } => store.update(&bucket, &key, &value).await,
        Message::Batch { rows } => store.batch(rows).await,
        Message::Join { addr } => store.join(&addr).await,
        Message::Remove { addr } => store.remove(&addr).await,
    }
}
