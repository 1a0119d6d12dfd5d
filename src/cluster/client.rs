//! Follower-side forwarding client.

use std::sync::Arc;

use tracing::debug;

use super::message::Message;
use super::message::Response;
use crate::constants::DIAL_TIMEOUT;
use crate::constants::MAX_MESSAGE_SIZE;
use crate::error::RegistryError;
use crate::error::Result;
use crate::store::Store;
use crate::transport::Transport;
use crate::transport::round_trip;

/// Ships one [`Message`] to the current leader and waits for its answer.
#[derive(Clone)]
pub struct ForwardingClient {
    transport: Arc<dyn Transport>,
}

impl ForwardingClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub async fn forward(&self, store: &Store, message: Message) -> Result<()> {
        let leader = store
            .leader()
            .filter(|addr| !addr.is_empty())
            .ok_or_else(|| RegistryError::forwarding("no leader available"))?;
        self.send(&leader, message).await
    }

    /// Sends `message` to the forwarding service at `addr`.
    pub async fn send(&self, addr: &str, message: Message) -> Result<()> {
        let opcode = message.opcode();
        debug!(leader = %addr, opcode, "forwarding request");
        let payload = serde_json::to_vec(&message)
            .map_err(|e| RegistryError::forwarding(format!("failed to encode {opcode}: {e}")))?;
        let stream = self
            .transport
            .dial(addr, DIAL_TIMEOUT)
            .await
            .map_err(|e| RegistryError::forwarding(format!("dial {addr}: {e}")))?;
        let reply = round_trip(stream, &payload, MAX_MESSAGE_SIZE)
            .await
            .map_err(|e| RegistryError::forwarding(format!("{opcode} to {addr}: {e}")))?;
        let response: Response = serde_json::from_slice(&reply)
            .map_err(|e| RegistryError::forwarding(format!("failed to decode {opcode} response: {e}")))?;
        response.into_result()
    }
}
