//! Cluster-wide view of the store.
//!
//! [`Cluster`] is the [`KeyValueStore`] every layer above the store uses. Reads
//! are local. Writes run against the local [`Store`] first; when it answers
//! `NotLeader`, the same operation is shipped to the leader's
//! [`ForwardingService`] through the [`ForwardingClient`].
//!
//! ```text
//! follower                                   leader
//! Cluster::update ── Store::update ─ NotLeader
//!       └── ForwardingClient ── tcp (tag 2) ──> ForwardingService ── Store::update
//! ```

pub mod client;
pub mod message;
pub mod service;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use self::client::ForwardingClient;
pub use self::message::Message;
pub use self::message::Response;
pub use self::service::ForwardingService;
use crate::error::RegistryError;
use crate::error::Result;
use crate::store::KeyValueStore;
use crate::store::Row;
use crate::store::Store;
use crate::transport::Transport;

pub struct Cluster {
    store: Arc<Store>,
    client: ForwardingClient,
}

impl Cluster {
    /// `transport` is the forwarding channel used to reach the leader.
    pub fn new(store: Arc<Store>, transport: Arc<dyn Transport>) -> Self {
        Self {
            store,
            client: ForwardingClient::new(transport),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    async fn or_forward(&self, local: Result<()>, message: impl FnOnce() -> Message) -> Result<()> {
        match local {
            Err(RegistryError::NotLeader) => self.client.forward(&self.store, message()).await,
            other => other,
        }
    }

    pub async fn update_api_peers(&self, peers: BTreeMap<String, String>) -> Result<()> {
        let local = self.store.update_api_peers(peers.clone()).await;
        self.or_forward(local, || Message::Peer { peers }).await
    }

    pub async fn join(&self, addr: &str) -> Result<()> {
        let local = self.store.join(addr).await;
        self.or_forward(local, || Message::Join { addr: addr.to_string() }).await
    }

    pub async fn remove(&self, addr: &str) -> Result<()> {
        let local = self.store.remove(addr).await;
        self.or_forward(local, || Message::Remove { addr: addr.to_string() }).await
    }

    /// Leader only; a follower gets `NotLeader`.
    pub fn backup(&self) -> Result<Vec<u8>> {
        self.store.backup()
    }

    pub fn leader(&self) -> Option<String> {
        self.store.leader()
    }

    pub fn is_leader(&self) -> bool {
        self.store.is_leader()
    }

    pub fn peers(&self) -> Vec<String> {
        self.store.peers()
    }

    pub fn api_peers(&self) -> BTreeMap<String, String> {
        self.store.api_peers()
    }

    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<String> {
        self.store.wait_for_leader(timeout).await
    }
}

#[async_trait]
impl KeyValueStore for Cluster {
    async fn view(&self, bucket: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.store.view(bucket, key)
    }

    async fn views(&self, bucket: &[u8], prefix: &[u8]) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
        self.store.views(bucket, prefix)
    }

    async fn update(&self, bucket: &[u8], key: &[u8], value: &[u8]) -> Result<()> {
        let local = self.store.update(bucket, key, value).await;
        self.or_forward(local, || Message::Update {
            bucket: bucket.to_vec(),
            key: key.to_vec(),
            value: value.to_vec(),
        })
        .await
    }

    async fn batch(&self, rows: Vec<Row>) -> Result<()> {
        let local = self.store.batch(rows.clone()).await;
        self.or_forward(local, || Message::Batch { rows }).await
    }

    async fn create_bucket(&self, name: &[u8]) -> Result<()> {
        let local = self.store.create_bucket(name).await;
        self.or_forward(local, || Message::CreateBucket {
            name: name.to_vec(),
            if_not_exist: false,
        })
        .await
    }

    async fn create_bucket_if_not_exist(&self, name: &[u8]) -> Result<()> {
        let local = self.store.create_bucket_if_not_exist(name).await;
        self.or_forward(local, || Message::CreateBucket {
            name: name.to_vec(),
            if_not_exist: true,
        })
        .await
    }

    async fn remove_bucket(&self, name: &[u8]) -> Result<()> {
        let local = self.store.remove_bucket(name).await;
        self.or_forward(local, || Message::RemoveBucket { name: name.to_vec() }).await
    }
}
