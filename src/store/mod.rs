//! Replicated bucket store.
//!
//! [`Store`] pairs a local redb bucket file with an openraft group. Reads are
//! served from the local file through the [`BucketCache`]; writes become
//! [`Command`]s appended to the raft log on the leader and applied by every
//! member's [`RegistryStateMachine`]. A follower answers every write with
//! [`RegistryError::NotLeader`]; turning that into a forwarded call is the job
//! of [`crate::cluster::Cluster`].

pub mod bucket;
pub mod log_store;
pub mod memory;
pub mod network;
pub mod rpc;
pub mod server;
pub mod state_machine;
pub mod types;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use openraft::BasicNode;
use openraft::ChangeMembers;
use openraft::Config;
use openraft::Raft;
use openraft::SnapshotPolicy;
use openraft::error::ClientWriteError;
use openraft::error::InitializeError;
use openraft::error::RaftError;
use parking_lot::Mutex;
use tracing::info;
use tracing::warn;

pub use self::bucket::BucketDb;
pub use self::bucket::BucketError;
pub use self::bucket::SnapshotImage;
pub use self::log_store::RaftLogStore;
pub use self::memory::MemoryStore;
#[cfg(test)]
pub(crate) use self::memory::SlowViews;
pub use self::network::TcpRaftNetworkFactory;
pub use self::server::RaftRpcServer;
pub use self::state_machine::ApiPeers;
pub use self::state_machine::RegistryStateMachine;
pub use self::types::Command;
pub use self::types::CommandResponse;
pub use self::types::NodeId;
pub use self::types::Row;
pub use self::types::TypeConfig;
pub use self::types::node_id_for;
use crate::cache::BucketCache;
use crate::constants::APPLY_TIMEOUT;
use crate::constants::DEFAULT_CACHE_CAPACITY;
use crate::constants::LEADER_POLL_INTERVAL;
use crate::constants::PEERS_FILE;
use crate::constants::RAFT_DB_FILE;
use crate::constants::REGISTRY_DB_FILE;
use crate::error::RegistryError;
use crate::error::Result;
use crate::transport::Transport;

/// Bucketed key/value operations shared by the local store, the forwarding
/// facade, and the in-memory test double.
///
/// Missing buckets are `NotFound` on every operation; writes never create a
/// bucket implicitly.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    /// Latest locally applied value, `None` when the key is absent.
    async fn view(&self, bucket: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Every entry of `bucket` whose key starts with `prefix`.
    async fn views(&self, bucket: &[u8], prefix: &[u8]) -> Result<BTreeMap<Vec<u8>, Vec<u8>>>;

    async fn update(&self, bucket: &[u8], key: &[u8], value: &[u8]) -> Result<()>;

    /// Writes all rows in one transaction, or none of them.
    async fn batch(&self, rows: Vec<Row>) -> Result<()>;

    /// Fails with `AlreadyExists` if the bucket is present.
    async fn create_bucket(&self, name: &[u8]) -> Result<()>;

    async fn create_bucket_if_not_exist(&self, name: &[u8]) -> Result<()>;

    async fn remove_bucket(&self, name: &[u8]) -> Result<()>;
}

type WriteError = RaftError<NodeId, ClientWriteError<NodeId, BasicNode>>;

fn map_write_error(err: WriteError) -> RegistryError {
    match err {
        RaftError::APIError(ClientWriteError::ForwardToLeader(_)) => RegistryError::NotLeader,
        other => RegistryError::storage(other.to_string()),
    }
}

/// Settings for [`Store::open`].
pub struct StoreConfig {
    /// Directory holding `raft.db`, `registry.db`, and `peers.json`.
    pub dir: PathBuf,
    /// Address peers dial to reach this member; also the source of its id.
    pub addr: String,
    /// Raft channel of the cluster transport.
    pub transport: Arc<dyn Transport>,
    pub heartbeat: Duration,
    pub election_timeout: Duration,
    /// Initialise a single-member cluster if this member has no raft state.
    pub bootstrap: bool,
    pub cache_capacity: usize,
}

impl StoreConfig {
    pub fn new(dir: impl Into<PathBuf>, addr: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            dir: dir.into(),
            addr: addr.into(),
            transport,
            heartbeat: Duration::from_millis(250),
            election_timeout: Duration::from_millis(1000),
            bootstrap: true,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

pub struct Store {
    id: NodeId,
    addr: String,
    raft: Raft<TypeConfig>,
    db: Arc<BucketDb>,
    cache: Arc<BucketCache>,
    api_peers: ApiPeers,
    server: Mutex<Option<RaftRpcServer>>,
}

impl Store {
    pub async fn open(config: StoreConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        std::fs::create_dir_all(&config.dir)
            .with_context(|| format!("failed to create data dir {}", config.dir.display()))?;
        let id = node_id_for(&config.addr);

        let raft_config = Config {
            cluster_name: "registry".to_string(),
            heartbeat_interval: config.heartbeat.as_millis() as u64,
            election_timeout_min: config.election_timeout.as_millis() as u64,
            election_timeout_max: config.election_timeout.as_millis() as u64 * 2,
            snapshot_policy: SnapshotPolicy::LogsSinceLast(10_000),
            max_in_snapshot_log_to_keep: 1_000,
            ..Default::default()
        }
        .validate()
        .context("invalid raft config")?;

        let log_store = RaftLogStore::open(config.dir.join(RAFT_DB_FILE))?;
        let db = Arc::new(BucketDb::open(config.dir.join(REGISTRY_DB_FILE))?);
        let cache = Arc::new(BucketCache::new(config.cache_capacity));
        let state_machine =
            RegistryStateMachine::new(Arc::clone(&db), Arc::clone(&cache), Some(config.dir.join(PEERS_FILE)))?;
        let api_peers = state_machine.api_peers();

        let network = TcpRaftNetworkFactory::new(Arc::clone(&config.transport));
        let raft = Raft::new(id, Arc::new(raft_config), network, log_store, state_machine)
            .await
            .context("failed to start raft")?;
        let server = RaftRpcServer::spawn(Arc::clone(&config.transport), raft.clone());

        if config.bootstrap {
            let mut members = BTreeMap::new();
            members.insert(id, BasicNode::new(&config.addr));
            match raft.initialize(members).await {
                Ok(()) => info!(node_id = id, addr = %config.addr, "bootstrapped single-member cluster"),
                Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {
                    info!(node_id = id, "raft state present, skipping bootstrap")
                }
                Err(err) => return Err(err).context("failed to bootstrap cluster"),
            }
        }

        info!(node_id = id, addr = %config.addr, dir = %config.dir.display(), "store opened");
        Ok(Self {
            id,
            addr: config.addr,
            raft,
            db,
            cache,
            api_peers,
            server: Mutex::new(Some(server)),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Cluster address of this member.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn raft(&self) -> &Raft<TypeConfig> {
        &self.raft
    }

    /// Point read through the cache.
    pub fn view(&self, bucket: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.cache.get(bucket, key) {
            return Ok(Some(value));
        }
        let epoch = self.cache.epoch();
        let value = self.db.view(bucket, key)?;
        if let Some(value) = &value {
            self.cache.add_if_current(epoch, bucket, key, value);
        }
        Ok(value)
    }

    /// Prefix scan. Not cached.
    pub fn views(&self, bucket: &[u8], prefix: &[u8]) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
        Ok(self.db.views(bucket, prefix)?)
    }

    pub fn buckets(&self) -> Result<Vec<String>> {
        Ok(self.db.buckets()?)
    }

    async fn apply(&self, command: Command) -> Result<()> {
        if !self.is_leader() {
            return Err(RegistryError::NotLeader);
        }
        match tokio::time::timeout(APPLY_TIMEOUT, self.raft.client_write(command)).await {
            Err(_) => Err(RegistryError::ConsensusTimeout),
            Ok(Err(err)) => Err(map_write_error(err)),
            Ok(Ok(resp)) => resp.data.into_result(),
        }
    }

    pub async fn update(&self, bucket: &[u8], key: &[u8], value: &[u8]) -> Result<()> {
        self.apply(Command::Update {
            bucket: bucket.to_vec(),
            key: key.to_vec(),
            value: value.to_vec(),
        })
        .await
    }

    pub async fn batch(&self, rows: Vec<Row>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        self.apply(Command::Batch { rows }).await
    }

    pub async fn create_bucket(&self, name: &[u8]) -> Result<()> {
        self.apply(Command::CreateBucket {
            name: name.to_vec(),
            if_not_exist: false,
        })
        .await
    }

    pub async fn create_bucket_if_not_exist(&self, name: &[u8]) -> Result<()> {
        self.apply(Command::CreateBucket {
            name: name.to_vec(),
            if_not_exist: true,
        })
        .await
    }

    pub async fn remove_bucket(&self, name: &[u8]) -> Result<()> {
        self.apply(Command::RemoveBucket { name: name.to_vec() }).await
    }

    /// Merges `raft address -> API address` entries into the replicated map.
    pub async fn update_api_peers(&self, peers: BTreeMap<String, String>) -> Result<()> {
        self.apply(Command::UpdateApiPeers { peers }).await
    }

    /// Adds the member listening on `addr` as a voter.
    pub async fn join(&self, addr: &str) -> Result<()> {
        if !self.is_leader() {
            return Err(RegistryError::NotLeader);
        }
        let id = node_id_for(addr);
        info!(node_id = id, %addr, "adding cluster member");
        self.raft
            .add_learner(id, BasicNode::new(addr), true)
            .await
            .map_err(map_write_error)?;
        self.raft
            .change_membership(ChangeMembers::AddVoterIds(BTreeSet::from([id])), false)
            .await
            .map_err(map_write_error)?;
        Ok(())
    }

    /// Removes the member listening on `addr`.
    pub async fn remove(&self, addr: &str) -> Result<()> {
        if !self.is_leader() {
            return Err(RegistryError::NotLeader);
        }
        let id = node_id_for(addr);
        if !self.voter_ids().contains(&id) {
            return Err(RegistryError::not_found(format!("peer {addr}")));
        }
        info!(node_id = id, %addr, "removing cluster member");
        self.raft
            .change_membership(ChangeMembers::RemoveVoters(BTreeSet::from([id])), false)
            .await
            .map_err(map_write_error)?;
        Ok(())
    }

    /// JSON image of every bucket. Leader only.
    pub fn backup(&self) -> Result<Vec<u8>> {
        if !self.is_leader() {
            return Err(RegistryError::NotLeader);
        }
        let image = self.db.export()?;
        serde_json::to_vec(&image).map_err(|e| RegistryError::storage(format!("failed to encode backup: {e}")))
    }

    /// Polls until a leader is known and returns its address.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader() {
                return Ok(leader);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RegistryError::ConsensusTimeout);
            }
            tokio::time::sleep(LEADER_POLL_INTERVAL).await;
        }
    }

    /// Cluster address of the current leader, if one is known.
    pub fn leader(&self) -> Option<String> {
        let metrics = self.raft.metrics();
        let metrics = metrics.borrow();
        let leader = metrics.current_leader?;
        metrics.membership_config.membership().get_node(&leader).map(|node| node.addr.clone())
    }

    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().current_leader == Some(self.id)
    }

    fn voter_ids(&self) -> BTreeSet<NodeId> {
        self.raft.metrics().borrow().membership_config.membership().voter_ids().collect()
    }

    /// Cluster addresses of every voter.
    pub fn peers(&self) -> Vec<String> {
        let metrics = self.raft.metrics();
        let metrics = metrics.borrow();
        let membership = metrics.membership_config.membership();
        membership
            .voter_ids()
            .filter_map(|id| membership.get_node(&id).map(|node| node.addr.clone()))
            .collect()
    }

    /// Replicated `raft address -> API address` map.
    pub fn api_peers(&self) -> BTreeMap<String, String> {
        self.api_peers.read().clone()
    }

    /// Stops the RPC server and the raft core.
    pub async fn close(&self) -> anyhow::Result<()> {
        let server = self.server.lock().take();
        if let Some(server) = server {
            server.shutdown().await?;
        }
        if let Err(err) = self.raft.shutdown().await {
            warn!(error = %err, "raft shutdown failed");
        }
        info!(node_id = self.id, "store closed");
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for Store {
    async fn view(&self, bucket: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>> {
        Store::view(self, bucket, key)
    }

    async fn views(&self, bucket: &[u8], prefix: &[u8]) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
        Store::views(self, bucket, prefix)
    }

    async fn update(&self, bucket: &[u8], key: &[u8], value: &[u8]) -> Result<()> {
        Store::update(self, bucket, key, value).await
    }

    async fn batch(&self, rows: Vec<Row>) -> Result<()> {
        Store::batch(self, rows).await
    }

    async fn create_bucket(&self, name: &[u8]) -> Result<()> {
        Store::create_bucket(self, name).await
    }

    async fn create_bucket_if_not_exist(&self, name: &[u8]) -> Result<()> {
        Store::create_bucket_if_not_exist(self, name).await
    }

    async fn remove_bucket(&self, name: &[u8]) -> Result<()> {
        Store::remove_bucket(self, name).await
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::transport::Multiplexer;
    use crate::transport::RAFT_TAG;

    async fn bind(addr: &str) -> Arc<Multiplexer> {
        // A closed multiplexer releases its port once its accept loop exits.
        for _ in 0..50 {
            if let Ok(mux) = Multiplexer::bind(addr).await {
                return mux;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("could not bind {addr}");
    }

    async fn single_node(dir: &TempDir) -> (Arc<Multiplexer>, Store) {
        single_node_at(dir, "127.0.0.1:0").await
    }

    async fn single_node_at(dir: &TempDir, bind_addr: &str) -> (Arc<Multiplexer>, Store) {
        let mux = bind(bind_addr).await;
        let addr = mux.addr().to_string();
        let transport: Arc<dyn Transport> = mux.channel(RAFT_TAG);
        tokio::spawn(Arc::clone(&mux).serve());
        let mut config = StoreConfig::new(dir.path(), addr, transport);
        config.heartbeat = Duration::from_millis(50);
        config.election_timeout = Duration::from_millis(200);
        let store = Store::open(config).await.unwrap();
        store.wait_for_leader(Duration::from_secs(5)).await.unwrap();
        (mux, store)
    }

    #[tokio::test]
    async fn test_single_node_write_read() {
        let dir = TempDir::new().unwrap();
        let (mux, store) = single_node(&dir).await;
        assert!(store.is_leader());
        assert_eq!(store.leader().as_deref(), Some(store.addr()));
        assert_eq!(store.peers(), vec![store.addr().to_string()]);

        assert!(store.update(b"loda", b"k", b"v").await.unwrap_err().is_not_found());
        store.create_bucket(b"loda").await.unwrap();
        assert!(matches!(store.create_bucket(b"loda").await, Err(RegistryError::AlreadyExists { .. })));
        store.create_bucket_if_not_exist(b"loda").await.unwrap();

        store.update(b"loda", b"k", b"v1").await.unwrap();
        assert_eq!(store.view(b"loda", b"k").unwrap(), Some(b"v1".to_vec()));
        store.update(b"loda", b"k", b"v2").await.unwrap();
        assert_eq!(store.view(b"loda", b"k").unwrap(), Some(b"v2".to_vec()));

        store
            .batch(vec![Row::new("loda", "a", b"1".to_vec()), Row::new("loda", "b", b"2".to_vec())])
            .await
            .unwrap();
        assert_eq!(store.views(b"loda", b"").unwrap().len(), 3);

        let image: SnapshotImage = serde_json::from_slice(&store.backup().unwrap()).unwrap();
        assert_eq!(image.buckets["loda"].len(), 3);

        store.remove_bucket(b"loda").await.unwrap();
        assert!(store.view(b"loda", b"k").unwrap_err().is_not_found());

        store.close().await.unwrap();
        mux.close();
    }

    #[tokio::test]
    async fn test_api_peers_replicated() {
        let dir = TempDir::new().unwrap();
        let (mux, store) = single_node(&dir).await;
        let mut peers = BTreeMap::new();
        peers.insert(store.addr().to_string(), "127.0.0.1:8001".to_string());
        store.update_api_peers(peers.clone()).await.unwrap();
        assert_eq!(store.api_peers(), peers);
        store.close().await.unwrap();
        mux.close();
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let dir = TempDir::new().unwrap();
        let addr = {
            let (mux, store) = single_node(&dir).await;
            store.create_bucket(b"report").await.unwrap();
            store.update(b"report", b"h", b"r").await.unwrap();
            store.close().await.unwrap();
            mux.close();
            store.addr().to_string()
        };
        // Same address, same raft id.
        let (mux, store) = single_node_at(&dir, &addr).await;
        assert_eq!(store.view(b"report", b"h").unwrap(), Some(b"r".to_vec()));
        store.close().await.unwrap();
        mux.close();
    }
}
