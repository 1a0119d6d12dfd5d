//! Replicated state machine over the bucket database.
//!
//! Committed commands mutate [`BucketDb`] in one write transaction per apply
//! batch together with the applied log id, then invalidate the cache entries
//! they touched. Snapshots are JSON images of every bucket.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

use openraft::AnyError;
use openraft::BasicNode;
use openraft::EntryPayload;
use openraft::LogId;
use openraft::OptionalSend;
use openraft::Snapshot;
use openraft::SnapshotMeta;
use openraft::StorageError;
use openraft::StorageIOError;
use openraft::StoredMembership;
use openraft::storage::RaftSnapshotBuilder;
use openraft::storage::RaftStateMachine;
use parking_lot::RwLock;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::bucket;
use super::bucket::BucketDb;
use super::bucket::SnapshotImage;
use super::types::CommandResponse;
use super::types::NodeId;
use super::types::TypeConfig;
use crate::cache::BucketCache;

type StoResult<T> = Result<T, StorageError<NodeId>>;
type Membership = StoredMembership<NodeId, BasicNode>;

fn read_sm_err<E: std::error::Error + 'static>(e: E) -> StorageError<NodeId> {
    StorageIOError::read_state_machine(AnyError::new(&e)).into()
}

fn write_sm_err<E: std::error::Error + 'static>(e: E) -> StorageError<NodeId> {
    StorageIOError::write_state_machine(AnyError::new(&e)).into()
}

fn write_snap_err<E: std::error::Error + 'static>(meta: &SnapshotMeta<NodeId, BasicNode>, e: E) -> StorageError<NodeId> {
    StorageIOError::write_snapshot(Some(meta.signature()), AnyError::new(&e)).into()
}

/// In-memory view of the replicated cluster metadata.
pub type ApiPeers = Arc<RwLock<BTreeMap<String, String>>>;

#[derive(Clone)]
pub struct RegistryStateMachine {
    db: Arc<BucketDb>,
    cache: Arc<BucketCache>,
    api_peers: ApiPeers,
    peers_file: Option<PathBuf>,
}

impl RegistryStateMachine {
    pub fn new(db: Arc<BucketDb>, cache: Arc<BucketCache>, peers_file: Option<PathBuf>) -> Result<Self, bucket::BucketError> {
        let api_peers = Arc::new(RwLock::new(db.api_peers()?));
        Ok(Self {
            db,
            cache,
            api_peers,
            peers_file,
        })
    }

    pub fn api_peers(&self) -> ApiPeers {
        Arc::clone(&self.api_peers)
    }

    fn read_applied(&self) -> StoResult<(Option<LogId<NodeId>>, Membership)> {
        let last_applied = match self.db.read_meta(bucket::LAST_APPLIED_META).map_err(read_sm_err)? {
            Some(raw) => serde_json::from_slice(&raw).map_err(read_sm_err)?,
            None => None,
        };
        let membership = match self.db.read_meta(bucket::MEMBERSHIP_META).map_err(read_sm_err)? {
            Some(raw) => serde_json::from_slice(&raw).map_err(read_sm_err)?,
            None => Membership::default(),
        };
        Ok((last_applied, membership))
    }

    /// Rewrites `peers.json` with the voter addresses of `membership`.
    fn write_peers_file(&self, membership: &Membership) {
        let Some(path) = &self.peers_file else {
            return;
        };
        let voters: std::collections::BTreeSet<NodeId> = membership.membership().voter_ids().collect();
        let addrs: Vec<&str> = membership
            .nodes()
            .filter(|(id, _)| voters.contains(id))
            .map(|(_, node)| node.addr.as_str())
            .collect();
        let result = serde_json::to_vec_pretty(&addrs)
            .map_err(std::io::Error::other)
            .and_then(|bytes| std::fs::write(path, bytes));
        if let Err(err) = result {
            warn!(path = %path.display(), error = %err, "failed to write peers file");
        }
    }
}

impl RaftSnapshotBuilder<TypeConfig> for RegistryStateMachine {
    async fn build_snapshot(&mut self) -> StoResult<Snapshot<TypeConfig>> {
        let (last_applied, last_membership) = self.read_applied()?;
        let image = self
            .db
            .export()
            .map_err(|e| StorageError::from(StorageIOError::read_snapshot(None, AnyError::new(&e))))?;
        let bytes = serde_json::to_vec(&image)
            .map_err(|e| StorageError::from(StorageIOError::read_snapshot(None, AnyError::new(&e))))?;
        let snapshot_id = match last_applied {
            Some(log_id) => format!("{}-{}-{}", log_id.leader_id, log_id.index, uuid::Uuid::new_v4()),
            None => format!("empty-{}", uuid::Uuid::new_v4()),
        };
        debug!(%snapshot_id, size = bytes.len(), "built snapshot");
        Ok(Snapshot {
            meta: SnapshotMeta {
                last_log_id: last_applied,
                last_membership,
                snapshot_id,
            },
            snapshot: Box::new(Cursor::new(bytes)),
        })
    }
}

impl RaftStateMachine<TypeConfig> for RegistryStateMachine {
    type SnapshotBuilder = Self;

    async fn applied_state(&mut self) -> StoResult<(Option<LogId<NodeId>>, Membership)> {
        self.read_applied()
    }

    async fn apply<I>(&mut self, entries: I) -> StoResult<Vec<CommandResponse>>
    where
        I: IntoIterator<Item = openraft::Entry<TypeConfig>> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let mut responses = Vec::new();
        let mut commands = Vec::new();
        let mut new_membership = None;

        let txn = self.db.begin_write().map_err(write_sm_err)?;
        for entry in entries {
            let applied = serde_json::to_vec(&Some(entry.log_id)).map_err(write_sm_err)?;
            bucket::put_meta(&txn, bucket::LAST_APPLIED_META, &applied).map_err(write_sm_err)?;

            let response = match entry.payload {
                EntryPayload::Blank => CommandResponse::ok(),
                EntryPayload::Normal(cmd) => {
                    let response = bucket::apply_command(&txn, &cmd).map_err(write_sm_err)?;
                    if response.error.is_none() {
                        commands.push(cmd);
                    }
                    response
                }
                EntryPayload::Membership(m) => {
                    let stored = Membership::new(Some(entry.log_id), m);
                    let raw = serde_json::to_vec(&stored).map_err(write_sm_err)?;
                    bucket::put_meta(&txn, bucket::MEMBERSHIP_META, &raw).map_err(write_sm_err)?;
                    new_membership = Some(stored);
                    CommandResponse::ok()
                }
            };
            responses.push(response);
        }
        txn.commit().map_err(write_sm_err)?;

        for cmd in &commands {
            for (bucket, key) in cmd.touched() {
                match key {
                    Some(key) => self.cache.remove(bucket, key),
                    None => self.cache.remove_bucket(bucket),
                }
            }
            if let super::types::Command::UpdateApiPeers { peers } = cmd {
                self.api_peers.write().extend(peers.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        if let Some(membership) = new_membership {
            self.write_peers_file(&membership);
        }
        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn begin_receiving_snapshot(&mut self) -> StoResult<Box<Cursor<Vec<u8>>>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> StoResult<()> {
        let image: SnapshotImage = serde_json::from_slice(snapshot.get_ref()).map_err(|e| write_snap_err(meta, e))?;

        let txn = self.db.begin_write().map_err(|e| write_snap_err(meta, e))?;
        bucket::restore_image(&txn, &image).map_err(|e| write_snap_err(meta, e))?;
        let applied = serde_json::to_vec(&meta.last_log_id).map_err(|e| write_snap_err(meta, e))?;
        bucket::put_meta(&txn, bucket::LAST_APPLIED_META, &applied).map_err(|e| write_snap_err(meta, e))?;
        let membership = serde_json::to_vec(&meta.last_membership).map_err(|e| write_snap_err(meta, e))?;
        bucket::put_meta(&txn, bucket::MEMBERSHIP_META, &membership).map_err(|e| write_snap_err(meta, e))?;
        txn.commit().map_err(|e| write_snap_err(meta, e))?;

        self.cache.purge();
        *self.api_peers.write() = image.api_peers;
        self.write_peers_file(&meta.last_membership);
        info!(snapshot_id = %meta.snapshot_id, buckets = image.buckets.len(), "installed snapshot");
        Ok(())
    }

    async fn get_current_snapshot(&mut self) -> StoResult<Option<Snapshot<TypeConfig>>> {
        Ok(Some(self.build_snapshot().await?))
    }
}
