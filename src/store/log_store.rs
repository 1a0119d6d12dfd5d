//! Raft log storage in `raft.db`.
//!
//! Entries are JSON-encoded and keyed by log index; the vote and the last
//! purged log id live in a small metadata table next to them.

use std::fmt::Debug;
use std::ops::RangeBounds;
use std::path::Path;
use std::sync::Arc;

use openraft::AnyError;
use openraft::Entry;
use openraft::LogId;
use openraft::LogState;
use openraft::OptionalSend;
use openraft::StorageError;
use openraft::StorageIOError;
use openraft::Vote;
use openraft::storage::LogFlushed;
use openraft::storage::RaftLogReader;
use openraft::storage::RaftLogStorage;
use redb::Database;
use redb::ReadableTable;
use redb::TableDefinition;
use snafu::ResultExt;

use super::bucket::BeginTxnSnafu;
use super::bucket::BucketError;
use super::bucket::CommitSnafu;
use super::bucket::OpenDatabaseSnafu;
use super::bucket::OpenTableSnafu;
use super::types::NodeId;
use super::types::TypeConfig;

const LOG_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("raft_log");
const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("raft_meta");

const VOTE_KEY: &str = "vote";
const PURGED_KEY: &str = "last_purged_log_id";

type StoResult<T> = Result<T, StorageError<NodeId>>;

fn read_logs_err<E: std::error::Error + 'static>(e: E) -> StorageError<NodeId> {
    StorageIOError::read_logs(AnyError::new(&e)).into()
}

fn write_logs_err<E: std::error::Error + 'static>(e: E) -> StorageError<NodeId> {
    StorageIOError::write_logs(AnyError::new(&e)).into()
}

fn read_vote_err<E: std::error::Error + 'static>(e: E) -> StorageError<NodeId> {
    StorageIOError::read_vote(AnyError::new(&e)).into()
}

fn write_vote_err<E: std::error::Error + 'static>(e: E) -> StorageError<NodeId> {
    StorageIOError::write_vote(AnyError::new(&e)).into()
}

/// Raft log backed by its own redb file.
#[derive(Clone)]
pub struct RaftLogStore {
    db: Arc<Database>,
}

impl RaftLogStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BucketError> {
        let path = path.as_ref();
        let db = Database::create(path).context(OpenDatabaseSnafu { path: path.to_path_buf() })?;
        let txn = db.begin_write().context(BeginTxnSnafu)?;
        txn.open_table(LOG_TABLE).context(OpenTableSnafu)?;
        txn.open_table(META_TABLE).context(OpenTableSnafu)?;
        txn.commit().context(CommitSnafu)?;
        Ok(Self { db: Arc::new(db) })
    }

    fn read_meta<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
        map_err: fn(redb::Error) -> StorageError<NodeId>,
    ) -> StoResult<Option<T>> {
        let txn = self.db.begin_read().map_err(|e| map_err(e.into()))?;
        let table = txn.open_table(META_TABLE).map_err(|e| map_err(e.into()))?;
        let Some(raw) = table.get(key).map_err(|e| map_err(e.into()))? else {
            return Ok(None);
        };
        let value = serde_json::from_slice(raw.value()).map_err(read_logs_err)?;
        Ok(Some(value))
    }

    fn write_meta<T: serde::Serialize>(
        &self,
        key: &str,
        value: &T,
        map_err: fn(redb::Error) -> StorageError<NodeId>,
    ) -> StoResult<()> {
        let bytes = serde_json::to_vec(value).map_err(write_logs_err)?;
        let txn = self.db.begin_write().map_err(|e| map_err(e.into()))?;
        {
            let mut table = txn.open_table(META_TABLE).map_err(|e| map_err(e.into()))?;
            table.insert(key, bytes.as_slice()).map_err(|e| map_err(e.into()))?;
        }
        txn.commit().map_err(|e| map_err(e.into()))
    }

    /// Removes every entry whose index falls in `range`.
    fn remove_range(&self, range: impl RangeBounds<u64>) -> StoResult<()> {
        let txn = self.db.begin_write().map_err(write_logs_err)?;
        {
            let mut table = txn.open_table(LOG_TABLE).map_err(write_logs_err)?;
            let doomed = table
                .range(range)
                .map_err(write_logs_err)?
                .map(|item| item.map(|(k, _)| k.value()))
                .collect::<Result<Vec<u64>, _>>()
                .map_err(write_logs_err)?;
            for index in doomed {
                table.remove(index).map_err(write_logs_err)?;
            }
        }
        txn.commit().map_err(write_logs_err)
    }
}

impl RaftLogReader<TypeConfig> for RaftLogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> StoResult<Vec<Entry<TypeConfig>>> {
        let txn = self.db.begin_read().map_err(read_logs_err)?;
        let table = txn.open_table(LOG_TABLE).map_err(read_logs_err)?;
        let mut entries = Vec::new();
        for item in table.range(range).map_err(read_logs_err)? {
            let (_, raw) = item.map_err(read_logs_err)?;
            let entry: Entry<TypeConfig> = serde_json::from_slice(raw.value()).map_err(read_logs_err)?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

impl RaftLogStorage<TypeConfig> for RaftLogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> StoResult<LogState<TypeConfig>> {
        let last_log_id = {
            let txn = self.db.begin_read().map_err(read_logs_err)?;
            let table = txn.open_table(LOG_TABLE).map_err(read_logs_err)?;
            let last = match table.last().map_err(read_logs_err)? {
                Some((_, raw)) => {
                    let entry: Entry<TypeConfig> = serde_json::from_slice(raw.value()).map_err(read_logs_err)?;
                    Some(entry.log_id)
                }
                None => None,
            };
            last
        };
        let last_purged_log_id: Option<LogId<NodeId>> = self.read_meta(PURGED_KEY, read_logs_err)?;
        // After a purge of everything the table is empty but the purged id is the tail.
        let last_log_id = last_log_id.or(last_purged_log_id);
        Ok(LogState {
            last_purged_log_id,
            last_log_id,
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> StoResult<()> {
        self.write_meta(VOTE_KEY, vote, write_vote_err)
    }

    async fn read_vote(&mut self) -> StoResult<Option<Vote<NodeId>>> {
        self.read_meta(VOTE_KEY, read_vote_err)
    }

    async fn append<I>(&mut self, entries: I, callback: LogFlushed<TypeConfig>) -> StoResult<()>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let txn = self.db.begin_write().map_err(write_logs_err)?;
        {
            let mut table = txn.open_table(LOG_TABLE).map_err(write_logs_err)?;
            for entry in entries {
                let bytes = serde_json::to_vec(&entry).map_err(write_logs_err)?;
                table.insert(entry.log_id.index, bytes.as_slice()).map_err(write_logs_err)?;
            }
        }
        txn.commit().map_err(write_logs_err)?;
        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId<NodeId>) -> StoResult<()> {
        self.remove_range(log_id.index..)
    }

    async fn purge(&mut self, log_id: LogId<NodeId>) -> StoResult<()> {
        self.write_meta(PURGED_KEY, &log_id, write_logs_err)?;
        self.remove_range(..=log_id.index)
    }
}

#[cfg(test)]
mod tests {
    use openraft::CommittedLeaderId;
    use openraft::EntryPayload;
    use tempfile::TempDir;

    use super::*;

    fn entry(term: u64, index: u64) -> Entry<TypeConfig> {
        Entry {
            log_id: LogId::new(CommittedLeaderId::new(term, 1), index),
            payload: EntryPayload::Blank,
        }
    }

    fn write(store: &RaftLogStore, entries: Vec<Entry<TypeConfig>>) {
        let txn = store.db.begin_write().unwrap();
        {
            let mut table = txn.open_table(LOG_TABLE).unwrap();
            for e in entries {
                let bytes = serde_json::to_vec(&e).unwrap();
                table.insert(e.log_id.index, bytes.as_slice()).unwrap();
            }
        }
        txn.commit().unwrap();
    }

    #[tokio::test]
    async fn test_vote_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut store = RaftLogStore::open(dir.path().join("raft.db")).unwrap();
        assert_eq!(store.read_vote().await.unwrap(), None);
        let vote = Vote::new(3, 7);
        store.save_vote(&vote).await.unwrap();
        assert_eq!(store.read_vote().await.unwrap(), Some(vote));
    }

    #[tokio::test]
    async fn test_truncate_and_purge() {
        let dir = TempDir::new().unwrap();
        let mut store = RaftLogStore::open(dir.path().join("raft.db")).unwrap();
        write(&store, (1..=5).map(|i| entry(1, i)).collect());

        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_log_id.map(|l| l.index), Some(5));
        assert_eq!(state.last_purged_log_id, None);

        store.truncate(entry(1, 4).log_id).await.unwrap();
        let entries = store.try_get_log_entries(0..10).await.unwrap();
        assert_eq!(entries.iter().map(|e| e.log_id.index).collect::<Vec<_>>(), vec![1, 2, 3]);

        store.purge(entry(1, 2).log_id).await.unwrap();
        let entries = store.try_get_log_entries(0..10).await.unwrap();
        assert_eq!(entries.iter().map(|e| e.log_id.index).collect::<Vec<_>>(), vec![3]);
        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_purged_log_id.map(|l| l.index), Some(2));
        assert_eq!(state.last_log_id.map(|l| l.index), Some(3));
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("raft.db");
        {
            let mut store = RaftLogStore::open(&path).unwrap();
            write(&store, vec![entry(2, 1), entry(2, 2)]);
            store.save_vote(&Vote::new(2, 9)).await.unwrap();
        }
        let mut store = RaftLogStore::open(&path).unwrap();
        assert_eq!(store.read_vote().await.unwrap(), Some(Vote::new(2, 9)));
        assert_eq!(store.get_log_state().await.unwrap().last_log_id.map(|l| l.index), Some(2));
    }
}
