//! Bucketed key/value file backed by redb.
//!
//! Each bucket is its own redb table named `bucket/<name>`, which keeps
//! prefix scans inside one bucket a single ordered range read. A reserved
//! `__meta` table holds the state machine's bookkeeping (last applied log
//! id, membership, API peer map); it is never visible as a bucket.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use redb::Database;
use redb::ReadableTable;
use redb::TableDefinition;
use redb::TableError;
use redb::TableHandle;
use redb::WriteTransaction;
use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use snafu::Snafu;

use super::types::Command;
use super::types::CommandResponse;
use crate::error::RegistryError;

const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("__meta");
const BUCKET_PREFIX: &str = "bucket/";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum BucketError {
    #[snafu(display("failed to open bucket database at {}: {source}", path.display()))]
    OpenDatabase {
        path: PathBuf,
        #[snafu(source(from(redb::DatabaseError, Box::new)))]
        source: Box<redb::DatabaseError>,
    },

    #[snafu(display("failed to begin transaction: {source}"))]
    BeginTxn {
        #[snafu(source(from(redb::TransactionError, Box::new)))]
        source: Box<redb::TransactionError>,
    },

    #[snafu(display("failed to open table: {source}"))]
    OpenTable {
        #[snafu(source(from(redb::TableError, Box::new)))]
        source: Box<redb::TableError>,
    },

    #[snafu(display("failed to commit transaction: {source}"))]
    Commit {
        #[snafu(source(from(redb::CommitError, Box::new)))]
        source: Box<redb::CommitError>,
    },

    #[snafu(display("failed to access table: {source}"))]
    Access {
        #[snafu(source(from(redb::StorageError, Box::new)))]
        source: Box<redb::StorageError>,
    },

    #[snafu(display("failed to encode metadata: {source}"))]
    Encode { source: serde_json::Error },

    #[snafu(display("invalid snapshot: {reason}"))]
    InvalidSnapshot { reason: String },

    #[snafu(display("bucket {name} not found"))]
    BucketNotFound { name: String },

    #[snafu(display("bucket name is not valid UTF-8"))]
    InvalidBucketName,
}

impl From<BucketError> for RegistryError {
    fn from(err: BucketError) -> Self {
        match err {
            BucketError::BucketNotFound { name } => RegistryError::not_found(format!("bucket {name}")),
            BucketError::InvalidBucketName => RegistryError::invalid_param("bucket name is not valid UTF-8"),
            other => RegistryError::storage(other.to_string()),
        }
    }
}

/// Portable image of the whole bucket database.
///
/// Bucket names are plain strings, keys and values are base64.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotImage {
    pub buckets: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    pub api_peers: BTreeMap<String, String>,
}

fn table_name(bucket: &[u8]) -> Result<String, BucketError> {
    let name = std::str::from_utf8(bucket).map_err(|_| BucketError::InvalidBucketName)?;
    Ok(format!("{BUCKET_PREFIX}{name}"))
}

fn display_name(bucket: &[u8]) -> String {
    String::from_utf8_lossy(bucket).into_owned()
}

/// The local bucket file. Reads go straight to it; writes only arrive through
/// the state machine.
pub struct BucketDb {
    db: Database,
}

impl BucketDb {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BucketError> {
        let path = path.as_ref();
        let db = Database::create(path).context(OpenDatabaseSnafu { path: path.to_path_buf() })?;
        let txn = db.begin_write().context(BeginTxnSnafu)?;
        txn.open_table(META_TABLE).context(OpenTableSnafu)?;
        txn.commit().context(CommitSnafu)?;
        Ok(Self { db })
    }

    /// Point read. `Ok(None)` when the key is absent, `BucketNotFound` when the bucket is.
    pub fn view(&self, bucket: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>, BucketError> {
        let name = table_name(bucket)?;
        let def: TableDefinition<&[u8], &[u8]> = TableDefinition::new(&name);
        let txn = self.db.begin_read().context(BeginTxnSnafu)?;
        let table = match txn.open_table(def) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => {
                return Err(BucketError::BucketNotFound { name: display_name(bucket) });
            }
            Err(e) => return Err(e).context(OpenTableSnafu),
        };
        let value = table.get(key).context(AccessSnafu)?.map(|v| v.value().to_vec());
        Ok(value)
    }

    /// All entries of `bucket` whose key starts with `prefix`, in key order.
    pub fn views(&self, bucket: &[u8], prefix: &[u8]) -> Result<BTreeMap<Vec<u8>, Vec<u8>>, BucketError> {
        let name = table_name(bucket)?;
        let def: TableDefinition<&[u8], &[u8]> = TableDefinition::new(&name);
        let txn = self.db.begin_read().context(BeginTxnSnafu)?;
        let table = match txn.open_table(def) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => {
                return Err(BucketError::BucketNotFound { name: display_name(bucket) });
            }
            Err(e) => return Err(e).context(OpenTableSnafu),
        };
        let mut out = BTreeMap::new();
        for item in table.range(prefix..).context(AccessSnafu)? {
            let (k, v) = item.context(AccessSnafu)?;
            let key = k.value();
            if !key.starts_with(prefix) {
                break;
            }
            out.insert(key.to_vec(), v.value().to_vec());
        }
        Ok(out)
    }

    pub fn bucket_exists(&self, bucket: &[u8]) -> Result<bool, BucketError> {
        let name = table_name(bucket)?;
        let txn = self.db.begin_read().context(BeginTxnSnafu)?;
        let found = txn.list_tables().context(AccessSnafu)?.any(|t| t.name() == name);
        Ok(found)
    }

    /// Names of every bucket.
    pub fn buckets(&self) -> Result<Vec<String>, BucketError> {
        let txn = self.db.begin_read().context(BeginTxnSnafu)?;
        let names = txn
            .list_tables()
            .context(AccessSnafu)?
            .filter_map(|t| t.name().strip_prefix(BUCKET_PREFIX).map(str::to_string))
            .collect();
        Ok(names)
    }

    pub fn read_meta(&self, key: &str) -> Result<Option<Vec<u8>>, BucketError> {
        let txn = self.db.begin_read().context(BeginTxnSnafu)?;
        let table = txn.open_table(META_TABLE).context(OpenTableSnafu)?;
        let value = table.get(key).context(AccessSnafu)?.map(|v| v.value().to_vec());
        Ok(value)
    }

    pub fn api_peers(&self) -> Result<BTreeMap<String, String>, BucketError> {
        match self.read_meta(API_PEERS_META)? {
            Some(raw) => serde_json::from_slice(&raw).context(EncodeSnafu),
            None => Ok(BTreeMap::new()),
        }
    }

    pub fn begin_write(&self) -> Result<WriteTransaction, BucketError> {
        self.db.begin_write().context(BeginTxnSnafu)
    }

    /// Exports every bucket plus the API peer map.
    pub fn export(&self) -> Result<SnapshotImage, BucketError> {
        let txn = self.db.begin_read().context(BeginTxnSnafu)?;
        let mut image = SnapshotImage::default();
        let names: Vec<String> = txn
            .list_tables()
            .context(AccessSnafu)?
            .map(|t| t.name().to_string())
            .filter(|n| n.starts_with(BUCKET_PREFIX))
            .collect();
        for name in names {
            let def: TableDefinition<&[u8], &[u8]> = TableDefinition::new(&name);
            let table = txn.open_table(def).context(OpenTableSnafu)?;
            let mut entries = BTreeMap::new();
            for item in table.iter().context(AccessSnafu)? {
                let (k, v) = item.context(AccessSnafu)?;
                entries.insert(STANDARD.encode(k.value()), STANDARD.encode(v.value()));
            }
            let bucket = name.trim_start_matches(BUCKET_PREFIX).to_string();
            image.buckets.insert(bucket, entries);
        }
        let meta = txn.open_table(META_TABLE).context(OpenTableSnafu)?;
        if let Some(raw) = meta.get(API_PEERS_META).context(AccessSnafu)? {
            image.api_peers = serde_json::from_slice(raw.value()).context(EncodeSnafu)?;
        }
        Ok(image)
    }
}

pub(crate) const API_PEERS_META: &str = "api_peers";
pub(crate) const LAST_APPLIED_META: &str = "last_applied";
pub(crate) const MEMBERSHIP_META: &str = "last_membership";

fn bucket_present(txn: &WriteTransaction, name: &str) -> Result<bool, BucketError> {
    Ok(txn.list_tables().context(AccessSnafu)?.any(|t| t.name() == name))
}

/// Writes a meta entry inside an open write transaction.
pub(crate) fn put_meta(txn: &WriteTransaction, key: &str, value: &[u8]) -> Result<(), BucketError> {
    let mut table = txn.open_table(META_TABLE).context(OpenTableSnafu)?;
    table.insert(key, value).context(AccessSnafu)?;
    Ok(())
}

/// Applies one command inside `txn`.
///
/// Missing or duplicate buckets are reported in the returned response and
/// leave the transaction untouched; only I/O faults are `Err`.
pub(crate) fn apply_command(txn: &WriteTransaction, cmd: &Command) -> Result<CommandResponse, BucketError> {
    match cmd {
        Command::UpdateApiPeers { peers } => {
            let mut merged: BTreeMap<String, String> = {
                let table = txn.open_table(META_TABLE).context(OpenTableSnafu)?;
                let current = table.get(API_PEERS_META).context(AccessSnafu)?;
                match current {
                    Some(raw) => serde_json::from_slice(raw.value()).context(EncodeSnafu)?,
                    None => BTreeMap::new(),
                }
            };
            merged.extend(peers.iter().map(|(k, v)| (k.clone(), v.clone())));
            let raw = serde_json::to_vec(&merged).context(EncodeSnafu)?;
            put_meta(txn, API_PEERS_META, &raw)?;
            Ok(CommandResponse::ok())
        }
        Command::CreateBucket { name, if_not_exist } => {
            let table = match table_name(name) {
                Ok(table) => table,
                Err(e) => return Ok(CommandResponse::failed(e.into())),
            };
            if bucket_present(txn, &table)? {
                if *if_not_exist {
                    return Ok(CommandResponse::ok());
                }
                return Ok(CommandResponse::failed(RegistryError::already_exists(format!(
                    "bucket {}",
                    display_name(name)
                ))));
            }
            let def: TableDefinition<&[u8], &[u8]> = TableDefinition::new(&table);
            txn.open_table(def).context(OpenTableSnafu)?;
            Ok(CommandResponse::ok())
        }
        Command::RemoveBucket { name } => {
            let table = match table_name(name) {
                Ok(table) => table,
                Err(e) => return Ok(CommandResponse::failed(e.into())),
            };
            let def: TableDefinition<&[u8], &[u8]> = TableDefinition::new(&table);
            if !txn.delete_table(def).context(OpenTableSnafu)? {
                return Ok(CommandResponse::failed(
                    BucketError::BucketNotFound { name: display_name(name) }.into(),
                ));
            }
            Ok(CommandResponse::ok())
        }
        Command::Update { bucket, key, value } => {
            let table = match table_name(bucket) {
                Ok(table) => table,
                Err(e) => return Ok(CommandResponse::failed(e.into())),
            };
            if !bucket_present(txn, &table)? {
                return Ok(CommandResponse::failed(
                    BucketError::BucketNotFound { name: display_name(bucket) }.into(),
                ));
            }
            let def: TableDefinition<&[u8], &[u8]> = TableDefinition::new(&table);
            let mut t = txn.open_table(def).context(OpenTableSnafu)?;
            t.insert(key.as_slice(), value.as_slice()).context(AccessSnafu)?;
            Ok(CommandResponse::ok())
        }
        Command::Batch { rows } => {
            // Validate every bucket first so a failing batch writes nothing.
            let mut tables = Vec::with_capacity(rows.len());
            for row in rows {
                let table = match table_name(&row.bucket) {
                    Ok(table) => table,
                    Err(e) => return Ok(CommandResponse::failed(e.into())),
                };
                if !bucket_present(txn, &table)? {
                    return Ok(CommandResponse::failed(
                        BucketError::BucketNotFound { name: display_name(&row.bucket) }.into(),
                    ));
                }
                tables.push(table);
            }
            for (row, table) in rows.iter().zip(tables.iter()) {
                let def: TableDefinition<&[u8], &[u8]> = TableDefinition::new(table);
                let mut t = txn.open_table(def).context(OpenTableSnafu)?;
                t.insert(row.key.as_slice(), row.value.as_slice()).context(AccessSnafu)?;
            }
            Ok(CommandResponse::ok())
        }
    }
}

/// Replaces all buckets and the API peer map with `image`.
pub(crate) fn restore_image(txn: &WriteTransaction, image: &SnapshotImage) -> Result<(), BucketError> {
    let existing: Vec<String> = txn
        .list_tables()
        .context(AccessSnafu)?
        .map(|t| t.name().to_string())
        .filter(|n| n.starts_with(BUCKET_PREFIX))
        .collect();
    for name in existing {
        let def: TableDefinition<&[u8], &[u8]> = TableDefinition::new(&name);
        txn.delete_table(def).context(OpenTableSnafu)?;
    }
    for (bucket, entries) in &image.buckets {
        let name = format!("{BUCKET_PREFIX}{bucket}");
        let def: TableDefinition<&[u8], &[u8]> = TableDefinition::new(&name);
        let mut table = txn.open_table(def).context(OpenTableSnafu)?;
        for (k, v) in entries {
            let key = STANDARD
                .decode(k.as_bytes())
                .map_err(|e| BucketError::InvalidSnapshot { reason: format!("key in {bucket}: {e}") })?;
            let value = STANDARD
                .decode(v.as_bytes())
                .map_err(|e| BucketError::InvalidSnapshot { reason: format!("value in {bucket}: {e}") })?;
            table.insert(key.as_slice(), value.as_slice()).context(AccessSnafu)?;
        }
    }
    let raw = serde_json::to_vec(&image.api_peers).context(EncodeSnafu)?;
    put_meta(txn, API_PEERS_META, &raw)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::store::types::Row;

    fn open() -> (TempDir, BucketDb) {
        let dir = TempDir::new().unwrap();
        let db = BucketDb::open(dir.path().join("registry.db")).unwrap();
        (dir, db)
    }

    fn apply(db: &BucketDb, cmd: Command) -> CommandResponse {
        let txn = db.begin_write().unwrap();
        let resp = apply_command(&txn, &cmd).unwrap();
        txn.commit().unwrap();
        resp
    }

    fn create(db: &BucketDb, name: &str) {
        let resp = apply(db, Command::CreateBucket { name: name.as_bytes().to_vec(), if_not_exist: false });
        assert_eq!(resp, CommandResponse::ok());
    }

    #[test]
    fn test_view_missing_bucket() {
        let (_dir, db) = open();
        let err = db.view(b"nope", b"k").unwrap_err();
        assert!(matches!(err, BucketError::BucketNotFound { .. }));
        assert!(RegistryError::from(err).is_not_found());
    }

    #[test]
    fn test_update_and_view() {
        let (_dir, db) = open();
        create(&db, "loda");
        let resp = apply(&db, Command::Update { bucket: b"loda".to_vec(), key: b"k".to_vec(), value: b"v".to_vec() });
        assert!(resp.error.is_none());
        assert_eq!(db.view(b"loda", b"k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(db.view(b"loda", b"other").unwrap(), None);
    }

    #[test]
    fn test_update_missing_bucket_is_reported() {
        let (_dir, db) = open();
        let resp = apply(&db, Command::Update { bucket: b"x".to_vec(), key: b"k".to_vec(), value: b"v".to_vec() });
        assert!(resp.error.unwrap().is_not_found());
        assert!(!db.bucket_exists(b"x").unwrap());
    }

    #[test]
    fn test_create_bucket_twice() {
        let (_dir, db) = open();
        create(&db, "a");
        let resp = apply(&db, Command::CreateBucket { name: b"a".to_vec(), if_not_exist: false });
        assert!(matches!(resp.error, Some(RegistryError::AlreadyExists { .. })));
        let resp = apply(&db, Command::CreateBucket { name: b"a".to_vec(), if_not_exist: true });
        assert!(resp.error.is_none());
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let (_dir, db) = open();
        create(&db, "a");
        let resp = apply(&db, Command::Batch {
            rows: vec![Row::new("a", "k", b"1".to_vec()), Row::new("missing", "k", b"2".to_vec())],
        });
        assert!(resp.error.unwrap().is_not_found());
        assert_eq!(db.view(b"a", b"k").unwrap(), None);

        create(&db, "b");
        let resp = apply(&db, Command::Batch {
            rows: vec![Row::new("a", "k", b"1".to_vec()), Row::new("b", "k", b"2".to_vec())],
        });
        assert!(resp.error.is_none());
        assert_eq!(db.view(b"a", b"k").unwrap(), Some(b"1".to_vec()));
        assert_eq!(db.view(b"b", b"k").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_views_prefix_scan() {
        let (_dir, db) = open();
        create(&db, "authorize");
        for key in ["g-a", "g-b", "u-x", "g"] {
            apply(&db, Command::Update { bucket: b"authorize".to_vec(), key: key.as_bytes().to_vec(), value: b"1".to_vec() });
        }
        let groups = db.views(b"authorize", b"g-").unwrap();
        let keys: Vec<_> = groups.keys().cloned().collect();
        assert_eq!(keys, vec![b"g-a".to_vec(), b"g-b".to_vec()]);
        assert_eq!(db.views(b"authorize", b"").unwrap().len(), 4);
    }

    #[test]
    fn test_remove_bucket() {
        let (_dir, db) = open();
        create(&db, "a");
        let resp = apply(&db, Command::RemoveBucket { name: b"a".to_vec() });
        assert!(resp.error.is_none());
        assert!(!db.bucket_exists(b"a").unwrap());
        let resp = apply(&db, Command::RemoveBucket { name: b"a".to_vec() });
        assert!(resp.error.unwrap().is_not_found());
    }

    #[test]
    fn test_api_peers_merge() {
        let (_dir, db) = open();
        let mut peers = BTreeMap::new();
        peers.insert("r1".to_string(), "h1".to_string());
        apply(&db, Command::UpdateApiPeers { peers });
        let mut peers = BTreeMap::new();
        peers.insert("r2".to_string(), "h2".to_string());
        apply(&db, Command::UpdateApiPeers { peers });
        let merged = db.api_peers().unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged["r1"], "h1");
    }

    #[test]
    fn test_export_restore() {
        let (_dir, src) = open();
        create(&src, "loda");
        create(&src, "empty");
        apply(&src, Command::Update { bucket: b"loda".to_vec(), key: b"node".to_vec(), value: vec![0, 1, 2, 255] });
        let image = src.export().unwrap();
        assert_eq!(image.buckets.len(), 2);

        let (_dir2, dst) = open();
        create(&dst, "stale");
        let txn = dst.begin_write().unwrap();
        restore_image(&txn, &image).unwrap();
        txn.commit().unwrap();

        assert!(!dst.bucket_exists(b"stale").unwrap());
        assert!(dst.bucket_exists(b"empty").unwrap());
        assert_eq!(dst.view(b"loda", b"node").unwrap(), Some(vec![0, 1, 2, 255]));
        assert_eq!(dst.export().unwrap(), image);
    }
}
