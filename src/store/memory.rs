//! In-memory [`KeyValueStore`] with the same bucket semantics as the
//! replicated store. Backs unit tests of the tree, resource, auth, and report
//! layers.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::KeyValueStore;
use super::types::Row;
use crate::error::RegistryError;
use crate::error::Result;

type Bucket = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Default)]
pub struct MemoryStore {
    buckets: RwLock<BTreeMap<Vec<u8>, Bucket>>,
}

fn missing(bucket: &[u8]) -> RegistryError {
    RegistryError::not_found(format!("bucket {}", String::from_utf8_lossy(bucket)))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bucket_names(&self) -> Vec<String> {
        self.buckets
            .read()
            .keys()
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .collect()
    }

    pub fn has_bucket(&self, name: &[u8]) -> bool {
        self.buckets.read().contains_key(name)
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn view(&self, bucket: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>> {
        let buckets = self.buckets.read();
        let b = buckets.get(bucket).ok_or_else(|| missing(bucket))?;
        Ok(b.get(key).cloned())
    }

    async fn views(&self, bucket: &[u8], prefix: &[u8]) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
        let buckets = self.buckets.read();
        let b = buckets.get(bucket).ok_or_else(|| missing(bucket))?;
        Ok(b.range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn update(&self, bucket: &[u8], key: &[u8], value: &[u8]) -> Result<()> {
        let mut buckets = self.buckets.write();
        let b = buckets.get_mut(bucket).ok_or_else(|| missing(bucket))?;
        b.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn batch(&self, rows: Vec<Row>) -> Result<()> {
        let mut buckets = self.buckets.write();
        if let Some(row) = rows.iter().find(|r| !buckets.contains_key(&r.bucket)) {
            return Err(missing(&row.bucket));
        }
        for row in rows {
            if let Some(b) = buckets.get_mut(&row.bucket) {
                b.insert(row.key, row.value);
            }
        }
        Ok(())
    }

    async fn create_bucket(&self, name: &[u8]) -> Result<()> {
        let mut buckets = self.buckets.write();
        if buckets.contains_key(name) {
            return Err(RegistryError::already_exists(format!("bucket {}", String::from_utf8_lossy(name))));
        }
        buckets.insert(name.to_vec(), Bucket::new());
        Ok(())
    }

    async fn create_bucket_if_not_exist(&self, name: &[u8]) -> Result<()> {
        self.buckets.write().entry(name.to_vec()).or_default();
        Ok(())
    }

    async fn remove_bucket(&self, name: &[u8]) -> Result<()> {
        match self.buckets.write().remove(name) {
            Some(_) => Ok(()),
            None => Err(missing(name)),
        }
    }
}

/// Wraps a [`MemoryStore`] and, while armed, delays every `view` of one
/// key. Tracks how many such views are in flight at once.
#[cfg(test)]
pub(crate) struct SlowViews {
    inner: MemoryStore,
    key: Vec<u8>,
    delay_ms: std::sync::atomic::AtomicU64,
    in_flight: std::sync::atomic::AtomicUsize,
    peak: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl SlowViews {
    pub(crate) fn new(key: &str) -> Self {
        Self {
            inner: MemoryStore::new(),
            key: key.as_bytes().to_vec(),
            delay_ms: Default::default(),
            in_flight: Default::default(),
            peak: Default::default(),
        }
    }

    pub(crate) fn arm(&self, delay: std::time::Duration) {
        self.delay_ms.store(delay.as_millis() as u64, std::sync::atomic::Ordering::SeqCst);
    }

    pub(crate) fn disarm(&self) {
        self.delay_ms.store(0, std::sync::atomic::Ordering::SeqCst);
    }

    /// Most delayed views observed in flight at the same time.
    pub(crate) fn peak(&self) -> usize {
        self.peak.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl KeyValueStore for SlowViews {
    async fn view(&self, bucket: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>> {
        use std::sync::atomic::Ordering;

        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 && key == self.key.as_slice() {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        self.inner.view(bucket, key).await
    }

    async fn views(&self, bucket: &[u8], prefix: &[u8]) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
        self.inner.views(bucket, prefix).await
    }

    async fn update(&self, bucket: &[u8], key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.update(bucket, key, value).await
    }

    async fn batch(&self, rows: Vec<Row>) -> Result<()> {
        self.inner.batch(rows).await
    }

    async fn create_bucket(&self, name: &[u8]) -> Result<()> {
        self.inner.create_bucket(name).await
    }

    async fn create_bucket_if_not_exist(&self, name: &[u8]) -> Result<()> {
        self.inner.create_bucket_if_not_exist(name).await
    }

    async fn remove_bucket(&self, name: &[u8]) -> Result<()> {
        self.inner.remove_bucket(name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bucket_semantics_match_store() {
        let store = MemoryStore::new();
        assert!(store.view(b"b", b"k").await.unwrap_err().is_not_found());
        store.create_bucket(b"b").await.unwrap();
        assert!(matches!(store.create_bucket(b"b").await, Err(RegistryError::AlreadyExists { .. })));
        store.create_bucket_if_not_exist(b"b").await.unwrap();

        store.update(b"b", b"g-1", b"x").await.unwrap();
        store.update(b"b", b"g-2", b"y").await.unwrap();
        store.update(b"b", b"u-1", b"z").await.unwrap();
        assert_eq!(store.view(b"b", b"g-1").await.unwrap(), Some(b"x".to_vec()));
        assert_eq!(store.views(b"b", b"g-").await.unwrap().len(), 2);

        let err = store
            .batch(vec![Row::new("b", "k", b"1".to_vec()), Row::new("missing", "k", b"2".to_vec())])
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(store.view(b"b", b"k").await.unwrap(), None);

        store.remove_bucket(b"b").await.unwrap();
        assert!(store.remove_bucket(b"b").await.unwrap_err().is_not_found());
    }
}
