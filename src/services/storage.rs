use anyhow::{Result, anyhow};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use bytes::Bytes;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Where chunk payloads and assembled files live until they are committed.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// Removes every blob under `prefix`, returning how many were removed
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;
    async fn health_check(&self) -> Result<()>;
}

/// In-process store used by tests and the development preset.
#[derive(Debug)]
pub struct MemoryBlobStore {
    blobs: DashMap<String, Bytes>,
    available: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self {
            blobs: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulates the backend going away
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .blobs
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(anyhow!("memory blob store is offline"))
        }
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.ensure_available()?;
        self.blobs.insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.ensure_available()?;
        Ok(self.blobs.get(key).map(|b| b.value().clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.ensure_available()?;
        self.blobs.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        self.ensure_available()?;
        let before = self.blobs.len();
        self.blobs.retain(|k, _| !k.starts_with(prefix));
        Ok(before.saturating_sub(self.blobs.len()))
    }

    async fn health_check(&self) -> Result<()> {
        self.ensure_available()
    }
}

/// Blobs as plain files under a root directory.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.starts_with('/') || key.split('/').any(|part| part == "..") {
            return Err(anyhow!("invalid blob key: {}", key));
        }
        Ok(self.root.join(key))
    }
}

async fn count_files(dir: &Path) -> Result<usize> {
    let mut count = 0;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                stack.push(entry.path());
            } else {
                count += 1;
            }
        }
    }
    Ok(count)
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write then rename so a reader never sees a torn blob
        let tmp = path.with_extension("partial");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        // Prefixes always end at a directory boundary
        let dir = self.path_for(prefix.trim_end_matches('/'))?;
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(0);
        }
        let removed = count_files(&dir).await?;
        tokio::fs::remove_dir_all(&dir).await?;
        Ok(removed)
    }

    async fn health_check(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let probe = self.root.join(".health");
        tokio::fs::write(&probe, b"ok").await?;
        tokio::fs::remove_file(&probe).await?;
        Ok(())
    }
}

/// S3-compatible (MinIO) backend.
pub struct S3BlobStore {
    client: Client,
    bucket: String,
}

impl S3BlobStore {
    pub fn new(client: Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token = None;

        loop {
            let res = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation_token)
                .send()
                .await?;

            for object in res.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }

            if res.is_truncated().unwrap_or(false) {
                continuation_token = res.next_continuation_token().map(|s| s.to_string());
            } else {
                break;
            }
        }

        Ok(keys)
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let res = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match res {
            Ok(output) => {
                let data = output.body.collect().await?.into_bytes();
                Ok(Some(data))
            }
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(service_error.into())
                }
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let keys = self.list_keys(prefix).await?;
        let total = keys.len();

        // DeleteObjects accepts at most 1000 keys per call
        for batch in keys.chunks(1000) {
            let objects = batch
                .iter()
                .map(|k| ObjectIdentifier::builder().key(k).build())
                .collect::<Result<Vec<_>, _>>()?;
            let delete = Delete::builder().set_objects(Some(objects)).build()?;
            self.client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await?;
        }

        Ok(total)
    }

    async fn health_check(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| {
                tracing::error!("S3 head_bucket failed for '{}': {:?}", self.bucket, e);
                anyhow!("bucket '{}' is unreachable", self.bucket)
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_prefix_delete() {
        let store = MemoryBlobStore::new();
        store.put("sessions/a/files/x/chunks/000000", Bytes::from_static(b"1")).await.unwrap();
        store.put("sessions/a/files/x/chunks/000001", Bytes::from_static(b"2")).await.unwrap();
        store.put("sessions/b/files/x/chunks/000000", Bytes::from_static(b"3")).await.unwrap();

        assert_eq!(store.delete_prefix("sessions/a/").await.unwrap(), 2);
        assert_eq!(store.len(), 1);
        assert!(store.get("sessions/a/files/x/chunks/000000").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_offline() {
        let store = MemoryBlobStore::new();
        store.set_available(false);
        assert!(store.health_check().await.is_err());
        assert!(store.put("k", Bytes::new()).await.is_err());
        store.set_available(true);
        assert!(store.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn test_local_store_roundtrip_and_prefix_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());
        store.health_check().await.unwrap();

        store.put("sessions/s1/files/p1/chunks/000000", Bytes::from_static(b"abc")).await.unwrap();
        store.put("sessions/s1/files/p1/assembled", Bytes::from_static(b"abcdef")).await.unwrap();

        let data = store.get("sessions/s1/files/p1/assembled").await.unwrap().unwrap();
        assert_eq!(&data[..], b"abcdef");
        assert!(store.get("sessions/s1/files/p2/assembled").await.unwrap().is_none());

        assert_eq!(store.delete_prefix("sessions/s1/files/p1/").await.unwrap(), 2);
        assert_eq!(store.delete_prefix("sessions/s1/files/p1/").await.unwrap(), 0);
        store.delete("sessions/s1/files/p1/assembled").await.unwrap();
    }

    #[tokio::test]
    async fn test_local_store_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());
        assert!(store.put("sessions/../../etc/x", Bytes::new()).await.is_err());
    }
}
