//! Durable key-value persistence.
//!
//! Values are grouped in buckets (`overrides`, `hosts`, `tokens`,
//! `credentials`).  [`FileStore`] keeps one JSON file per key and writes
//! through a uniquely named temporary file followed by a rename, so a
//! single-key write is either fully visible or not at all.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rand::RngCore;
use tokio::fs;
use tokio::sync::RwLock;

use crate::error::{Error, Result};

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put(&self, bucket: &str, key: &str, value: Vec<u8>) -> Result<()>;

    /// Returns whether the key existed.
    async fn delete(&self, bucket: &str, key: &str) -> Result<bool>;

    /// All entries of a bucket, ordered by key.
    async fn list(&self, bucket: &str) -> Result<BTreeMap<String, Vec<u8>>>;
}

/// Store rooted at a directory, one subdirectory per bucket.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| Error::storage("open", root.display().to_string(), e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // Keys may contain "::" and other characters that are unsafe in file
    // names, so file names are the hex encoding of the key.
    fn path_for(&self, bucket: &str, key: &str) -> PathBuf {
        self.root
            .join(bucket)
            .join(format!("{}.json", hex::encode(key.as_bytes())))
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(bucket, key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::storage("read", format!("{}/{}", bucket, key), e)),
        }
    }

    async fn put(&self, bucket: &str, key: &str, value: Vec<u8>) -> Result<()> {
        let ctx = || format!("{}/{}", bucket, key);
        let path = self.path_for(bucket, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::storage("write", ctx(), e))?;
        }

        // Concurrent writers each get their own temp file; the last rename wins.
        let mut nonce = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let tmp = path.with_extension(format!("{}.tmp", hex::encode(nonce)));
        fs::write(&tmp, value)
            .await
            .map_err(|e| Error::storage("write", ctx(), e))?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(Error::storage("write", ctx(), e));
        }
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<bool> {
        match fs::remove_file(self.path_for(bucket, key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::storage("delete", format!("{}/{}", bucket, key), e)),
        }
    }

    async fn list(&self, bucket: &str) -> Result<BTreeMap<String, Vec<u8>>> {
        let dir = self.root.join(bucket);
        let mut out = BTreeMap::new();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(Error::storage("list", bucket, e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::storage("list", bucket, e))?
        {
            let file_name = entry.file_name();
            let Some(stem) = file_name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            let key = match hex::decode(stem).ok().and_then(|b| String::from_utf8(b).ok()) {
                Some(key) => key,
                None => continue,
            };
            match fs::read(entry.path()).await {
                Ok(bytes) => {
                    out.insert(key, bytes);
                }
                // Deleted between read_dir and read.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::storage("list", format!("{}/{}", bucket, key), e)),
            }
        }
        Ok(out)
    }
}

/// Volatile store used when no data directory is configured, and in tests.
#[derive(Default)]
pub struct MemoryStore {
    buckets: RwLock<HashMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let map = self.buckets.read().await;
        Ok(map.get(bucket).and_then(|b| b.get(key)).cloned())
    }

    async fn put(&self, bucket: &str, key: &str, value: Vec<u8>) -> Result<()> {
        let mut map = self.buckets.write().await;
        map.entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<bool> {
        let mut map = self.buckets.write().await;
        Ok(map
            .get_mut(bucket)
            .map(|b| b.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn list(&self, bucket: &str) -> Result<BTreeMap<String, Vec<u8>>> {
        let map = self.buckets.read().await;
        Ok(map.get(bucket).cloned().unwrap_or_default())
    }
}

/// JSON helpers shared by the typed stores built on top of a [`KeyValueStore`].
pub(crate) fn encode<T: serde::Serialize>(op: &'static str, key: &str, value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(value).map_err(|e| Error::storage(op, key, e))
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(op: &'static str, key: &str, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| Error::storage(op, key, e))
}
