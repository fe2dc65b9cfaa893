use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use parking_lot::Mutex;
use tokio::fs;

/// Durable byte store used for cache persistence.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn write(&self, key: &str, bytes: &[u8]) -> Result<()>;
}

/// One file per key under a directory. File names are the base64url form of
/// the key, so distinct keys never share a file.
#[derive(Debug, Clone)]
pub struct FileKvStore {
    dir: PathBuf,
}

impl FileKvStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.bin", URL_SAFE_NO_PAD.encode(key.as_bytes())))
    }
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
        }
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("create {}", self.dir.display()))?;
        let path = self.path_for(key);
        let tmp = path.with_extension("bin.tmp");
        fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("rename into {}", path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryKvStore {
    map: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.map.lock().get(key).cloned())
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.map.lock().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_store_roundtrip_and_missing_key() {
        let tmp = tempfile::tempdir().unwrap();
        let kv = FileKvStore::new(tmp.path().join("kv"));
        assert!(kv.read("absent").await.unwrap().is_none());
        kv.write("scribe/cache:v1", b"payload").await.unwrap();
        assert_eq!(
            kv.read("scribe/cache:v1").await.unwrap().as_deref(),
            Some(&b"payload"[..])
        );
        let name = format!("{}.bin", URL_SAFE_NO_PAD.encode("scribe/cache:v1"));
        assert!(tmp.path().join("kv").join(name).exists());
    }

    #[tokio::test]
    async fn keys_differing_only_in_punctuation_stay_apart() {
        let tmp = tempfile::tempdir().unwrap();
        let kv = FileKvStore::new(tmp.path());
        kv.write("a/b", b"slash").await.unwrap();
        kv.write("a_b", b"underscore").await.unwrap();
        kv.write("a:b", b"colon").await.unwrap();
        assert_eq!(kv.read("a/b").await.unwrap().as_deref(), Some(&b"slash"[..]));
        assert_eq!(kv.read("a_b").await.unwrap().as_deref(), Some(&b"underscore"[..]));
        assert_eq!(kv.read("a:b").await.unwrap().as_deref(), Some(&b"colon"[..]));
    }
}
