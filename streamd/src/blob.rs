//! Cold blob store (spec §1): object put/get/delete by opaque key. Out of
//! scope as a backend, but segment rotation (in scope, §4.4) needs
//! somewhere to write, so a filesystem-backed implementation is provided.

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::io;

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> io::Result<()>;
    async fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>>;
    async fn delete(&self, key: &str) -> io::Result<()>;
}

pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: PathBuf) -> Self {
        FsBlobStore { root }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> io::Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, bytes).await
    }

    async fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, key: &str) -> io::Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Segment key per spec §4.4: `(stream_id, read_seq)` with the stream id
/// URL-safe base64 encoded.
pub fn segment_key(stream_id: &str, read_seq: i64) -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    format!("{}/{read_seq:016}", URL_SAFE_NO_PAD.encode(stream_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fs_blob_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path().to_path_buf());
        let key = segment_key("proj/stream-1", 3);

        assert!(store.get(&key).await.unwrap().is_none());
        store.put(&key, b"hello".to_vec()).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), Some(b"hello".to_vec()));
        store.delete(&key).await.unwrap();
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[test]
    fn segment_key_is_url_safe() {
        let key = segment_key("a stream/with?odd:chars", 1);
        assert!(!key.contains('?'));
        assert!(!key.contains(':'));
    }
}
