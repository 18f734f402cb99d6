use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::sync::OwnedMutexGuard;

use crate::{blob_key, ObjectStore, StoreError};

/// Lowercase hex SHA-256 of `data`.
pub fn digest_of(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub digest: String,
    pub size_bytes: i64,
    /// False when an identical blob was already present.
    pub written: bool,
}

/// Content-addressed blob storage on top of an [`ObjectStore`].
///
/// Blobs are written at most once per digest. Callers that need to make a
/// decision spanning the store and the database (register-or-reuse) hold
/// [`ContentStore::lock`] for the digest while they do it.
pub struct ContentStore {
    objects: Arc<dyn ObjectStore>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ContentStore {
    pub fn new(objects: Arc<dyn ObjectStore>) -> Self {
        Self {
            objects,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Serialize work on a single digest within this process.
    pub async fn lock(&self, digest: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            // Entries only referenced by the map are idle.
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks
                .entry(digest.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Store `data` under its digest unless it is already present.
    ///
    /// Does not take the digest lock; callers coordinating with the
    /// database should already hold it.
    pub async fn put(&self, data: Bytes) -> Result<StoredBlob, StoreError> {
        let digest = digest_of(&data);
        let size_bytes = data.len() as i64;
        let key = blob_key(&digest);

        if self.objects.exists(&key).await? {
            tracing::debug!(%digest, "blob already stored");
            return Ok(StoredBlob {
                digest,
                size_bytes,
                written: false,
            });
        }

        self.objects.put(&key, data).await?;
        tracing::debug!(%digest, size_bytes, "blob stored");
        Ok(StoredBlob {
            digest,
            size_bytes,
            written: true,
        })
    }

    /// Store `data`, refusing it if its digest does not match `expected`.
    pub async fn put_verified(&self, expected: &str, data: Bytes) -> Result<StoredBlob, StoreError> {
        let actual = digest_of(&data);
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(StoreError::Internal(format!(
                "digest mismatch: expected {expected}, got {actual}"
            )));
        }
        self.put(data).await
    }

    pub async fn get(&self, digest: &str) -> Result<Bytes, StoreError> {
        self.objects.get(&blob_key(digest)).await
    }

    pub async fn get_opt(&self, digest: &str) -> Result<Option<Bytes>, StoreError> {
        self.objects.get_opt(&blob_key(digest)).await
    }

    pub async fn contains(&self, digest: &str) -> Result<bool, StoreError> {
        self.objects.exists(&blob_key(digest)).await
    }

    pub async fn delete(&self, digest: &str) -> Result<(), StoreError> {
        self.objects.delete(&blob_key(digest)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LocalStore, StoreConfig};

    fn content_store(dir: &std::path::Path) -> (Arc<ContentStore>, Arc<dyn ObjectStore>) {
        let objects: Arc<dyn ObjectStore> =
            Arc::new(LocalStore::new(&StoreConfig::local(dir.to_string_lossy())));
        (Arc::new(ContentStore::new(objects.clone())), objects)
    }

    #[test]
    fn digest_is_lowercase_sha256_hex() {
        assert_eq!(
            digest_of(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(digest_of(b"abc").len(), 64);
    }

    #[tokio::test]
    async fn put_is_write_once() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, objects) = content_store(tmp.path());

        let first = store.put(Bytes::from("screenshot bytes")).await.unwrap();
        assert!(first.written);
        assert_eq!(first.size_bytes, 16);

        let second = store.put(Bytes::from("screenshot bytes")).await.unwrap();
        assert!(!second.written);
        assert_eq!(second.digest, first.digest);

        assert_eq!(objects.list("blobs").await.unwrap().len(), 1);
        assert_eq!(
            store.get(&first.digest).await.unwrap().as_ref(),
            b"screenshot bytes"
        );
    }

    #[tokio::test]
    async fn put_verified_rejects_mismatch() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, _) = content_store(tmp.path());

        let err = store
            .put_verified(&"00".repeat(32), Bytes::from("payload"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("digest mismatch"));

        let digest = digest_of(b"payload");
        let stored = store
            .put_verified(&digest.to_uppercase(), Bytes::from("payload"))
            .await
            .unwrap();
        assert_eq!(stored.digest, digest);
    }

    #[tokio::test]
    async fn concurrent_locked_puts_write_once() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, _) = content_store(tmp.path());
        let data = Bytes::from(vec![7u8; 4096]);
        let digest = digest_of(&data);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let data = data.clone();
            let digest = digest.clone();
            handles.push(tokio::spawn(async move {
                let _guard = store.lock(&digest).await;
                store.put(data).await.unwrap().written
            }));
        }

        let mut writes = 0;
        for h in handles {
            if h.await.unwrap() {
                writes += 1;
            }
        }
        assert_eq!(writes, 1);
        assert!(store.contains(&digest).await.unwrap());
    }

    #[tokio::test]
    async fn delete_then_get_opt_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, _) = content_store(tmp.path());

        let blob = store.put(Bytes::from("x")).await.unwrap();
        store.delete(&blob.digest).await.unwrap();
        assert!(store.get_opt(&blob.digest).await.unwrap().is_none());
        assert!(!store.contains(&blob.digest).await.unwrap());
    }
}
