use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{ObjectStore, StoreConfig, StoreError};

pub struct LocalStore {
    base_dir: PathBuf,
}

impl LocalStore {
    pub fn new(config: &StoreConfig) -> Self {
        let base_dir = config
            .local_data_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);
        Self { base_dir }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, StoreError> {
        let rel = Path::new(key);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(StoreError::Internal(format!("invalid key {key:?}")));
        }
        Ok(self.base_dir.join(rel))
    }
}

/// Same default as `casebook_db::data_dir()`, without depending on the db crate.
fn default_data_dir() -> PathBuf {
    let base = if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg)
    } else if let Some(home) = std::env::var_os("HOME") {
        PathBuf::from(home).join(".local/share")
    } else {
        PathBuf::from(".")
    };
    base.join("casebook")
}

#[async_trait]
impl ObjectStore for LocalStore {
    /// Writes go to a temporary sibling first and are renamed into place,
    /// so readers never observe a partially written object.
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError> {
        let path = self.resolve(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| StoreError::Internal(format!("invalid key {key:?}")))?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::Internal(format!("mkdir: {e}")))?;

        let tmp = parent.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        if let Err(e) = tokio::fs::write(&tmp, &data).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StoreError::Internal(format!("write {}: {e}", tmp.display())));
        }
        tokio::fs::rename(&tmp, &path).await.map_err(|e| {
            StoreError::Internal(format!("rename into {}: {e}", path.display()))
        })
    }

    async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(StoreError::Internal(format!(
                "read {}: {e}",
                path.display()
            ))),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Internal(format!(
                "delete {}: {e}",
                path.display()
            ))),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.resolve(prefix)?;
        if !dir.exists() {
            return Ok(vec![]);
        }
        let mut keys = Vec::new();
        let mut stack = vec![dir];
        while let Some(current) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&current).await {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(StoreError::Internal(format!(
                        "list {}: {e}",
                        current.display()
                    )))
                }
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StoreError::Internal(format!("read_dir entry: {e}")))?
            {
                let path = entry.path();
                let ft = entry
                    .file_type()
                    .await
                    .map_err(|e| StoreError::Internal(format!("file_type: {e}")))?;
                if ft.is_dir() {
                    stack.push(path);
                } else if entry.file_name().to_string_lossy().starts_with(".tmp-") {
                    continue;
                } else if let Ok(rel) = path.strip_prefix(&self.base_dir) {
                    keys.push(rel.to_string_lossy().to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.resolve(key)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| StoreError::Internal(format!("exists {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store(dir: &std::path::Path) -> LocalStore {
        LocalStore::new(&StoreConfig::local(dir.to_string_lossy()))
    }

    #[tokio::test]
    async fn put_then_get() {
        let tmp = tempfile::tempdir().unwrap();
        let store = test_store(tmp.path());

        store
            .put("blobs/ab/cd/abcd", Bytes::from("hello world"))
            .await
            .unwrap();
        let data = store.get("blobs/ab/cd/abcd").await.unwrap();
        assert_eq!(data.as_ref(), b"hello world");
    }

    #[tokio::test]
    async fn get_missing_returns_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = test_store(tmp.path());

        let err = store.get("nonexistent/key").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(store.get_opt("nonexistent/key").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_leaves_no_temp_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = test_store(tmp.path());

        store.put("blobs/aa/key", Bytes::from("first")).await.unwrap();
        store.put("blobs/aa/key", Bytes::from("second")).await.unwrap();

        let data = store.get("blobs/aa/key").await.unwrap();
        assert_eq!(data.as_ref(), b"second");
        let names: Vec<_> = std::fs::read_dir(tmp.path().join("blobs/aa"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["key".to_string()]);
    }

    #[tokio::test]
    async fn delete_removes_object_and_missing_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let store = test_store(tmp.path());

        store.put("key", Bytes::from("data")).await.unwrap();
        assert!(store.exists("key").await.unwrap());

        store.delete("key").await.unwrap();
        assert!(!store.exists("key").await.unwrap());
        store.delete("key").await.unwrap();
    }

    #[tokio::test]
    async fn list_returns_keys_with_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        let store = test_store(tmp.path());

        store.put("blobs/aa/one", Bytes::from("1")).await.unwrap();
        store.put("blobs/aa/two", Bytes::from("2")).await.unwrap();
        store.put("blobs/bb/three", Bytes::from("3")).await.unwrap();
        store.put("other/file.txt", Bytes::from("x")).await.unwrap();

        let keys = store.list("blobs/aa").await.unwrap();
        assert_eq!(keys, vec!["blobs/aa/one".to_string(), "blobs/aa/two".to_string()]);
        assert_eq!(store.list("blobs").await.unwrap().len(), 3);
        assert!(store.list("nonexistent").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn keys_cannot_escape_base_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let store = test_store(tmp.path());

        assert!(store.put("../escape", Bytes::from("x")).await.is_err());
        assert!(store.get("/etc/passwd").await.is_err());
    }
}
