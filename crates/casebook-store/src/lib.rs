mod content;
mod local;
#[cfg(feature = "s3")]
mod s3;

pub use content::{digest_of, ContentStore, StoredBlob};
pub use local::LocalStore;
#[cfg(feature = "s3")]
pub use s3::S3Store;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("store error: {0}")]
    Internal(String),
}

/// A store for opaque blobs keyed by string paths.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write (create or overwrite) an object.
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError>;

    /// Read an object. Returns `StoreError::NotFound` if absent.
    async fn get(&self, key: &str) -> Result<Bytes, StoreError>;

    /// Read an object, returning `None` if it does not exist.
    async fn get_opt(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        match self.get(key).await {
            Ok(data) => Ok(Some(data)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Delete an object. No-op if absent.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// List object keys under a prefix.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Check if an object exists.
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        match self.get(key).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

// -- Key helpers --

/// Content-addressed location of a blob: `blobs/<aa>/<bb>/<digest>`.
pub fn blob_key(digest: &str) -> String {
    match (digest.get(0..2), digest.get(2..4)) {
        (Some(a), Some(b)) => format!("blobs/{a}/{b}/{digest}"),
        _ => format!("blobs/{digest}"),
    }
}

// -- Configuration --

/// Configuration for the object store backend.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// S3-compatible endpoint URL (e.g., "http://127.0.0.1:3900").
    /// When `None`, use local filesystem.
    pub endpoint_url: Option<String>,
    pub region: Option<String>,
    pub bucket: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Namespace inside the bucket, so one bucket can serve several deployments.
    pub key_prefix: Option<String>,
    /// Local filesystem base directory (used when S3 is not configured).
    pub local_data_dir: Option<String>,
}

impl StoreConfig {
    /// Build from environment variables.
    /// If `CASEBOOK_S3_ENDPOINT` (or `AWS_ENDPOINT_URL`) is set along with
    /// credentials and a bucket name, use S3. Otherwise, fall back to the
    /// local filesystem under `CASEBOOK_DATA_DIR`.
    pub fn from_env() -> Self {
        Self {
            endpoint_url: std::env::var("CASEBOOK_S3_ENDPOINT")
                .or_else(|_| std::env::var("AWS_ENDPOINT_URL"))
                .ok(),
            region: std::env::var("CASEBOOK_S3_REGION")
                .or_else(|_| std::env::var("AWS_REGION"))
                .ok(),
            bucket: std::env::var("CASEBOOK_S3_BUCKET").ok(),
            access_key_id: std::env::var("CASEBOOK_S3_ACCESS_KEY_ID")
                .or_else(|_| std::env::var("AWS_ACCESS_KEY_ID"))
                .ok(),
            secret_access_key: std::env::var("CASEBOOK_S3_SECRET_ACCESS_KEY")
                .or_else(|_| std::env::var("AWS_SECRET_ACCESS_KEY"))
                .ok(),
            key_prefix: std::env::var("CASEBOOK_S3_PREFIX").ok(),
            local_data_dir: std::env::var("CASEBOOK_DATA_DIR").ok(),
        }
    }

    pub fn local(dir: impl Into<String>) -> Self {
        Self {
            endpoint_url: None,
            region: None,
            bucket: None,
            access_key_id: None,
            secret_access_key: None,
            key_prefix: None,
            local_data_dir: Some(dir.into()),
        }
    }

    pub fn is_s3(&self) -> bool {
        self.endpoint_url.is_some()
            && self.access_key_id.is_some()
            && self.secret_access_key.is_some()
            && self.bucket.is_some()
    }
}

// -- Factory --

/// Create an `ObjectStore` from configuration.
pub fn create_store(config: &StoreConfig) -> Result<Arc<dyn ObjectStore>, StoreError> {
    if config.is_s3() {
        #[cfg(feature = "s3")]
        {
            Ok(Arc::new(S3Store::new(config)?))
        }
        #[cfg(not(feature = "s3"))]
        {
            Err(StoreError::Internal(
                "S3 configuration detected but the 's3' feature is not enabled".into(),
            ))
        }
    } else {
        Ok(Arc::new(LocalStore::new(config)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_key_fans_out_by_prefix() {
        let digest = "ab".repeat(32);
        assert_eq!(blob_key(&digest), format!("blobs/ab/ab/{digest}"));
        assert_eq!(blob_key("xy"), "blobs/xy");
    }

    #[test]
    fn store_config_is_s3_requires_all_fields() {
        let full = StoreConfig {
            endpoint_url: Some("http://localhost:3900".into()),
            region: Some("garage".into()),
            bucket: Some("casebook".into()),
            access_key_id: Some("key".into()),
            secret_access_key: Some("secret".into()),
            key_prefix: None,
            local_data_dir: None,
        };
        assert!(full.is_s3());

        let mut missing_bucket = full.clone();
        missing_bucket.bucket = None;
        assert!(!missing_bucket.is_s3());

        let mut missing_creds = full;
        missing_creds.secret_access_key = None;
        assert!(!missing_creds.is_s3());

        assert!(!StoreConfig::local("/tmp/x").is_s3());
    }

    #[test]
    fn create_store_local_fallback() {
        let tmp = tempfile::tempdir().unwrap();
        let config = StoreConfig::local(tmp.path().to_string_lossy());
        assert!(create_store(&config).is_ok());
    }

    // These subtests mutate global env vars and must run sequentially
    // in a single test to avoid races with parallel test execution.
    #[test]
    fn store_config_from_env_scenarios() {
        use std::sync::Mutex;
        static ENV_LOCK: Mutex<()> = Mutex::new(());
        let _guard = ENV_LOCK.lock().unwrap();

        let clear_all = || {
            for var in [
                "CASEBOOK_S3_ENDPOINT", "AWS_ENDPOINT_URL",
                "CASEBOOK_S3_REGION", "AWS_REGION",
                "CASEBOOK_S3_BUCKET",
                "CASEBOOK_S3_ACCESS_KEY_ID", "AWS_ACCESS_KEY_ID",
                "CASEBOOK_S3_SECRET_ACCESS_KEY", "AWS_SECRET_ACCESS_KEY",
                "CASEBOOK_S3_PREFIX", "CASEBOOK_DATA_DIR",
            ] {
                std::env::remove_var(var);
            }
        };

        clear_all();
        let config = StoreConfig::from_env();
        assert!(config.endpoint_url.is_none());
        assert!(config.local_data_dir.is_none());
        assert!(!config.is_s3());

        // CASEBOOK_* take precedence over AWS_*
        clear_all();
        std::env::set_var("CASEBOOK_S3_ENDPOINT", "http://garage:3900");
        std::env::set_var("AWS_ENDPOINT_URL", "http://aws:443");
        std::env::set_var("CASEBOOK_S3_BUCKET", "blobs");
        std::env::set_var("AWS_ACCESS_KEY_ID", "aws-key");
        std::env::set_var("CASEBOOK_S3_SECRET_ACCESS_KEY", "secret");
        std::env::set_var("CASEBOOK_DATA_DIR", "/var/lib/casebook");
        std::env::set_var("CASEBOOK_S3_PREFIX", "staging");
        let config = StoreConfig::from_env();
        assert_eq!(config.key_prefix.as_deref(), Some("staging"));
        assert_eq!(config.endpoint_url.as_deref(), Some("http://garage:3900"));
        assert_eq!(config.access_key_id.as_deref(), Some("aws-key"));
        assert_eq!(config.local_data_dir.as_deref(), Some("/var/lib/casebook"));
        assert!(config.is_s3());

        clear_all();
    }
}
