use async_trait::async_trait;
use bytes::Bytes;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::region::Region;
use s3::Bucket;
use tracing::debug;

use crate::{ObjectStore, StoreConfig, StoreError};

/// Blobs are immutable once written: their key is their digest.
const BLOB_CONTENT_TYPE: &str = "application/octet-stream";

pub struct S3Store {
    bucket: Box<Bucket>,
    /// Either empty or ends with `/`.
    prefix: String,
}

impl std::fmt::Debug for S3Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Store")
            .field("bucket", &self.bucket.name())
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl S3Store {
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let bucket_name = config
            .bucket
            .as_deref()
            .ok_or_else(|| StoreError::Internal("bucket name required".into()))?;
        let region = Region::Custom {
            region: config.region.clone().unwrap_or_else(|| "us-east-1".into()),
            endpoint: config.endpoint_url.clone().unwrap_or_default(),
        };
        let credentials = Credentials::new(
            config.access_key_id.as_deref(),
            config.secret_access_key.as_deref(),
            None,
            None,
            None,
        )
        .map_err(|e| StoreError::Internal(format!("credentials: {e}")))?;

        let mut bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StoreError::Internal(format!("bucket {bucket_name}: {e}")))?;
        bucket.set_path_style();

        Ok(Self {
            bucket,
            prefix: normalize_prefix(config.key_prefix.as_deref()),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    fn check(&self, op: &str, key: &str, status: u16) -> Result<(), StoreError> {
        match status {
            404 => Err(StoreError::NotFound(key.to_string())),
            s if s >= 400 => Err(StoreError::Internal(format!("s3 {op} {key}: status {s}"))),
            _ => Ok(()),
        }
    }
}

fn normalize_prefix(raw: Option<&str>) -> String {
    match raw.map(|p| p.trim_matches('/')) {
        Some(p) if !p.is_empty() => format!("{p}/"),
        _ => String::new(),
    }
}

fn map_s3_error(e: S3Error) -> StoreError {
    StoreError::Internal(format!("s3: {e}"))
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError> {
        let response = self
            .bucket
            .put_object_with_content_type(self.full_key(key), &data, BLOB_CONTENT_TYPE)
            .await
            .map_err(map_s3_error)?;
        self.check("put", key, response.status_code())?;
        debug!(key, size = data.len(), "s3 object written");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        let response = self
            .bucket
            .get_object(self.full_key(key))
            .await
            .map_err(map_s3_error)?;
        self.check("get", key, response.status_code())?;
        Ok(Bytes::from(response.to_vec()))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let response = self
            .bucket
            .delete_object(self.full_key(key))
            .await
            .map_err(map_s3_error)?;
        match self.check("delete", key, response.status_code()) {
            Err(StoreError::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let pages = self
            .bucket
            .list(self.full_key(prefix), None)
            .await
            .map_err(map_s3_error)?;
        let mut keys: Vec<String> = pages
            .into_iter()
            .flat_map(|page| page.contents)
            .filter_map(|o| o.key.strip_prefix(self.prefix.as_str()).map(String::from))
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// HEAD instead of GET: dedup checks must not pull whole blobs.
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let (_, status) = self
            .bucket
            .head_object(self.full_key(key))
            .await
            .map_err(map_s3_error)?;
        match self.check("head", key, status) {
            Ok(()) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
