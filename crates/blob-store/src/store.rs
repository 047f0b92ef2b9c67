//! The provider-backed object store handle.

use std::sync::Arc;

use bytes::Bytes;
use object_store::{
    aws::AmazonS3Builder, gcp::GoogleCloudStorageBuilder, path::Path, ClientOptions, ObjectStore,
    PutPayload,
};
use tracing::debug;

use crate::{
    config::{CloudConfig, Provider},
    error::{BlobError, BlobResult},
    stream::{BlobReader, BlobWriter},
};

/// Which entries a listing should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// Only objects.
    Files,
    /// Only common prefixes (returned with a trailing `/`).
    Directories,
    /// Both.
    All,
}

/// Handle to one configured bucket.
///
/// Cheap to clone; all clones share the underlying client.
#[derive(Clone)]
pub struct CloudStore {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl CloudStore {
    /// Open the bucket described by `config`.
    pub fn new(config: &CloudConfig) -> BlobResult<Self> {
        let store: Arc<dyn ObjectStore> = match config.provider {
            Provider::Aws => Arc::new(Self::build_s3(config)?),
            Provider::Gcp => Arc::new(Self::build_gcs(config)?),
        };

        debug!(bucket = %config.bucket, provider = ?config.provider, "opened cloud bucket");

        Ok(CloudStore {
            store,
            bucket: config.bucket.clone(),
        })
    }

    fn build_s3(config: &CloudConfig) -> BlobResult<object_store::aws::AmazonS3> {
        let mut builder = AmazonS3Builder::from_env().with_bucket_name(&config.bucket);

        if let Some(region) = &config.region {
            builder = builder.with_region(region);
        }

        let mut allow_http = config.disable_ssl;
        if let Some(url) = &config.s3_url {
            builder = builder.with_endpoint(url);
            if url.starts_with("http://") {
                allow_http = true;
            }
        }

        if config.s3_force_path_style {
            builder = builder.with_virtual_hosted_style_request(false);
        }

        let mut client_options = ClientOptions::new();
        if allow_http {
            client_options = client_options.with_allow_http(true);
        }
        if config.insecure_skip_tls_verify {
            client_options = client_options.with_allow_invalid_certificates(true);
        }

        builder
            .with_client_options(client_options)
            .build()
            .map_err(BlobError::from)
    }

    fn build_gcs(config: &CloudConfig) -> BlobResult<object_store::gcp::GoogleCloudStorage> {
        GoogleCloudStorageBuilder::from_env()
            .with_bucket_name(&config.bucket)
            .build()
            .map_err(BlobError::from)
    }

    /// Bucket this store points at.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Streaming multipart writer for `key`.
    pub fn writer(&self, key: &str, part_size: u64) -> BlobWriter {
        BlobWriter::new(self.store.clone(), Path::from(key), part_size)
    }

    /// Pull-based reader over the object at `key`.
    pub async fn reader(&self, key: &str) -> BlobResult<BlobReader> {
        let result = self.store.get(&Path::from(key)).await?;
        Ok(BlobReader::new(result.into_stream()))
    }

    /// Whole-object read.
    pub async fn get(&self, key: &str) -> BlobResult<Bytes> {
        let result = self.store.get(&Path::from(key)).await?;
        Ok(result.bytes().await?)
    }

    /// Whole-object write. A failed write removes the partial object
    /// best-effort so the key never holds truncated data.
    pub async fn put(&self, key: &str, data: Bytes) -> BlobResult<()> {
        let path = Path::from(key);
        if let Err(err) = self.store.put(&path, PutPayload::from(data)).await {
            if let Err(del_err) = self.store.delete(&path).await {
                debug!(key, error = %del_err, "failed to remove partial object");
            }
            return Err(err.into());
        }
        Ok(())
    }

    /// Delete `key`. A missing object is not an error.
    pub async fn delete(&self, key: &str) -> BlobResult<()> {
        match self.store.delete(&Path::from(key)).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Whether an object exists at `key`.
    pub async fn exists(&self, key: &str) -> BlobResult<bool> {
        match self.store.head(&Path::from(key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// List keys below `prefix`, one hierarchy level deep (`/` delimiter).
    ///
    /// Directory entries are returned with their trailing `/`.
    pub async fn list_keys(&self, prefix: &str, kind: KeyKind) -> BlobResult<Vec<String>> {
        let prefix_path = Path::from(prefix);
        let listing = self.store.list_with_delimiter(Some(&prefix_path)).await?;

        let mut keys = Vec::new();
        if kind != KeyKind::Files {
            keys.extend(
                listing
                    .common_prefixes
                    .iter()
                    .map(|p| format!("{}/", p)),
            );
        }
        if kind != KeyKind::Directories {
            keys.extend(listing.objects.iter().map(|o| o.location.to_string()));
        }
        Ok(keys)
    }
}

#[cfg(any(test, feature = "test-util"))]
impl CloudStore {
    /// In-memory store for exercising the streaming paths in tests.
    pub fn in_memory() -> Self {
        CloudStore {
            store: Arc::new(object_store::memory::InMemory::new()),
            bucket: "in-memory".to_string(),
        }
    }
}

#[cfg(feature = "test-util")]
impl CloudStore {
    /// In-memory store whose first multipart upload fails to open; later
    /// uploads work. For testing that one writer's failure stays scoped
    /// to its owner.
    pub fn failing_first_multipart() -> Self {
        CloudStore {
            store: Arc::new(crate::fault::FailFirstMultipart::default()),
            bucket: "in-memory".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete_roundtrip() {
        let store = CloudStore::in_memory();
        store
            .put("backups/b1/p-pv-1-b1.pvc", Bytes::from_static(b"{}"))
            .await
            .unwrap();

        assert!(store.exists("backups/b1/p-pv-1-b1.pvc").await.unwrap());
        let data = store.get("backups/b1/p-pv-1-b1.pvc").await.unwrap();
        assert_eq!(data.as_ref(), b"{}");

        store.delete("backups/b1/p-pv-1-b1.pvc").await.unwrap();
        assert!(!store.exists("backups/b1/p-pv-1-b1.pvc").await.unwrap());
    }

    #[tokio::test]
    async fn delete_of_missing_object_is_ok() {
        let store = CloudStore::in_memory();
        store.delete("backups/absent").await.unwrap();
    }

    #[tokio::test]
    async fn get_of_missing_object_is_not_found() {
        let store = CloudStore::in_memory();
        let err = store.get("backups/absent").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn listing_separates_directories_and_files() {
        let store = CloudStore::in_memory();
        for key in [
            "backups/sch-20240101000000/p-pv-1-sch-20240101000000",
            "backups/sch-20240102000000/p-pv-1-sch-20240102000000",
            "backups/manifest",
        ] {
            store.put(key, Bytes::from_static(b"x")).await.unwrap();
        }

        let dirs = store
            .list_keys("backups", KeyKind::Directories)
            .await
            .unwrap();
        assert_eq!(
            dirs,
            vec![
                "backups/sch-20240101000000/".to_string(),
                "backups/sch-20240102000000/".to_string(),
            ]
        );

        let files = store.list_keys("backups", KeyKind::Files).await.unwrap();
        assert_eq!(files, vec!["backups/manifest".to_string()]);

        let all = store.list_keys("backups", KeyKind::All).await.unwrap();
        assert_eq!(all.len(), 3);
    }
}
