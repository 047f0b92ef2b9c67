//! Fault-injecting backend for exercising error paths in tests.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::stream::BoxStream;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{
    GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, ObjectStore, PutMultipartOpts,
    PutOptions, PutPayload, PutResult,
};

/// In-memory backend whose first multipart upload fails to open; every
/// later upload behaves normally. With several writers against one store,
/// exactly one of them sees the failure.
#[derive(Debug)]
pub(crate) struct FailFirstMultipart {
    inner: InMemory,
    tripped: AtomicBool,
}

impl Default for FailFirstMultipart {
    fn default() -> Self {
        FailFirstMultipart {
            inner: InMemory::new(),
            tripped: AtomicBool::new(false),
        }
    }
}

impl fmt::Display for FailFirstMultipart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FailFirstMultipart({})", self.inner)
    }
}

#[async_trait]
impl ObjectStore for FailFirstMultipart {
    async fn put_opts(
        &self,
        location: &Path,
        payload: PutPayload,
        opts: PutOptions,
    ) -> object_store::Result<PutResult> {
        self.inner.put_opts(location, payload, opts).await
    }

    async fn put_multipart_opts(
        &self,
        location: &Path,
        opts: PutMultipartOpts,
    ) -> object_store::Result<Box<dyn MultipartUpload>> {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            return Err(object_store::Error::Generic {
                store: "FailFirstMultipart",
                source: "injected multipart failure".into(),
            });
        }
        self.inner.put_multipart_opts(location, opts).await
    }

    async fn get_opts(
        &self,
        location: &Path,
        options: GetOptions,
    ) -> object_store::Result<GetResult> {
        self.inner.get_opts(location, options).await
    }

    async fn delete(&self, location: &Path) -> object_store::Result<()> {
        self.inner.delete(location).await
    }

    fn list(&self, prefix: Option<&Path>) -> BoxStream<'_, object_store::Result<ObjectMeta>> {
        self.inner.list(prefix)
    }

    async fn list_with_delimiter(&self, prefix: Option<&Path>) -> object_store::Result<ListResult> {
        self.inner.list_with_delimiter(prefix).await
    }

    async fn copy(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        self.inner.copy(from, to).await
    }

    async fn copy_if_not_exists(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        self.inner.copy_if_not_exists(from, to).await
    }
}
