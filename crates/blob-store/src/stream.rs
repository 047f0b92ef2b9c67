//! Streaming writer and reader over one remote object.

use std::sync::Arc;

use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt};
use object_store::{path::Path, ObjectStore, PutPayload, WriteMultipart};
use tracing::debug;

use crate::error::BlobResult;

/// Streaming multipart writer for one remote object.
///
/// Bytes are buffered and flushed as parts of `part_size`; the multipart
/// upload is only opened once the first byte arrives, so a writer that is
/// finished without ever writing still produces a zero-byte object.
pub struct BlobWriter {
    store: Arc<dyn ObjectStore>,
    path: Path,
    part_size: u64,
    upload: Option<WriteMultipart>,
    bytes_written: u64,
}

impl BlobWriter {
    pub(crate) fn new(store: Arc<dyn ObjectStore>, path: Path, part_size: u64) -> Self {
        BlobWriter {
            store,
            path,
            part_size,
            upload: None,
            bytes_written: 0,
        }
    }

    /// Append `data` to the object.
    pub async fn write(&mut self, data: &[u8]) -> BlobResult<()> {
        if self.upload.is_none() {
            let multipart = self.store.put_multipart(&self.path).await?;
            self.upload = Some(WriteMultipart::new_with_chunk_size(
                multipart,
                self.part_size as usize,
            ));
        }

        if let Some(upload) = self.upload.as_mut() {
            upload.wait_for_capacity(1).await?;
            upload.write(data);
            self.bytes_written += data.len() as u64;
        }
        Ok(())
    }

    /// Total bytes accepted so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Finalise the upload. Zero bytes written still creates the object.
    pub async fn finish(self) -> BlobResult<u64> {
        match self.upload {
            Some(upload) => {
                upload.finish().await?;
            }
            None => {
                self.store
                    .put(&self.path, PutPayload::from(Bytes::new()))
                    .await?;
            }
        }
        Ok(self.bytes_written)
    }

    /// Drop the upload and remove whatever may have landed, best-effort.
    pub async fn abort(self) {
        drop(self.upload);
        if let Err(err) = self.store.delete(&self.path).await {
            debug!(key = %self.path, error = %err, "abort cleanup failed");
        }
    }
}

/// Pull-based reader over one remote object.
pub struct BlobReader {
    stream: BoxStream<'static, object_store::Result<Bytes>>,
    current: Bytes,
    done: bool,
}

impl BlobReader {
    pub(crate) fn new(stream: BoxStream<'static, object_store::Result<Bytes>>) -> Self {
        BlobReader {
            stream,
            current: Bytes::new(),
            done: false,
        }
    }

    /// Fill `buf` with the next bytes of the object. Returns the number of
    /// bytes copied; `0` means end of object.
    pub async fn read(&mut self, buf: &mut [u8]) -> BlobResult<usize> {
        loop {
            if !self.current.is_empty() {
                let n = std::cmp::min(buf.len(), self.current.len());
                buf[..n].copy_from_slice(&self.current[..n]);
                self.current = self.current.split_off(n);
                return Ok(n);
            }

            if self.done {
                return Ok(0);
            }

            match self.stream.next().await {
                Some(chunk) => self.current = chunk?,
                None => self.done = true,
            }
        }
    }
}
