//! Cloud-provider-agnostic object I/O for snapshot transfer.
//!
//! This crate owns everything that touches the object store directly:
//!
//! - [`CloudConfig`]: options parsed from the host's configuration map
//!   (provider, bucket, region, prefixes, multipart chunk size).
//! - [`CloudStore`]: a thin wrapper over [`object_store`] that exposes the
//!   operations the transfer pipeline needs: streaming multipart writers,
//!   pull-based readers, whole-object read/write, delete, and delimiter
//!   listing.
//! - [`RemoteLayout`]: the deterministic remote naming scheme
//!   `[<pathPrefix>/]backups/<backup>/<prefix>-<volume>-<backup>` plus the
//!   sidecar suffixes for claim and volume specs.
//!
//! Writers buffer up to the configured part size before flushing a part;
//! closing a writer that never wrote still produces a zero-byte object so
//! that empty snapshots round-trip. Readers are pull-based: `read` returning
//! `0` means end of object.

mod config;
mod error;
#[cfg(feature = "test-util")]
mod fault;
mod paths;
mod store;
mod stream;

pub use config::{effective_part_size, parse_quantity, CloudConfig, Provider, MIN_PART_SIZE};
pub use error::{BlobError, BlobResult};
pub use paths::{RemoteLayout, PVC_SUFFIX};
pub use store::{CloudStore, KeyKind};
pub use stream::{BlobReader, BlobWriter};
