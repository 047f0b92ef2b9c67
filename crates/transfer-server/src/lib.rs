//! TCP data plane between storage-engine replicas and the cloud object
//! store.
//!
//! One [`TransferServer`] runs per backup or restore operation. It listens
//! on the operation's port, accepts replica connections, and pipes each
//! connection's bytes to (backup) or from (restore) its own blob stream.
//! The server keeps running through individual client failures and winds
//! down only when the owning [`CloudConn`]'s exit flag is raised by the
//! reconciler: the control plane, not the data plane, decides when an
//! operation is over.

mod conn;
mod registry;
mod server;

pub use conn::CloudConn;
pub use registry::{ClientRegistry, ClientStatus};
pub use server::{ServerOp, TransferCounts, TransferServer};

/// Port replicas dial for restore downloads.
pub const RESTORE_PORT: u16 = 9000;

/// Port replicas dial for backup uploads.
pub const BACKUP_PORT: u16 = 9001;

/// Listen backlog; also the most replicas one operation will serve.
pub const MAX_CLIENTS: u32 = 10;

/// Per-client transfer buffer size.
pub const READ_BUFFER_LEN: usize = 32 * 1024;
