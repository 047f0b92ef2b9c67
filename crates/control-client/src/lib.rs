//! Client for the storage engine's control-plane REST surface.
//!
//! The engine exposes backup and restore resources as JSON over HTTP. The
//! reconciler creates a resource to start an operation, polls it until the
//! status turns terminal, and deletes backup resources during cleanup. The
//! `backupDest`/`restoreSrc` fields carry the `host:port` of the transfer
//! server the engine's replicas dial.

mod client;
mod types;

pub use client::{ControlClient, DEFAULT_TIMEOUT};
pub use types::{
    BackupResource, BackupSpec, CasInfo, CasSpec, Metadata, OpStatus, RestoreResource, RestoreSpec,
};
