//! The long-lived cloud connection shared by every operation.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use blob_store::{effective_part_size, CloudConfig, CloudStore, KeyKind, RemoteLayout};
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::server::{ServerOp, TransferCounts, TransferServer};

/// Process-wide cloud access point: the opened bucket, the remote naming
/// scheme, the preferred part size, and the exit flag the reconciler uses
/// to wind the data plane down.
///
/// Initialised once per plugin instance and shared across operations.
#[derive(Clone)]
pub struct CloudConn {
    store: CloudStore,
    layout: RemoteLayout,
    part_size: u64,
    exit: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl CloudConn {
    /// Open the bucket described by `config`.
    pub fn new(config: &CloudConfig) -> Result<Self> {
        let store = CloudStore::new(config).context("failed to setup bucket")?;
        Ok(Self::with_store(store, config))
    }

    /// Wrap an already opened store (test backends included).
    pub fn with_store(store: CloudStore, config: &CloudConfig) -> Self {
        CloudConn {
            store,
            layout: RemoteLayout::new(config.prefix.clone(), config.backup_path_prefix.clone()),
            part_size: config.part_size,
            exit: Arc::new(AtomicBool::new(false)),
            poll_interval: Duration::from_secs(5),
        }
    }

    /// Override the transfer server's exit poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// The opened bucket.
    pub fn store(&self) -> &CloudStore {
        &self.store
    }

    /// The remote naming scheme.
    pub fn layout(&self) -> &RemoteLayout {
        &self.layout
    }

    /// Remote key of the snapshot bytes object for `volume` under `backup`.
    pub fn remote_file_name(&self, volume: &str, backup: &str) -> String {
        self.layout.file_name(volume, backup)
    }

    /// Clear the exit flag ahead of a new operation.
    pub fn reset(&self) {
        self.exit.store(false, Ordering::Relaxed);
    }

    /// Tell the running transfer server to wind down.
    pub fn request_exit(&self) {
        self.exit.store(true, Ordering::Relaxed);
    }

    pub fn exit_requested(&self) -> bool {
        self.exit.load(Ordering::Relaxed)
    }

    /// Run a backup-direction transfer server for `key`.
    ///
    /// `total_size` is the source volume size, used to derive the multipart
    /// part size when none was configured. On failure the partially written
    /// bytes object is removed best-effort.
    pub async fn upload(
        &self,
        key: &str,
        total_size: u64,
        port: u16,
        ready: oneshot::Sender<Option<SocketAddr>>,
    ) -> Result<TransferCounts> {
        let part_size = effective_part_size(self.part_size, total_size);
        info!(key, port, part_size, "uploading snapshot");

        let server = TransferServer::new(
            ServerOp::Backup,
            port,
            key,
            part_size,
            self.store.clone(),
            self.exit.clone(),
        )
        .with_poll_interval(self.poll_interval);

        match server.run(ready).await {
            Ok(counts) => Ok(counts),
            Err(err) => {
                if let Err(del_err) = self.store.delete(key).await {
                    warn!(key, error = %del_err, "failed to remove snapshot object");
                }
                Err(err)
            }
        }
    }

    /// Run a restore-direction transfer server for `key`.
    pub async fn download(
        &self,
        key: &str,
        port: u16,
        ready: oneshot::Sender<Option<SocketAddr>>,
    ) -> Result<TransferCounts> {
        info!(key, port, "restoring snapshot");

        let server = TransferServer::new(
            ServerOp::Restore,
            port,
            key,
            effective_part_size(self.part_size, 0),
            self.store.clone(),
            self.exit.clone(),
        )
        .with_poll_interval(self.poll_interval);

        server.run(ready).await
    }

    /// Names of snapshots of `volume` under `schedule` that exist in the
    /// bucket, in listing order.
    ///
    /// A snapshot counts only when its bytes object is present; a backup
    /// that died after uploading sidecars leaves a directory without one.
    pub async fn snapshot_list(&self, volume: &str, schedule: &str) -> Result<Vec<String>> {
        let root = self.layout.backups_root();
        let dirs = self
            .store
            .list_keys(&root, KeyKind::Directories)
            .await
            .context("failed to list backup directories")?;

        let prefix = format!("{}-", schedule);
        let mut snapshots = Vec::new();
        for dir in dirs {
            let name = dir
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string();
            if !name.starts_with(&prefix) {
                continue;
            }
            if self.store.exists(&self.layout.file_name(volume, &name)).await? {
                snapshots.push(name);
            }
        }
        Ok(snapshots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::collections::HashMap;

    fn test_conn() -> CloudConn {
        let mut map = HashMap::new();
        map.insert("provider".to_string(), "aws".to_string());
        map.insert("bucket".to_string(), "velero".to_string());
        map.insert("region".to_string(), "us-east-1".to_string());
        map.insert("prefix".to_string(), "p".to_string());
        let config = CloudConfig::from_map(&map).unwrap();
        CloudConn::with_store(CloudStore::in_memory(), &config)
            .with_poll_interval(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn snapshot_list_filters_by_schedule_and_bytes_object() {
        let conn = test_conn();
        let store = conn.store();

        // Two complete snapshots of the schedule, one foreign backup, and
        // one schedule directory without a bytes object.
        for name in ["sch-20240101000000", "sch-20240102000000"] {
            store
                .put(&conn.remote_file_name("pv-1", name), Bytes::from_static(b"x"))
                .await
                .unwrap();
        }
        store
            .put(&conn.remote_file_name("pv-1", "other-b1"), Bytes::from_static(b"x"))
            .await
            .unwrap();
        store
            .put(
                "backups/sch-20240103000000/p-pv-1-sch-20240103000000.pvc",
                Bytes::from_static(b"{}"),
            )
            .await
            .unwrap();

        let list = conn.snapshot_list("pv-1", "sch").await.unwrap();
        assert_eq!(
            list,
            vec!["sch-20240101000000".to_string(), "sch-20240102000000".to_string()]
        );
    }

    #[tokio::test]
    async fn exit_flag_reset_and_request() {
        let conn = test_conn();
        assert!(!conn.exit_requested());
        conn.request_exit();
        assert!(conn.exit_requested());
        conn.reset();
        assert!(!conn.exit_requested());
    }

    #[tokio::test]
    async fn upload_then_download_roundtrip() {
        let conn = test_conn();
        let key = conn.remote_file_name("pv-1", "b1");

        // Backup leg.
        conn.reset();
        let (ready_tx, ready_rx) = oneshot::channel();
        let upload = {
            let conn = conn.clone();
            let key = key.clone();
            tokio::spawn(async move { conn.upload(&key, 1 << 30, 0, ready_tx).await })
        };
        let addr = ready_rx.await.unwrap().unwrap();

        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 233) as u8).collect();
        {
            use tokio::io::AsyncWriteExt;
            let mut replica = tokio::net::TcpStream::connect(addr).await.unwrap();
            replica.write_all(&payload).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        conn.request_exit();
        let counts = upload.await.unwrap().unwrap();
        assert_eq!(counts.success, 1);

        // Restore leg.
        conn.reset();
        let (ready_tx, ready_rx) = oneshot::channel();
        let download = {
            let conn = conn.clone();
            let key = key.clone();
            tokio::spawn(async move { conn.download(&key, 0, ready_tx).await })
        };
        let addr = ready_rx.await.unwrap().unwrap();

        let mut restored = Vec::new();
        {
            use tokio::io::AsyncReadExt;
            let mut replica = tokio::net::TcpStream::connect(addr).await.unwrap();
            let mut buf = [0u8; 4096];
            loop {
                let n = replica.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                restored.extend_from_slice(&buf[..n]);
            }
        }
        conn.request_exit();
        let counts = download.await.unwrap().unwrap();
        assert_eq!(counts.success, 1);
        assert_eq!(restored, payload);
    }
}
