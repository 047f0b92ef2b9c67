//! The per-operation transfer server.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use blob_store::{BlobReader, BlobWriter, CloudStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::registry::{ClientRegistry, ClientState, ClientStatus};
use crate::{MAX_CLIENTS, READ_BUFFER_LEN};

/// Direction of one transfer operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerOp {
    /// Replicas push snapshot bytes; the server uploads them.
    Backup,
    /// Replicas pull snapshot bytes; the server downloads and serves them.
    Restore,
}

/// Final accounting of one server run.
///
/// `success + failed == accepted` always holds on return.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferCounts {
    pub accepted: u64,
    pub success: u64,
    pub failed: u64,
}

/// TCP server for one backup or restore operation.
pub struct TransferServer {
    op: ServerOp,
    port: u16,
    key: String,
    part_size: u64,
    store: CloudStore,
    exit: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl TransferServer {
    pub fn new(
        op: ServerOp,
        port: u16,
        key: impl Into<String>,
        part_size: u64,
        store: CloudStore,
        exit: Arc<AtomicBool>,
    ) -> Self {
        TransferServer {
            op,
            port,
            key: key.into(),
            part_size,
            store,
            exit,
            poll_interval: Duration::from_secs(5),
        }
    }

    /// Override the exit-flag poll interval (5 s in production).
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run the server until the exit flag is observed on an idle tick.
    ///
    /// `ready` fires exactly once: `Some(addr)` as soon as the listener is
    /// accepting, `None` if the listener could not be set up. Individual
    /// client errors are absorbed into the counters and never end the run.
    pub async fn run(self, ready: oneshot::Sender<Option<SocketAddr>>) -> Result<TransferCounts> {
        let listener = match self.bind() {
            Ok(listener) => listener,
            Err(err) => {
                let _ = ready.send(None);
                return Err(err);
            }
        };

        let local_addr = listener.local_addr().context("no local address")?;
        info!(op = ?self.op, %local_addr, key = %self.key, "transfer server listening");
        let _ = ready.send(Some(local_addr));

        let shutdown = CancellationToken::new();
        let mut registry = ClientRegistry::new();
        let mut pipes: JoinSet<u64> = JoinSet::new();
        let mut tick = tokio::time::interval(self.poll_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            self.accept_client(stream, peer, &mut registry, &mut pipes, &shutdown)
                                .await;
                        }
                        Err(err) => warn!(error = %err, "failed to accept connection"),
                    }
                }
                Some(finished) = pipes.join_next(), if !pipes.is_empty() => {
                    match finished {
                        Ok(id) => settle(&mut registry, id),
                        Err(err) => error!(error = %err, "client pipe task failed"),
                    }
                }
                _ = tick.tick() => {
                    if self.exit.load(Ordering::Relaxed) {
                        break;
                    }
                }
            }
        }

        info!(running = registry.running(), "transfer done, closing the server");
        drop(listener);
        shutdown.cancel();
        while let Some(finished) = pipes.join_next().await {
            match finished {
                Ok(id) => settle(&mut registry, id),
                Err(err) => error!(error = %err, "client pipe task failed"),
            }
        }

        let counts = TransferCounts {
            accepted: registry.accepted(),
            success: registry.success(),
            failed: registry.failed(),
        };
        info!(
            accepted = counts.accepted,
            success = counts.success,
            failed = counts.failed,
            "transfer server closed"
        );
        Ok(counts)
    }

    fn bind(&self) -> Result<TcpListener> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let socket = TcpSocket::new_v4().context("failed to create listen socket")?;
        socket
            .set_reuseaddr(true)
            .context("failed to set SO_REUSEADDR")?;
        socket
            .bind(addr)
            .with_context(|| format!("failed to bind port {}", self.port))?;
        socket
            .listen(MAX_CLIENTS)
            .context("failed to listen on transfer socket")
    }

    async fn accept_client(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        registry: &mut ClientRegistry,
        pipes: &mut JoinSet<u64>,
        shutdown: &CancellationToken,
    ) {
        let (id, state) = registry.append(peer);
        info!(client = id, %peer, op = ?self.op, "accepted replica connection");

        match self.op {
            ServerOp::Backup => {
                let writer = self.store.writer(&self.key, self.part_size);
                pipes.spawn(backup_pipe(id, stream, writer, state, shutdown.clone()));
            }
            ServerOp::Restore => {
                if let Err(err) = stream.set_nodelay(true) {
                    warn!(client = id, error = %err, "failed to set TCP_NODELAY");
                }
                // Losing the blob stream at accept time is unrecoverable for
                // the whole operation, not just this client.
                let reader = match self.store.reader(&self.key).await {
                    Ok(reader) => reader,
                    Err(err) => {
                        panic!("failed to create blob stream for {}: {}", self.key, err)
                    }
                };
                pipes.spawn(restore_pipe(id, stream, reader, state, shutdown.clone()));
            }
        }
    }
}

fn settle(registry: &mut ClientRegistry, id: u64) {
    if let Some((peer, status)) = registry.settle(id) {
        info!(
            client = id,
            %peer,
            ?status,
            completed = registry.success(),
            "client operation completed"
        );
    }
}

/// Drain the replica socket into the blob writer until the peer closes.
async fn backup_pipe(
    id: u64,
    mut stream: TcpStream,
    mut writer: BlobWriter,
    state: Arc<ClientState>,
    shutdown: CancellationToken,
) -> u64 {
    let mut buf = vec![0u8; READ_BUFFER_LEN];
    loop {
        let n = tokio::select! {
            _ = shutdown.cancelled() => {
                writer.abort().await;
                return id;
            }
            read = stream.read(&mut buf) => match read {
                Ok(0) => {
                    match writer.finish().await {
                        Ok(total) => {
                            debug!(client = id, bytes = total, "upload finished");
                            state.set(ClientStatus::Done);
                        }
                        Err(err) => {
                            error!(client = id, error = %err, "failed to finalise upload");
                            state.set(ClientStatus::Failed);
                        }
                    }
                    return id;
                }
                Ok(n) => n,
                Err(err) => {
                    error!(client = id, error = %err, "socket read failed");
                    state.set(ClientStatus::Failed);
                    writer.abort().await;
                    return id;
                }
            }
        };

        if let Err(err) = writer.write(&buf[..n]).await {
            error!(client = id, error = %err, "blob write failed");
            state.set(ClientStatus::Failed);
            writer.abort().await;
            return id;
        }
    }
}

/// Serve the blob's bytes to the replica socket until end of object.
async fn restore_pipe(
    id: u64,
    mut stream: TcpStream,
    mut reader: BlobReader,
    state: Arc<ClientState>,
    shutdown: CancellationToken,
) -> u64 {
    let mut buf = vec![0u8; READ_BUFFER_LEN];
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                return id;
            }
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    let _ = stream.shutdown().await;
                    debug!(client = id, "download finished");
                    state.set(ClientStatus::Done);
                    return id;
                }
                Ok(n) => {
                    if let Err(err) = stream.write_all(&buf[..n]).await {
                        error!(client = id, error = %err, "socket write failed");
                        state.set(ClientStatus::Failed);
                        return id;
                    }
                }
                Err(err) => {
                    error!(client = id, error = %err, "blob read failed");
                    state.set(ClientStatus::Failed);
                    return id;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn exit_flag() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    async fn read_to_end(stream: &mut TcpStream) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[tokio::test]
    async fn backup_uploads_what_the_replica_sends() {
        let store = CloudStore::in_memory();
        let exit = exit_flag();
        let server = TransferServer::new(
            ServerOp::Backup,
            0,
            "backups/b1/p-pv-1-b1",
            blob_store::MIN_PART_SIZE,
            store.clone(),
            exit.clone(),
        )
        .with_poll_interval(Duration::from_millis(20));

        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(server.run(ready_tx));
        let addr = ready_rx.await.unwrap().unwrap();

        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 241) as u8).collect();
        let mut replica = TcpStream::connect(addr).await.unwrap();
        replica.write_all(&payload).await.unwrap();
        drop(replica);

        // Let the pipe settle, then signal completion the way the
        // reconciler does once the control plane reports terminal status.
        tokio::time::sleep(Duration::from_millis(100)).await;
        exit.store(true, Ordering::Relaxed);

        let counts = task.await.unwrap().unwrap();
        assert_eq!(counts.accepted, 1);
        assert_eq!(counts.success, 1);
        assert_eq!(counts.failed, 0);

        let uploaded = store.get("backups/b1/p-pv-1-b1").await.unwrap();
        assert_eq!(uploaded.as_ref(), payload.as_slice());
    }

    #[tokio::test]
    async fn zero_byte_backup_creates_empty_object() {
        let store = CloudStore::in_memory();
        let exit = exit_flag();
        let server = TransferServer::new(
            ServerOp::Backup,
            0,
            "backups/b0/p-pv-1-b0",
            blob_store::MIN_PART_SIZE,
            store.clone(),
            exit.clone(),
        )
        .with_poll_interval(Duration::from_millis(20));

        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(server.run(ready_tx));
        let addr = ready_rx.await.unwrap().unwrap();

        let replica = TcpStream::connect(addr).await.unwrap();
        drop(replica);

        tokio::time::sleep(Duration::from_millis(100)).await;
        exit.store(true, Ordering::Relaxed);

        let counts = task.await.unwrap().unwrap();
        assert_eq!(counts.success, 1);
        let uploaded = store.get("backups/b0/p-pv-1-b0").await.unwrap();
        assert!(uploaded.is_empty());
    }

    #[tokio::test]
    async fn restore_serves_the_object_to_every_replica() {
        let store = CloudStore::in_memory();
        let payload: Vec<u8> = (0..80_000u32).map(|i| (i % 199) as u8).collect();
        store
            .put("backups/b1/p-pv-1-b1", bytes::Bytes::from(payload.clone()))
            .await
            .unwrap();

        let exit = exit_flag();
        let server = TransferServer::new(
            ServerOp::Restore,
            0,
            "backups/b1/p-pv-1-b1",
            blob_store::MIN_PART_SIZE,
            store.clone(),
            exit.clone(),
        )
        .with_poll_interval(Duration::from_millis(20));

        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(server.run(ready_tx));
        let addr = ready_rx.await.unwrap().unwrap();

        let mut first = TcpStream::connect(addr).await.unwrap();
        let mut second = TcpStream::connect(addr).await.unwrap();
        let got_first = read_to_end(&mut first).await;
        let got_second = read_to_end(&mut second).await;
        assert_eq!(got_first, payload);
        assert_eq!(got_second, payload);

        exit.store(true, Ordering::Relaxed);
        let counts = task.await.unwrap().unwrap();
        assert_eq!(counts.accepted, 2);
        assert_eq!(counts.success, 2);
        assert_eq!(counts.failed, 0);
    }

    #[tokio::test]
    async fn unfinished_client_counts_as_failed_on_exit() {
        let store = CloudStore::in_memory();
        let exit = exit_flag();
        let server = TransferServer::new(
            ServerOp::Backup,
            0,
            "backups/b1/p-pv-1-b1",
            blob_store::MIN_PART_SIZE,
            store.clone(),
            exit.clone(),
        )
        .with_poll_interval(Duration::from_millis(20));

        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(server.run(ready_tx));
        let addr = ready_rx.await.unwrap().unwrap();

        // One replica finishes cleanly, the other never closes its socket.
        let mut done = TcpStream::connect(addr).await.unwrap();
        done.write_all(b"complete").await.unwrap();
        drop(done);

        let mut stuck = TcpStream::connect(addr).await.unwrap();
        stuck.write_all(b"partial").await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        exit.store(true, Ordering::Relaxed);

        let counts = task.await.unwrap().unwrap();
        assert_eq!(counts.accepted, 2);
        assert_eq!(counts.success, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.success + counts.failed, counts.accepted);
        drop(stuck);
    }

    #[tokio::test]
    async fn blob_write_failure_is_scoped_to_one_client() {
        // The first multipart upload against this store fails; whichever
        // client writes first takes the hit.
        let store = CloudStore::failing_first_multipart();
        let exit = exit_flag();
        let server = TransferServer::new(
            ServerOp::Backup,
            0,
            "backups/b1/p-pv-1-b1",
            blob_store::MIN_PART_SIZE,
            store.clone(),
            exit.clone(),
        )
        .with_poll_interval(Duration::from_millis(20));

        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(server.run(ready_tx));
        let addr = ready_rx.await.unwrap().unwrap();

        let mut failing = TcpStream::connect(addr).await.unwrap();
        let mut healthy = TcpStream::connect(addr).await.unwrap();

        // The failing client pushes 1 MiB; its writer dies on the first
        // chunk and the server closes the socket mid-send, so the send
        // itself may error.
        let _ = failing.write_all(&vec![7u8; 1024 * 1024]).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The peer keeps running on the same server and completes.
        let payload = b"healthy client bytes";
        healthy.write_all(payload).await.unwrap();
        drop(healthy);

        tokio::time::sleep(Duration::from_millis(100)).await;
        exit.store(true, Ordering::Relaxed);

        let counts = task.await.unwrap().unwrap();
        assert_eq!(counts.accepted, 2);
        assert_eq!(counts.success, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.success + counts.failed, counts.accepted);

        // The surviving client's upload made it out intact.
        let uploaded = store.get("backups/b1/p-pv-1-b1").await.unwrap();
        assert_eq!(uploaded.as_ref(), payload);
        drop(failing);
    }

    #[tokio::test]
    async fn server_exits_within_one_tick_of_the_flag() {
        let store = CloudStore::in_memory();
        let exit = exit_flag();
        let server = TransferServer::new(
            ServerOp::Backup,
            0,
            "backups/b1/p-pv-1-b1",
            blob_store::MIN_PART_SIZE,
            store,
            exit.clone(),
        )
        .with_poll_interval(Duration::from_millis(50));

        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(server.run(ready_tx));
        ready_rx.await.unwrap().unwrap();

        exit.store(true, Ordering::Relaxed);
        let started = std::time::Instant::now();
        let counts = task.await.unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(counts.accepted, 0);
    }

    #[tokio::test]
    async fn bind_failure_reports_not_ready() {
        let store = CloudStore::in_memory();
        let exit = exit_flag();

        // Hold the port so the second server cannot bind it.
        let holder = TcpListener::bind("0.0.0.0:0").await.unwrap();
        let port = holder.local_addr().unwrap().port();

        let server = TransferServer::new(
            ServerOp::Backup,
            port,
            "backups/b1/p-pv-1-b1",
            blob_store::MIN_PART_SIZE,
            store,
            exit,
        );

        let (ready_tx, ready_rx) = oneshot::channel();
        let result = server.run(ready_tx).await;
        assert!(result.is_err());
        assert!(ready_rx.await.unwrap().is_none());
    }
}
