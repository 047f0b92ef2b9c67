//! Membership and accounting for live replica connections.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Per-connection transfer state. Transitions are monotonic: a client that
/// reached `Done` stays done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Init,
    Done,
    Failed,
}

const STATUS_INIT: u8 = 0;
const STATUS_DONE: u8 = 1;
const STATUS_FAILED: u8 = 2;

/// Shared, task-safe status cell for one client.
#[derive(Debug, Default)]
pub struct ClientState {
    status: AtomicU8,
}

impl ClientState {
    pub fn get(&self) -> ClientStatus {
        match self.status.load(Ordering::Relaxed) {
            STATUS_DONE => ClientStatus::Done,
            STATUS_FAILED => ClientStatus::Failed,
            _ => ClientStatus::Init,
        }
    }

    /// Move to `status`; a terminal `Done` is never overwritten.
    pub fn set(&self, status: ClientStatus) {
        let new = match status {
            ClientStatus::Init => STATUS_INIT,
            ClientStatus::Done => STATUS_DONE,
            ClientStatus::Failed => STATUS_FAILED,
        };
        let _ = self
            .status
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
                if cur == STATUS_DONE {
                    None
                } else {
                    Some(new)
                }
            });
    }
}

struct ClientEntry {
    peer: SocketAddr,
    state: Arc<ClientState>,
}

/// Live clients of one transfer server, with success/failure accounting.
///
/// Invariant at server exit: `success + failed == accepted`.
#[derive(Default)]
pub struct ClientRegistry {
    clients: HashMap<u64, ClientEntry>,
    next_id: u64,
    accepted: u64,
    success: u64,
    failed: u64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted connection. Returns its id and status
    /// cell.
    pub fn append(&mut self, peer: SocketAddr) -> (u64, Arc<ClientState>) {
        let id = self.next_id;
        self.next_id += 1;
        let state = Arc::new(ClientState::default());
        self.clients.insert(
            id,
            ClientEntry {
                peer,
                state: state.clone(),
            },
        );
        self.accepted += 1;
        (id, state)
    }

    /// Remove a client and fold its final status into the counters.
    /// A client that reached `Done` counts as success, anything else as
    /// failed.
    pub fn settle(&mut self, id: u64) -> Option<(SocketAddr, ClientStatus)> {
        let entry = self.clients.remove(&id)?;
        let status = entry.state.get();
        match status {
            ClientStatus::Done => self.success += 1,
            _ => self.failed += 1,
        }
        Some((entry.peer, status))
    }

    pub fn running(&self) -> usize {
        self.clients.len()
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn success(&self) -> u64 {
        self.success
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn accounting_adds_up() {
        let mut reg = ClientRegistry::new();
        let (a, state_a) = reg.append(peer());
        let (b, state_b) = reg.append(peer());
        let (c, _state_c) = reg.append(peer());
        assert_eq!(reg.running(), 3);

        state_a.set(ClientStatus::Done);
        state_b.set(ClientStatus::Failed);

        reg.settle(a);
        reg.settle(b);
        reg.settle(c); // still Init: counts as failed

        assert_eq!(reg.running(), 0);
        assert_eq!(reg.success(), 1);
        assert_eq!(reg.failed(), 2);
        assert_eq!(reg.success() + reg.failed(), reg.accepted());
    }

    #[test]
    fn settle_is_idempotent_per_client() {
        let mut reg = ClientRegistry::new();
        let (id, state) = reg.append(peer());
        state.set(ClientStatus::Done);
        assert!(reg.settle(id).is_some());
        assert!(reg.settle(id).is_none());
        assert_eq!(reg.success(), 1);
    }

    #[test]
    fn done_is_terminal() {
        let state = ClientState::default();
        state.set(ClientStatus::Done);
        state.set(ClientStatus::Failed);
        assert_eq!(state.get(), ClientStatus::Done);
    }
}
