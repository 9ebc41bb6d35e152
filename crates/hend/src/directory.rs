use hen_core::Status;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};

/// One authenticated session as seen by every other session.
#[derive(Debug)]
pub struct Client {
    pub address: SocketAddr,
    pub nick: String,
    status: AtomicU8,
    tx: mpsc::Sender<String>,
    evicted: watch::Sender<bool>,
}

impl Client {
    pub fn new(address: SocketAddr, nick: String, tx: mpsc::Sender<String>) -> Self {
        let (evicted, _) = watch::channel(false);
        Self {
            address,
            nick,
            status: AtomicU8::new(Status::Online.as_u8()),
            tx,
            evicted,
        }
    }

    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Only the owning session calls this.
    pub fn set_status(&self, status: Status) {
        self.status.store(status.as_u8(), Ordering::Release);
    }

    /// Queues text for the client's writer task.
    pub async fn send(&self, text: String) -> anyhow::Result<()> {
        self.tx
            .send(text)
            .await
            .map_err(|_| anyhow::anyhow!("outbound queue for {} closed", self.nick))
    }

    /// Signals the owning session to terminate.
    pub fn evict(&self) {
        self.evicted.send_replace(true);
    }

    /// Resolves once [`Client::evict`] has been called. Cancel safe.
    pub async fn evicted(&self) {
        let mut rx = self.evicted.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_evicted(&self) -> bool {
        *self.evicted.borrow()
    }
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    client: Arc<Client>,
}

#[derive(Debug, Default)]
struct DirectoryState {
    clients: HashMap<SocketAddr, Entry>,
    next_seq: u64,
}

/// Connected, authenticated clients keyed by address.
///
/// All access goes through one mutex; [`ClientDirectory::snapshot`] copies the
/// members out so callers never hold the lock across network I/O.
#[derive(Debug, Default)]
pub struct ClientDirectory {
    state: Mutex<DirectoryState>,
}

impl ClientDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `client` under its address. Any other entry holding the same
    /// nick is removed in the same critical section and returned so the
    /// caller can notify it.
    pub async fn register(&self, client: Arc<Client>) -> Option<Arc<Client>> {
        let mut state = self.state.lock().await;
        let displaced = state
            .clients
            .iter()
            .find(|(addr, entry)| **addr != client.address && entry.client.nick == client.nick)
            .map(|(addr, _)| *addr);
        let displaced = displaced.and_then(|addr| state.clients.remove(&addr));
        let seq = state.next_seq;
        state.next_seq += 1;
        state.clients.insert(client.address, Entry { seq, client });
        displaced.map(|entry| entry.client)
    }

    /// Idempotent: returns `None` when the address is not registered.
    pub async fn unregister(&self, address: &SocketAddr) -> Option<Arc<Client>> {
        let mut state = self.state.lock().await;
        state.clients.remove(address).map(|entry| entry.client)
    }

    pub async fn find_by_nick(&self, nick: &str) -> Option<Arc<Client>> {
        let state = self.state.lock().await;
        state
            .clients
            .values()
            .find(|entry| entry.client.nick == nick)
            .map(|entry| entry.client.clone())
    }

    pub async fn contains(&self, address: &SocketAddr) -> bool {
        let state = self.state.lock().await;
        state.clients.contains_key(address)
    }

    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.clients.len()
    }

    /// Current members in registration order.
    pub async fn snapshot(&self) -> Vec<Arc<Client>> {
        let state = self.state.lock().await;
        let mut entries: Vec<&Entry> = state.clients.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries.into_iter().map(|entry| entry.client.clone()).collect()
    }
}
