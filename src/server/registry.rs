use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub type PeerId = u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("outbound queue is full")]
    Full,
    #[error("connection is closed")]
    Closed,
}

/// A registered participant: its identity plus the write side of its connection.
///
/// The socket itself is owned by the peer's write pump and worker; closing the
/// peer cancels both, which is what actually releases the transport.
#[derive(Debug)]
pub struct Peer {
    id: PeerId,
    addr: SocketAddr,
    outbound: mpsc::Sender<Bytes>,
    closed: CancellationToken,
}

impl Peer {
    pub fn new(id: PeerId, addr: SocketAddr, outbound: mpsc::Sender<Bytes>) -> Self {
        Self {
            id,
            addr,
            outbound,
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Identity shown to other participants.
    pub fn name(&self) -> String {
        self.addr.to_string()
    }

    /// Queues an encoded frame without waiting on the socket.
    pub fn deliver(&self, frame: Bytes) -> Result<(), DeliveryError> {
        if self.closed.is_cancelled() {
            return Err(DeliveryError::Closed);
        }
        self.outbound.try_send(frame).map_err(|err| match err {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub(crate) fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

/// The hub's live set of peers.
///
/// Every operation takes the lock for the duration of a map operation only;
/// callers iterate a [`snapshot`](Registry::snapshot), never the live map.
#[derive(Debug, Default)]
pub struct Registry {
    peers: Mutex<HashMap<PeerId, Arc<Peer>>>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_id(&self) -> PeerId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn register(&self, peer: Arc<Peer>) -> PeerId {
        let id = peer.id();
        let addr = peer.addr();
        let total = {
            let mut peers = self.lock();
            peers.insert(id, peer);
            peers.len()
        };
        debug!(peer = %addr, id, total, "registered peer");
        id
    }

    /// Removes and closes a peer. Only the first call for an id returns it.
    pub fn unregister(&self, id: PeerId) -> Option<Arc<Peer>> {
        let (removed, total) = {
            let mut peers = self.lock();
            let removed = peers.remove(&id);
            (removed, peers.len())
        };
        if let Some(peer) = &removed {
            peer.close();
            debug!(peer = %peer.addr(), id, total, "unregistered peer");
        }
        removed
    }

    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.lock().values().cloned().collect()
    }

    /// Empties the registry, handing every peer to the caller still open.
    pub fn drain(&self) -> Vec<Arc<Peer>> {
        self.lock().drain().map(|(_, peer)| peer).collect()
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PeerId, Arc<Peer>>> {
        // The map is consistent after every statement, so a poisoned lock is still usable.
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_peer(registry: &Registry, port: u16) -> (Arc<Peer>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(4);
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        (Arc::new(Peer::new(registry.allocate_id(), addr, tx)), rx)
    }

    #[test]
    fn unregister_is_idempotent_and_closes_once() {
        let registry = Registry::new();
        let (peer, _rx) = make_peer(&registry, 1);
        let id = registry.register(Arc::clone(&peer));

        assert!(registry.unregister(id).is_some());
        assert!(peer.is_closed());
        assert!(registry.unregister(id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshot_is_not_affected_by_later_mutation() {
        let registry = Registry::new();
        let (a, _rx_a) = make_peer(&registry, 1);
        let (b, _rx_b) = make_peer(&registry, 2);
        registry.register(Arc::clone(&a));
        registry.register(Arc::clone(&b));

        let snapshot = registry.snapshot();
        registry.unregister(a.id());
        let (c, _rx_c) = make_peer(&registry, 3);
        registry.register(c);

        assert_eq!(snapshot.len(), 2);
        assert_eq!(registry.len(), 2);
        assert!(!registry.contains(a.id()));
    }

    #[test]
    fn closed_peer_refuses_delivery() {
        let registry = Registry::new();
        let (peer, mut rx) = make_peer(&registry, 1);
        peer.deliver(Bytes::from_static(b"one\n")).unwrap();
        peer.close();

        assert_eq!(
            peer.deliver(Bytes::from_static(b"two\n")),
            Err(DeliveryError::Closed)
        );
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"one\n"));
    }

    #[test]
    fn full_queue_is_reported() {
        let registry = Registry::new();
        let (peer, _rx) = make_peer(&registry, 1);
        for _ in 0..4 {
            peer.deliver(Bytes::from_static(b"x\n")).unwrap();
        }
        assert_eq!(
            peer.deliver(Bytes::from_static(b"x\n")),
            Err(DeliveryError::Full)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_churn_settles_to_survivors() {
        let registry = Arc::new(Registry::new());
        let mut receivers = Vec::new();
        let mut tasks = Vec::new();
        for port in 0..64 {
            let (peer, rx) = make_peer(&registry, port);
            receivers.push(rx);
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move { registry.register(peer) }));
        }
        let mut ids = Vec::new();
        for task in tasks.drain(..) {
            ids.push(task.await.unwrap());
        }

        let mut churn = Vec::new();
        for id in ids.iter().copied().filter(|id| id % 2 == 0) {
            let registry = Arc::clone(&registry);
            churn.push(tokio::spawn(async move {
                registry.unregister(id);
                registry.unregister(id);
                let _ = registry.snapshot();
            }));
        }
        for task in churn {
            task.await.unwrap();
        }

        assert_eq!(registry.len(), 32);
        assert!(registry.snapshot().iter().all(|peer| peer.id() % 2 == 1));
    }
}
