mod connection;
pub mod registry;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::codec::{encode_frame, relay_limit, FrameError};
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::protocol::Message;
use registry::{Peer, PeerId, Registry};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

// ─── Hub ────────────────────────────────────────────────────────────────────

/// Owns the registry and fans messages out to every registered peer.
pub struct Hub {
    registry: Registry,
    config: ServerConfig,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    terminated: AtomicBool,
}

impl Hub {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            registry: Registry::new(),
            config,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            terminated: AtomicBool::new(false),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn peer_count(&self) -> usize {
        self.registry.len()
    }

    pub fn peer_addrs(&self) -> Vec<SocketAddr> {
        self.registry.snapshot().iter().map(|peer| peer.addr()).collect()
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Sends `message` to every registered peer except `excluding`.
    ///
    /// Iterates a snapshot, so peers joining or leaving meanwhile are never
    /// observed half-way. A peer whose queue refuses the frame is unregistered
    /// and the loop carries on. Returns how many peers accepted the frame.
    pub fn broadcast(&self, message: &Message, excluding: Option<PeerId>) -> usize {
        let frame = match self.encode(message) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, kind = ?message.kind, "dropping message that cannot be framed");
                return 0;
            }
        };

        let mut delivered = 0;
        for peer in self.registry.snapshot() {
            if Some(peer.id()) == excluding {
                continue;
            }
            if self.deliver(&peer, frame.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Sends `message` to a single peer, unregistering it on failure.
    pub fn send_to(&self, peer: &Peer, message: &Message) -> bool {
        match self.encode(message) {
            Ok(frame) => self.deliver(peer, frame),
            Err(err) => {
                warn!(peer = %peer.addr(), error = %err, "dropping message that cannot be framed");
                false
            }
        }
    }

    // Inbound frames are capped at max_frame_bytes; relaying adds the sender tag.
    fn encode(&self, message: &Message) -> Result<Bytes, FrameError> {
        encode_frame(message, relay_limit(self.config.max_frame_bytes))
    }

    fn deliver(&self, peer: &Peer, frame: Bytes) -> bool {
        match peer.deliver(frame) {
            Ok(()) => true,
            Err(err) => {
                warn!(peer = %peer.addr(), error = %err, "removing unreachable peer");
                self.registry.unregister(peer.id());
                false
            }
        }
    }

    /// Stops accepting, tells every peer the hub is closing, closes them and
    /// waits for all connection tasks to finish. Later calls return immediately.
    pub async fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("hub shutting down");
        self.shutdown.cancel();

        let peers = self.registry.drain();
        if let Ok(close) = self.encode(&Message::close()) {
            for peer in &peers {
                if let Err(err) = peer.deliver(close.clone()) {
                    debug!(peer = %peer.addr(), error = %err, "could not queue close notice");
                }
            }
        }
        for peer in &peers {
            peer.close();
        }

        self.tasks.close();
        self.tasks.wait().await;
        info!(peers = peers.len(), "hub terminated");
    }

    /// Registers a freshly accepted connection and starts its tasks.
    ///
    /// A connection that arrives once terminate() has started is dropped
    /// without spawning anything.
    fn admit(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        // Holding a tracker token keeps terminate() waiting until this returns.
        let _admitting = self.tasks.token();
        if self.shutdown.is_cancelled() {
            debug!(peer = %addr, "hub is shutting down, refusing connection");
            return;
        }

        if let Err(err) = stream.set_nodelay(true) {
            debug!(peer = %addr, error = ?err, "could not set TCP_NODELAY");
        }
        let (reader, writer) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_queue);
        let peer = Arc::new(Peer::new(self.registry.allocate_id(), addr, outbound_tx));

        self.tasks.spawn(connection::write_pump(
            outbound_rx,
            writer,
            peer.close_token(),
            self.config.close_linger,
            addr,
        ));

        let roster = self.registry.snapshot();
        self.registry.register(Arc::clone(&peer));

        // terminate() may have drained the registry just before this peer landed.
        if self.shutdown.is_cancelled() {
            self.send_to(&peer, &Message::close());
            self.registry.unregister(peer.id());
            return;
        }

        info!(peer = %addr, total = roster.len() + 1, "connection from {}", addr);

        for other in &roster {
            if !self.send_to(&peer, &Message::join(other.name())) {
                break;
            }
        }
        self.broadcast(&Message::join(peer.name()), Some(peer.id()));

        self.tasks.spawn(connection::run_worker(
            Arc::downgrade(self),
            peer,
            reader,
            self.config.max_frame_bytes,
        ));
    }
}

// ─── Server ─────────────────────────────────────────────────────────────────

/// A hub bound to its listening socket.
pub struct Server {
    listener: TcpListener,
    hub: Arc<Hub>,
}

impl Server {
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;
        Ok(Self {
            listener,
            hub: Hub::new(config),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn hub(&self) -> Arc<Hub> {
        Arc::clone(&self.hub)
    }

    /// Accepts connections until the hub is terminated, then drops the listener.
    pub async fn run(self) -> Result<()> {
        let Server { listener, hub } = self;

        loop {
            tokio::select! {
                biased;
                _ = hub.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => hub.admit(stream, addr),
                    Err(err) => {
                        warn!(error = ?err, "failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        drop(listener);
        debug!("accept loop stopped");
        Ok(())
    }

    /// Runs the accept loop until `signal` resolves, then terminates the hub.
    pub async fn run_until<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let hub = self.hub();
        let accept = self.run();
        tokio::pin!(accept);

        tokio::select! {
            result = &mut accept => return result,
            _ = signal => {}
        }

        hub.terminate().await;
        accept.await
    }
}
