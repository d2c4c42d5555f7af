use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::Peer;
use super::Hub;
use crate::codec::{read_message, FrameError, MessageCodec};
use crate::protocol::{Message, MessageKind};

/// Why a connection worker stopped reading.
#[derive(Debug)]
enum Disconnect {
    EndOfStream,
    /// The client said goodbye with a `close` frame.
    Goodbye,
    Framing(FrameError),
    /// Closed from the hub side: failed write or terminate.
    Closed,
}

impl From<FrameError> for Disconnect {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::EndOfStream => Disconnect::EndOfStream,
            other => Disconnect::Framing(other),
        }
    }
}

/// Reads frames from one peer and relays its chat lines until the peer goes away.
///
/// Holds only a weak reference to the hub; the hub outliving its workers is not
/// assumed.
pub(crate) async fn run_worker(
    hub: Weak<Hub>,
    peer: Arc<Peer>,
    reader: OwnedReadHalf,
    max_frame_bytes: usize,
) {
    let mut frames = FramedRead::new(reader, MessageCodec::new(max_frame_bytes));

    let outcome = loop {
        let next = select! {
            _ = peer.closed() => break Disconnect::Closed,
            next = read_message(&mut frames) => next,
        };
        let message = match next {
            Ok(message) => message,
            Err(err) => break Disconnect::from(err),
        };
        let Some(live) = hub.upgrade() else {
            break Disconnect::Closed;
        };
        if !relay(&live, &peer, message) {
            break Disconnect::Goodbye;
        }
    };

    drop(frames);
    peer.close();
    if let Some(live) = hub.upgrade() {
        depart(&live, &peer, outcome);
    }
}

/// Returns false once the peer has asked to leave.
fn relay(hub: &Hub, peer: &Peer, message: Message) -> bool {
    match message.kind {
        MessageKind::Chat => {
            info!(peer = %peer.addr(), "{}: {:?}", peer.name(), message.data);
            hub.broadcast(&Message::relayed(peer.name(), message.data), Some(peer.id()));
            true
        }
        MessageKind::Close => false,
        MessageKind::Join | MessageKind::Leave => {
            debug!(peer = %peer.addr(), kind = ?message.kind, "ignoring notice sent by client");
            true
        }
    }
}

fn depart(hub: &Hub, peer: &Peer, outcome: Disconnect) {
    hub.registry().unregister(peer.id());

    match &outcome {
        Disconnect::EndOfStream | Disconnect::Goodbye => {
            info!(peer = %peer.addr(), total = hub.peer_count(), "{} disconnected", peer.name())
        }
        Disconnect::Framing(err) => {
            warn!(peer = %peer.addr(), error = %err, "dropping peer after bad frame")
        }
        Disconnect::Closed => debug!(peer = %peer.addr(), "connection closed by hub"),
    }

    if hub.is_running() {
        hub.broadcast(&Message::leave(peer.name()), Some(peer.id()));
    }
}

/// Drains a peer's outbound queue onto its socket.
///
/// Once the peer is closed, frames already queued get `linger` to flush before
/// the write half is shut down. A failed write closes the peer, which stops its
/// worker and gets it unregistered.
pub(crate) async fn write_pump(
    mut outbound: mpsc::Receiver<Bytes>,
    mut writer: OwnedWriteHalf,
    closed: CancellationToken,
    linger: Duration,
    addr: SocketAddr,
) {
    loop {
        let frame = select! {
            biased;
            frame = outbound.recv() => frame,
            _ = closed.cancelled() => break,
        };
        let Some(frame) = frame else { break };

        let written = select! {
            written = writer.write_all(&frame) => written,
            _ = lingered(&closed, linger) => {
                debug!(peer = %addr, "write still pending after close, abandoning");
                return;
            }
        };
        if let Err(err) = written {
            debug!(peer = %addr, error = ?err, "write failed");
            closed.cancel();
            return;
        }
    }

    outbound.close();
    let flush = async {
        while let Some(frame) = outbound.recv().await {
            writer.write_all(&frame).await?;
        }
        writer.shutdown().await
    };
    match timeout(linger, flush).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(peer = %addr, error = ?err, "final flush failed"),
        Err(_) => debug!(peer = %addr, "final flush timed out"),
    }
}

async fn lingered(closed: &CancellationToken, linger: Duration) {
    closed.cancelled().await;
    sleep(linger).await;
}
