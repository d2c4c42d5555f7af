//! Outbound side: one connection to a hub, a background receive loop, and a
//! send path shared by whoever produces chat lines.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex as StdMutex, PoisonError};

use futures::SinkExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{read_message, relay_limit, FrameError, MessageCodec};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::protocol::Message;

const INBOX_CAPACITY: usize = 128;

#[derive(Debug)]
pub enum CloseReason {
    /// The hub sent a `close` frame.
    ServerClosed,
    EndOfStream,
    Framing(FrameError),
    /// [`Session::terminate`] was called locally.
    Terminated,
}

impl CloseReason {
    /// The line shown to the user when the session ends, if any.
    pub fn notice(&self) -> Option<String> {
        match self {
            CloseReason::ServerClosed => Some("Server closed".to_owned()),
            CloseReason::Terminated => None,
            other => Some(format!("Server closed ({other})")),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ServerClosed => f.write_str("server closed"),
            CloseReason::EndOfStream => f.write_str("connection lost"),
            CloseReason::Framing(err) => write!(f, "bad frame from server: {err}"),
            CloseReason::Terminated => f.write_str("session terminated"),
        }
    }
}

#[derive(Debug)]
pub enum SessionEvent {
    /// A chat line, join or leave notice relayed by the hub.
    Message(Message),
    /// Always the last event.
    Closed(CloseReason),
}

pub type Inbox = mpsc::Receiver<SessionEvent>;

pub struct Session {
    writer: Mutex<FramedWrite<OwnedWriteHalf, MessageCodec>>,
    receiver: StdMutex<Option<JoinHandle<()>>>,
    stop: CancellationToken,
    terminated: AtomicBool,
    local_addr: SocketAddr,
    server_addr: SocketAddr,
}

impl Session {
    /// Connects to the hub and starts the receive loop.
    pub async fn connect(config: &ClientConfig) -> Result<(Self, Inbox)> {
        let target = config.server_addr();
        let stream = TcpStream::connect(&target)
            .await
            .map_err(|source| Error::Connect {
                addr: target.clone(),
                source,
            })?;
        let local_addr = stream.local_addr()?;
        let server_addr = stream.peer_addr()?;
        info!(server = %server_addr, "connected to {}", target);

        let (reader, writer) = stream.into_split();
        let (events_tx, events_rx) = mpsc::channel(INBOX_CAPACITY);
        let stop = CancellationToken::new();

        // Relayed frames carry the sender tag on top of what the hub accepted.
        let frames = FramedRead::new(
            reader,
            MessageCodec::new(relay_limit(config.max_frame_bytes)),
        );
        let receiver = tokio::spawn(receive_loop(frames, events_tx, stop.clone()));

        let session = Self {
            writer: Mutex::new(FramedWrite::new(
                writer,
                MessageCodec::new(config.max_frame_bytes),
            )),
            receiver: StdMutex::new(Some(receiver)),
            stop,
            terminated: AtomicBool::new(false),
            local_addr,
            server_addr,
        };
        Ok((session, events_rx))
    }

    /// Our address as the hub sees it, which is also our chat identity.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn is_running(&self) -> bool {
        !self.stop.is_cancelled()
    }

    /// Resolves once the session stopped, from either side.
    pub async fn closed(&self) {
        self.stop.cancelled().await
    }

    /// Sends one chat line.
    ///
    /// A line too long to frame is refused with [`FrameError::Oversized`] and
    /// the session stays up; only a transport failure stops it.
    pub async fn send(&self, text: &str) -> Result<()> {
        if !self.is_running() {
            return Err(Error::SessionClosed);
        }
        let mut writer = self.writer.lock().await;
        match writer.send(Message::chat(text)).await {
            Ok(()) => Ok(()),
            Err(err @ FrameError::Io(_)) => {
                self.stop.cancel();
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Sends every non-empty line from `input` until it ends or the session stops.
    ///
    /// Lines too long to frame are skipped with a warning.
    pub async fn pump_lines<R>(&self, input: R) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = input.lines();
        loop {
            let line = select! {
                _ = self.stop.cancelled() => return Ok(()),
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                return Ok(());
            };
            let text = line.trim_end();
            if text.is_empty() {
                continue;
            }
            match self.send(text).await {
                Err(Error::Frame(err @ FrameError::Oversized { .. })) => {
                    warn!(error = %err, "line not sent");
                }
                sent => sent?,
            }
        }
    }

    /// Stops both loops and closes the connection. Later calls do nothing.
    pub async fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop.cancel();

        {
            let mut writer = self.writer.lock().await;
            if let Err(err) = writer.send(Message::close()).await {
                debug!(error = %err, "could not send goodbye");
            }
            if let Err(err) = writer.get_mut().shutdown().await {
                debug!(error = ?err, "failed to shut down connection cleanly");
            }
        }

        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(receiver) = receiver {
            if let Err(err) = receiver.await {
                debug!(error = ?err, "receive loop ended abnormally");
            }
        }
    }
}

async fn receive_loop(
    mut frames: FramedRead<OwnedReadHalf, MessageCodec>,
    events: mpsc::Sender<SessionEvent>,
    stop: CancellationToken,
) {
    let reason = loop {
        let next = select! {
            _ = stop.cancelled() => break CloseReason::Terminated,
            next = read_message(&mut frames) => next,
        };
        let message = match next {
            Ok(message) if message.is_close() => break CloseReason::ServerClosed,
            Ok(message) => message,
            Err(FrameError::EndOfStream) => break CloseReason::EndOfStream,
            Err(err) => break CloseReason::Framing(err),
        };
        select! {
            _ = stop.cancelled() => break CloseReason::Terminated,
            sent = events.send(SessionEvent::Message(message)) => {
                if sent.is_err() {
                    debug!("inbox dropped, stopping receive loop");
                    break CloseReason::Terminated;
                }
            }
        }
    };

    debug!(%reason, "receive loop finished");
    stop.cancel();
    events.send(SessionEvent::Closed(reason)).await.ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_notice_names_the_reason_only_when_it_adds_something() {
        assert_eq!(CloseReason::ServerClosed.notice().as_deref(), Some("Server closed"));
        assert_eq!(
            CloseReason::EndOfStream.notice().as_deref(),
            Some("Server closed (connection lost)")
        );
        assert_eq!(CloseReason::Terminated.notice(), None);
    }

    #[test]
    fn close_reasons_read_well() {
        assert_eq!(CloseReason::ServerClosed.to_string(), "server closed");
        assert_eq!(
            CloseReason::Framing(FrameError::Truncated { pending: 3 }).to_string(),
            "bad frame from server: stream ended inside a frame (3 bytes pending)"
        );
    }
}
