//! Newline-delimited JSON framing.
//!
//! A frame is one compact JSON [`Message`] followed by `\n`. JSON string
//! escaping keeps raw newlines out of the encoded body, so the delimiter is
//! unambiguous no matter what the payload contains. The decoder buffers
//! partial reads until a full line is available, so it does not care how the
//! transport chunks the byte stream.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use futures::StreamExt;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, Encoder, FramedRead};

use crate::protocol::Message;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

/// Room the hub adds on top of an accepted frame when it relays it.
///
/// Covers `,"from":"<addr>"`: the longest socket address string (scoped IPv6
/// with a port) is under 64 bytes. JSON re-encoding never makes `data` longer
/// than the sender's own encoding of it.
pub const RELAY_HEADROOM: usize = 128;

/// Largest frame the hub may emit when clients are limited to `max_frame_bytes`.
pub fn relay_limit(max_frame_bytes: usize) -> usize {
    max_frame_bytes.saturating_add(RELAY_HEADROOM)
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    Oversized { size: usize, max: usize },
    #[error("stream ended inside a frame ({pending} bytes pending)")]
    Truncated { pending: usize },
    #[error("peer closed the stream")]
    EndOfStream,
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    /// True when the peer went away cleanly rather than misbehaving.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, FrameError::EndOfStream)
    }
}

#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_frame_bytes: usize,
    // Bytes already scanned for a delimiter, so a slow trickle is not rescanned.
    scanned: usize,
}

impl MessageCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            scanned: 0,
        }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, FrameError> {
        loop {
            let start = self.scanned.min(src.len());
            let Some(offset) = src[start..].iter().position(|b| *b == b'\n') else {
                if src.len() > self.max_frame_bytes {
                    return Err(FrameError::Oversized {
                        size: src.len(),
                        max: self.max_frame_bytes,
                    });
                }
                self.scanned = src.len();
                return Ok(None);
            };

            let newline = start + offset;
            self.scanned = 0;
            let line = src.split_to(newline + 1);
            let mut frame = &line[..newline];
            if let Some(stripped) = frame.strip_suffix(b"\r") {
                frame = stripped;
            }
            if frame.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            if frame.len() > self.max_frame_bytes {
                return Err(FrameError::Oversized {
                    size: frame.len(),
                    max: self.max_frame_bytes,
                });
            }
            return Ok(Some(serde_json::from_slice(frame)?));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>, FrameError> {
        if let Some(message) = self.decode(src)? {
            return Ok(Some(message));
        }
        if src.iter().all(u8::is_ascii_whitespace) {
            src.clear();
            self.scanned = 0;
            return Ok(None);
        }
        Err(FrameError::Truncated { pending: src.len() })
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), FrameError> {
        let body = serde_json::to_vec(&item)?;
        if body.len() > self.max_frame_bytes {
            return Err(FrameError::Oversized {
                size: body.len(),
                max: self.max_frame_bytes,
            });
        }
        dst.reserve(body.len() + 1);
        dst.extend_from_slice(&body);
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Encodes a message once so it can be cloned cheaply into many outbound queues.
pub fn encode_frame(message: &Message, max_frame_bytes: usize) -> Result<Bytes, FrameError> {
    let mut buf = BytesMut::new();
    MessageCodec::new(max_frame_bytes).encode(message.clone(), &mut buf)?;
    Ok(buf.freeze())
}

/// Reads exactly one message, suspending until a whole frame has arrived.
///
/// A closed stream surfaces as [`FrameError::EndOfStream`] so callers can treat
/// every failure uniformly as "peer gone".
pub async fn read_message<R>(frames: &mut FramedRead<R, MessageCodec>) -> Result<Message, FrameError>
where
    R: AsyncRead + Unpin,
{
    match frames.next().await {
        Some(result) => result,
        None => Err(FrameError::EndOfStream),
    }
}
