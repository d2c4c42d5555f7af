use std::io;

use thiserror::Error;

use crate::codec::FrameError;

/// Errors surfaced to the startup layer. Per-peer failures inside the hub
/// never reach this type; they end in that peer being unregistered.
#[derive(Debug, Error)]
pub enum Error {
    #[error("could not bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("could not connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("session is closed")]
    SessionClosed,

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
