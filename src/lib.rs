//! Single-hub chat relay over TCP.
//!
//! - [`server`] accepts peers, keeps the live registry and fans chat lines out
//!   to everyone but the sender, announcing joins and leaves.
//! - [`client`] is the participant side: connect, receive relayed lines in the
//!   background, send typed lines.
//! - [`codec`] frames [`protocol::Message`]s as newline-delimited JSON.

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;

pub use client::{CloseReason, Inbox, Session, SessionEvent};
pub use config::{ClientConfig, ServerConfig};
pub use error::{Error, Result};
pub use protocol::{Message, MessageKind};
pub use server::{Hub, Server};
