use std::time::Duration;

use crate::codec::DEFAULT_MAX_FRAME_BYTES;

pub const DEFAULT_PORT: u16 = 1337;
pub const DEFAULT_HOST: &str = "0.0.0.0";

const OUTBOUND_QUEUE: usize = 256;
const CLOSE_LINGER: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_frame_bytes: usize,
    /// Frames buffered per peer before it counts as a failed write.
    pub outbound_queue: usize,
    /// How long a closed peer's queued frames may take to flush.
    pub close_linger: Duration,
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            outbound_queue: OUTBOUND_QUEUE,
            close_linger: CLOSE_LINGER,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub max_frame_bytes: usize,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults_listen_everywhere_on_1337() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr(), "0.0.0.0:1337");
        assert_eq!(config.outbound_queue, 256);
    }

    #[test]
    fn client_renders_target() {
        assert_eq!(ClientConfig::new("localhost", 9000).server_addr(), "localhost:9000");
    }
}
