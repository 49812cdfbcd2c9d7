//! # Tunnel Broker
//!
//! Server side of an ngrok-style reverse tunnel. Clients behind NAT keep an
//! outbound control connection open, register public HTTP(S) endpoints on
//! it, and open proxy connections on demand so that browser traffic arriving
//! at the broker can be relayed back to them.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Browser Front End                    │
//! │        (Host lookup, basic auth, byte relay)         │
//! ├─────────────────────────────────────────────────────┤
//! │              Proxy Coordinator                       │
//! │  (need-proxy queues, assignments, relay channels)    │
//! ├─────────────────────────────────────────────────────┤
//! │               Tunnel Registry                        │
//! │          (url → client, client → tunnels)            │
//! ├─────────────────────────────────────────────────────┤
//! │           Connection State Machine                   │
//! │     (Auth, ReqTunnel, RegProxy, Ping dispatch)       │
//! ├─────────────────────────────────────────────────────┤
//! │        Frame Assembler / Message Codec               │
//! │        (8-byte length prefix + JSON payload)         │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod control;
pub mod crypto;
pub mod policy;
pub mod protocol;
pub mod proxy;
pub mod transport;
pub mod tunnel;

pub use config::Config;
pub use control::{Broker, ControlConnection};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum control frame payload (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Default control listener port
pub const DEFAULT_PORT: u16 = 4443;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Coordinator error: {0}")]
    Coordinator(#[from] tunnel::CoordinatorError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,
}
