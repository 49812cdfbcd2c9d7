//! Browser-facing front end
//!
//! Provides:
//! - HTTP/HTTPS listener that maps `Host` to a registered tunnel and relays
//!   the request through a proxy connection of the owning client

#[cfg(feature = "http-frontend")]
mod http;

#[cfg(feature = "http-frontend")]
pub use http::HttpFrontend;

use crate::crypto::CryptoError;
use crate::tunnel::CoordinatorError;
use thiserror::Error;

/// Front end errors. They end one browser connection, nothing else.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("No tunnel for {0}")]
    TunnelNotFound(String),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("No response from tunnel client")]
    UpstreamTimeout,

    #[error("Coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}
