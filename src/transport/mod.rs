//! Transport layer
//!
//! The control protocol runs over any `AsyncRead + AsyncWrite` stream. This
//! module only supplies what the listeners need to produce those streams:
//! - TLS acceptor construction from PEM files
//! - Socket tuning for accepted TCP connections

#[cfg(feature = "tls")]
mod tls;

#[cfg(feature = "tls")]
pub use tls::{build_acceptor, load_certs, load_private_key};

use std::io;
use thiserror::Error;
use tokio::net::TcpStream;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(String),
}

/// Apply socket options to an accepted connection
pub fn configure_stream(stream: &TcpStream) -> Result<(), TransportError> {
    // Control frames and length prefixes are small; don't let Nagle hold them back
    stream.set_nodelay(true)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_configure_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (stream, _) = listener.accept().await.unwrap();

        configure_stream(&stream).unwrap();
        assert!(stream.nodelay().unwrap());
        drop(client.await.unwrap());
    }
}
