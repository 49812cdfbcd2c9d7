//! Control protocol definitions and constants

mod message;

pub use message::{
    AuthRequest, AuthResponse, Empty, NewTunnel, RegProxyRequest, Request, Response, StartProxy,
    TunnelRequest,
};

use std::time::Duration;
use thiserror::Error;

/// Protocol errors. Every variant is fatal for the connection that raised it.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Frame too large: {0} > {1}")]
    FrameTooLarge(u64, usize),

    #[error("Negative frame length: {0}")]
    NegativeLength(i64),

    #[error("Malformed message: {0}")]
    MalformedJson(String),

    #[error("Unknown request type: {0}")]
    UnknownRequest(String),

    #[error("{0} before authentication")]
    Unauthenticated(&'static str),

    #[error("Proxy registration on an authenticated control connection")]
    AlreadyAuthenticated,

    #[error("Proxy registration without client id")]
    MissingClientId,

    #[error("Unknown client: {0}")]
    UnknownClient(String),
}

impl ProtocolError {
    /// Code the connection is closed with
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::UnknownRequest(_) => ErrorCode::UnknownRequest,
            _ => ErrorCode::CloseSocket,
        }
    }
}

/// Symbolic result codes surfaced to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Success,
    UnknownRequest,
    UnsupportedProtocol,
    UrlExists,
    CloseSocket,
}

impl ErrorCode {
    /// Client-visible message for this code
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::Success => "",
            ErrorCode::UnknownRequest => "unknown request",
            ErrorCode::UnsupportedProtocol => "unsupported protocol",
            ErrorCode::UrlExists => "URL already exists",
            ErrorCode::CloseSocket => "close socket",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

/// Protocol version reported in `AuthResp`
pub const PROTOCOL_VERSION: &str = "2";

/// Major/minor server version reported in `AuthResp`
pub const MM_VERSION: &str = "1.7";

/// Size of the frame length prefix
pub const LENGTH_PREFIX_SIZE: usize = 8;

/// A control connection with no traffic for this long is torn down
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_messages() {
        assert_eq!(ErrorCode::UrlExists.message(), "URL already exists");
        assert_eq!(
            ErrorCode::UnsupportedProtocol.to_string(),
            "unsupported protocol"
        );
    }

    #[test]
    fn test_violation_codes() {
        assert_eq!(
            ProtocolError::UnknownRequest("Bogus".to_string()).code(),
            ErrorCode::UnknownRequest
        );
        assert_eq!(
            ProtocolError::Unauthenticated("Ping").code(),
            ErrorCode::CloseSocket
        );
        assert_eq!(ProtocolError::NegativeLength(-1).code(), ErrorCode::CloseSocket);
        assert_eq!(ErrorCode::CloseSocket.to_string(), "close socket");
    }
}
