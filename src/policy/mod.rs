//! Business rules the control protocol defers to
//!
//! The connection state machine never decides who may log in or which URL a
//! tunnel gets; it asks a [`Policy`]. [`ConfigPolicy`] is the implementation
//! driven by the `[server]` section of the configuration file.

use crate::config::ServerConfig;
use crate::crypto::{random_hex, CryptoError};
use crate::protocol::{AuthRequest, TunnelRequest, PROTOCOL_VERSION};
use crate::tunnel::TunnelProtocol;
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

/// Policy rejections. These are reported to the client, never fatal.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("{0}")]
    AuthFailed(String),

    #[error("invalid hostname: {0}")]
    InvalidHostname(String),

    #[error("invalid client id: {0}")]
    InvalidClient(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// External collaborator consulted by every control connection
#[async_trait]
pub trait Policy: Send + Sync {
    /// Check credentials and issue a client id
    async fn authenticate(&self, request: &AuthRequest) -> Result<String, PolicyError>;

    /// Pick the public URL for an HTTP(S) tunnel request
    async fn allocate_http_tunnel(
        &self,
        request: &TunnelRequest,
        protocol: TunnelProtocol,
    ) -> Result<String, PolicyError>;

    /// Check that a proxy connection names a plausible client
    async fn validate_proxy_client(&self, client_id: &str) -> Result<(), PolicyError>;
}

/// Length in bytes of generated client ids (hex doubles it)
const CLIENT_ID_BYTES: usize = 16;

/// Length in bytes of generated subdomains
const SUBDOMAIN_BYTES: usize = 4;

/// Policy backed by the server configuration
#[derive(Debug, Clone)]
pub struct ConfigPolicy {
    users: HashMap<String, String>,
    domain: String,
    http_port: u16,
    https_port: u16,
}

impl ConfigPolicy {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            users: config
                .users
                .iter()
                .map(|u| (u.user.clone(), u.password.clone()))
                .collect(),
            domain: config.domain.to_lowercase(),
            http_port: config.http_port,
            https_port: config.https_port,
        }
    }

    fn port_for(&self, protocol: TunnelProtocol) -> u16 {
        match protocol {
            TunnelProtocol::Http => self.http_port,
            TunnelProtocol::Https => self.https_port,
        }
    }

    /// Build the public URL for a host
    pub fn url_for(&self, protocol: TunnelProtocol, host: &str) -> String {
        let port = self.port_for(protocol);
        if port == protocol.default_port() {
            format!("{}://{}", protocol, host)
        } else {
            format!("{}://{}:{}", protocol, host, port)
        }
    }
}

/// DNS-style names: dot-separated labels of `[a-z0-9-]`, no empty labels,
/// no label starting or ending with `-`
fn is_valid_host(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= 253
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        })
}

#[async_trait]
impl Policy for ConfigPolicy {
    async fn authenticate(&self, request: &AuthRequest) -> Result<String, PolicyError> {
        if !request.version.is_empty() && request.version != PROTOCOL_VERSION {
            return Err(PolicyError::AuthFailed(format!(
                "incompatible protocol version {}, server speaks {}",
                request.version, PROTOCOL_VERSION
            )));
        }

        if !self.users.is_empty() {
            match self.users.get(&request.user) {
                Some(password) if *password == request.password => {}
                _ => {
                    return Err(PolicyError::AuthFailed(
                        "invalid user or password".to_string(),
                    ))
                }
            }
        }

        Ok(random_hex(CLIENT_ID_BYTES)?)
    }

    async fn allocate_http_tunnel(
        &self,
        request: &TunnelRequest,
        protocol: TunnelProtocol,
    ) -> Result<String, PolicyError> {
        let host = if !request.hostname.is_empty() {
            request.hostname.to_lowercase()
        } else if !request.subdomain.is_empty() {
            format!("{}.{}", request.subdomain.to_lowercase(), self.domain)
        } else {
            format!("{}.{}", random_hex(SUBDOMAIN_BYTES)?, self.domain)
        };

        if !is_valid_host(&host) {
            return Err(PolicyError::InvalidHostname(host));
        }

        Ok(self.url_for(protocol, &host))
    }

    async fn validate_proxy_client(&self, client_id: &str) -> Result<(), PolicyError> {
        if client_id.is_empty()
            || client_id.len() > 128
            || !client_id.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(PolicyError::InvalidClient(client_id.to_string()));
        }
        Ok(())
    }
}
