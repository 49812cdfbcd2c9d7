//! Tunnel registry
//!
//! Process-wide map of public URLs to the clients that own them. Every
//! method takes the lock once, so each call is atomic with respect to
//! concurrent connections.

use super::RegistryError;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Protocols a tunnel can be registered for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelProtocol {
    Http,
    Https,
}

impl TunnelProtocol {
    /// Parse the `Protocol` field of a `ReqTunnel`; `None` for anything
    /// without HTTP semantics (including `tcp`)
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "http" => Some(TunnelProtocol::Http),
            "https" => Some(TunnelProtocol::Https),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TunnelProtocol::Http => "http",
            TunnelProtocol::Https => "https",
        }
    }

    /// Port that is left out of URLs for this scheme
    pub fn default_port(self) -> u16 {
        match self {
            TunnelProtocol::Http => 80,
            TunnelProtocol::Https => 443,
        }
    }
}

impl std::fmt::Display for TunnelProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One public endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunnel {
    pub url: String,
    pub protocol: TunnelProtocol,
    pub client_id: String,
    /// `user:password` required from browsers, if set
    pub http_auth: Option<String>,
}

#[derive(Default)]
struct RegistryInner {
    tunnels: HashMap<String, Tunnel>,
    by_client: HashMap<String, BTreeSet<String>>,
    live: HashSet<String>,
}

/// Shared tunnel registry
#[derive(Default)]
pub struct TunnelRegistry {
    inner: Mutex<RegistryInner>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark a client id as live. Returns false if it already was.
    pub fn register_client(&self, client_id: &str) -> bool {
        self.lock().live.insert(client_id.to_string())
    }

    /// Forget a client id. Returns false if it was not live.
    pub fn unregister_client(&self, client_id: &str) -> bool {
        self.lock().live.remove(client_id)
    }

    pub fn is_live(&self, client_id: &str) -> bool {
        self.lock().live.contains(client_id)
    }

    /// Insert a tunnel. A URL that is already taken is left untouched.
    pub fn add_tunnel(&self, tunnel: Tunnel) -> Result<(), RegistryError> {
        let mut inner = self.lock();

        if inner.tunnels.contains_key(&tunnel.url) {
            return Err(RegistryError::UrlExists(tunnel.url));
        }

        inner
            .by_client
            .entry(tunnel.client_id.clone())
            .or_default()
            .insert(tunnel.url.clone());
        inner.tunnels.insert(tunnel.url.clone(), tunnel);
        Ok(())
    }

    /// Drop every tunnel owned by a client, returning the removed URLs in order
    pub fn remove_client_tunnels(&self, client_id: &str) -> Vec<String> {
        let mut inner = self.lock();

        let urls = inner.by_client.remove(client_id).unwrap_or_default();
        for url in &urls {
            inner.tunnels.remove(url);
        }
        urls.into_iter().collect()
    }

    /// Owning client of a URL
    pub fn lookup_tunnel(&self, url: &str) -> Option<String> {
        self.lock().tunnels.get(url).map(|t| t.client_id.clone())
    }

    /// Full tunnel record for a URL
    pub fn tunnel(&self, url: &str) -> Option<Tunnel> {
        self.lock().tunnels.get(url).cloned()
    }

    /// URLs owned by a client, in order
    pub fn client_tunnels(&self, client_id: &str) -> Vec<String> {
        self.lock()
            .by_client
            .get(client_id)
            .map(|urls| urls.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn tunnel_count(&self) -> usize {
        self.lock().tunnels.len()
    }

    pub fn client_count(&self) -> usize {
        self.lock().live.len()
    }
}
