//! Tunnel layer - shared broker state
//!
//! Provides:
//! - Control frame assembly
//! - The tunnel registry (public URL → owning client)
//! - Proxy coordination (need-proxy queues, assignments, relay channels)

mod channel;
mod coordinator;
mod frame;
mod registry;

pub use channel::{relay_channel, BrowserEnd, ProxyEnd, RelayEvent};
pub use coordinator::{ProxyAssignment, ProxyCoordinator, ProxyRequests};
pub use frame::{encode_frame, FrameAssembler, ReadState};
pub use registry::{Tunnel, TunnelProtocol, TunnelRegistry};

use thiserror::Error;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("URL already exists: {0}")]
    UrlExists(String),
}

/// Proxy coordination errors
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Unknown client: {0}")]
    UnknownClient(String),

    #[error("Communication channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Communication channel closed")]
    ChannelClosed,

    #[error("Timed out waiting for proxy assignment")]
    AssignmentTimeout,
}

/// Value carried by a rendezvous queue: either work or the instruction to stop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal<T> {
    Data(T),
    Close,
}

impl<T> Signal<T> {
    /// Map a channel receive into a signal, treating a disconnected queue as `Close`
    pub fn from_recv(value: Option<Signal<T>>) -> Self {
        value.unwrap_or(Signal::Close)
    }
}

/// Default capacity of the per-relay byte queues
pub const RELAY_QUEUE_DEPTH: usize = 64;
