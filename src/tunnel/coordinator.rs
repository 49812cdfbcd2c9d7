//! Proxy connection coordination
//!
//! Asking a client for another proxy connection is decoupled from handing a
//! proxy connection a concrete browser request:
//!
//! - `request_proxy` pushes a token on the client's need-proxy queue; the
//!   control connection's waiter turns each token into a `ReqProxy` frame.
//! - `enqueue_assignment` parks a browser request on the client's assignment
//!   queue; the next proxy connection to register for that client takes it.
//! - `open_channel` / `bind_channel` pair the browser handler and the proxy
//!   connection through a relay channel keyed by communication id.

use super::channel::{relay_channel, BrowserEnd, ProxyEnd};
use super::{CoordinatorError, Signal};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

/// A browser request waiting for a proxy connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyAssignment {
    pub url: String,
    pub browser_addr: String,
    pub communication_id: String,
}

/// Receiving side of a client's need-proxy queue, owned by its waiter task
#[derive(Debug)]
pub struct ProxyRequests {
    rx: mpsc::UnboundedReceiver<Signal<()>>,
}

impl ProxyRequests {
    /// Next token. A dropped queue reads as `Close`.
    pub async fn next(&mut self) -> Signal<()> {
        Signal::from_recv(self.rx.recv().await)
    }
}

type AssignmentQueue = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<ProxyAssignment>>>;

struct ClientQueues {
    need_proxy: mpsc::UnboundedSender<Signal<()>>,
    assignments_tx: mpsc::UnboundedSender<ProxyAssignment>,
    assignments_rx: AssignmentQueue,
}

#[derive(Default)]
struct CoordinatorInner {
    clients: HashMap<String, ClientQueues>,
    /// `None` once a proxy connection has bound the channel
    channels: HashMap<String, Option<ProxyEnd>>,
}

/// Shared proxy coordinator
#[derive(Default)]
pub struct ProxyCoordinator {
    inner: Mutex<CoordinatorInner>,
}

impl ProxyCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the queues for a freshly authenticated client.
    ///
    /// Registering an id twice replaces its queues; the previous waiter sees
    /// its queue disconnect and stops.
    pub fn register_client(&self, client_id: &str) -> ProxyRequests {
        let (need_proxy, rx) = mpsc::unbounded_channel();
        let (assignments_tx, assignments_rx) = mpsc::unbounded_channel();

        let queues = ClientQueues {
            need_proxy,
            assignments_tx,
            assignments_rx: Arc::new(tokio::sync::Mutex::new(assignments_rx)),
        };
        if let Some(old) = self.lock().clients.insert(client_id.to_string(), queues) {
            let _ = old.need_proxy.send(Signal::Close);
        }

        ProxyRequests { rx }
    }

    /// Tear down a client's queues.
    ///
    /// The need-proxy waiter receives `Close`; proxy connections waiting for
    /// an assignment observe `Close`; assignments nobody picked up are
    /// discarded together with their relay channels.
    pub fn unregister_client(&self, client_id: &str) -> bool {
        let mut inner = self.lock();
        let Some(queues) = inner.clients.remove(client_id) else {
            return false;
        };

        let _ = queues.need_proxy.send(Signal::Close);
        drop(queues.need_proxy);
        drop(queues.assignments_tx);

        // A waiter holding the receiver may already have been woken with an
        // item; it discards whatever is left once it sees the client gone.
        if let Ok(mut rx) = queues.assignments_rx.try_lock() {
            rx.close();
            while let Ok(stale) = rx.try_recv() {
                debug!(
                    "Discarding assignment {} for {}",
                    stale.communication_id, client_id
                );
                inner.channels.remove(&stale.communication_id);
            }
        }
        true
    }

    pub fn has_client(&self, client_id: &str) -> bool {
        self.lock().clients.contains_key(client_id)
    }

    /// Ask the client to open one more proxy connection
    pub fn request_proxy(&self, client_id: &str) -> Result<(), CoordinatorError> {
        let inner = self.lock();
        let queues = inner
            .clients
            .get(client_id)
            .ok_or_else(|| CoordinatorError::UnknownClient(client_id.to_string()))?;

        queues
            .need_proxy
            .send(Signal::Data(()))
            .map_err(|_| CoordinatorError::UnknownClient(client_id.to_string()))
    }

    /// Park a browser request until a proxy connection for the client registers
    pub fn enqueue_assignment(
        &self,
        client_id: &str,
        assignment: ProxyAssignment,
    ) -> Result<(), CoordinatorError> {
        let inner = self.lock();
        let queues = inner
            .clients
            .get(client_id)
            .ok_or_else(|| CoordinatorError::UnknownClient(client_id.to_string()))?;

        queues
            .assignments_tx
            .send(assignment)
            .map_err(|_| CoordinatorError::UnknownClient(client_id.to_string()))
    }

    /// Wait for the next assignment for a client.
    ///
    /// Waiters are served in the order they started waiting. Returns `Close`
    /// for unknown clients and when the client is torn down mid-wait.
    pub async fn next_assignment(&self, client_id: &str) -> Signal<ProxyAssignment> {
        let queue = {
            let inner = self.lock();
            match inner.clients.get(client_id) {
                Some(queues) => Arc::clone(&queues.assignments_rx),
                None => return Signal::Close,
            }
        };

        let mut rx = queue.lock().await;
        while let Some(assignment) = rx.recv().await {
            if self.is_current_queue(client_id, &queue) {
                return Signal::Data(assignment);
            }
            debug!(
                "Discarding assignment {} for departed client {}",
                assignment.communication_id, client_id
            );
            self.remove_channel(&assignment.communication_id);
        }
        Signal::Close
    }

    fn is_current_queue(&self, client_id: &str, queue: &AssignmentQueue) -> bool {
        self.lock()
            .clients
            .get(client_id)
            .is_some_and(|queues| Arc::ptr_eq(&queues.assignments_rx, queue))
    }

    /// Register a relay channel and return the browser's end of it
    pub fn open_channel(&self, communication_id: &str) -> BrowserEnd {
        let (proxy, browser) = relay_channel(communication_id);
        self.lock()
            .channels
            .insert(communication_id.to_string(), Some(proxy));
        browser
    }

    /// Claim the proxy end of a channel. Each channel can be bound once.
    pub fn bind_channel(&self, communication_id: &str) -> Result<ProxyEnd, CoordinatorError> {
        self.lock()
            .channels
            .get_mut(communication_id)
            .and_then(Option::take)
            .ok_or_else(|| CoordinatorError::ChannelNotFound(communication_id.to_string()))
    }

    /// Forget a channel. Returns false if it was already gone.
    pub fn remove_channel(&self, communication_id: &str) -> bool {
        self.lock().channels.remove(communication_id).is_some()
    }

    pub fn has_channel(&self, communication_id: &str) -> bool {
        self.lock().channels.contains_key(communication_id)
    }

    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }

    pub fn channel_count(&self) -> usize {
        self.lock().channels.len()
    }
}
