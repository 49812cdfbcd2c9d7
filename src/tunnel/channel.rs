//! Relay channel between one proxy connection and one browser request
//!
//! Four one-directional queues, split across two ends:
//! - request bytes, browser → proxy
//! - response bytes, proxy → browser
//! - close signal observed by the proxy end
//! - close signal observed by the browser end
//!
//! Dropping an end counts as closing it.

use super::{CoordinatorError, RELAY_QUEUE_DEPTH};
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

/// What an end of the relay observes next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// Bytes from the other side
    Data(Bytes),
    /// The other side closed or went away
    Closed,
}

/// Create both ends of a relay channel for a communication id
pub fn relay_channel(communication_id: &str) -> (ProxyEnd, BrowserEnd) {
    let (request_tx, request_rx) = mpsc::channel(RELAY_QUEUE_DEPTH);
    let (response_tx, response_rx) = mpsc::channel(RELAY_QUEUE_DEPTH);
    let (close_proxy_tx, close_proxy_rx) = oneshot::channel();
    let (close_browser_tx, close_browser_rx) = oneshot::channel();

    let proxy = ProxyEnd {
        communication_id: communication_id.to_string(),
        request_rx,
        response_tx,
        browser_closed: close_proxy_rx,
        close_browser: Some(close_browser_tx),
        finished: false,
    };
    let browser = BrowserEnd {
        communication_id: communication_id.to_string(),
        request_tx,
        response_rx,
        proxy_closed: close_browser_rx,
        close_proxy: Some(close_proxy_tx),
        finished: false,
    };
    (proxy, browser)
}

/// Half held by the proxy connection
#[derive(Debug)]
pub struct ProxyEnd {
    communication_id: String,
    request_rx: mpsc::Receiver<Bytes>,
    response_tx: mpsc::Sender<Bytes>,
    browser_closed: oneshot::Receiver<()>,
    close_browser: Option<oneshot::Sender<()>>,
    finished: bool,
}

impl ProxyEnd {
    pub fn communication_id(&self) -> &str {
        &self.communication_id
    }

    /// Next request chunk from the browser, or `Closed` once the browser is
    /// gone. Queued bytes are delivered before the close.
    pub async fn next_event(&mut self) -> RelayEvent {
        if self.finished {
            return RelayEvent::Closed;
        }

        let event = tokio::select! {
            biased;
            data = self.request_rx.recv() => match data {
                Some(data) => RelayEvent::Data(data),
                None => RelayEvent::Closed,
            },
            _ = &mut self.browser_closed => RelayEvent::Closed,
        };

        if event == RelayEvent::Closed {
            self.finished = true;
        }
        event
    }

    /// Forward response bytes to the browser
    pub async fn send_response(&self, data: Bytes) -> Result<(), CoordinatorError> {
        self.response_tx
            .send(data)
            .await
            .map_err(|_| CoordinatorError::ChannelClosed)
    }

    /// Tell the browser side the upstream is gone. Idempotent.
    pub fn close(&mut self) {
        if let Some(tx) = self.close_browser.take() {
            let _ = tx.send(());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.close_browser.is_none()
    }
}

/// Half held by the browser-facing handler
#[derive(Debug)]
pub struct BrowserEnd {
    communication_id: String,
    request_tx: mpsc::Sender<Bytes>,
    response_rx: mpsc::Receiver<Bytes>,
    proxy_closed: oneshot::Receiver<()>,
    close_proxy: Option<oneshot::Sender<()>>,
    finished: bool,
}

impl BrowserEnd {
    pub fn communication_id(&self) -> &str {
        &self.communication_id
    }

    /// Forward request bytes to the proxy connection
    pub async fn send_request(&self, data: Bytes) -> Result<(), CoordinatorError> {
        self.request_tx
            .send(data)
            .await
            .map_err(|_| CoordinatorError::ChannelClosed)
    }

    /// Next response chunk from the client, or `Closed` once the proxy
    /// connection is gone. Queued bytes are delivered before the close.
    pub async fn next_event(&mut self) -> RelayEvent {
        if self.finished {
            return RelayEvent::Closed;
        }

        let event = tokio::select! {
            biased;
            data = self.response_rx.recv() => match data {
                Some(data) => RelayEvent::Data(data),
                None => RelayEvent::Closed,
            },
            _ = &mut self.proxy_closed => RelayEvent::Closed,
        };

        if event == RelayEvent::Closed {
            self.finished = true;
        }
        event
    }

    /// Tell the proxy side the browser is gone. Idempotent.
    pub fn close(&mut self) {
        if let Some(tx) = self.close_proxy.take() {
            let _ = tx.send(());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.close_proxy.is_none()
    }
}
