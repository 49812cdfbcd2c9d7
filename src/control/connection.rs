//! Per-connection state machine
//!
//! ```text
//! Unauthenticated ──Auth──▶ Authenticated ──Auth──▶ Authenticated (new id)
//!        │
//!        └──RegProxy──▶ ProxyWaiting ──assignment──▶ ProxyBound (raw relay)
//! ```
//!
//! Requests are handled strictly in arrival order, and every response is
//! written out before the next read.

use super::Broker;
use crate::protocol::{
    AuthRequest, ErrorCode, ProtocolError, RegProxyRequest, Request, Response, TunnelRequest,
};
use crate::tunnel::{
    CoordinatorError, FrameAssembler, ProxyEnd, ProxyRequests, RegistryError, RelayEvent,
    Signal, Tunnel, TunnelProtocol,
};
use crate::{Error, Result};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// What the connection turned out to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Control,
    Proxy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unauthenticated,
    Authenticated,
    ProxyWaiting,
    ProxyBound,
    Closed,
}

/// Outcome of handling one request
enum Dispatch {
    /// Write the response and keep reading frames
    Reply(Response),
    /// Write the response, then switch to raw byte relay
    Relay(Response),
    /// Fatal; close without a response
    Close(Error),
}

/// One connection accepted on the control listener
pub struct ControlConnection<R, W> {
    broker: Arc<Broker>,
    peer_addr: String,
    reader: R,
    writer: W,
    assembler: FrameAssembler,
    outbox: VecDeque<Bytes>,
    /// `ReqProxy` prompts pushed by the need-proxy waiter
    prompts_tx: mpsc::UnboundedSender<Response>,
    prompts_rx: mpsc::UnboundedReceiver<Response>,
    role: Role,
    state: ConnectionState,
    client_id: Option<String>,
    communication_id: Option<String>,
    channel: Option<ProxyEnd>,
    waiter: Option<JoinHandle<()>>,
    closed: bool,
}

impl<R, W> ControlConnection<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(broker: Arc<Broker>, reader: R, writer: W, peer_addr: impl Into<String>) -> Self {
        let (prompts_tx, prompts_rx) = mpsc::unbounded_channel();
        let assembler = FrameAssembler::with_max_frame_size(broker.settings.max_frame_size);

        Self {
            broker,
            peer_addr: peer_addr.into(),
            reader,
            writer,
            assembler,
            outbox: VecDeque::new(),
            prompts_tx,
            prompts_rx,
            role: Role::Control,
            state: ConnectionState::Unauthenticated,
            client_id: None,
            communication_id: None,
            channel: None,
            waiter: None,
            closed: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Serve until the peer goes away or something fatal happens, then tear
    /// down everything the connection registered.
    pub async fn run(mut self) -> Result<()> {
        let result = self.serve().await;
        if let Err(Error::Protocol(e)) = &result {
            warn!(
                "Protocol violation from {} ({}): {}",
                self.peer_addr,
                e.code(),
                e
            );
        }
        self.teardown().await;
        result
    }

    async fn serve(&mut self) -> Result<()> {
        let mut buf = vec![0u8; self.broker.settings.read_buffer_size];
        let idle_timeout = self.broker.settings.idle_timeout;

        loop {
            tokio::select! {
                read = tokio::time::timeout(idle_timeout, self.reader.read(&mut buf)) => {
                    let n = read.map_err(|_| Error::Timeout)??;
                    if n == 0 {
                        debug!("{} closed the connection", self.peer_addr);
                        return Ok(());
                    }
                    self.assembler.extend(&buf[..n]);
                    if self.process_frames().await? {
                        return self.relay(&mut buf).await;
                    }
                }
                Some(prompt) = self.prompts_rx.recv() => {
                    self.queue(&prompt)?;
                    self.flush().await?;
                }
            }
        }
    }

    /// Handle every complete frame buffered so far. Returns true once the
    /// connection has become a proxy relay.
    async fn process_frames(&mut self) -> Result<bool> {
        while let Some(payload) = self.assembler.next_frame()? {
            let request = Request::decode(&payload)?;
            debug!("{} <- {}", self.peer_addr, request.kind());

            match self.dispatch(request).await {
                Dispatch::Reply(response) => {
                    self.queue(&response)?;
                    self.flush().await?;
                }
                Dispatch::Relay(response) => {
                    self.queue(&response)?;
                    self.flush().await?;
                    return Ok(true);
                }
                Dispatch::Close(reason) => return Err(reason),
            }
        }
        Ok(false)
    }

    async fn dispatch(&mut self, request: Request) -> Dispatch {
        match request {
            Request::Auth(auth) => self.handle_auth(auth).await,
            Request::ReqTunnel(req) => self.handle_req_tunnel(req).await,
            Request::RegProxy(req) => self.handle_reg_proxy(req).await,
            Request::Ping => self.handle_ping(),
        }
    }

    async fn handle_auth(&mut self, auth: AuthRequest) -> Dispatch {
        let client_id = match self.broker.policy.authenticate(&auth).await {
            Ok(client_id) => client_id,
            Err(e) => {
                warn!(
                    "Authentication failed for user {:?} from {}: {}",
                    auth.user, self.peer_addr, e
                );
                return Dispatch::Reply(Response::auth_error(e.to_string()));
            }
        };

        if let Some(previous) = self.client_id.take() {
            debug!("{} re-authenticated, releasing {}", self.peer_addr, previous);
            self.release_client(&previous).await;
        }

        self.broker.registry.register_client(&client_id);
        let requests = self.broker.coordinator.register_client(&client_id);
        self.waiter = Some(spawn_proxy_waiter(
            client_id.clone(),
            requests,
            self.prompts_tx.clone(),
        ));
        self.client_id = Some(client_id.clone());
        self.state = ConnectionState::Authenticated;

        info!(
            "Client {} authenticated from {} ({}/{})",
            client_id, self.peer_addr, auth.os, auth.arch
        );
        Dispatch::Reply(Response::auth_ok(client_id))
    }

    async fn handle_req_tunnel(&mut self, req: TunnelRequest) -> Dispatch {
        let Some(client_id) = self.client_id.clone() else {
            return Dispatch::Close(ProtocolError::Unauthenticated("ReqTunnel").into());
        };

        let Some(protocol) = TunnelProtocol::parse(&req.protocol) else {
            debug!(
                "Client {} asked for unsupported protocol {:?}",
                client_id, req.protocol
            );
            return Dispatch::Reply(Response::tunnel_error(
                &req.req_id,
                ErrorCode::UnsupportedProtocol.message(),
            ));
        };

        let url = match self.broker.policy.allocate_http_tunnel(&req, protocol).await {
            Ok(url) => url,
            Err(e) => {
                warn!("Tunnel request from client {} rejected: {}", client_id, e);
                return Dispatch::Reply(Response::tunnel_error(&req.req_id, e.to_string()));
            }
        };

        let tunnel = Tunnel {
            url: url.clone(),
            protocol,
            client_id: client_id.clone(),
            http_auth: Some(req.http_auth.clone()).filter(|auth| !auth.is_empty()),
        };
        match self.broker.registry.add_tunnel(tunnel) {
            Ok(()) => {
                info!("Tunnel {} registered for client {}", url, client_id);
                Dispatch::Reply(Response::new_tunnel(&req.req_id, &url, protocol.as_str()))
            }
            Err(RegistryError::UrlExists(url)) => {
                warn!("Client {} asked for taken URL {}", client_id, url);
                Dispatch::Reply(Response::tunnel_error(
                    &req.req_id,
                    ErrorCode::UrlExists.message(),
                ))
            }
        }
    }

    async fn handle_reg_proxy(&mut self, req: RegProxyRequest) -> Dispatch {
        if self.client_id.is_some() {
            return Dispatch::Close(ProtocolError::AlreadyAuthenticated.into());
        }

        let client_id = req.client_id;
        if client_id.is_empty() {
            return Dispatch::Close(ProtocolError::MissingClientId.into());
        }
        if let Err(e) = self.broker.policy.validate_proxy_client(&client_id).await {
            debug!("Proxy registration from {} refused: {}", self.peer_addr, e);
            return Dispatch::Close(ProtocolError::UnknownClient(client_id).into());
        }
        if !self.broker.registry.is_live(&client_id) {
            return Dispatch::Close(ProtocolError::UnknownClient(client_id).into());
        }

        self.role = Role::Proxy;
        self.state = ConnectionState::ProxyWaiting;
        self.client_id = Some(client_id.clone());
        debug!(
            "Proxy connection {} waiting for work from client {}",
            self.peer_addr, client_id
        );

        let broker = Arc::clone(&self.broker);
        let wait = tokio::time::timeout(
            broker.settings.assignment_timeout,
            broker.coordinator.next_assignment(&client_id),
        );
        tokio::pin!(wait);
        let mut buf = vec![0u8; broker.settings.read_buffer_size];

        // Keep reading while parked so a proxy that hangs up leaves the
        // queue instead of taking the next assignment with it.
        let assignment = loop {
            tokio::select! {
                waited = &mut wait => match waited {
                    Ok(Signal::Data(assignment)) => break assignment,
                    Ok(Signal::Close) => return Dispatch::Close(Error::ConnectionClosed),
                    Err(_) => return Dispatch::Close(CoordinatorError::AssignmentTimeout.into()),
                },
                read = self.reader.read(&mut buf) => match read {
                    Ok(0) => {
                        debug!("Waiting proxy connection {} closed by client", self.peer_addr);
                        return Dispatch::Close(Error::ConnectionClosed);
                    }
                    Ok(n) => {
                        trace!("{} sent {} bytes before its assignment", self.peer_addr, n);
                        self.assembler.extend(&buf[..n]);
                    }
                    Err(e) => return Dispatch::Close(e.into()),
                },
            }
        };

        self.communication_id = Some(assignment.communication_id.clone());
        let channel = match broker.coordinator.bind_channel(&assignment.communication_id) {
            Ok(channel) => channel,
            Err(e) => return Dispatch::Close(e.into()),
        };
        self.channel = Some(channel);
        self.state = ConnectionState::ProxyBound;

        info!(
            "Proxy connection {} serving {} for {}",
            self.peer_addr, assignment.url, assignment.browser_addr
        );
        Dispatch::Relay(Response::start_proxy(
            &assignment.url,
            &assignment.browser_addr,
        ))
    }

    fn handle_ping(&self) -> Dispatch {
        if self.client_id.is_none() {
            return Dispatch::Close(ProtocolError::Unauthenticated("Ping").into());
        }
        Dispatch::Reply(Response::pong())
    }

    /// Pump raw bytes between the socket and the bound relay channel
    async fn relay(&mut self, buf: &mut [u8]) -> Result<()> {
        let leftover = self.assembler.take_remaining();
        let Some(channel) = self.channel.as_mut() else {
            return Err(CoordinatorError::ChannelClosed.into());
        };

        if !leftover.is_empty() {
            trace!("{} -> browser: {} buffered bytes", self.peer_addr, leftover.len());
            if channel.send_response(leftover).await.is_err() {
                return Ok(());
            }
        }

        loop {
            tokio::select! {
                read = self.reader.read(&mut *buf) => {
                    let n = read?;
                    if n == 0 {
                        debug!("Proxy connection {} closed by client", self.peer_addr);
                        return Ok(());
                    }
                    trace!("{} -> browser: {} bytes", self.peer_addr, n);
                    if channel.send_response(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                        debug!("Browser for {} went away", channel.communication_id());
                        return Ok(());
                    }
                }
                event = channel.next_event() => match event {
                    RelayEvent::Data(data) => {
                        trace!("browser -> {}: {} bytes", self.peer_addr, data.len());
                        self.writer.write_all(&data).await?;
                        self.writer.flush().await?;
                    }
                    RelayEvent::Closed => {
                        debug!("Browser side of {} closed", channel.communication_id());
                        return Ok(());
                    }
                },
            }
        }
    }

    fn queue(&mut self, response: &Response) -> Result<()> {
        debug!("{} -> {}", self.peer_addr, response.kind());
        self.outbox.push_back(response.encode()?);
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        while let Some(frame) = self.outbox.pop_front() {
            self.writer.write_all(&frame).await?;
        }
        self.writer.flush().await?;
        Ok(())
    }

    /// Release a client identity and wait for its waiter to stop
    async fn release_client(&mut self, client_id: &str) {
        self.release_client_state(client_id);
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.await;
        }
        // Prompts queued for the old identity are stale
        while self.prompts_rx.try_recv().is_ok() {}
    }

    async fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        match self.role {
            Role::Control => {
                if let Some(client_id) = self.client_id.take() {
                    self.release_client(&client_id).await;
                }
            }
            Role::Proxy => self.release_channel(),
        }
        self.state = ConnectionState::Closed;
        self.outbox.clear();

        if let Err(e) = self.writer.shutdown().await {
            trace!("Shutdown of {} failed: {}", self.peer_addr, e);
        }
    }
}

impl<R, W> ControlConnection<R, W> {
    fn release_client_state(&self, client_id: &str) {
        self.broker.coordinator.unregister_client(client_id);
        let urls = self.broker.registry.remove_client_tunnels(client_id);
        self.broker.registry.unregister_client(client_id);

        for url in &urls {
            debug!("Tunnel {} closed", url);
        }
        info!(
            "Client {} released ({} tunnel(s) removed)",
            client_id,
            urls.len()
        );
    }

    fn release_channel(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
        if let Some(communication_id) = self.communication_id.take() {
            self.broker.coordinator.remove_channel(&communication_id);
            debug!("Relay {} released", communication_id);
        }
    }
}

// A connection future dropped mid-flight (shutdown, aborted task) still
// releases its shared state; only the socket shutdown is skipped.
impl<R, W> Drop for ControlConnection<R, W> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        match self.role {
            Role::Control => {
                if let Some(client_id) = self.client_id.take() {
                    self.release_client_state(&client_id);
                }
            }
            Role::Proxy => self.release_channel(),
        }
    }
}

/// Turn need-proxy tokens into `ReqProxy` prompts until the queue closes
fn spawn_proxy_waiter(
    client_id: String,
    mut requests: ProxyRequests,
    prompts: mpsc::UnboundedSender<Response>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Signal::Data(()) = requests.next().await {
            debug!("Requesting proxy connection from client {}", client_id);
            if prompts.send(Response::req_proxy()).is_err() {
                break;
            }
        }
        debug!("Proxy request waiter for client {} stopped", client_id);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServerConfig, UserConfig};
    use crate::control::BrokerSettings;
    use crate::policy::ConfigPolicy;
    use crate::tunnel::{encode_frame, ProxyAssignment};
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    fn server_config() -> ServerConfig {
        ServerConfig {
            domain: "example.com".to_string(),
            users: vec![UserConfig {
                user: "u".to_string(),
                password: "p".to_string(),
            }],
            assignment_timeout_secs: 5,
            ..Default::default()
        }
    }

    fn test_broker() -> Arc<Broker> {
        Arc::new(Broker::from_config(&server_config()))
    }

    fn broker_with(adjust: impl FnOnce(&mut BrokerSettings)) -> Arc<Broker> {
        let config = server_config();
        let mut settings = BrokerSettings::from(&config);
        adjust(&mut settings);
        Arc::new(Broker::new(Arc::new(ConfigPolicy::new(&config)), settings))
    }

    fn connect(broker: &Arc<Broker>) -> (DuplexStream, JoinHandle<Result<()>>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(server);
        let conn = ControlConnection::new(Arc::clone(broker), reader, writer, "test-peer");
        (client, tokio::spawn(conn.run()))
    }

    async fn send(stream: &mut DuplexStream, message: serde_json::Value) {
        let payload = serde_json::to_vec(&message).unwrap();
        stream.write_all(&encode_frame(&payload)).await.unwrap();
    }

    async fn recv(stream: &mut DuplexStream) -> Response {
        let mut len = [0u8; 8];
        tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut len))
            .await
            .expect("response should arrive")
            .unwrap();
        let mut body = vec![0u8; i64::from_le_bytes(len) as usize];
        stream.read_exact(&mut body).await.unwrap();
        Response::decode(&body).unwrap()
    }

    async fn assert_closed(stream: &mut DuplexStream) {
        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut rest))
            .await
            .expect("connection should close")
            .unwrap();
        assert!(rest.is_empty(), "expected no response, got {:?}", rest);
    }

    async fn authenticate(stream: &mut DuplexStream) -> String {
        send(
            stream,
            json!({"Type": "Auth", "Payload": {"User": "u", "Password": "p", "Version": "2", "MmVersion": "1.7"}}),
        )
        .await;
        match recv(stream).await {
            Response::AuthResp(resp) => {
                assert_eq!(resp.error, "");
                assert!(!resp.client_id.is_empty());
                resp.client_id
            }
            other => panic!("expected AuthResp, got {:?}", other),
        }
    }

    async fn request_tunnel(stream: &mut DuplexStream, hostname: &str) -> Response {
        send(
            stream,
            json!({"Type": "ReqTunnel", "Payload": {"ReqId": "r1", "Protocol": "http", "Hostname": hostname}}),
        )
        .await;
        recv(stream).await
    }

    #[tokio::test]
    async fn test_auth_tunnel_and_ping() {
        let broker = test_broker();
        let (mut client, _task) = connect(&broker);

        let client_id = authenticate(&mut client).await;
        assert!(broker.registry.is_live(&client_id));

        assert_eq!(
            request_tunnel(&mut client, "a.example.com").await,
            Response::new_tunnel("r1", "http://a.example.com", "http")
        );
        assert_eq!(
            broker.registry.lookup_tunnel("http://a.example.com"),
            Some(client_id)
        );

        send(&mut client, json!({"Type": "Ping", "Payload": {}})).await;
        assert_eq!(recv(&mut client).await, Response::pong());
        assert_eq!(broker.registry.tunnel_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_auth_keeps_connection_open() {
        let broker = test_broker();
        let (mut client, _task) = connect(&broker);

        send(
            &mut client,
            json!({"Type": "Auth", "Payload": {"User": "u", "Password": "wrong"}}),
        )
        .await;
        match recv(&mut client).await {
            Response::AuthResp(resp) => {
                assert!(!resp.error.is_empty());
                assert_eq!(resp.client_id, "");
            }
            other => panic!("expected AuthResp, got {:?}", other),
        }
        assert_eq!(broker.registry.client_count(), 0);

        authenticate(&mut client).await;
        assert_eq!(broker.registry.client_count(), 1);
    }

    #[tokio::test]
    async fn test_req_tunnel_before_auth_closes() {
        let broker = test_broker();
        let (mut client, task) = connect(&broker);

        send(
            &mut client,
            json!({"Type": "ReqTunnel", "Payload": {"ReqId": "r1", "Protocol": "http"}}),
        )
        .await;
        assert_closed(&mut client).await;
        assert!(matches!(
            task.await.unwrap(),
            Err(Error::Protocol(ProtocolError::Unauthenticated(_)))
        ));
        assert_eq!(broker.registry.tunnel_count(), 0);
    }

    #[tokio::test]
    async fn test_ping_before_auth_closes() {
        let broker = test_broker();
        let (mut client, task) = connect(&broker);

        send(&mut client, json!({"Type": "Ping"})).await;
        assert_closed(&mut client).await;
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_unknown_request_closes() {
        let broker = test_broker();
        let (mut client, task) = connect(&broker);

        send(&mut client, json!({"Type": "Bogus", "Payload": {}})).await;
        assert_closed(&mut client).await;
        match task.await.unwrap() {
            Err(Error::Protocol(e @ ProtocolError::UnknownRequest(_))) => {
                assert_eq!(e.code(), ErrorCode::UnknownRequest);
            }
            other => panic!("expected unknown request, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unsupported_protocol_is_recoverable() {
        let broker = test_broker();
        let (mut client, _task) = connect(&broker);
        authenticate(&mut client).await;

        for protocol in ["tcp", "gopher"] {
            send(
                &mut client,
                json!({"Type": "ReqTunnel", "Payload": {"ReqId": "r2", "Protocol": protocol, "RemotePort": 9000}}),
            )
            .await;
            assert_eq!(
                recv(&mut client).await,
                Response::tunnel_error("r2", "unsupported protocol")
            );
        }

        send(&mut client, json!({"Type": "Ping"})).await;
        assert_eq!(recv(&mut client).await, Response::pong());
    }

    #[tokio::test]
    async fn test_duplicate_url_rejected() {
        let broker = test_broker();
        let (mut first, _first_task) = connect(&broker);
        let (mut second, _second_task) = connect(&broker);
        let owner = authenticate(&mut first).await;
        authenticate(&mut second).await;

        request_tunnel(&mut first, "a.example.com").await;
        assert_eq!(
            request_tunnel(&mut second, "a.example.com").await,
            Response::tunnel_error("r1", "URL already exists")
        );
        assert_eq!(
            broker.registry.lookup_tunnel("http://a.example.com"),
            Some(owner)
        );
        assert_eq!(broker.registry.tunnel_count(), 1);
    }

    #[tokio::test]
    async fn test_reauth_releases_previous_identity() {
        let broker = test_broker();
        let (mut client, _task) = connect(&broker);

        let first = authenticate(&mut client).await;
        request_tunnel(&mut client, "a.example.com").await;

        let second = authenticate(&mut client).await;
        assert_ne!(first, second);
        assert!(!broker.registry.is_live(&first));
        assert!(!broker.coordinator.has_client(&first));
        assert!(broker.registry.is_live(&second));
        assert_eq!(broker.registry.lookup_tunnel("http://a.example.com"), None);
    }

    #[tokio::test]
    async fn test_need_proxy_token_sends_req_proxy() {
        let broker = test_broker();
        let (mut client, _task) = connect(&broker);
        let client_id = authenticate(&mut client).await;

        broker.coordinator.request_proxy(&client_id).unwrap();
        assert_eq!(recv(&mut client).await, Response::req_proxy());
    }

    #[tokio::test]
    async fn test_teardown_releases_client() {
        let broker = test_broker();
        let (mut client, task) = connect(&broker);
        let client_id = authenticate(&mut client).await;
        request_tunnel(&mut client, "a.example.com").await;

        drop(client);
        assert!(task.await.unwrap().is_ok());

        assert!(!broker.registry.is_live(&client_id));
        assert!(!broker.coordinator.has_client(&client_id));
        assert_eq!(broker.registry.lookup_tunnel("http://a.example.com"), None);
        assert_eq!(broker.registry.tunnel_count(), 0);
    }

    #[tokio::test]
    async fn test_reg_proxy_rejections_close() {
        let broker = test_broker();

        let (mut client, task) = connect(&broker);
        send(&mut client, json!({"Type": "RegProxy", "Payload": {"ClientId": "deadbeef"}})).await;
        assert_closed(&mut client).await;
        assert!(matches!(
            task.await.unwrap(),
            Err(Error::Protocol(ProtocolError::UnknownClient(_)))
        ));

        let (mut client, task) = connect(&broker);
        send(&mut client, json!({"Type": "RegProxy", "Payload": {"ClientId": ""}})).await;
        assert_closed(&mut client).await;
        assert!(matches!(
            task.await.unwrap(),
            Err(Error::Protocol(ProtocolError::MissingClientId))
        ));

        let (mut control, task) = connect(&broker);
        let client_id = authenticate(&mut control).await;
        send(&mut control, json!({"Type": "RegProxy", "Payload": {"ClientId": client_id}})).await;
        assert_closed(&mut control).await;
        assert!(matches!(
            task.await.unwrap(),
            Err(Error::Protocol(ProtocolError::AlreadyAuthenticated))
        ));
        assert!(!broker.registry.is_live(&client_id));
    }

    #[tokio::test]
    async fn test_proxy_waits_then_relays() {
        let broker = test_broker();
        let (mut control, _control_task) = connect(&broker);
        let client_id = authenticate(&mut control).await;

        let (mut proxy, proxy_task) = connect(&broker);
        send(&mut proxy, json!({"Type": "RegProxy", "Payload": {"ClientId": client_id}})).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut browser = broker.coordinator.open_channel("comm-1");
        broker
            .coordinator
            .enqueue_assignment(
                &client_id,
                ProxyAssignment {
                    url: "http://a.example.com".to_string(),
                    browser_addr: "10.0.0.1:5555".to_string(),
                    communication_id: "comm-1".to_string(),
                },
            )
            .unwrap();

        assert_eq!(
            recv(&mut proxy).await,
            Response::start_proxy("http://a.example.com", "10.0.0.1:5555")
        );

        browser
            .send_request(Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n"))
            .await
            .unwrap();
        let mut request = [0u8; 18];
        proxy.read_exact(&mut request).await.unwrap();
        assert_eq!(&request, b"GET / HTTP/1.1\r\n\r\n");

        proxy.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
        assert_eq!(
            browser.next_event().await,
            RelayEvent::Data(Bytes::from_static(b"HTTP/1.1 200 OK\r\n\r\n"))
        );

        browser.close();
        assert_closed(&mut proxy).await;
        assert!(proxy_task.await.unwrap().is_ok());
        assert!(!broker.coordinator.has_channel("comm-1"));
    }

    #[tokio::test]
    async fn test_proxy_closed_when_client_torn_down() {
        let broker = test_broker();
        let (mut control, control_task) = connect(&broker);
        let client_id = authenticate(&mut control).await;

        let (mut proxy, proxy_task) = connect(&broker);
        send(&mut proxy, json!({"Type": "RegProxy", "Payload": {"ClientId": client_id}})).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        drop(control);
        control_task.await.unwrap().unwrap();

        assert_closed(&mut proxy).await;
        assert!(matches!(
            proxy_task.await.unwrap(),
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_assignment_timeout_closes_proxy() {
        let broker = broker_with(|settings| {
            settings.assignment_timeout = Duration::from_millis(50);
        });
        let (mut control, _control_task) = connect(&broker);
        let client_id = authenticate(&mut control).await;

        let (mut proxy, proxy_task) = connect(&broker);
        send(&mut proxy, json!({"Type": "RegProxy", "Payload": {"ClientId": client_id}})).await;

        assert_closed(&mut proxy).await;
        assert!(matches!(
            proxy_task.await.unwrap(),
            Err(Error::Coordinator(CoordinatorError::AssignmentTimeout))
        ));
        assert!(broker.registry.is_live(&client_id));
    }

    #[tokio::test]
    async fn test_disconnected_waiting_proxy_leaves_queue() {
        let broker = test_broker();
        let (mut control, _control_task) = connect(&broker);
        let client_id = authenticate(&mut control).await;

        let (mut gone, gone_task) = connect(&broker);
        send(&mut gone, json!({"Type": "RegProxy", "Payload": {"ClientId": client_id}})).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (mut live, _live_task) = connect(&broker);
        send(&mut live, json!({"Type": "RegProxy", "Payload": {"ClientId": client_id}})).await;
        live.write_all(b"early").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        drop(gone);
        let finished = tokio::time::timeout(Duration::from_secs(1), gone_task)
            .await
            .expect("waiting proxy should notice the disconnect")
            .unwrap();
        assert!(matches!(finished, Err(Error::ConnectionClosed)));

        let mut browser = broker.coordinator.open_channel("comm-1");
        broker
            .coordinator
            .enqueue_assignment(
                &client_id,
                ProxyAssignment {
                    url: "http://a.example.com".to_string(),
                    browser_addr: "10.0.0.1:5555".to_string(),
                    communication_id: "comm-1".to_string(),
                },
            )
            .unwrap();

        assert_eq!(
            recv(&mut live).await,
            Response::start_proxy("http://a.example.com", "10.0.0.1:5555")
        );
        assert_eq!(
            browser.next_event().await,
            RelayEvent::Data(Bytes::from_static(b"early"))
        );
        assert!(broker.coordinator.has_channel("comm-1"));
    }

    #[tokio::test]
    async fn test_idle_control_connection_times_out() {
        let broker = broker_with(|settings| {
            settings.idle_timeout = Duration::from_millis(50);
        });
        let (mut control, task) = connect(&broker);
        let client_id = authenticate(&mut control).await;
        request_tunnel(&mut control, "a.example.com").await;
        assert_eq!(broker.registry.tunnel_count(), 1);

        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("idle connection should be torn down")
            .unwrap();
        assert!(matches!(result, Err(Error::Timeout)));

        assert_closed(&mut control).await;
        assert!(!broker.registry.is_live(&client_id));
        assert!(!broker.coordinator.has_client(&client_id));
        assert_eq!(broker.registry.lookup_tunnel("http://a.example.com"), None);
        assert_eq!(broker.registry.tunnel_count(), 0);
    }
}
