//! HTTP front end for registered tunnels

use super::ProxyError;
use crate::control::Broker;
use crate::crypto::random_hex;
use crate::transport::configure_stream;
use crate::tunnel::{BrowserEnd, ProxyAssignment, RelayEvent, Tunnel, TunnelProtocol};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, error, info, trace};

/// Random bytes in a communication id (hex doubles it)
const COMMUNICATION_ID_BYTES: usize = 8;

/// Upper bound on request line plus headers
const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Bytes requested per browser read
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Listener that forwards browser requests into tunnels
pub struct HttpFrontend {
    listener: TcpListener,
    broker: Arc<Broker>,
    protocol: TunnelProtocol,
    #[cfg(feature = "tls")]
    tls: Option<tokio_rustls::TlsAcceptor>,
}

impl HttpFrontend {
    /// Bind a front end serving tunnels of the given protocol
    pub async fn bind(
        addr: &str,
        broker: Arc<Broker>,
        protocol: TunnelProtocol,
    ) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        info!("{} front end listening on {}", protocol, addr);

        Ok(Self {
            listener,
            broker,
            protocol,
            #[cfg(feature = "tls")]
            tls: None,
        })
    }

    /// Terminate TLS on accepted connections
    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, acceptor: tokio_rustls::TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept browser connections forever
    pub async fn run(&self) -> Result<(), ProxyError> {
        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Front end accept error: {}", e);
                    continue;
                }
            };
            debug!("Browser connection from {}", peer_addr);
            if let Err(e) = configure_stream(&stream) {
                debug!("Failed to configure {}: {}", peer_addr, e);
            }

            let broker = Arc::clone(&self.broker);
            let protocol = self.protocol;
            #[cfg(feature = "tls")]
            let tls = self.tls.clone();

            tokio::spawn(async move {
                let peer = peer_addr.to_string();

                #[cfg(feature = "tls")]
                let result = match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(stream) => Self::handle_connection(broker, protocol, stream, peer).await,
                        Err(e) => Err(e.into()),
                    },
                    None => Self::handle_connection(broker, protocol, stream, peer).await,
                };
                #[cfg(not(feature = "tls"))]
                let result = Self::handle_connection(broker, protocol, stream, peer).await;

                if let Err(e) = result {
                    debug!("Browser connection {} ended: {}", peer_addr, e);
                }
            });
        }
    }

    /// Serve one browser connection: resolve its tunnel, then relay bytes
    /// through a proxy connection until either side closes.
    pub async fn handle_connection<S>(
        broker: Arc<Broker>,
        protocol: TunnelProtocol,
        stream: S,
        peer_addr: String,
    ) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (read_half, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        let head = match read_head(&mut reader).await {
            Ok(Some(head)) => head,
            Ok(None) => return Ok(()),
            Err(e) => {
                respond(&mut writer, "400 Bad Request", "", "Bad request\n").await?;
                return Err(e);
            }
        };

        let Some(host) = head.header("host") else {
            respond(&mut writer, "400 Bad Request", "", "Missing Host header\n").await?;
            return Err(ProxyError::BadRequest("missing Host header".to_string()));
        };
        let url = tunnel_url(protocol, host);
        debug!("{} {} {} via {}", peer_addr, head.method, head.target, url);

        let Some(tunnel) = broker.registry.tunnel(&url) else {
            let body = format!("Tunnel {} not found\n", url);
            respond(&mut writer, "404 Not Found", "", &body).await?;
            return Err(ProxyError::TunnelNotFound(url));
        };

        if let Some(expected) = &tunnel.http_auth {
            if !basic_auth_matches(head.header("authorization"), expected) {
                respond(
                    &mut writer,
                    "401 Unauthorized",
                    "WWW-Authenticate: Basic realm=\"tunnel\"\r\n",
                    "Authorization required\n",
                )
                .await?;
                return Err(ProxyError::AuthenticationFailed);
            }
        }

        let communication_id = random_hex(COMMUNICATION_ID_BYTES)?;
        let mut channel = broker.coordinator.open_channel(&communication_id);

        let result = forward(
            &broker,
            &tunnel,
            &mut channel,
            head.raw,
            &mut reader,
            &mut writer,
            &peer_addr,
        )
        .await;

        channel.close();
        broker.coordinator.remove_channel(&communication_id);
        result
    }
}

/// Hand the request to the owning client and pump bytes both ways
async fn forward<R, W>(
    broker: &Broker,
    tunnel: &Tunnel,
    channel: &mut BrowserEnd,
    head: Bytes,
    reader: &mut R,
    writer: &mut W,
    peer_addr: &str,
) -> Result<(), ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let assignment = ProxyAssignment {
        url: tunnel.url.clone(),
        browser_addr: peer_addr.to_string(),
        communication_id: channel.communication_id().to_string(),
    };
    let queued = broker
        .coordinator
        .enqueue_assignment(&tunnel.client_id, assignment)
        .and_then(|()| broker.coordinator.request_proxy(&tunnel.client_id));
    if let Err(e) = queued {
        respond(writer, "502 Bad Gateway", "", "Tunnel unavailable\n").await?;
        return Err(e.into());
    }

    if channel.send_request(head).await.is_err() {
        return Ok(());
    }
    relay(channel, reader, writer, broker.settings.assignment_timeout).await
}

async fn relay<R, W>(
    channel: &mut BrowserEnd,
    reader: &mut R,
    writer: &mut W,
    response_timeout: Duration,
) -> Result<(), ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut reading = true;
    let mut responded = false;
    let deadline = tokio::time::sleep(response_timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            read = reader.read(&mut buf), if reading => {
                let n = read?;
                if n == 0 {
                    reading = false;
                    continue;
                }
                trace!("browser -> {}: {} bytes", channel.communication_id(), n);
                if channel.send_request(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    reading = false;
                }
            }
            event = channel.next_event() => match event {
                RelayEvent::Data(data) => {
                    responded = true;
                    trace!("{} -> browser: {} bytes", channel.communication_id(), data.len());
                    writer.write_all(&data).await?;
                    writer.flush().await?;
                }
                RelayEvent::Closed => {
                    if !responded {
                        respond(writer, "502 Bad Gateway", "", "Tunnel closed\n").await?;
                    }
                    return Ok(());
                }
            },
            _ = &mut deadline, if !responded => {
                respond(writer, "504 Gateway Timeout", "", "No response from tunnel\n").await?;
                return Err(ProxyError::UpstreamTimeout);
            }
        }
    }
}

/// Request line and headers as received
struct RequestHead {
    method: String,
    target: String,
    headers: HashMap<String, String>,
    /// Exact bytes read, forwarded to the client unchanged
    raw: Bytes,
}

impl RequestHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Read up to the blank line ending the headers. `None` if the browser
/// closed before sending anything.
async fn read_head<R>(reader: &mut BufReader<R>) -> Result<Option<RequestHead>, ProxyError>
where
    R: AsyncRead + Unpin,
{
    let mut raw = BytesMut::new();
    let mut line = String::new();

    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    raw.extend_from_slice(line.as_bytes());

    let mut parts = line.split_whitespace();
    let (Some(method), Some(target), Some(_version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(ProxyError::BadRequest("invalid request line".to_string()));
    };
    let method = method.to_string();
    let target = target.to_string();

    let mut headers = HashMap::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Err(ProxyError::BadRequest("truncated headers".to_string()));
        }
        raw.extend_from_slice(line.as_bytes());
        if raw.len() > MAX_HEAD_SIZE {
            return Err(ProxyError::BadRequest("headers too large".to_string()));
        }

        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_lowercase(), value.trim().to_string());
        }
    }

    Ok(Some(RequestHead {
        method,
        target,
        headers,
        raw: raw.freeze(),
    }))
}

/// Public URL a `Host` header addresses. The protocol's default port is
/// dropped so it matches the URLs handed out to clients.
fn tunnel_url(protocol: TunnelProtocol, host: &str) -> String {
    let host = host.trim().to_lowercase();
    let default_suffix = format!(":{}", protocol.default_port());
    let host = host.strip_suffix(&default_suffix).unwrap_or(&host);
    format!("{}://{}", protocol, host)
}

/// Check an `Authorization: Basic ...` header against `user:password`
fn basic_auth_matches(header: Option<&str>, expected: &str) -> bool {
    use base64::Engine;

    header
        .and_then(|value| value.strip_prefix("Basic "))
        .and_then(|encoded| {
            base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .ok()
        })
        .and_then(|decoded| String::from_utf8(decoded).ok())
        .is_some_and(|credentials| credentials == expected)
}

async fn respond<W>(
    writer: &mut W,
    status: &str,
    extra_headers: &str,
    body: &str,
) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n{}\r\n{}",
        status,
        body.len(),
        extra_headers,
        body
    );
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
