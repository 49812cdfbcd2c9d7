//! Tunnel Broker Server
//!
//! Accepts control and proxy connections from tunnel clients and serves
//! browser traffic for the tunnels they register.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use tracing_subscriber::fmt::MakeWriter;
use tunnel_broker::{
    config::{generate_example_config, Config},
    transport::configure_stream,
    Broker, ControlConnection,
};

#[cfg(feature = "http-frontend")]
use tunnel_broker::{proxy::HttpFrontend, tunnel::TunnelProtocol};

#[cfg(feature = "tls")]
type Acceptor = Option<tokio_rustls::TlsAcceptor>;
#[cfg(not(feature = "tls"))]
type Acceptor = Option<std::convert::Infallible>;

/// Tunnel Broker - reverse tunnel server
#[derive(Parser, Debug)]
#[command(name = "tunnel-server")]
#[command(about = "Reverse tunnel broker: exposes clients behind NAT on public URLs")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Control listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Browser HTTP listen address (overrides config)
    #[arg(long)]
    http_listen: Option<String>,

    /// Log level (trace, debug, info, warn, error); defaults to the config value
    #[arg(short = 'v', long)]
    log_level: Option<String>,

    /// Print an example configuration and exit
    #[arg(long)]
    generate_config: bool,
}

/// Server state shared across accepted connections
struct ServerState {
    broker: Arc<Broker>,
    conn_semaphore: Semaphore,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        print!("{}", generate_example_config().to_toml()?);
        return Ok(());
    }

    let config_missing = !std::path::Path::new(&args.config).exists();
    let config = if config_missing {
        Config::default()
    } else {
        Config::load(&args.config).context("Failed to load configuration")?
    };

    init_logging(
        args.log_level.as_deref().unwrap_or(&config.logging.level),
        &config.logging.format,
    );
    if config_missing {
        warn!("Config file {} not found, using defaults", args.config);
    }

    let mut server_config = config.server;
    if let Some(listen) = args.listen {
        server_config.listen = listen;
    }
    if let Some(http_listen) = args.http_listen {
        server_config.http_listen = Some(http_listen);
    }

    if server_config.users.is_empty() {
        warn!("No users configured - any credentials will be accepted");
    } else {
        info!("Loaded {} user(s)", server_config.users.len());
    }

    let tls_acceptor = build_tls(&server_config)?;

    let broker = Arc::new(Broker::from_config(&server_config));
    let state = Arc::new(ServerState {
        broker: Arc::clone(&broker),
        conn_semaphore: Semaphore::new(server_config.max_connections),
    });

    info!("Tunnel Broker v{}", tunnel_broker::VERSION);
    info!("Tunnel domain: {}", server_config.domain);

    #[cfg(feature = "http-frontend")]
    spawn_frontends(&server_config, &broker, &tls_acceptor).await?;

    let listener = TcpListener::bind(&server_config.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", server_config.listen))?;
    info!("Control listener on {}", server_config.listen);

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        debug!("New connection from {}", peer_addr);

                        let state = Arc::clone(&state);
                        let acceptor = tls_acceptor.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer_addr, state, acceptor).await {
                                debug!("Connection {} error: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    Ok(())
}

fn init_logging(level: &str, format: &str) {
    let subscriber = log_subscriber(level, format, std::io::stdout);
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install logger: {}", e);
    }
}

fn log_subscriber<W>(
    level: &str,
    format: &str,
    writer: W,
) -> Box<dyn tracing::Subscriber + Send + Sync>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);

    match format {
        "compact" => Box::new(builder.compact().finish()),
        "json" => Box::new(builder.json().finish()),
        _ => Box::new(builder.finish()),
    }
}

#[cfg(feature = "tls")]
fn build_tls(config: &tunnel_broker::config::ServerConfig) -> Result<Acceptor> {
    match (&config.tls_cert, &config.tls_key) {
        (Some(cert_path), Some(key_path)) => {
            let acceptor = tunnel_broker::transport::build_acceptor(cert_path, key_path)
                .context("Failed to build TLS acceptor")?;
            info!("TLS enabled with cert: {}", cert_path);
            Ok(Some(acceptor))
        }
        (None, None) => {
            info!("TLS disabled (no tls_cert/tls_key configured)");
            Ok(None)
        }
        _ => Err(anyhow!("tls_cert and tls_key must be configured together")),
    }
}

#[cfg(not(feature = "tls"))]
fn build_tls(config: &tunnel_broker::config::ServerConfig) -> Result<Acceptor> {
    if config.tls_cert.is_some() || config.tls_key.is_some() || config.https_listen.is_some() {
        return Err(anyhow!("TLS configured but built without the `tls` feature"));
    }
    Ok(None)
}

#[cfg(feature = "http-frontend")]
async fn spawn_frontends(
    config: &tunnel_broker::config::ServerConfig,
    broker: &Arc<Broker>,
    tls_acceptor: &Acceptor,
) -> Result<()> {
    if let Some(addr) = &config.http_listen {
        let frontend = HttpFrontend::bind(addr, Arc::clone(broker), TunnelProtocol::Http)
            .await
            .with_context(|| format!("Failed to bind HTTP front end to {}", addr))?;
        tokio::spawn(async move {
            if let Err(e) = frontend.run().await {
                error!("HTTP front end stopped: {}", e);
            }
        });
    }

    if let Some(addr) = &config.https_listen {
        #[cfg(feature = "tls")]
        {
            let acceptor = tls_acceptor
                .clone()
                .ok_or_else(|| anyhow!("https_listen requires tls_cert and tls_key"))?;
            let frontend = HttpFrontend::bind(addr, Arc::clone(broker), TunnelProtocol::Https)
                .await
                .with_context(|| format!("Failed to bind HTTPS front end to {}", addr))?
                .with_tls(acceptor);
            tokio::spawn(async move {
                if let Err(e) = frontend.run().await {
                    error!("HTTPS front end stopped: {}", e);
                }
            });
        }
        #[cfg(not(feature = "tls"))]
        {
            let _ = tls_acceptor;
            return Err(anyhow!("https_listen {} requires the `tls` feature", addr));
        }
    }

    Ok(())
}

/// Handle a single control-listener connection
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
    tls_acceptor: Acceptor,
) -> Result<()> {
    let _permit = state
        .conn_semaphore
        .acquire()
        .await
        .context("Failed to acquire connection permit")?;

    configure_stream(&stream)?;

    #[cfg(feature = "tls")]
    if let Some(acceptor) = tls_acceptor {
        let tls_stream = acceptor.accept(stream).await.context("TLS accept failed")?;
        debug!("TLS handshake complete with {}", peer_addr);

        let (read_half, write_half) = tokio::io::split(tls_stream);
        return handle_connection_inner(read_half, write_half, peer_addr, &state).await;
    }
    #[cfg(not(feature = "tls"))]
    let _ = tls_acceptor;

    let (read_half, write_half) = stream.into_split();
    handle_connection_inner(read_half, write_half, peer_addr, &state).await
}

/// Inner connection handler, generic over transport read/write halves
async fn handle_connection_inner<R, W>(
    read_half: R,
    write_half: W,
    peer_addr: SocketAddr,
    state: &ServerState,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let connection = ControlConnection::new(
        Arc::clone(&state.broker),
        read_half,
        write_half,
        peer_addr.to_string(),
    );
    connection.run().await?;
    Ok(())
}
