//! TCP Control-Channel Server
//!
//! Async TCP front end for the authentication gate. Each accepted connection
//! gets its own [`ControlDispatcher`] driven by a single task, so all
//! per-connection authentication state stays single-threaded. Frames are
//! length-prefixed on the wire; everything inside a frame belongs to the
//! dispatcher.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::auth::dispatcher::{ControlDispatcher, EngineSink};
use crate::config::AuthSettings;
use crate::network::connection::{Connection, ConnectionRole, ControlLink};
use crate::services::Services;

/// Maximum accepted wire frame size.
pub const MAX_FRAME_BYTES: u32 = 64 * 1024;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// How often each connection checks its phase deadlines.
    pub tick_interval: Duration,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7777".parse().unwrap(),
            max_connections: 1000,
            tick_interval: Duration::from_secs(1),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind or accept.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection limit reached.
    #[error("connection limit reached")]
    ConnectionLimitReached,
}

// =============================================================================
// TCP LINK
// =============================================================================

enum LinkCommand {
    Frame(Vec<u8>),
    Shutdown,
}

/// [`ControlLink`] over a TCP stream: frames go through an unbounded channel
/// to a dedicated writer task, so the dispatcher never blocks on the socket.
struct TcpLink {
    tx: mpsc::UnboundedSender<LinkCommand>,
    closed: Arc<AtomicBool>,
}

impl TcpLink {
    fn new(write_half: OwnedWriteHalf) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let writer = tokio::spawn(run_writer(write_half, rx, closed.clone()));
        (Self { tx, closed }, writer)
    }
}

impl ControlLink for TcpLink {
    fn deliver(&mut self, frame: Vec<u8>) {
        if !self.closed.load(Ordering::Acquire) {
            let _ = self.tx.send(LinkCommand::Frame(frame));
        }
    }

    fn flush(&mut self) {
        // The writer task writes eagerly; channel order is delivery order.
    }

    fn close(&mut self, reason: &str) {
        debug!(reason, "closing tcp link");
        self.closed.store(true, Ordering::Release);
        let _ = self.tx.send(LinkCommand::Shutdown);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Drain queued frames onto the socket. A shutdown command is delivered after
/// any frames queued before it, so failure notices still reach the wire.
async fn run_writer(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<LinkCommand>,
    closed: Arc<AtomicBool>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            LinkCommand::Frame(frame) => {
                let len = frame.len() as u32;
                if write_half.write_all(&len.to_le_bytes()).await.is_err()
                    || write_half.write_all(&frame).await.is_err()
                {
                    closed.store(true, Ordering::Release);
                    break;
                }
            }
            LinkCommand::Shutdown => break,
        }
    }
    let _ = write_half.shutdown().await;
}

/// Read one length-prefixed frame. `None` means the peer went away.
async fn read_frame(
    read_half: &mut tokio::net::tcp::OwnedReadHalf,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];
    match read_half.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame exceeds size limit",
        ));
    }
    let mut frame = vec![0u8; len as usize];
    read_half.read_exact(&mut frame).await?;
    Ok(Some(frame))
}

// =============================================================================
// SERVER
// =============================================================================

/// Factory producing the service collaborators for one connection.
pub type ServiceFactory = Arc<dyn Fn() -> Services + Send + Sync>;

/// Factory producing the engine sink for one connection.
pub type EngineFactory = Arc<dyn Fn() -> Box<dyn EngineSink> + Send + Sync>;

/// The authentication gate server.
pub struct AuthServer {
    config: ServerConfig,
    settings: AuthSettings,
    services: ServiceFactory,
    engine: EngineFactory,
    connections: Arc<AtomicUsize>,
    shutdown_tx: broadcast::Sender<()>,
}

impl AuthServer {
    /// Create a server. Each accepted connection gets fresh collaborators
    /// from the factories.
    pub fn new(
        config: ServerConfig,
        settings: AuthSettings,
        services: ServiceFactory,
        engine: EngineFactory,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            settings,
            services,
            engine,
            connections: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        }
    }

    /// Bind and run the accept loop until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.run_on(listener).await
    }

    /// Run the accept loop on an already-bound listener.
    pub async fn run_on(&self, listener: TcpListener) -> Result<(), ServerError> {
        info!(addr = %listener.local_addr()?, version = %self.config.version, "auth server listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.connections.load(Ordering::Acquire) >= self.config.max_connections {
                                warn!(%addr, "connection limit reached, rejecting");
                                continue;
                            }
                            info!(%addr, "new connection");
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!(error = %e, "accept failed");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Spawn the per-connection task owning this connection's dispatcher.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let settings = self.settings.clone();
        let services = (self.services)();
        let engine = (self.engine)();
        let tick_interval = self.config.tick_interval;
        let connections = self.connections.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        connections.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(async move {
            let (mut read_half, write_half) = stream.into_split();
            let (link, writer) = TcpLink::new(write_half);
            let conn = Connection::new(ConnectionRole::DedicatedServer, Box::new(link));
            let mut dispatcher = ControlDispatcher::new(conn, services, settings, engine);

            let mut ticker = interval(tick_interval);
            loop {
                tokio::select! {
                    frame = read_frame(&mut read_half) => {
                        match frame {
                            Ok(Some(frame)) => dispatcher.received_frame(&frame),
                            Ok(None) => {
                                debug!(%addr, "peer disconnected");
                                break;
                            }
                            Err(e) => {
                                warn!(%addr, error = %e, "read failed");
                                break;
                            }
                        }
                    }
                    _ = ticker.tick() => {
                        dispatcher.tick(Instant::now());
                    }
                    _ = shutdown_rx.recv() => {
                        dispatcher.connection_mut().close("server shutting down");
                        break;
                    }
                }
                if dispatcher.connection().is_closed() {
                    break;
                }
            }

            dispatcher.connection_mut().close("connection task ended");
            let _ = writer.await;
            connections.fetch_sub(1, Ordering::AcqRel);
            info!(%addr, "connection cleaned up");
        });
    }

    /// Signal every task to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Active connection count.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthMode;
    use crate::network::protocol::{self, msg_type, FailureNotice, LoginPayload};
    use crate::services::{InMemorySanctions, JwtIdentityProvider, RecordingAntiCheat};

    struct NullEngine;

    impl EngineSink for NullEngine {
        fn accept_hello(&mut self, _hello: crate::network::protocol::HelloPayload) {}
        fn accept_login(&mut self, _login: LoginPayload) {}
        fn accept_beacon_join(&mut self, _join: crate::network::protocol::BeaconJoinPayload) {}
        fn accept_stat_write(&mut self, _write: crate::network::protocol::WriteStatPayload) {}
        fn handle_control(&mut self, _msg_type: u8, _payload: &[u8]) -> bool {
            false
        }
    }

    fn test_server(settings: AuthSettings) -> AuthServer {
        AuthServer::new(
            ServerConfig::default(),
            settings,
            Arc::new(|| Services {
                identity: Box::new(JwtIdentityProvider::unconfigured()),
                sanctions: Box::new(InMemorySanctions::new()),
                anticheat: Box::new(RecordingAntiCheat::new()),
            }),
            Arc::new(|| Box::new(NullEngine)),
        )
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.tick_interval, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_server_shutdown() {
        let server = test_server(AuthSettings::default());
        server.shutdown();
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_identityless_login_refused_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = Arc::new(test_server(AuthSettings {
            mode: AuthMode::IdToken,
            ..Default::default()
        }));
        let run_server = server.clone();
        let server_task = tokio::spawn(async move { run_server.run_on(listener).await });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let frame = protocol::encode(
            msg_type::LOGIN,
            &LoginPayload {
                identity: None,
                nickname: "Sparks".into(),
                online_platform: "pc".into(),
            },
        )
        .unwrap();
        let len = frame.len() as u32;
        stream.write_all(&len.to_le_bytes()).await.unwrap();
        stream.write_all(&frame).await.unwrap();

        // The server answers with a failure notice, then closes.
        let mut len_bytes = [0u8; 4];
        stream.read_exact(&mut len_bytes).await.unwrap();
        let len = u32::from_le_bytes(len_bytes) as usize;
        let mut reply = vec![0u8; len];
        stream.read_exact(&mut reply).await.unwrap();

        let (t, body) = protocol::split_frame(&reply).unwrap();
        assert_eq!(t, msg_type::FAILURE_NOTICE);
        let notice: FailureNotice = protocol::decode(body).unwrap();
        assert!(notice.reason.contains("identity"));

        assert_eq!(stream.read(&mut [0u8; 1]).await.unwrap(), 0);

        server.shutdown();
        let _ = server_task.await;
    }
}
