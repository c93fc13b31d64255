//! WebSocket relay server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── SharedDocument "room1" ── yrs replica
//!             ├── ws://host/room1 ──┤                           ── awareness
//! Client B ──┘                      │                           ── connections
//!                                   │
//! Client C ───── ws://host/room2 ───┴── SharedDocument "room2"
//! ```
//!
//! Each accepted socket gets its own task. The task owns the socket, runs a
//! [`Dispatcher`] for inbound frames and drains the connection's outbound
//! queue (replies and broadcasts from other connections) into the socket.
//! The accept loop also sweeps idle documents out of the registry and, on
//! shutdown, waits for every connection to run its close cleanup.

use std::future::Future;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use crate::connection::ConnectionHandle;
use crate::dispatcher::{AuthHook, Dispatcher, LogOnlyAuth};
use crate::error::{RelayError, Result};
use crate::registry::DocumentRegistry;

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Document every connection joins, ignoring the request path
    pub document_name: Option<String>,
    /// Document joined when the request path is empty
    pub default_document: String,
    /// Frames queued per connection before sends to it are dropped
    pub outbound_capacity: usize,
    /// WebSocket ping interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Close connections silent for this long (0 = never)
    pub idle_timeout_secs: u64,
    /// Evict documents this long after their last connection left
    pub document_grace_secs: u64,
    /// Interval between eviction sweeps in seconds
    pub eviction_interval_secs: u64,
    /// How long shutdown waits for connections to flush
    pub shutdown_grace_secs: u64,
    /// Garbage-collect deleted content in replicas
    pub gc: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:1234".to_string(),
            document_name: None,
            default_document: "default".to_string(),
            outbound_capacity: 256,
            heartbeat_interval_secs: 30,
            idle_timeout_secs: 90,
            document_grace_secs: 300,
            eviction_interval_secs: 30,
            shutdown_grace_secs: 5,
            gc: true,
        }
    }
}

impl ServerConfig {
    /// Read overrides from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from `lookup`, falling back to defaults for unset keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let host = lookup("HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let port: u16 = parse_var(&lookup, "PORT", 1234)?;

        Ok(Self {
            bind_addr: format!("{host}:{port}"),
            document_name: lookup("RELAY_DOC_NAME").filter(|name| !name.is_empty()),
            default_document: lookup("RELAY_DEFAULT_DOC").unwrap_or(defaults.default_document),
            outbound_capacity: parse_var(&lookup, "RELAY_OUTBOUND_CAPACITY", defaults.outbound_capacity)?,
            heartbeat_interval_secs: parse_var(&lookup, "RELAY_HEARTBEAT_SECS", defaults.heartbeat_interval_secs)?,
            idle_timeout_secs: parse_var(&lookup, "RELAY_IDLE_TIMEOUT_SECS", defaults.idle_timeout_secs)?,
            document_grace_secs: parse_var(&lookup, "RELAY_DOC_GRACE_SECS", defaults.document_grace_secs)?,
            eviction_interval_secs: parse_var(&lookup, "RELAY_EVICTION_INTERVAL_SECS", defaults.eviction_interval_secs)?,
            shutdown_grace_secs: parse_var(&lookup, "RELAY_SHUTDOWN_GRACE_SECS", defaults.shutdown_grace_secs)?,
            gc: parse_var(&lookup, "RELAY_GC", defaults.gc)?,
        })
    }

    /// Document name for a connection that requested `request_path`.
    pub fn resolve_document(&self, request_path: Option<&str>) -> String {
        if let Some(name) = &self.document_name {
            return name.clone();
        }
        let path = request_path.unwrap_or_default();
        let path = path.split('?').next().unwrap_or_default();
        let name = path.strip_prefix('/').unwrap_or(path);
        if name.is_empty() {
            self.default_document.clone()
        } else {
            name.to_string()
        }
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| RelayError::Config(format!("{key}={raw:?} is not valid"))),
        None => Ok(default),
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub malformed_frames: u64,
    pub active_documents: usize,
}

/// State shared with every connection task.
#[derive(Clone)]
struct ConnectionContext {
    config: ServerConfig,
    registry: Arc<DocumentRegistry>,
    stats: Arc<RwLock<ServerStats>>,
    auth: Arc<dyn AuthHook>,
    shutdown: watch::Receiver<bool>,
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    registry: Arc<DocumentRegistry>,
    stats: Arc<RwLock<ServerStats>>,
    auth: Arc<dyn AuthHook>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(DocumentRegistry::new(config.gc));
        Self {
            config,
            registry,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            auth: Arc::new(LogOnlyAuth),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Replace the hook that receives auth frames.
    pub fn with_auth_hook(mut self, auth: Arc<dyn AuthHook>) -> Self {
        self.auth = auth;
        self
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay server listening on {}", self.config.bind_addr);
        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` resolves, then
    /// close every connection gracefully.
    pub async fn serve(&self, listener: TcpListener, shutdown: impl Future<Output = ()>) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut connections = JoinSet::new();

        let sweep_period = Duration::from_secs(self.config.eviction_interval_secs.max(1));
        let mut sweep = tokio::time::interval(sweep_period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let grace = Duration::from_secs(self.config.document_grace_secs);

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Shutdown requested, closing {} connections", connections.len());
                    break;
                }

                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            log::error!("Accept failed: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");

                    let ctx = ConnectionContext {
                        config: self.config.clone(),
                        registry: self.registry.clone(),
                        stats: self.stats.clone(),
                        auth: self.auth.clone(),
                        shutdown: shutdown_rx.clone(),
                    };
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, ctx).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }

                _ = sweep.tick() => {
                    let evicted = self.registry.evict_idle(grace).await;
                    if !evicted.is_empty() {
                        let active = self.registry.len().await;
                        self.stats.write().await.active_documents = active;
                    }
                }

                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        log::error!("Connection task failed: {e}");
                    }
                }
            }
        }

        let _ = shutdown_tx.send(true);
        let drain = async {
            while let Some(joined) = connections.join_next().await {
                if let Err(e) = joined {
                    log::error!("Connection task failed during shutdown: {e}");
                }
            }
        };
        let shutdown_grace = Duration::from_secs(self.config.shutdown_grace_secs);
        if tokio::time::timeout(shutdown_grace, drain).await.is_err() {
            log::warn!("Connections did not close within {shutdown_grace:?}, aborting");
            connections.abort_all();
        }

        log::info!("Relay server stopped");
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

/// Serve one WebSocket connection from handshake to close cleanup.
async fn handle_connection(stream: TcpStream, addr: SocketAddr, mut ctx: ConnectionContext) -> Result<()> {
    let mut request_path: Option<String> = None;
    let ws_stream = tokio_tungstenite::accept_hdr_async(
        stream,
        |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            request_path = Some(request.uri().path().to_string());
            Ok(response)
        },
    )
    .await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let doc_name = ctx.config.resolve_document(request_path.as_deref());
    let document = ctx.registry.get_or_create(&doc_name).await;
    let (handle, mut outbound) = ConnectionHandle::new(ctx.config.outbound_capacity);
    {
        let active_documents = ctx.registry.len().await;
        let mut s = ctx.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
        s.active_documents = active_documents;
    }

    let kick = handle.clone();
    let dispatcher = Dispatcher::open(document, handle, ctx.auth.clone()).await;
    let conn_id = dispatcher.connection_id();
    log::info!("WebSocket connection {conn_id} from {addr} on doc {doc_name}");

    let heartbeat_period = Duration::from_secs(ctx.config.heartbeat_interval_secs.max(1));
    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + heartbeat_period,
        heartbeat_period,
    );
    let idle_timeout = (ctx.config.idle_timeout_secs > 0)
        .then(|| Duration::from_secs(ctx.config.idle_timeout_secs));
    let mut last_seen = Instant::now();

    let result: Result<()> = loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        last_seen = Instant::now();
                        let accepted = dispatcher.handle(&data).await.is_some();
                        record_frame(&ctx.stats, data.len(), accepted).await;
                    }

                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        let accepted = dispatcher.handle(text.as_bytes()).await.is_some();
                        record_frame(&ctx.stats, text.len(), accepted).await;
                    }

                    Some(Ok(Message::Ping(data))) => {
                        last_seen = Instant::now();
                        if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                            break Err(e.into());
                        }
                    }

                    Some(Ok(Message::Pong(_))) => {
                        last_seen = Instant::now();
                    }

                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection {conn_id} closed by peer");
                        break Ok(());
                    }

                    Some(Err(e)) => {
                        break Err(e.into());
                    }

                    _ => {}
                }
            }

            frame = outbound.recv() => {
                match frame {
                    Some(frame) => {
                        if let Err(e) = ws_sender.send(Message::Binary(frame.to_vec().into())).await {
                            break Err(e.into());
                        }
                    }
                    None => break Ok(()),
                }
            }

            _ = heartbeat.tick() => {
                if let Some(timeout) = idle_timeout {
                    if last_seen.elapsed() >= timeout {
                        log::warn!("Connection {conn_id} idle for {timeout:?}, closing");
                        break Ok(());
                    }
                }
                if let Err(e) = ws_sender.send(Message::Ping(Vec::new().into())).await {
                    break Err(e.into());
                }
            }

            _ = kick.disconnected() => {
                log::info!("Connection {conn_id} closing so the client can resync");
                break Ok(());
            }

            _ = ctx.shutdown.changed() => {
                log::debug!("Connection {conn_id} closing for shutdown");
                break Ok(());
            }
        }
    };

    dispatcher.close().await;

    // Deliver what was queued before the connection left the document.
    while let Ok(frame) = outbound.try_recv() {
        if ws_sender.send(Message::Binary(frame.to_vec().into())).await.is_err() {
            break;
        }
    }
    let _ = ws_sender.send(Message::Close(None)).await;

    {
        let active_documents = ctx.registry.len().await;
        let mut s = ctx.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        s.active_documents = active_documents;
    }

    result
}

async fn record_frame(stats: &RwLock<ServerStats>, len: usize, accepted: bool) {
    let mut s = stats.write().await;
    s.total_frames += 1;
    s.total_bytes += len as u64;
    if !accepted {
        s.malformed_frames += 1;
    }
}
