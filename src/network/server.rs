//! WebSocket Game Server
//!
//! Accepts WebSocket connections, resolves their identity from the
//! handshake, and runs one [`ConnectionHandler`] per connection. Matchmaking
//! and game frames share a single endpoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::{accept_hdr_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::{env_or, AppConfig, ConfigError};
use crate::network::auth::{resolve_identity, AuthConfig};
use crate::network::handler::{ConnectionHandler, ServerContext};
use crate::network::protocol::ServerMessage;
use crate::persistence::PersistenceGateway;

/// Outbound frames buffered per connection.
const OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// Time allowed to flush queued frames after a connection ends.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
        }
    }
}

impl ServerConfig {
    /// Load from `PONG_BIND_ADDR` and `PONG_MAX_CONNECTIONS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            bind_addr: env_or("PONG_BIND_ADDR", defaults.bind_addr)?,
            max_connections: env_or("PONG_MAX_CONNECTIONS", defaults.max_connections)?,
        })
    }
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),
}

/// The game server.
pub struct GameServer {
    config: ServerConfig,
    auth: Arc<AuthConfig>,
    ctx: ServerContext,
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a server around a persistence gateway.
    pub fn new(config: AppConfig, persistence: Arc<dyn PersistenceGateway>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let ctx = ServerContext::new(config.session, config.matchmaking, persistence);

        Self {
            config: config.server,
            auth: Arc::new(config.auth),
            ctx,
            shutdown_tx,
        }
    }

    /// Shared services, for embedding and tests.
    pub fn context(&self) -> &ServerContext {
        &self.ctx
    }

    /// Run the accept loop until [`shutdown`](Self::shutdown).
    #[instrument(skip(self), fields(addr = %self.config.bind_addr))]
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("Game server listening on {}", self.config.bind_addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.connection_count().await >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }
                            debug!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Stop accepting and close every connection.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Open connections.
    pub async fn connection_count(&self) -> usize {
        self.ctx.hub.connection_count().await
    }

    /// Live sessions.
    pub async fn session_count(&self) -> usize {
        self.ctx.registry.len().await
    }

    /// Players waiting for an opponent.
    pub async fn queue_size(&self) -> usize {
        self.ctx.matchmaking.len().await
    }

    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let ctx = self.ctx.clone();
        let auth = self.auth.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut query = None;
            let capture_query =
                |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                    query = request.uri().query().map(str::to_owned);
                    Ok(response)
                };
            let ws_stream = match accept_hdr_async(stream, capture_query).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let identity = resolve_identity(query.as_deref(), &auth);
            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_QUEUE_CAPACITY);

            let mut handler = ConnectionHandler::connect(ctx, identity.clone(), msg_tx).await;
            let conn = handler.id();
            match &identity {
                Some(user) => info!("Connection {} from {} as user {}", conn, addr, user),
                None => info!("Connection {} from {} (anonymous)", conn, addr),
            }

            let mut sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    if msg.is_high_frequency() {
                        trace!("-> {}: {:?}", conn, msg);
                    } else {
                        debug!("-> {}: {:?}", conn, msg);
                    }
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                let _ = ws_sender.close().await;
            });

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => handler.handle_text(&text).await,
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", conn);
                                break;
                            }
                            Some(Err(e)) => {
                                warn!("WebSocket error for {}: {}", conn, e);
                                break;
                            }
                            // Pings are answered by tungstenite; binary frames aren't part of the protocol.
                            _ => {}
                        }
                    }
                    _ = handler.evicted() => {
                        warn!("Closing {}: outbound queue overflowed", conn);
                        break;
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }

            // Dropping the handler's hub entry closes the outbound queue,
            // letting the sender task flush and exit. A socket that stopped
            // draining is cut off after the flush timeout.
            handler.disconnect().await;
            if tokio::time::timeout(FLUSH_TIMEOUT, &mut sender_task).await.is_err() {
                debug!("Outbound queue of {} not flushed in time", conn);
                sender_task.abort();
            }

            info!("Connection {} closed", conn);
        });
    }
}
