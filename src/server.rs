//! WebSocket collaboration server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                        ┌── DocumentService ── DocumentStore
//!             ├── CollabSession ──────┤          │
//! Client B ──┘        │               │     version gate
//!                     │               └── LockService (per-doc mutex)
//!                     ▼
//!                RoomRouter ── outbound queue per connection
//! ```
//!
//! One spawned task per connection runs a `tokio::select!` loop over the
//! inbound socket and the connection's ordered outbound queue. The
//! handshake carries a bearer token (`Authorization` header, or a `token`
//! query parameter for clients that cannot set headers); validation
//! failure gets a terminal `error` frame and a close.
//!
//! No in-process lock is held across an await other than the distributed
//! document lock owned by the session's send-op path.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use crate::auth::TokenValidator;
use crate::lock::LockService;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::room::RoomRouter;
use crate::service::DocumentService;
use crate::session::CollabSession;
use crate::store::DocumentStore;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound queue capacity per connection
    pub outbound_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind_addr: "127.0.0.1:9360".to_string(), outbound_capacity: 256 }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub protocol_errors: u64,
    pub active_rooms: usize,
}

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    service: Arc<DocumentService>,
    router: Arc<RoomRouter>,
    locks: Arc<dyn LockService>,
    validator: Arc<dyn TokenValidator>,
    stats: Arc<RwLock<ServerStats>>,
}

impl CollabServer {
    /// Create a server over injected store, lock, and auth handles.
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn DocumentStore>,
        locks: Arc<dyn LockService>,
        validator: Arc<dyn TokenValidator>,
    ) -> Self {
        Self {
            config,
            service: Arc::new(DocumentService::new(store)),
            router: Arc::new(RoomRouter::new()),
            locks,
            validator,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// The service handle, for seeding documents and inspection.
    pub fn service(&self) -> &Arc<DocumentService> {
        &self.service
    }

    pub fn router(&self) -> &Arc<RoomRouter> {
        &self.router
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Snapshot of server health.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.router.room_count().await;
        stats
    }

    /// Accept connections forever. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("collab server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let service = self.service.clone();
            let router = self.router.clone();
            let locks = self.locks.clone();
            let validator = self.validator.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(
                    stream, addr, service, router, locks, validator, stats, config,
                )
                .await
                {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Pull the bearer token out of the upgrade request.
    fn extract_token(req: &Request) -> Option<String> {
        if let Some(value) = req.headers().get("authorization") {
            let value = value.to_str().ok()?;
            return value
                .strip_prefix("Bearer ")
                .or_else(|| value.strip_prefix("bearer "))
                .map(str::to_string);
        }
        req.uri()
            .query()?
            .split('&')
            .find_map(|pair| pair.strip_prefix("token="))
            .map(str::to_string)
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        service: Arc<DocumentService>,
        router: Arc<RoomRouter>,
        locks: Arc<dyn LockService>,
        validator: Arc<dyn TokenValidator>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut token: Option<String> = None;
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                token = Self::extract_token(req);
                Ok(resp)
            },
        )
        .await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let user_id = match &token {
            Some(token) => validator.validate(token).await,
            None => None,
        };
        let Some(user_id) = user_id else {
            log::warn!("rejecting unauthenticated connection from {addr}");
            let frame = ServerMessage::Error { message: "unauthorized".into() }.encode()?;
            ws_sender.send(Message::Text(frame.into())).await?;
            ws_sender.send(Message::Close(None)).await?;
            return Ok(());
        };

        log::info!("connection established from {addr} as {user_id}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // One ordered queue carries everything this connection receives:
        // direct replies and room broadcasts.
        let (out_tx, mut out_rx) = mpsc::channel::<Arc<ServerMessage>>(config.outbound_capacity);
        let mut session = CollabSession::new(
            user_id,
            service,
            router,
            locks,
            out_tx.clone(),
        );

        loop {
            tokio::select! {
                inbound = ws_receiver.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                            }
                            match ClientMessage::decode(text.as_str()) {
                                Ok(msg) => session.handle_message(msg).await,
                                Err(e) => {
                                    log::warn!("bad frame from {addr}: {e}");
                                    let mut s = stats.write().await;
                                    s.protocol_errors += 1;
                                    drop(s);
                                    let _ = out_tx
                                        .send(Arc::new(ServerMessage::Error {
                                            message: e.to_string(),
                                        }))
                                        .await;
                                }
                            }
                        }
                        Some(Ok(Message::Binary(_))) => {
                            let _ = out_tx
                                .send(Arc::new(ServerMessage::Error {
                                    message: crate::protocol::ProtocolError::UnexpectedBinary
                                        .to_string(),
                                }))
                                .await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("connection closed from {addr}");
                            break;
                        }
                        Some(Err(e)) => {
                            log::error!("websocket error from {addr}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                outbound = out_rx.recv() => {
                    match outbound {
                        Some(msg) => {
                            let frame = msg.encode()?;
                            ws_sender.send(Message::Text(frame.into())).await?;
                        }
                        None => break,
                    }
                }
            }
        }

        session.handle_disconnect().await;
        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
        }

        Ok(())
    }
}
