//! WebSocket socket server: the connection registry.
//!
//! Owns the listening endpoint, accepts transport connections, assigns each
//! one an id from the cycling [`IdPool`], and routes lifecycle events
//! (`connection` / `message` / `close` / `error`) to the dispatch loop over
//! an mpsc channel.  The registry knows nothing about authentication; it
//! only guarantees ordering:
//!
//! - a connection is inserted into the active table before its `Connection`
//!   event is emitted, and
//! - a closing connection is removed from the table before its `Closed`
//!   event or the `ConnectionClosed` bus topic is observable, and its id is
//!   released only after both have fired.
//!
//! Each accepted connection runs in its own Tokio task; a slow peer never
//! delays the accept loop or other connections.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use gatehouse_core::{ConnectionId, EventBus, InboundEnvelope, Topic};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use super::client_connection::{ClientHandle, ConnectionCommand};
use super::id_pool::IdPool;
use crate::application::ClientLookup;

/// Error type for socket server operations.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind failed on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("could not read bound local address: {0}")]
    LocalAddr(#[source] std::io::Error),
}

/// Lifecycle events routed to the dispatch loop.
#[derive(Debug)]
pub enum ServerEvent {
    /// A transport connection was accepted and registered under `id`.
    Connection { id: ConnectionId },
    /// A parsed frame arrived on connection `id`.
    Message {
        id: ConnectionId,
        envelope: InboundEnvelope,
    },
    /// Connection `id` closed; it has already left the active table.
    Closed { id: ConnectionId },
    /// A transport-level read error on connection `id`; a `Closed` event
    /// follows.
    Error { id: ConnectionId, error: String },
}

struct ServerState {
    started: AtomicBool,
    bind_failed: AtomicBool,
    running: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    connections: Mutex<HashMap<ConnectionId, ClientHandle>>,
    id_pool: Mutex<IdPool>,
    events: mpsc::UnboundedSender<ServerEvent>,
    bus: EventBus,
}

/// The connection registry and its listening endpoint.
pub struct SocketServer {
    state: Arc<ServerState>,
}

impl SocketServer {
    /// Creates the server and returns it together with the event receiver
    /// the dispatch loop drains.
    ///
    /// `bus` receives a [`Topic::ConnectionClosed`] emission for every
    /// connection teardown, which is what retires pending authentications
    /// tied to a direct request.
    pub fn new(bus: EventBus) -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let server = Self {
            state: Arc::new(ServerState {
                started: AtomicBool::new(false),
                bind_failed: AtomicBool::new(false),
                running: AtomicBool::new(false),
                local_addr: Mutex::new(None),
                connections: Mutex::new(HashMap::new()),
                id_pool: Mutex::new(IdPool::new()),
                events,
                bus,
            }),
        };
        (server, rx)
    }

    /// Binds `127.0.0.1:port` and starts the accept loop.
    ///
    /// Calling `start` while the server is already bound and healthy is a
    /// no-op that only logs; after a failed bind the next call retries.
    /// Pass port `0` to bind an ephemeral port and read it back via
    /// [`SocketServer::local_addr`].
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] when the port cannot be bound.
    pub async fn start(&self, port: u16) -> Result<(), ServerError> {
        if self.state.started.load(Ordering::Relaxed) && !self.state.bind_failed.load(Ordering::Relaxed)
        {
            info!("socket server already running");
            return Ok(());
        }

        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(source) => {
                self.state.started.store(true, Ordering::Relaxed);
                self.state.bind_failed.store(true, Ordering::Relaxed);
                return Err(ServerError::Bind { addr, source });
            }
        };
        let local_addr = listener.local_addr().map_err(ServerError::LocalAddr)?;

        *self.state.local_addr.lock().unwrap() = Some(local_addr);
        self.state.started.store(true, Ordering::Relaxed);
        self.state.bind_failed.store(false, Ordering::Relaxed);
        self.state.running.store(true, Ordering::Relaxed);

        info!("socket server listening on {local_addr}");

        let state = Arc::clone(&self.state);
        tokio::spawn(accept_loop(listener, state));
        Ok(())
    }

    /// The address the listener is bound to, once `start` has succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.state.local_addr.lock().unwrap()
    }

    /// Returns the live handle for `id`, or an inert stand-in whose `send`
    /// and `close` do nothing and whose `is_open` reports `false`.
    pub fn get_client_by_id(&self, id: ConnectionId) -> ClientHandle {
        self.state
            .connections
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .unwrap_or_else(ClientHandle::inert)
    }

    /// Number of currently tracked connections.
    pub fn active_connection_count(&self) -> usize {
        self.state.connections.lock().unwrap().len()
    }

    /// Closes every tracked connection without waiting for acknowledgement.
    pub fn close_all_connections(&self) {
        let handles: Vec<ClientHandle> = self
            .state
            .connections
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for handle in handles {
            handle.close();
        }
    }

    /// Stops the accept loop and closes all tracked connections.
    pub fn shutdown(&self) {
        self.state.running.store(false, Ordering::Relaxed);
        self.close_all_connections();
    }
}

impl ClientLookup for SocketServer {
    fn get_client_by_id(&self, id: ConnectionId) -> ClientHandle {
        SocketServer::get_client_by_id(self, id)
    }
}

// ── Accept loop ───────────────────────────────────────────────────────────────

/// Accepts connections until the running flag is cleared.
///
/// A short timeout on `accept()` lets the loop notice shutdown even when no
/// peers are connecting.
async fn accept_loop(listener: TcpListener, state: Arc<ServerState>) {
    loop {
        if !state.running.load(Ordering::Relaxed) {
            info!("socket server accept loop stopping");
            break;
        }
        match timeout(Duration::from_millis(200), listener.accept()).await {
            Ok(Ok((stream, peer_addr))) => {
                debug!("incoming transport connection from {peer_addr}");
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    handle_connection(stream, state).await;
                });
            }
            Ok(Err(e)) => {
                // Transient accept error; keep the endpoint alive.
                error!("accept error: {e}");
            }
            Err(_) => {
                // Timeout with no connection; re-check the running flag.
            }
        }
    }
}

// ── Per-connection handler ────────────────────────────────────────────────────

/// Runs the complete lifecycle of a single connection: WebSocket upgrade,
/// id assignment, reader/writer tasks, and ordered teardown.
async fn handle_connection(stream: TcpStream, state: Arc<ServerState>) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("websocket handshake failed: {e}");
            return;
        }
    };

    let id = state.id_pool.lock().unwrap().next();
    let (handle, mut commands) = ClientHandle::channel();
    state.connections.lock().unwrap().insert(id, handle.clone());
    let _ = state.events.send(ServerEvent::Connection { id });
    info!("connection {id} established");

    let (mut sink, mut source) = ws.split();

    // Writer task: serializes queued frames; a Close command writes the
    // close frame after any frames queued before it.
    let writer = tokio::spawn(async move {
        while let Some(command) = commands.recv().await {
            match command {
                ConnectionCommand::Send(frame) => match serde_json::to_string(&frame) {
                    Ok(text) => {
                        if sink.send(WsMessage::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => error!("connection {id}: outbound frame serialization failed: {e}"),
                },
                ConnectionCommand::Close => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
            }
        }
    });

    // Reader loop: parse text frames, forward everything else as noise.
    while let Some(frame) = source.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => match serde_json::from_str::<InboundEnvelope>(&text) {
                Ok(envelope) => {
                    let _ = state.events.send(ServerEvent::Message { id, envelope });
                }
                Err(e) => {
                    // One malformed frame does not cost the peer its
                    // connection; it may retry with valid JSON.
                    warn!("connection {id}: invalid JSON frame ignored: {e}");
                }
            },
            Ok(WsMessage::Binary(_)) => {
                warn!("connection {id}: unexpected binary frame ignored");
            }
            Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) | Ok(WsMessage::Frame(_)) => {}
            Ok(WsMessage::Close(_)) => break,
            Err(e) => {
                let _ = state.events.send(ServerEvent::Error {
                    id,
                    error: e.to_string(),
                });
                break;
            }
        }
    }

    // Ordered teardown: leave the active table first so no subscriber can
    // observe a stale entry, then signal, then recycle the id.
    handle.mark_closed();
    writer.abort();
    state.connections.lock().unwrap().remove(&id);
    let _ = state.events.send(ServerEvent::Closed { id });
    state.bus.emit(Topic::ConnectionClosed(id));
    state.id_pool.lock().unwrap().release(id);
    info!("connection {id} closed");
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_client_by_id_returns_inert_for_unknown_id() {
        let (server, _rx) = SocketServer::new(EventBus::new());
        let handle = server.get_client_by_id(999);
        assert!(!handle.is_open());
        // Inert operations must not panic.
        handle.close();
    }

    #[test]
    fn test_close_all_connections_on_empty_table_is_noop() {
        let (server, _rx) = SocketServer::new(EventBus::new());
        server.close_all_connections();
        assert_eq!(server.active_connection_count(), 0);
    }

    #[tokio::test]
    async fn test_start_binds_ephemeral_port_and_reports_local_addr() {
        let (server, _rx) = SocketServer::new(EventBus::new());
        server.start(0).await.expect("bind to ephemeral port");
        let addr = server.local_addr().expect("local addr after start");
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
        assert_ne!(addr.port(), 0);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_start_twice_while_healthy_is_a_noop() {
        let (server, _rx) = SocketServer::new(EventBus::new());
        server.start(0).await.expect("first bind");
        let addr = server.local_addr().unwrap();
        // Second start must not re-bind or change the address.
        server.start(0).await.expect("second start is a logged no-op");
        assert_eq!(server.local_addr().unwrap(), addr);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_failed_bind_allows_retry() {
        // Occupy a port with a plain TCP listener, then fail to bind it.
        let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken_port = blocker.local_addr().unwrap().port();

        let (server, _rx) = SocketServer::new(EventBus::new());
        let result = server.start(taken_port).await;
        assert!(matches!(result, Err(ServerError::Bind { .. })));

        // Release the port and retry; the failed-bind flag must permit it.
        drop(blocker);
        server
            .start(taken_port)
            .await
            .expect("retry after failed bind must re-attempt");
        server.shutdown();
    }
}
