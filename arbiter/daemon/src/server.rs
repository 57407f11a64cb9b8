//! Daemon Server Implementation
//!
//! This module provides the WebSocket front door for the arbiter:
//! - Accepts TCP connections and upgrades them to WebSocket
//! - Attaches a `SessionContext` per connection from its own task
//! - Decodes text frames into operator events
//! - Writes arbiter events back from a per-connection writer task
//! - Supports graceful shutdown
//!
//! ```text
//!                        DaemonServer
//!                             │
//!          ┌──────────────────┼──────────────────┐
//!          │                  │                  │
//!      operator           operator           spectator
//!      (conn-1)           (conn-2)           (conn-3)
//!          │                  │                  │
//!          └──────────────────┴──────────────────┘
//!                             │
//!                      ArbiterHandle
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn, Instrument};

use arbiter_core::{
    decode_inbound, encode_outbound, ArbiterConfig, ArbiterHandle, ConnectionId, OutboundEvent,
    SessionContext,
};

/// How often the accept loop re-checks the shutdown flag
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Connection state tracking (internal to server)
struct ConnectionState {
    /// When the socket was accepted
    connected_at: Instant,
    /// Remote peer
    peer: SocketAddr,
    /// Handle to abort the connection task
    abort_handle: tokio::task::AbortHandle,
}

/// Configuration for the daemon server
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to bind
    pub listen_addr: SocketAddr,
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Per-connection outbound channel capacity
    pub connection_channel_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&ArbiterConfig::default())
    }
}

impl From<&ArbiterConfig> for ServerConfig {
    fn from(config: &ArbiterConfig) -> Self {
        Self {
            listen_addr: config.listen_addr,
            max_connections: 100,
            connection_channel_capacity: config.connection_channel_capacity,
        }
    }
}

/// The main daemon server
pub struct DaemonServer {
    /// Server configuration
    server_config: ServerConfig,
    /// Arbiter the connections talk to
    arbiter: ArbiterHandle,
    /// Active connection state
    connection_states: Arc<DashMap<ConnectionId, ConnectionState>>,
}

impl DaemonServer {
    /// Create a new daemon server
    pub fn new(server_config: ServerConfig, arbiter: ArbiterHandle) -> Self {
        Self {
            server_config,
            arbiter,
            connection_states: Arc::new(DashMap::new()),
        }
    }

    /// Run the accept loop until `shutdown` is set
    pub async fn run(&mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let listener = TcpListener::bind(self.server_config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", self.server_config.listen_addr))?;

        info!(addr = %self.server_config.listen_addr, "Listening for connections");

        loop {
            if shutdown.load(Ordering::SeqCst) {
                info!("Shutdown requested, stopping accept loop");
                break;
            }

            // Accept with timeout to allow checking shutdown flag
            let (stream, peer) = match tokio::time::timeout(ACCEPT_POLL, listener.accept()).await {
                Ok(Ok((stream, peer))) => (stream, peer),
                Ok(Err(e)) => {
                    error!(error = %e, "Accept failed");
                    continue;
                }
                Err(_) => continue,
            };

            if self.connection_states.len() >= self.server_config.max_connections {
                warn!(peer = %peer, "Connection limit reached, rejecting new connection");
                drop(stream);
                continue;
            }

            self.spawn_connection(stream, peer);
        }

        self.shutdown().await;
        Ok(())
    }

    /// Track a connection and hand it to its own task
    ///
    /// Attaching to the arbiter happens inside the task, so a full command
    /// queue holds up only this connection and never the accept loop.
    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let conn_id = ConnectionId::new();

        info!(
            conn_id = %conn_id,
            peer = %peer,
            active_connections = self.connection_states.len() + 1,
            "New connection accepted"
        );

        // handler starts only once its state is tracked
        let (tracked_tx, tracked_rx) = oneshot::channel();
        let arbiter = self.arbiter.clone();
        let capacity = self.server_config.connection_channel_capacity;
        let connection_states = Arc::clone(&self.connection_states);
        let task_handle = tokio::spawn(
            async move {
                if tracked_rx.await.is_err() {
                    return;
                }
                let (tx, rx) = mpsc::channel::<OutboundEvent>(capacity);
                let origin = peer.ip().to_string();
                match SessionContext::attach(arbiter, conn_id, origin, tx.clone()).await {
                    Ok(ctx) => Self::handle_connection(ctx, stream, tx, rx, connection_states).await,
                    Err(e) => {
                        error!(error = %e, "Arbiter unavailable, dropping connection");
                        connection_states.remove(&conn_id);
                    }
                }
            }
            .instrument(tracing::info_span!("connection", %conn_id)),
        );

        self.connection_states.insert(
            conn_id,
            ConnectionState {
                connected_at: Instant::now(),
                peer,
                abort_handle: task_handle.abort_handle(),
            },
        );
        let _ = tracked_tx.send(());
    }

    /// Handle a single client connection
    ///
    /// The reader runs here; outbound events are written by a dedicated
    /// writer task so a slow socket never stalls reading.
    async fn handle_connection(
        ctx: SessionContext,
        stream: TcpStream,
        reply_tx: mpsc::Sender<OutboundEvent>,
        mut rx: mpsc::Receiver<OutboundEvent>,
        connection_states: Arc<DashMap<ConnectionId, ConnectionState>>,
    ) {
        let ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(error = %e, "WebSocket handshake failed");
                Self::finish(ctx, &connection_states).await;
                return;
            }
        };
        info!("Connection handler started");

        let (mut sink, mut source) = ws.split();

        let writer = tokio::spawn(
            async move {
                while let Some(event) = rx.recv().await {
                    let frame = match encode_outbound(&event) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(error = %e, "Failed to encode event");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(frame)).await {
                        debug!(error = %e, "Write error");
                        break;
                    }
                }
                // Best effort close frame
                let _ = sink.close().await;
            }
            .in_current_span(),
        );

        while let Some(frame) = source.next().await {
            match frame {
                Ok(Message::Text(text)) => match decode_inbound(&text) {
                    Ok(event) => {
                        debug!(event = ?event, "Received event");
                        if ctx.dispatch(event).await.is_err() {
                            error!("Arbiter channel closed");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to decode event frame");
                        // Full channel just drops the notice
                        let _ = reply_tx.try_send(OutboundEvent::ActionError {
                            message: e.to_string(),
                        });
                    }
                },
                Ok(Message::Close(_)) => {
                    info!("Client disconnected");
                    break;
                }
                Ok(Message::Binary(_)) => {
                    warn!("Ignoring binary frame");
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "Read error");
                    break;
                }
            }
        }

        writer.abort();
        Self::finish(ctx, &connection_states).await;
    }

    async fn finish(
        ctx: SessionContext,
        connection_states: &DashMap<ConnectionId, ConnectionState>,
    ) {
        let conn_id = ctx.id();
        if ctx.close().await.is_err() {
            debug!("Arbiter already stopped");
        }
        if let Some((_, state)) = connection_states.remove(&conn_id) {
            info!(
                peer = %state.peer,
                uptime_secs = state.connected_at.elapsed().as_secs(),
                active_connections = connection_states.len(),
                "Connection handler finished"
            );
        }
    }

    /// Graceful shutdown
    async fn shutdown(&mut self) {
        info!("Initiating graceful shutdown");

        let conn_ids: Vec<ConnectionId> = self.connection_states.iter().map(|r| *r.key()).collect();
        for conn_id in conn_ids {
            if let Some((_, conn_state)) = self.connection_states.remove(&conn_id) {
                info!(conn_id = %conn_id, "Aborting connection");
                conn_state.abort_handle.abort();
                if self.arbiter.disconnect(conn_id).await.is_err() {
                    break;
                }
            }
        }

        info!("Shutdown complete");
    }

    /// Get number of active connections
    pub fn connection_count(&self) -> usize {
        self.connection_states.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_core::ArbiterCommand;

    #[test]
    fn test_server_config_from_arbiter_config() {
        let mut config = ArbiterConfig::default();
        config.connection_channel_capacity = 8;
        let server = ServerConfig::from(&config);
        assert_eq!(server.listen_addr.port(), 3000);
        assert_eq!(server.connection_channel_capacity, 8);
        assert_eq!(server.max_connections, 100);
    }

    #[tokio::test]
    async fn test_new_server_has_no_connections() {
        let (handle, _task) = arbiter_core::Arbiter::spawn(&ArbiterConfig::default());
        let server = DaemonServer::new(ServerConfig::default(), handle);
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_accept_does_not_wait_on_full_arbiter_queue() {
        let (handle, mut commands) = ArbiterHandle::channel(1);
        handle.rotate().await.unwrap();
        let server = DaemonServer::new(ServerConfig::default(), handle);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();

        server.spawn_connection(stream, peer);
        assert_eq!(server.connection_count(), 1);

        // the connection attaches once the queue drains
        assert!(matches!(commands.recv().await, Some(ArbiterCommand::Rotate)));
        let attached = tokio::time::timeout(Duration::from_secs(1), commands.recv())
            .await
            .unwrap();
        assert!(matches!(
            attached,
            Some(ArbiterCommand::Connect { ref origin, .. }) if origin == "127.0.0.1"
        ));
    }
}
