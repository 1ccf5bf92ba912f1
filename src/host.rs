//! WebSocket host: serves every session in the registry.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Session (id) ── Document + version ── BroadcastGroup
//! Client B ──┘         │
//!                      ▼
//!            ┌─────────┼──────────┐
//!            ▼         ▼          ▼
//!         Client A  Client B   Client C
//! ```
//!
//! One WebSocket connection per participant per session. Each connection
//! runs a `tokio::select!` loop between incoming frames (routed to the
//! session) and the session's broadcast stream (forwarded to the socket,
//! skipping frames this participant authored). A transport drop runs
//! `leave` on the participant's behalf so half-closed connections never
//! linger in the roster.

use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{
    CursorRequest, JoinRejectReason, JoinRequest, MessageType, UpdateRequest, WireMessage,
};
use crate::registry::SessionRegistry;
use crate::session::{JoinError, Session};

/// Host configuration.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Heartbeat interval in seconds (client-driven pings).
    pub heartbeat_interval_secs: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            heartbeat_interval_secs: 30,
        }
    }
}

/// Host statistics.
#[derive(Debug, Clone, Default)]
pub struct HostStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_sessions: usize,
}

/// The session host: accepts participant connections and routes their
/// traffic to sessions owned by the registry.
pub struct SessionHost {
    config: HostConfig,
    registry: Arc<SessionRegistry>,
    stats: Arc<RwLock<HostStats>>,
}

impl SessionHost {
    pub fn new(config: HostConfig, registry: Arc<SessionRegistry>) -> Self {
        Self {
            config,
            registry,
            stats: Arc::new(RwLock::new(HostStats::default())),
        }
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the accept loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Session host listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registry, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single participant connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<SessionRegistry>,
        stats: Arc<RwLock<HostStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Per-connection state, populated by the join handshake.
        let mut participant_id: Option<Uuid> = None;
        let mut session: Option<Arc<Session>> = None;
        let mut broadcast_rx: Option<tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>> = None;

        // The loop runs as an inner block so that a failed send (the
        // participant's socket died under us) still falls through to
        // the leave cleanup below instead of returning early.
        let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = async {
            loop {
                tokio::select! {
                    // Incoming WebSocket frame
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let bytes: Vec<u8> = data.into();
                                let wire = match WireMessage::decode(&bytes) {
                                    Ok(wire) => wire,
                                    Err(e) => {
                                        log::warn!("Failed to decode frame from {addr}: {e}");
                                        continue;
                                    }
                                };
                                {
                                    let mut s = stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += bytes.len() as u64;
                                }

                                match wire.msg_type {
                                    MessageType::JoinSession => {
                                        if session.is_some() {
                                            log::warn!("Duplicate join from {addr}, ignoring");
                                            continue;
                                        }
                                        let request: JoinRequest =
                                            match wire.payload_as(MessageType::JoinSession) {
                                                Ok(r) => r,
                                                Err(e) => {
                                                    log::warn!("Malformed join from {addr}: {e}");
                                                    continue;
                                                }
                                            };

                                        let Some(target) = registry.get(wire.session_id).await else {
                                            log::info!(
                                                "Join from {addr} for unknown session {}",
                                                wire.session_id
                                            );
                                            let reject = WireMessage::join_rejected(
                                                wire.session_id,
                                                JoinRejectReason::SessionNotFound,
                                                "no session with that id is hosted here",
                                            );
                                            ws_sender.send(Message::Binary(reject.encode()?.into())).await?;
                                            continue;
                                        };

                                        match target.join(&request.user).await {
                                            Ok((ack, rx)) => {
                                                participant_id = Some(ack.user_id);
                                                broadcast_rx = Some(rx);
                                                let joined =
                                                    WireMessage::session_joined(wire.session_id, &ack);
                                                ws_sender
                                                    .send(Message::Binary(joined.encode()?.into()))
                                                    .await?;
                                                session = Some(target);
                                            }
                                            Err(JoinError::SessionFull { max }) => {
                                                let reject = WireMessage::join_rejected(
                                                    wire.session_id,
                                                    JoinRejectReason::SessionFull,
                                                    format!("session is full ({max} participants)"),
                                                );
                                                ws_sender
                                                    .send(Message::Binary(reject.encode()?.into()))
                                                    .await?;
                                            }
                                        }
                                    }

                                    MessageType::DocumentUpdate => {
                                        let (Some(s), Some(pid)) = (session.as_ref(), participant_id)
                                        else {
                                            log::warn!("Update from {addr} before join, ignoring");
                                            continue;
                                        };
                                        let request: UpdateRequest =
                                            match wire.payload_as(MessageType::DocumentUpdate) {
                                                Ok(r) => r,
                                                Err(e) => {
                                                    log::warn!("Malformed update from {addr}: {e}");
                                                    continue;
                                                }
                                            };

                                        match s.commit(pid, request.operation, request.version).await {
                                            Ok(receipt) => {
                                                // Advisory only; the commit already went through.
                                                if let Some(conflict) = receipt.conflict {
                                                    let notice =
                                                        WireMessage::conflict(s.id(), conflict);
                                                    ws_sender
                                                        .send(Message::Binary(notice.encode()?.into()))
                                                        .await?;
                                                }
                                            }
                                            Err(e) => {
                                                // Rejected to the author only, never broadcast.
                                                let reject = WireMessage::update_rejected(
                                                    s.id(),
                                                    e.to_string(),
                                                );
                                                ws_sender
                                                    .send(Message::Binary(reject.encode()?.into()))
                                                    .await?;
                                            }
                                        }
                                    }

                                    MessageType::CursorUpdate => {
                                        let (Some(s), Some(pid)) = (session.as_ref(), participant_id)
                                        else {
                                            continue;
                                        };
                                        if let Ok(request) = wire
                                            .payload_as::<CursorRequest>(MessageType::CursorUpdate)
                                        {
                                            s.update_presence(pid, request.cursor).await;
                                        }
                                    }

                                    MessageType::Ping => {
                                        let pong = WireMessage::pong(participant_id.unwrap_or(Uuid::nil()));
                                        ws_sender.send(Message::Binary(pong.encode()?.into())).await?;
                                    }

                                    other => {
                                        log::debug!("Unhandled message type from {addr}: {other:?}");
                                    }
                                }
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    // Session broadcast frame to forward
                    frame = async {
                        match broadcast_rx.as_mut() {
                            Some(rx) => rx.recv().await,
                            // Not joined yet — wait forever.
                            None => std::future::pending().await,
                        }
                    } => {
                        match frame {
                            Ok(data) => {
                                // Never echo a frame back to its author.
                                let ended = match WireMessage::decode(&data) {
                                    Ok(msg) => {
                                        if Some(msg.sender) == participant_id {
                                            continue;
                                        }
                                        msg.msg_type == MessageType::SessionEnded
                                    }
                                    Err(_) => false,
                                };
                                ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                                if ended {
                                    // The session is gone; drop the connection.
                                    log::info!("Session ended, closing connection from {addr}");
                                    break;
                                }
                            }
                            Err(RecvError::Lagged(n)) => {
                                log::warn!("Participant {participant_id:?} lagged by {n} frames");
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        // Cleanup: run leave on the participant's behalf, whether the
        // connection closed cleanly or a send to it failed.
        if let (Some(s), Some(pid)) = (session, participant_id) {
            s.leave(pid).await;
        }
        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
        }

        result
    }

    /// Get host statistics.
    pub async fn stats(&self) -> HostStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_sessions = self.registry.session_count().await;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// The registry this host serves.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_config_default() {
        let config = HostConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.heartbeat_interval_secs, 30);
    }

    #[test]
    fn test_host_creation() {
        let registry = Arc::new(SessionRegistry::new());
        let host = SessionHost::new(HostConfig::default(), registry);
        assert_eq!(host.bind_addr(), "127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_host_stats_initial() {
        let registry = Arc::new(SessionRegistry::new());
        let host = SessionHost::new(HostConfig::default(), registry);
        let stats = host.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.total_bytes, 0);
        assert_eq!(stats.active_sessions, 0);
    }
}
