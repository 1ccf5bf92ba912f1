//! Collaboration client: one participant's connection to a session host.
//!
//! Provides:
//! - Connection lifecycle with a hard handshake timeout
//! - Optimistic local application before the commit round-trip completes
//! - Version-gated application of remote operation broadcasts
//! - Pending queue for edits made while disconnected
//! - Cursor/presence updates (best-effort)
//!
//! The local document copy is a cache. It may diverge briefly while a
//! submission is in flight, and it is overwritten by whatever the
//! authoritative broadcasts say. Reconnection is an explicit caller
//! action — `connect` again; queued operations survive until sent or
//! discarded.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::document::{Document, Operation};
use crate::presence::CursorPosition;
use crate::protocol::{
    ConflictNotice, CursorBroadcast, JoinAck, JoinReject, JoinRejectReason, MessageType,
    ParticipantInfo, ProtocolError, UpdateBroadcast, UpdateReject, UpdateRequest, UserInfo,
    UserLeftNotice, WireMessage,
};

// ───────────────────────────────────────────────────────────────────
// Configuration, state, events, errors
// ───────────────────────────────────────────────────────────────────

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Time allowed for connection establishment plus the join handshake.
    pub connect_timeout: Duration,
    /// Maximum operations held while disconnected.
    pub pending_queue_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            pending_queue_size: 10_000,
        }
    }
}

/// Connection lifecycle. `Connecting` falls back to `Disconnected` on
/// timeout or transport error instead of reaching `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events surfaced to the owning application, in receive order.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Join handshake completed.
    Connected,
    /// Connection is gone; roster and version have been cleared.
    Disconnected { reason: String },
    /// A remote participant's operation was committed.
    DocumentUpdated {
        operation: Operation,
        version: u64,
        user_id: Uuid,
    },
    /// A participant joined the session.
    UserJoined(ParticipantInfo),
    /// A participant left the session.
    UserLeft(Uuid),
    /// A remote participant moved their cursor.
    CursorUpdated {
        user_id: Uuid,
        cursor: Option<CursorPosition>,
    },
    /// Advisory: our last submission carried a stale version.
    Conflict(ConflictNotice),
    /// The host rejected our operation; it was not committed.
    UpdateRejected { reason: String },
    /// The host stopped the session.
    SessionEnded,
}

/// Client-side failures, split so the UI can react differently to
/// "could not reach host" and "host rejected the handshake".
#[derive(Debug, Clone)]
pub enum ClientError {
    /// Connection establishment or handshake exceeded the timeout.
    Timeout,
    /// The transport could not reach the host at all.
    ConnectionFailed(String),
    /// The host was reachable but the handshake did not complete.
    HandshakeFailed(String),
    /// The host does not know the requested session id.
    SessionNotFound,
    /// The session's participant cap is reached.
    SessionFull,
    /// Operation attempted while not connected.
    NotConnected,
    Protocol(ProtocolError),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "Connection attempt timed out"),
            Self::ConnectionFailed(e) => write!(f, "Could not reach host: {e}"),
            Self::HandshakeFailed(e) => write!(f, "Handshake failed: {e}"),
            Self::SessionNotFound => write!(f, "Host rejected join: no such session"),
            Self::SessionFull => write!(f, "Host rejected join: session is full"),
            Self::NotConnected => write!(f, "Not connected to a session"),
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

// ───────────────────────────────────────────────────────────────────
// Pending queue
// ───────────────────────────────────────────────────────────────────

/// Operations authored while disconnected, replayed FIFO on reconnect.
///
/// Each queued operation was already applied to the local working copy
/// at authoring time; the queue only owes the host a transmission.
pub struct PendingQueue {
    queue: VecDeque<Operation>,
    max_size: usize,
}

impl PendingQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an operation for later transmission.
    pub fn enqueue(&mut self, op: Operation) -> bool {
        if self.queue.len() >= self.max_size {
            return false; // Queue full
        }
        self.queue.push_back(op);
        true
    }

    /// Drain all queued operations in authoring order.
    pub fn drain(&mut self) -> Vec<Operation> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

// ───────────────────────────────────────────────────────────────────
// Client
// ───────────────────────────────────────────────────────────────────

/// Connection-scoped state shared with the reader task.
struct Shared {
    state: RwLock<ConnectionState>,
    document: RwLock<Document>,
    version: RwLock<u64>,
    roster: RwLock<HashMap<Uuid, ParticipantInfo>>,
    participant_id: RwLock<Option<Uuid>>,
    session_id: RwLock<Option<Uuid>>,
}

impl Shared {
    /// Tear down connection state exactly once and notify the owner.
    async fn teardown(&self, event_tx: &mpsc::Sender<ClientEvent>, reason: &str) {
        {
            let mut state = self.state.write().await;
            if *state == ConnectionState::Disconnected {
                return;
            }
            *state = ConnectionState::Disconnected;
        }
        *self.version.write().await = 0;
        self.roster.write().await.clear();
        *self.participant_id.write().await = None;
        *self.session_id.write().await = None;
        let _ = event_tx
            .send(ClientEvent::Disconnected {
                reason: reason.to_string(),
            })
            .await;
    }
}

/// The collaboration client.
pub struct CollabClient {
    user: UserInfo,
    config: ClientConfig,
    shared: Arc<Shared>,
    pending: Arc<Mutex<PendingQueue>>,
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_tx: mpsc::Sender<ClientEvent>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
}

impl CollabClient {
    pub fn new(user: UserInfo) -> Self {
        Self::with_config(user, ClientConfig::default())
    }

    pub fn with_config(user: UserInfo, config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let pending_size = config.pending_queue_size;
        Self {
            user,
            config,
            shared: Arc::new(Shared {
                state: RwLock::new(ConnectionState::Disconnected),
                document: RwLock::new(Document::default()),
                version: RwLock::new(0),
                roster: RwLock::new(HashMap::new()),
                participant_id: RwLock::new(None),
                session_id: RwLock::new(None),
            }),
            pending: Arc::new(Mutex::new(PendingQueue::new(pending_size))),
            outgoing_tx: None,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect to a host and join a session.
    ///
    /// The whole sequence — TCP + WebSocket establishment and the join
    /// handshake — runs under `config.connect_timeout`; on expiry the
    /// half-open transport is dropped and [`ClientError::Timeout`] is
    /// returned, distinct from [`ClientError::ConnectionFailed`] (the
    /// host was unreachable) and from the structured rejections
    /// ([`ClientError::SessionNotFound`] / [`ClientError::SessionFull`]).
    ///
    /// On success, spawns the reader/writer tasks and replays any
    /// operations queued while disconnected.
    pub async fn connect(
        &mut self,
        host: &str,
        port: u16,
        session_id: Uuid,
    ) -> Result<JoinAck, ClientError> {
        *self.shared.state.write().await = ConnectionState::Connecting;

        let result = timeout(
            self.config.connect_timeout,
            self.handshake(host, port, session_id),
        )
        .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(_) => {
                *self.shared.state.write().await = ConnectionState::Disconnected;
                return Err(ClientError::Timeout);
            }
        };

        let (ack, ws_stream) = match outcome {
            Ok(pair) => pair,
            Err(e) => {
                *self.shared.state.write().await = ConnectionState::Disconnected;
                return Err(e);
            }
        };

        // Adopt the snapshot.
        *self.shared.document.write().await = ack.document.clone();
        *self.shared.version.write().await = ack.version;
        *self.shared.roster.write().await =
            ack.users.iter().map(|u| (u.id, u.clone())).collect();
        *self.shared.participant_id.write().await = Some(ack.user_id);
        *self.shared.session_id.write().await = Some(session_id);

        let (ws_writer, ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel to the socket.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            let mut writer = ws_writer;
            while let Some(data) = out_rx.recv().await {
                if writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            // Channel gone — tell the host we are leaving.
            let _ = writer.send(Message::Close(None)).await;
        });

        // Reader task: decode frames into events and keep the local
        // copy converged.
        let shared = self.shared.clone();
        let event_tx = self.event_tx.clone();
        let own_id = ack.user_id;
        tokio::spawn(async move {
            let mut reader = ws_reader;
            let mut reason = "connection closed".to_string();
            while let Some(msg) = reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match WireMessage::decode(&bytes) {
                            Ok(wire) => {
                                if handle_frame(&shared, &event_tx, own_id, wire).await {
                                    reason = "session ended".to_string();
                                    break;
                                }
                            }
                            Err(e) => log::warn!("Failed to decode frame: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        reason = e.to_string();
                        break;
                    }
                    _ => {}
                }
            }
            shared.teardown(&event_tx, &reason).await;
        });

        *self.shared.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;

        // Replay operations authored while disconnected, oldest first.
        let queued = self.pending.lock().await.drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued operations", queued.len());
            for op in queued {
                self.transmit(op).await;
            }
        }

        Ok(ack)
    }

    /// Connection establishment + join handshake (run under the
    /// connect timeout).
    async fn handshake(
        &self,
        host: &str,
        port: u16,
        session_id: Uuid,
    ) -> Result<(JoinAck, WsStream), ClientError> {
        let url = format!("ws://{host}:{port}");
        let (mut ws_stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;

        let join = WireMessage::join_session(session_id, &self.user);
        ws_stream
            .send(Message::Binary(join.encode()?.into()))
            .await
            .map_err(|e| ClientError::HandshakeFailed(e.to_string()))?;

        // The first binary frame the host sends is the verdict.
        while let Some(msg) = ws_stream.next().await {
            let msg = msg.map_err(|e| ClientError::HandshakeFailed(e.to_string()))?;
            let Message::Binary(data) = msg else { continue };
            let bytes: Vec<u8> = data.into();
            let wire = WireMessage::decode(&bytes)?;
            match wire.msg_type {
                MessageType::SessionJoined => {
                    let ack: JoinAck = wire.payload_as(MessageType::SessionJoined)?;
                    return Ok((ack, ws_stream));
                }
                MessageType::JoinRejected => {
                    let reject: JoinReject = wire.payload_as(MessageType::JoinRejected)?;
                    return Err(match reject.reason {
                        JoinRejectReason::SessionNotFound => ClientError::SessionNotFound,
                        JoinRejectReason::SessionFull => ClientError::SessionFull,
                    });
                }
                other => {
                    log::debug!("Ignoring pre-join frame: {other:?}");
                }
            }
        }
        Err(ClientError::HandshakeFailed(
            "connection closed during handshake".to_string(),
        ))
    }

    /// Submit an operation.
    ///
    /// Two-phase optimistic apply: the local working copy is mutated
    /// immediately, then the operation is transmitted tagged with the
    /// current known version. Returns true when it was transmitted now,
    /// false when it was queued for replay after the next `connect`.
    pub async fn send_update(&self, operation: Operation) -> bool {
        // Phase 1: local apply. The host remains authoritative — a
        // rejection comes back as UpdateRejected and a later broadcast
        // overwrites whatever we did here.
        if let Err(e) = self.shared.document.write().await.apply(&operation) {
            log::warn!("Optimistic local apply failed: {e}");
        }

        if *self.shared.state.read().await != ConnectionState::Connected {
            let mut pending = self.pending.lock().await;
            if !pending.enqueue(operation) {
                log::warn!("Pending queue full, dropping operation");
            }
            return false;
        }

        // Phase 2: transmit.
        self.transmit(operation).await
    }

    /// Encode and send one operation; queue it back on channel failure.
    async fn transmit(&self, operation: Operation) -> bool {
        let (session_id, sender, version) = (
            self.shared.session_id.read().await.unwrap_or(Uuid::nil()),
            self.shared.participant_id.read().await.unwrap_or(Uuid::nil()),
            *self.shared.version.read().await,
        );
        let request = UpdateRequest {
            operation: operation.clone(),
            version,
        };
        let msg = WireMessage::document_update(session_id, sender, &request);
        let encoded = match msg.encode() {
            Ok(e) => e,
            Err(e) => {
                log::error!("Failed to encode update: {e}");
                return false;
            }
        };

        match &self.outgoing_tx {
            Some(tx) => {
                if tx.send(encoded).await.is_err() {
                    let mut pending = self.pending.lock().await;
                    if !pending.enqueue(operation) {
                        log::warn!("Pending queue full, dropping operation");
                    }
                    false
                } else {
                    true
                }
            }
            None => {
                let mut pending = self.pending.lock().await;
                if !pending.enqueue(operation) {
                    log::warn!("Pending queue full, dropping operation");
                }
                false
            }
        }
    }

    /// Send a cursor update. Best-effort: silently a no-op while
    /// disconnected.
    pub async fn send_cursor_update(
        &self,
        cursor: Option<CursorPosition>,
    ) -> Result<(), ClientError> {
        if *self.shared.state.read().await != ConnectionState::Connected {
            return Ok(());
        }
        let (session_id, sender) = (
            self.shared.session_id.read().await.unwrap_or(Uuid::nil()),
            self.shared.participant_id.read().await.unwrap_or(Uuid::nil()),
        );
        let msg = WireMessage::cursor_update(session_id, sender, cursor);
        if let Some(tx) = &self.outgoing_tx {
            let _ = tx.send(msg.encode()?).await;
        }
        Ok(())
    }

    /// Send a heartbeat ping.
    pub async fn send_ping(&self) -> Result<(), ClientError> {
        let sender = self.shared.participant_id.read().await.unwrap_or(Uuid::nil());
        let msg = WireMessage::ping(sender);
        match &self.outgoing_tx {
            Some(tx) => {
                tx.send(msg.encode()?)
                    .await
                    .map_err(|_| ClientError::NotConnected)?;
                Ok(())
            }
            None => Err(ClientError::NotConnected),
        }
    }

    /// Drop the connection. Queued operations survive for the next
    /// `connect`; there is no automatic reconnect.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None; // Closes the writer task, then the socket
        self.shared
            .teardown(&self.event_tx, "disconnected by client")
            .await;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    /// The host-assigned participant id, while connected.
    pub async fn participant_id(&self) -> Option<Uuid> {
        *self.shared.participant_id.read().await
    }

    /// Current adopted version.
    pub async fn version(&self) -> u64 {
        *self.shared.version.read().await
    }

    /// Snapshot of the local working copy.
    pub async fn document(&self) -> Document {
        self.shared.document.read().await.clone()
    }

    /// Known participants, while connected.
    pub async fn participants(&self) -> Vec<ParticipantInfo> {
        self.shared.roster.read().await.values().cloned().collect()
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Throw away operations queued while disconnected.
    pub async fn discard_pending(&self) {
        self.pending.lock().await.clear();
    }

    pub fn user(&self) -> &UserInfo {
        &self.user
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Apply one incoming frame. Returns true when the session ended and
/// the reader should stop.
async fn handle_frame(
    shared: &Shared,
    event_tx: &mpsc::Sender<ClientEvent>,
    own_id: Uuid,
    wire: WireMessage,
) -> bool {
    match wire.msg_type {
        MessageType::DocumentUpdated => {
            // Own operations were applied optimistically at submission;
            // the host never echoes them, and any that arrive anyway
            // must not be applied twice.
            if wire.sender == own_id {
                return false;
            }
            let Ok(update) = wire.payload_as::<UpdateBroadcast>(MessageType::DocumentUpdated)
            else {
                log::warn!("Malformed document-updated payload");
                return false;
            };

            // Version gate: duplicates and reordered frames are ignored.
            let mut version = shared.version.write().await;
            if update.version <= *version {
                log::debug!(
                    "Ignoring stale broadcast v{} (at v{})",
                    update.version,
                    *version
                );
                return false;
            }
            if let Err(e) = shared.document.write().await.apply(&update.operation) {
                log::warn!("Failed to apply remote operation: {e}");
            }
            *version = update.version;
            drop(version);

            let _ = event_tx
                .send(ClientEvent::DocumentUpdated {
                    operation: update.operation,
                    version: update.version,
                    user_id: update.user_id,
                })
                .await;
        }

        MessageType::UserJoined => {
            if let Ok(info) = wire.payload_as::<ParticipantInfo>(MessageType::UserJoined) {
                shared.roster.write().await.insert(info.id, info.clone());
                let _ = event_tx.send(ClientEvent::UserJoined(info)).await;
            }
        }

        MessageType::UserLeft => {
            if let Ok(notice) = wire.payload_as::<UserLeftNotice>(MessageType::UserLeft) {
                shared.roster.write().await.remove(&notice.user_id);
                let _ = event_tx.send(ClientEvent::UserLeft(notice.user_id)).await;
            }
        }

        MessageType::CursorUpdated => {
            if let Ok(update) = wire.payload_as::<CursorBroadcast>(MessageType::CursorUpdated) {
                if update.user_id == own_id {
                    return false;
                }
                if let Some(info) = shared.roster.write().await.get_mut(&update.user_id) {
                    info.cursor = update.cursor.clone();
                }
                let _ = event_tx
                    .send(ClientEvent::CursorUpdated {
                        user_id: update.user_id,
                        cursor: update.cursor,
                    })
                    .await;
            }
        }

        MessageType::Conflict => {
            if let Ok(notice) = wire.payload_as::<ConflictNotice>(MessageType::Conflict) {
                let _ = event_tx.send(ClientEvent::Conflict(notice)).await;
            }
        }

        MessageType::UpdateRejected => {
            if let Ok(reject) = wire.payload_as::<UpdateReject>(MessageType::UpdateRejected) {
                let _ = event_tx
                    .send(ClientEvent::UpdateRejected {
                        reason: reject.reason,
                    })
                    .await;
            }
        }

        MessageType::SessionEnded => {
            let _ = event_tx.send(ClientEvent::SessionEnded).await;
            return true;
        }

        MessageType::Pong => {
            log::trace!("Heartbeat pong");
        }

        other => {
            log::debug!("Unhandled message type: {other:?}");
        }
    }
    false
}
