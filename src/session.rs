//! The authoritative per-session actor.
//!
//! A [`Session`] exclusively owns one shared document. Every mutation —
//! join, commit, leave, presence — happens under a single write lock
//! with no await points inside, so operations for a session are applied
//! and broadcast in exactly one total order. That total order of writes
//! per session is the sole consistency guarantee of the system; there is
//! no merge logic beyond sequential last-writer-wins.
//!
//! Commits broadcast while the lock is still held: a tokio broadcast
//! send is synchronous, and releasing the lock first would let two
//! commits swap their frame order relative to their version stamps.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::broadcast::BroadcastGroup;
use crate::document::{Document, Operation, OperationError};
use crate::presence::{CursorPosition, PresenceIndex};
use crate::protocol::{
    ConflictNotice, JoinAck, ParticipantInfo, SessionMetadata, UpdateBroadcast, UserInfo,
    WireMessage,
};

/// Lightweight session description for browsing/control-plane calls.
/// Never carries the document payload.
#[derive(Debug, Clone)]
pub struct SessionDescriptor {
    pub session_id: Uuid,
    pub name: String,
    pub host_name: String,
    pub document_type: String,
    pub created_at_ms: u64,
    pub participants: Vec<ParticipantInfo>,
}

/// Why a join was refused by the session itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinError {
    SessionFull { max: usize },
}

impl std::fmt::Display for JoinError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SessionFull { max } => write!(f, "Session is full (max {max} participants)"),
        }
    }
}

impl std::error::Error for JoinError {}

/// Outcome of a committed operation.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitReceipt {
    /// The version assigned to this operation.
    pub version: u64,
    /// Advisory notice when the submitter's version was stale. The
    /// commit proceeded regardless; this only feeds a UI warning.
    pub conflict: Option<ConflictNotice>,
}

struct SessionState {
    document: Document,
    version: u64,
    participants: HashMap<Uuid, ParticipantInfo>,
    presence: PresenceIndex,
}

/// One shared-editing instance of a single document.
pub struct Session {
    id: Uuid,
    metadata: SessionMetadata,
    created_at_ms: u64,
    max_participants: usize,
    state: RwLock<SessionState>,
    broadcast: BroadcastGroup,
}

impl Session {
    /// Create a session around an independent copy of `document`.
    /// Version starts at 0. The id is a freshly generated random UUID.
    pub fn new(
        document: Document,
        metadata: SessionMetadata,
        max_participants: usize,
        broadcast_capacity: usize,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            metadata,
            created_at_ms: unix_millis(),
            max_participants,
            state: RwLock::new(SessionState {
                document,
                version: 0,
                participants: HashMap::new(),
                presence: PresenceIndex::new(),
            }),
            broadcast: BroadcastGroup::new(broadcast_capacity),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    /// Descriptor with the live participant roster.
    pub async fn descriptor(&self) -> SessionDescriptor {
        let state = self.state.read().await;
        SessionDescriptor {
            session_id: self.id,
            name: self.metadata.name.clone(),
            host_name: self.metadata.host_name.clone(),
            document_type: self.metadata.document_type.clone(),
            created_at_ms: self.created_at_ms,
            participants: state.participants.values().cloned().collect(),
        }
    }

    /// Add a participant and return a snapshot plus their broadcast
    /// receiver.
    ///
    /// Snapshot, roster insertion, and channel subscription happen under
    /// one write lock, so the returned document and version are mutually
    /// consistent and the receiver sees every frame committed after the
    /// snapshot — no gap, no overlap.
    pub async fn join(
        &self,
        user: &UserInfo,
    ) -> Result<(JoinAck, broadcast::Receiver<Arc<Vec<u8>>>), JoinError> {
        let mut state = self.state.write().await;
        if state.participants.len() >= self.max_participants {
            return Err(JoinError::SessionFull {
                max: self.max_participants,
            });
        }

        let info = ParticipantInfo::assign(&user.name);
        state.participants.insert(info.id, info.clone());
        let rx = self.broadcast.subscribe();

        let ack = JoinAck {
            user_id: info.id,
            document: state.document.clone(),
            version: state.version,
            users: state.participants.values().cloned().collect(),
            metadata: self.metadata.clone(),
        };

        self.send(WireMessage::user_joined(self.id, &info));
        log::info!(
            "Participant {} ({}) joined session {}",
            info.name,
            info.id,
            self.id
        );

        Ok((ack, rx))
    }

    /// Apply one operation to the authoritative document.
    ///
    /// On success the version advances by exactly 1 and the operation is
    /// broadcast stamped with the new version and its author. On failure
    /// nothing is broadcast and the version does not move — the error
    /// goes back to the author only.
    ///
    /// A stale `client_version` never blocks the commit; it only attaches
    /// an advisory [`ConflictNotice`] to the receipt.
    pub async fn commit(
        &self,
        user_id: Uuid,
        operation: Operation,
        client_version: u64,
    ) -> Result<CommitReceipt, OperationError> {
        let mut state = self.state.write().await;

        let conflict = (client_version != state.version).then(|| ConflictNotice {
            expected_version: state.version,
            received_version: client_version,
        });

        state.document.apply(&operation)?;
        state.version += 1;

        let broadcast = UpdateBroadcast {
            operation,
            version: state.version,
            user_id,
        };
        self.send(WireMessage::document_updated(self.id, &broadcast));
        log::debug!(
            "Session {} committed v{} from {}",
            self.id,
            state.version,
            user_id
        );

        Ok(CommitReceipt {
            version: state.version,
            conflict,
        })
    }

    /// Remove a participant, purge their presence entries, and notify
    /// the rest of the session. Unknown ids are a no-op.
    pub async fn leave(&self, user_id: Uuid) -> Option<ParticipantInfo> {
        let mut state = self.state.write().await;
        let info = state.participants.remove(&user_id)?;
        state.presence.remove(&user_id);

        self.send(WireMessage::user_left(self.id, user_id));
        log::info!("Participant {} left session {}", user_id, self.id);
        Some(info)
    }

    /// Store a participant's cursor and broadcast it to the others.
    ///
    /// Returns false when the update was dropped (unknown participant or
    /// older than the stored cursor). Presence is unversioned; the
    /// transport's per-connection delivery order is all the ordering
    /// there is.
    pub async fn update_presence(&self, user_id: Uuid, cursor: Option<CursorPosition>) -> bool {
        let mut state = self.state.write().await;
        if !state.participants.contains_key(&user_id) {
            return false;
        }

        let changed = state.presence.set(user_id, cursor);
        if changed {
            let stored = state.presence.cursor_of(&user_id).cloned();
            if let Some(info) = state.participants.get_mut(&user_id) {
                info.cursor = stored.clone();
            }
            self.send(WireMessage::cursor_updated(self.id, user_id, stored));
        }
        changed
    }

    /// Notify every participant that the session is over and clear the
    /// roster. The registry removes the session right after.
    pub async fn end(&self) {
        let mut state = self.state.write().await;
        self.send(WireMessage::session_ended(self.id));
        state.participants.clear();
        state.presence.clear();
        log::info!("Session {} ended", self.id);
    }

    /// Current version (for diagnostics and tests).
    pub async fn version(&self) -> u64 {
        self.state.read().await.version
    }

    /// Snapshot of the authoritative document.
    pub async fn document(&self) -> Document {
        self.state.read().await.document.clone()
    }

    pub async fn participant_count(&self) -> usize {
        self.state.read().await.participants.len()
    }

    /// Participants currently focused on a field (for diagnostics).
    pub async fn participants_on(&self, field_path: &str) -> Vec<Uuid> {
        self.state.read().await.presence.participants_on(field_path)
    }

    fn send(&self, msg: WireMessage) {
        if let Err(e) = self.broadcast.send(&msg) {
            log::error!("Session {}: failed to encode broadcast frame: {e}", self.id);
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
