//! Wire protocol for session transport events.
//!
//! Every frame is a bincode-encoded envelope:
//! ```text
//! ┌──────────┬────────────┬───────────┬──────────┐
//! │ msg_type │ session_id │ sender    │ payload  │
//! │ 1 byte   │ 16 bytes   │ 16 bytes  │ variable │
//! └──────────┴────────────┴───────────┴──────────┘
//! ```
//!
//! `sender` is the originating participant id (`Uuid::nil()` when the
//! host itself originates a frame). Payloads carry arbitrary document
//! values, so they are serde_json-encoded — JSON is self-describing,
//! which `serde_json::Value` requires on the decode side.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::{Document, Operation};
use crate::presence::{CursorColor, CursorPosition};

/// Transport event discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// C→H: join handshake request
    JoinSession = 1,
    /// H→C: join handshake success (snapshot + assigned id)
    SessionJoined = 2,
    /// H→C: join handshake structured failure
    JoinRejected = 3,
    /// C→H: submit an operation
    DocumentUpdate = 4,
    /// H→C: committed operation broadcast
    DocumentUpdated = 5,
    /// H→C: operation rejected, author only
    UpdateRejected = 6,
    /// H→C: a participant joined
    UserJoined = 7,
    /// H→C: a participant left
    UserLeft = 8,
    /// C→H: cursor/focus update
    CursorUpdate = 9,
    /// H→C: cursor/focus broadcast
    CursorUpdated = 10,
    /// H→C: advisory stale-version notice, submitter only
    Conflict = 11,
    /// H→C: session stopped by its host
    SessionEnded = 12,
    /// Heartbeat ping
    Ping = 13,
    /// Heartbeat pong
    Pong = 14,
}

/// Display identity a joining user supplies. The host assigns everything
/// else (id, color).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
}

impl UserInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A session participant as seen on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub id: Uuid,
    pub name: String,
    pub color: CursorColor,
    pub cursor: Option<CursorPosition>,
}

impl ParticipantInfo {
    /// Build a participant with a freshly assigned id and stable color.
    pub fn assign(name: impl Into<String>) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            name: name.into(),
            color: CursorColor::from_uuid(id),
            cursor: None,
        }
    }
}

/// Session display metadata, fixed at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub name: String,
    pub host_name: String,
    pub document_type: String,
}

/// C→H join handshake payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub user: UserInfo,
}

/// H→C join handshake success payload.
///
/// `user_id` is the host-assigned participant id; the client needs it to
/// filter its own operations out of the broadcast stream. Document and
/// version are mutually consistent: the document reflects exactly the
/// operations up to `version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinAck {
    pub user_id: Uuid,
    pub document: Document,
    pub version: u64,
    pub users: Vec<ParticipantInfo>,
    pub metadata: SessionMetadata,
}

/// Why a join was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinRejectReason {
    SessionNotFound,
    SessionFull,
}

/// H→C join handshake structured failure payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinReject {
    pub reason: JoinRejectReason,
    pub message: String,
}

/// C→H operation submission payload. `version` is the version the client
/// believed current at submission time — informational, used only to
/// decide whether a `Conflict` notice goes back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub operation: Operation,
    pub version: u64,
}

/// H→C committed operation broadcast payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateBroadcast {
    pub operation: Operation,
    pub version: u64,
    pub user_id: Uuid,
}

/// H→C rejection payload, sent to the author only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateReject {
    pub reason: String,
}

/// H→C advisory notice that a submission carried a stale version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictNotice {
    pub expected_version: u64,
    pub received_version: u64,
}

/// C→H cursor payload. `None` clears the focus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorRequest {
    pub cursor: Option<CursorPosition>,
}

/// H→C cursor broadcast payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorBroadcast {
    pub user_id: Uuid,
    pub cursor: Option<CursorPosition>,
}

/// H→C participant-left payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLeftNotice {
    pub user_id: Uuid,
}

/// H→C session-stopped payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEndedNotice {
    pub session_id: Uuid,
}

/// Top-level wire envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub msg_type: MessageType,
    pub session_id: Uuid,
    pub sender: Uuid,
    pub payload: Vec<u8>,
}

impl WireMessage {
    fn with_payload<T: Serialize>(
        msg_type: MessageType,
        session_id: Uuid,
        sender: Uuid,
        payload: &T,
    ) -> Self {
        Self {
            msg_type,
            session_id,
            sender,
            payload: serde_json::to_vec(payload).unwrap_or_default(),
        }
    }

    /// C→H join handshake.
    pub fn join_session(session_id: Uuid, user: &UserInfo) -> Self {
        Self::with_payload(
            MessageType::JoinSession,
            session_id,
            Uuid::nil(),
            &JoinRequest { user: user.clone() },
        )
    }

    /// H→C join success.
    pub fn session_joined(session_id: Uuid, ack: &JoinAck) -> Self {
        Self::with_payload(MessageType::SessionJoined, session_id, Uuid::nil(), ack)
    }

    /// H→C join failure.
    pub fn join_rejected(session_id: Uuid, reason: JoinRejectReason, message: impl Into<String>) -> Self {
        Self::with_payload(
            MessageType::JoinRejected,
            session_id,
            Uuid::nil(),
            &JoinReject {
                reason,
                message: message.into(),
            },
        )
    }

    /// C→H operation submission.
    pub fn document_update(session_id: Uuid, sender: Uuid, request: &UpdateRequest) -> Self {
        Self::with_payload(MessageType::DocumentUpdate, session_id, sender, request)
    }

    /// H→C committed operation broadcast.
    pub fn document_updated(session_id: Uuid, broadcast: &UpdateBroadcast) -> Self {
        Self::with_payload(
            MessageType::DocumentUpdated,
            session_id,
            broadcast.user_id,
            broadcast,
        )
    }

    /// H→C operation rejection, author only.
    pub fn update_rejected(session_id: Uuid, reason: impl Into<String>) -> Self {
        Self::with_payload(
            MessageType::UpdateRejected,
            session_id,
            Uuid::nil(),
            &UpdateReject {
                reason: reason.into(),
            },
        )
    }

    /// H→C participant joined.
    pub fn user_joined(session_id: Uuid, info: &ParticipantInfo) -> Self {
        Self::with_payload(MessageType::UserJoined, session_id, info.id, info)
    }

    /// H→C participant left.
    pub fn user_left(session_id: Uuid, user_id: Uuid) -> Self {
        Self::with_payload(
            MessageType::UserLeft,
            session_id,
            user_id,
            &UserLeftNotice { user_id },
        )
    }

    /// C→H cursor update.
    pub fn cursor_update(session_id: Uuid, sender: Uuid, cursor: Option<CursorPosition>) -> Self {
        Self::with_payload(
            MessageType::CursorUpdate,
            session_id,
            sender,
            &CursorRequest { cursor },
        )
    }

    /// H→C cursor broadcast.
    pub fn cursor_updated(session_id: Uuid, user_id: Uuid, cursor: Option<CursorPosition>) -> Self {
        Self::with_payload(
            MessageType::CursorUpdated,
            session_id,
            user_id,
            &CursorBroadcast { user_id, cursor },
        )
    }

    /// H→C advisory stale-version notice.
    pub fn conflict(session_id: Uuid, notice: ConflictNotice) -> Self {
        Self::with_payload(MessageType::Conflict, session_id, Uuid::nil(), &notice)
    }

    /// H→C session stopped.
    pub fn session_ended(session_id: Uuid) -> Self {
        Self::with_payload(
            MessageType::SessionEnded,
            session_id,
            Uuid::nil(),
            &SessionEndedNotice { session_id },
        )
    }

    /// Heartbeat ping.
    pub fn ping(sender: Uuid) -> Self {
        Self {
            msg_type: MessageType::Ping,
            session_id: Uuid::nil(),
            sender,
            payload: Vec::new(),
        }
    }

    /// Heartbeat pong.
    pub fn pong(sender: Uuid) -> Self {
        Self {
            msg_type: MessageType::Pong,
            session_id: Uuid::nil(),
            sender,
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Decode the payload, checking the message type first.
    pub fn payload_as<T: DeserializeOwned>(&self, expected: MessageType) -> Result<T, ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::InvalidMessageType);
        }
        serde_json::from_slice(&self.payload)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
        }
    }
}

impl std::error::Error for ProtocolError {}
