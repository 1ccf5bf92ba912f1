//! # formsync — Collaborative document synchronization
//!
//! Shares a structured document from one participant (the host) with
//! others over a local network, and reconciles concurrent edits into a
//! single converged state using host-authoritative, version-stamped
//! operation broadcast with last-writer-wins semantics at the field
//! level. This is deliberately not a CRDT or operational-transform
//! engine — the host serializes all writes per session, and that total
//! order is the whole consistency story.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ CollabClient │ ◄─────────────────► │ SessionHost  │
//! │ (per user)   │    Binary Proto     │ (authority)  │
//! └──────┬───────┘                     └──────┬───────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌──────────────┐                     ┌──────────────┐
//! │ Local copy   │                     │ SessionRegistry
//! │ (cache)      │                     │  └─ Session ── Document + version
//! └──────────────┘                     │       └─ BroadcastGroup (fan-out)
//!                                      └──────┬───────┘
//!                                             │ UDP announcements
//!                                      ┌──────┴───────┐
//!                                      │ SessionAdvertiser / SessionDiscovery
//!                                      └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`document`] — document tree + set / array-insert / array-remove
//! - [`protocol`] — binary wire envelope (bincode) with JSON payloads
//! - [`broadcast`] — per-session fan-out with lagging-receiver stats
//! - [`session`] — the authoritative per-session actor
//! - [`registry`] — session lifecycle bookkeeping (create/stop/list/get)
//! - [`host`] — WebSocket host serving every registered session
//! - [`client`] — participant connection with optimistic local apply
//! - [`presence`] — ephemeral cursor / field-focus state
//! - [`discovery`] — UDP LAN session advertisement and browsing
//!
//! ## Flow
//!
//! A client connects and joins: the handshake returns the document
//! snapshot, its version, and the roster, all mutually consistent. The
//! client applies its own edits optimistically and submits them tagged
//! with the version it believes is current. The host applies each
//! operation to the authoritative copy under a per-session lock, bumps
//! the version by exactly one, and broadcasts the stamped operation to
//! every other participant; the submitter is never echoed. Stale
//! submissions still commit (last writer wins) — the submitter just gets
//! an advisory conflict notice.

pub mod broadcast;
pub mod client;
pub mod discovery;
pub mod document;
pub mod host;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod session;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use client::{
    ClientConfig, ClientError, ClientEvent, CollabClient, ConnectionState, PendingQueue,
};
pub use discovery::{
    Announcement, DiscoveredSession, DiscoveryConfig, SessionAdvertiser, SessionDiscovery,
    DEFAULT_DISCOVERY_PORT,
};
pub use document::{Document, Operation, OperationError};
pub use host::{HostConfig, HostStats, SessionHost};
pub use presence::{CursorColor, CursorPosition, PresenceIndex};
pub use protocol::{
    ConflictNotice, JoinAck, JoinRejectReason, MessageType, ParticipantInfo, ProtocolError,
    SessionMetadata, UserInfo, WireMessage,
};
pub use registry::SessionRegistry;
pub use session::{CommitReceipt, JoinError, Session, SessionDescriptor};
