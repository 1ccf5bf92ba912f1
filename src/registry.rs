//! Bookkeeping of all sessions hosted by this process.
//!
//! The registry is constructed at process start and injected into the
//! host, the control-plane surface, and the advertiser — it is never a
//! global. One `RwLock` around the session map is the single mutual-
//! exclusion point for session creation and removal; everything inside a
//! session is guarded by that session's own lock.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::document::Document;
use crate::protocol::SessionMetadata;
use crate::session::{Session, SessionDescriptor};

/// Default per-session broadcast buffer (frames per receiver).
pub const DEFAULT_BROADCAST_CAPACITY: usize = 256;
/// Default participant cap per session.
pub const DEFAULT_MAX_PARTICIPANTS: usize = 100;

/// Registry of sessions hosted by this process.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
    broadcast_capacity: usize,
    max_participants: usize,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_PARTICIPANTS, DEFAULT_BROADCAST_CAPACITY)
    }

    pub fn with_limits(max_participants: usize, broadcast_capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            broadcast_capacity,
            max_participants,
        }
    }

    /// Create and register a session around an independent copy of
    /// `document`. Version starts at 0. No network listener is opened
    /// here — serving connections is the host's job.
    pub async fn create_session(
        &self,
        document: Document,
        metadata: SessionMetadata,
    ) -> Arc<Session> {
        let session = Arc::new(Session::new(
            document,
            metadata,
            self.max_participants,
            self.broadcast_capacity,
        ));
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.id(), session.clone());
        log::info!(
            "Created session {} ({:?}), {} active",
            session.id(),
            session.metadata().name,
            sessions.len()
        );
        session
    }

    /// Stop a session: notify connected participants, then drop it from
    /// the registry. Idempotent — stopping an unknown id returns false
    /// and is otherwise a no-op.
    pub async fn stop_session(&self, session_id: Uuid) -> bool {
        let removed = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(&session_id)
        };
        match removed {
            Some(session) => {
                session.end().await;
                log::info!("Stopped session {session_id}");
                true
            }
            None => false,
        }
    }

    /// The live session object (host path). `None` for unknown ids.
    pub async fn get(&self, session_id: Uuid) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&session_id).cloned()
    }

    /// Descriptor with the live participant roster, or `None`.
    pub async fn get_session(&self, session_id: Uuid) -> Option<SessionDescriptor> {
        let session = self.get(session_id).await?;
        Some(session.descriptor().await)
    }

    /// Descriptors of every hosted session; no document payloads.
    pub async fn list_sessions(&self) -> Vec<SessionDescriptor> {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        let mut descriptors = Vec::with_capacity(sessions.len());
        for session in sessions {
            descriptors.push(session.descriptor().await);
        }
        descriptors
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
