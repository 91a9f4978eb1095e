//! RTSP session management (RFC 2326 §3, §12.37).
//!
//! A session is one client's protocol state. Readers are created by SETUP,
//! publishers by ANNOUNCE. Both are destroyed by TEARDOWN or when their
//! connection goes away.
//!
//! ## Session lifecycle (RFC 2326 §A.1)
//!
//! ```text
//! Reader:     SETUP -> Ready -> PLAY -> Playing <-> Paused
//! Publisher:  ANNOUNCE -> Announced -> SETUP -> PreRecord -> RECORD -> Recording
//! TEARDOWN / disconnect -> (removed)
//! ```

pub mod transport;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::stream::SharedStream;
pub use transport::Transport;

/// Default session timeout in seconds (RFC 2326 §12.37).
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Reader,
    Publisher,
}

/// RTSP session state machine (RFC 2326 §A.1, §A.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Reader set up, not yet playing.
    Ready,
    Playing,
    Paused,
    /// Publisher whose SDP has been accepted.
    Announced,
    /// Publisher with at least one track set up.
    PreRecord,
    /// Publisher packets are being forwarded.
    Recording,
}

/// A single RTSP session (RFC 2326 §3).
///
/// Interior mutability via `RwLock` allows shared references across threads.
pub struct Session {
    /// Unique session identifier (16-char hex string).
    pub id: String,
    pub role: SessionRole,
    /// Session timeout in seconds (included in the `Session` response header).
    pub timeout_secs: u64,
    state: RwLock<SessionState>,
    transport: RwLock<Option<Transport>>,
    /// The stream this session reads from or publishes to.
    stream: RwLock<Option<Arc<SharedStream>>>,
}

impl Session {
    /// Create a session with a random 64-bit ID.
    pub fn new(role: SessionRole, timeout_secs: u64) -> Self {
        let state = match role {
            SessionRole::Reader => SessionState::Ready,
            SessionRole::Publisher => SessionState::Announced,
        };
        Session {
            id: format!("{:016X}", rand::random::<u64>()),
            role,
            timeout_secs,
            state: RwLock::new(state),
            transport: RwLock::new(None),
            stream: RwLock::new(None),
        }
    }

    /// Set the transport parameters (called during SETUP).
    pub fn set_transport(&self, transport: Transport) {
        tracing::debug!(session_id = %self.id, ?transport, "transport configured");
        *self.transport.write() = Some(transport);
    }

    /// Returns a clone of the transport parameters, if configured.
    pub fn get_transport(&self) -> Option<Transport> {
        self.transport.read().clone()
    }

    /// Transition to a new state.
    pub fn set_state(&self, state: SessionState) {
        tracing::debug!(session_id = %self.id, old_state = ?*self.state.read(), new_state = ?state, "state transition");
        *self.state.write() = state;
    }

    pub fn get_state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn is_playing(&self) -> bool {
        *self.state.read() == SessionState::Playing
    }

    pub fn attach_stream(&self, stream: Arc<SharedStream>) {
        *self.stream.write() = Some(stream);
    }

    pub fn stream(&self) -> Option<Arc<SharedStream>> {
        self.stream.read().clone()
    }

    /// Detach from the stream, removing this session as a reader.
    pub fn detach(&self) -> Option<Arc<SharedStream>> {
        let stream = self.stream.write().take();
        if let Some(stream) = &stream
            && self.role == SessionRole::Reader
        {
            stream.remove_reader(&self.id);
        }
        stream
    }

    /// Format the `Session` response header value per RFC 2326 §12.37.
    ///
    /// Example: `"8F3A00C2D1E94B07;timeout=60"`
    pub fn session_header_value(&self) -> String {
        format!("{};timeout={}", self.id, self.timeout_secs)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.get_state())
            .field("transport", &self.get_transport())
            .finish()
    }
}

/// Thread-safe registry of active sessions.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    timeout_secs: u64,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_SESSION_TIMEOUT_SECS)
    }

    pub fn with_timeout(timeout_secs: u64) -> Self {
        SessionManager {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            timeout_secs,
        }
    }

    /// Create and register a new session.
    pub fn create_session(&self, role: SessionRole) -> Arc<Session> {
        let session = Arc::new(Session::new(role, self.timeout_secs));
        let total = {
            let mut sessions = self.sessions.write();
            sessions.insert(session.id.clone(), session.clone());
            sessions.len()
        };
        tracing::debug!(session_id = %session.id, ?role, total_sessions = total, "session created");
        session
    }

    /// Look up a session by ID.
    pub fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    /// Remove and return a session by ID (used by TEARDOWN).
    pub fn remove_session(&self, id: &str) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write();
        let removed = sessions.remove(id);
        if removed.is_some() {
            tracing::debug!(session_id = %id, total_sessions = sessions.len(), "session removed");
        }
        removed
    }

    /// Remove multiple sessions at once (used during disconnect cleanup).
    pub fn remove_sessions(&self, ids: &[String]) -> Vec<Arc<Session>> {
        let mut sessions = self.sessions.write();
        let removed: Vec<_> = ids.iter().filter_map(|id| sessions.remove(id)).collect();
        if !removed.is_empty() {
            tracing::debug!(removed = removed.len(), remaining = sessions.len(), "batch session cleanup");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
