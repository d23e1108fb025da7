//! Session bookkeeping
//!
//! Every proxied connection gets a [`SessionId`] and an entry in a
//! [`SessionRegistry`] for as long as it lives. The registry is the single
//! place a session is finished, and it lets other tasks wait for a session to
//! reach its terminal state without polling.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tracing::{debug, trace};

/// Longest correlation id accepted from a peer
const MAX_ID_LEN: usize = 64;

/// Opaque correlation id, unique for the lifetime of a session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Accept an id received from a peer.
    ///
    /// Ids are opaque, but they travel inside `id|COMMAND|payload` records, so
    /// they must be non-empty and free of separators.
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= MAX_ID_LEN
            && !raw.contains(['|', '\n', '\r']);
        valid.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 characters, for log lines
    pub fn short(&self) -> &str {
        let end = self.0.char_indices().nth(8).map_or(self.0.len(), |(i, _)| i);
        &self.0[..end]
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session state, following the SOCKS5 front-end lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the method negotiation
    AwaitGreeting,
    /// "No authentication" selected
    AuthSelected,
    /// Waiting for the request header
    AwaitRequest,
    /// Target address parsed
    AddressParsed,
    /// Egress being established
    Connecting,
    /// Bytes flowing in both directions
    Relaying,
    /// Finished, all streams closed
    Closed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        self == SessionState::Closed
    }
}

/// Snapshot of a registered session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    /// Who opened the session (peer address or link description)
    pub peer: String,
    /// Target, once known
    pub target: Option<String>,
    pub state: SessionState,
    pub created_at: Instant,
}

struct Entry {
    info: SessionInfo,
    state_tx: watch::Sender<SessionState>,
}

/// Registry of live sessions, guarded by one lock that is never held across I/O
pub struct SessionRegistry {
    label: &'static str,
    sessions: Mutex<HashMap<SessionId, Entry>>,
}

impl SessionRegistry {
    /// Create a registry; `label` tags its log lines
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new session and return its id
    pub async fn open(&self, peer: impl Into<String>, state: SessionState) -> SessionId {
        let id = SessionId::generate();
        let (state_tx, _) = watch::channel(state);
        let info = SessionInfo {
            id: id.clone(),
            peer: peer.into(),
            target: None,
            state,
            created_at: Instant::now(),
        };

        trace!("[{}] session {} opened from {}", self.label, id.short(), info.peer);
        self.sessions
            .lock()
            .await
            .insert(id.clone(), Entry { info, state_tx });
        id
    }

    /// Move a session to a new state. Returns false if it is no longer registered.
    pub async fn set_state(&self, id: &SessionId, state: SessionState) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(id) {
            Some(entry) => {
                trace!(
                    "[{}] session {}: {:?} -> {:?}",
                    self.label,
                    id.short(),
                    entry.info.state,
                    state
                );
                entry.info.state = state;
                entry.state_tx.send_replace(state);
                true
            }
            None => false,
        }
    }

    /// Record the target a session is heading to
    pub async fn set_target(&self, id: &SessionId, target: impl Into<String>) {
        if let Some(entry) = self.sessions.lock().await.get_mut(id) {
            entry.info.target = Some(target.into());
        }
    }

    pub async fn get(&self, id: &SessionId) -> Option<SessionInfo> {
        self.sessions.lock().await.get(id).map(|e| e.info.clone())
    }

    pub async fn snapshot(&self) -> Vec<SessionInfo> {
        self.sessions
            .lock()
            .await
            .values()
            .map(|e| e.info.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Finish a session: mark it closed, wake its waiters and remove it.
    ///
    /// Returns true the first time; later calls for the same id do nothing.
    pub async fn finish(&self, id: &SessionId) -> bool {
        let entry = self.sessions.lock().await.remove(id);
        match entry {
            Some(entry) => {
                entry.state_tx.send_replace(SessionState::Closed);
                debug!(
                    "[{}] session {} finished after {:?}",
                    self.label,
                    id.short(),
                    entry.info.created_at.elapsed()
                );
                true
            }
            None => false,
        }
    }

    /// Wait until a session is closed.
    ///
    /// Returns true if it closed (or was never registered) within `timeout`.
    pub async fn wait_closed(&self, id: &SessionId, timeout: Duration) -> bool {
        let rx = match self.sessions.lock().await.get(id) {
            Some(entry) => entry.state_tx.subscribe(),
            None => return true,
        };
        wait_terminal(rx, timeout).await
    }

    /// Wait for every currently registered session to close.
    ///
    /// Returns the number of sessions still open when `timeout` elapsed.
    pub async fn drain(&self, timeout: Duration) -> usize {
        let receivers: Vec<_> = self
            .sessions
            .lock()
            .await
            .values()
            .map(|e| e.state_tx.subscribe())
            .collect();

        let deadline = tokio::time::Instant::now() + timeout;
        for rx in receivers {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if !wait_terminal(rx, remaining).await {
                break;
            }
        }
        self.len().await
    }
}

async fn wait_terminal(mut rx: watch::Receiver<SessionState>, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, rx.wait_for(|s| s.is_terminal())).await {
        Ok(_) => true,
        Err(_) => false,
    }
}
