//! Correlation id to session map for one multiplexed channel

use crate::proxy::Address;
use crate::session::SessionId;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::trace;

/// Answer to a pending CONNECT: bound address or the peer's reason
pub(crate) type OpenResult = Result<Address, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MuxSessionState {
    /// CONNECT sent, waiting for CONNECT_OK / CONNECT_ERR
    Connecting,
    /// DATA flows
    Relaying,
}

struct MuxSession {
    state: MuxSessionState,
    inbound: mpsc::Sender<Bytes>,
    pending: Option<oneshot::Sender<OpenResult>>,
}

/// Sessions of one channel, keyed by correlation id.
///
/// Every entry is connecting or relaying; an id is removed exactly once.
#[derive(Default)]
pub struct MuxRegistry {
    sessions: Mutex<HashMap<SessionId, MuxSession>>,
}

impl MuxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session we opened and are waiting on
    pub(crate) async fn insert_pending(
        &self,
        id: SessionId,
        inbound: mpsc::Sender<Bytes>,
        pending: oneshot::Sender<OpenResult>,
    ) -> bool {
        self.insert(
            id,
            MuxSession {
                state: MuxSessionState::Connecting,
                inbound,
                pending: Some(pending),
            },
        )
        .await
    }

    /// Claim the id of a CONNECT from the peer while its target is dialed.
    ///
    /// Returns false if the id is already taken, so a repeated CONNECT never
    /// dials twice.
    pub(crate) async fn reserve(&self, id: SessionId, inbound: mpsc::Sender<Bytes>) -> bool {
        self.insert(
            id,
            MuxSession {
                state: MuxSessionState::Connecting,
                inbound,
                pending: None,
            },
        )
        .await
    }

    /// Target of a reserved session reached; DATA may flow
    pub(crate) async fn set_relaying(&self, id: &SessionId) -> bool {
        match self.sessions.lock().await.get_mut(id) {
            Some(session) => {
                session.state = MuxSessionState::Relaying;
                true
            }
            None => false,
        }
    }

    async fn insert(&self, id: SessionId, session: MuxSession) -> bool {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&id) {
            return false;
        }
        sessions.insert(id, session);
        true
    }

    /// Deliver the answer to a pending CONNECT.
    ///
    /// Success moves the session to relaying; failure removes it. Returns
    /// false if no CONNECT was pending under `id`.
    pub(crate) async fn resolve(&self, id: &SessionId, result: OpenResult) -> bool {
        let pending = {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.get_mut(id) else {
                return false;
            };
            let Some(pending) = session.pending.take() else {
                return false;
            };
            if result.is_ok() {
                session.state = MuxSessionState::Relaying;
            } else {
                sessions.remove(id);
            }
            pending
        };
        // The opener may have timed out already
        let _ = pending.send(result);
        true
    }

    /// Inbound queue of a relaying session
    pub(crate) async fn inbound(&self, id: &SessionId) -> Option<mpsc::Sender<Bytes>> {
        self.sessions
            .lock()
            .await
            .get(id)
            .filter(|s| s.state == MuxSessionState::Relaying)
            .map(|s| s.inbound.clone())
    }

    pub async fn contains(&self, id: &SessionId) -> bool {
        self.sessions.lock().await.contains_key(id)
    }

    /// Remove a session. Returns true only for the call that removed it.
    pub async fn remove(&self, id: &SessionId) -> bool {
        let removed = self.sessions.lock().await.remove(id).is_some();
        if removed {
            trace!("Mux session {} removed", id.short());
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every session after channel loss.
    ///
    /// Pending opens see their answer channel close; relaying sessions see
    /// their inbound queue end.
    pub(crate) async fn close_all(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        let count = sessions.len();
        sessions.clear();
        count
    }
}
