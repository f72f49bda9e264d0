//! Process-wide map of live sessions.

use std::sync::Arc;

use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use komodo_core::{Session, SessionId};
use parking_lot::Mutex;
use tracing::{debug, info};

/// Shared handle to one session. Never hold the lock across an `.await`.
pub type SessionHandle = Arc<Mutex<Session>>;

/// Owns every session, keyed by id.
///
/// Creation goes through the map's entry API so two joins racing on a new
/// id always end up sharing one session.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, id: &SessionId) -> RefMut<'_, SessionId, SessionHandle> {
        self.sessions.entry(id.clone()).or_insert_with(|| {
            info!(session_id = %id, "session created");
            Arc::new(Mutex::new(Session::new(id.clone())))
        })
    }

    pub fn get_or_create(&self, id: &SessionId) -> SessionHandle {
        Arc::clone(self.entry(id).value())
    }

    /// Run `f` on the session, creating it first if needed.
    ///
    /// The map entry stays locked while `f` runs, so the session cannot be
    /// removed between lookup and mutation. Lock order is map then session,
    /// the same as [`Self::remove_if_empty`].
    pub fn update_or_create<R>(&self, id: &SessionId, f: impl FnOnce(&mut Session) -> R) -> R {
        let entry = self.entry(id);
        let mut session = entry.value().lock();
        f(&mut session)
    }

    pub fn get(&self, id: &SessionId) -> Option<SessionHandle> {
        self.sessions.get(id).map(|s| Arc::clone(s.value()))
    }

    pub fn delete(&self, id: &SessionId) -> bool {
        let removed = self.sessions.remove(id).is_some();
        if removed {
            info!(session_id = %id, "session deleted");
        }
        removed
    }

    /// Delete the session only if it still has no clients.
    ///
    /// The emptiness check and the removal happen under the map's shard
    /// lock, so a join that lands in between keeps the session alive.
    pub fn remove_if_empty(&self, id: &SessionId) -> bool {
        let removed = self
            .sessions
            .remove_if(id, |_, session| session.lock().is_empty())
            .is_some();
        if removed {
            info!(session_id = %id, "session deleted after last client left");
        } else {
            debug!(session_id = %id, "session kept, clients rejoined");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn recording_ids(&self) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|e| e.value().lock().is_recording())
            .map(|e| e.key().clone())
            .collect()
    }
}
