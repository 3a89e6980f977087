//! Registry of live sessions.
//!
//! Owned by the broker task, so no locking. Sessions are indexed by id and
//! by control socket path; the path index is what the directory watcher
//! uses to tell known sockets from new ones.

use super::{SessionHandler, SessionId};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, SessionHandler>,
    by_path: HashMap<PathBuf, SessionId>,
    next_id: SessionId,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Self::default()
        }
    }

    /// Allocate an id for a new session.
    pub fn next_id(&mut self) -> SessionId {
        let id = self.next_id.max(1);
        self.next_id = id + 1;
        id
    }

    pub fn insert(&mut self, handler: SessionHandler) {
        let id = handler.id();
        debug!(session_id = id, username = %handler.username(), "session registered");
        self.sessions.insert(id, handler);
        self.index_path(id);
    }

    pub fn get(&self, id: SessionId) -> Option<&SessionHandler> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut SessionHandler> {
        self.sessions.get_mut(&id)
    }

    pub fn remove(&mut self, id: SessionId) -> Option<SessionHandler> {
        self.by_path.retain(|_, v| *v != id);
        let removed = self.sessions.remove(&id);
        if removed.is_some() {
            debug!(session_id = id, "session unregistered");
        }
        removed
    }

    /// Re-read a session's socket path into the path index. Call after any
    /// handler operation that may have spawned the worker.
    pub fn index_path(&mut self, id: SessionId) {
        let Some(path) = self
            .sessions
            .get(&id)
            .and_then(|s| s.socket_path())
            .map(Path::to_path_buf)
        else {
            return;
        };
        self.by_path.insert(path, id);
    }

    pub fn by_path(&self, path: &Path) -> Option<SessionId> {
        self.by_path.get(path).copied()
    }

    /// Listed session of `username`, compared case-insensitively. The
    /// oldest one wins if a newer session is still purging.
    pub fn find_by_username(&self, username: &str) -> Option<SessionId> {
        self.sessions
            .values()
            .filter(|s| s.is_listed() && s.username().eq_ignore_ascii_case(username))
            .map(SessionHandler::id)
            .min()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &SessionHandler> {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
