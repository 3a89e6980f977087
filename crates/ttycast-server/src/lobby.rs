//! Lobby broadcaster: batches lobby entry updates.
//!
//! Sessions mark themselves dirty; every `lobby_update_rate` the broker
//! computes each dirty session's entry once and pushes it to every lobby
//! connection. Sessions of restricted accounts are only shown to admins.

use crate::session::{SessionId, SessionRegistry};
use std::collections::BTreeSet;
use ttycast_core::{EndReason, LobbyEntry, ServerMessage};

/// One lobby entry and whether only admins may see it.
#[derive(Debug, Clone)]
pub struct LobbyUpdate {
    pub entry: LobbyEntry,
    pub restricted: bool,
}

impl LobbyUpdate {
    pub fn visible_to(&self, admin: bool) -> bool {
        admin || !self.restricted
    }

    pub fn message(&self) -> ServerMessage {
        ServerMessage::LobbyEntry(self.entry.clone())
    }
}

#[derive(Debug, Default)]
pub struct LobbyBroadcaster {
    pending: BTreeSet<SessionId>,
}

impl LobbyBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&mut self, id: SessionId) {
        self.pending.insert(id);
    }

    /// Drop a session from the pending set.
    pub fn remove(&mut self, id: SessionId) {
        self.pending.remove(&id);
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Take the pending set and compute one update per live session.
    pub fn flush(&mut self, registry: &SessionRegistry) -> Vec<LobbyUpdate> {
        let pending = std::mem::take(&mut self.pending);
        pending
            .into_iter()
            .filter_map(|id| registry.get(id))
            .filter(|s| s.is_listed())
            .map(|s| LobbyUpdate {
                entry: s.lobby_entry(),
                restricted: s.account_restricted(),
            })
            .collect()
    }

    /// Full lobby for a connection entering it.
    pub fn snapshot(registry: &SessionRegistry, admin: bool) -> Vec<ServerMessage> {
        let mut msgs = vec![ServerMessage::LobbyClear];
        msgs.extend(
            registry
                .ids()
                .into_iter()
                .filter_map(|id| registry.get(id))
                .filter(|s| s.is_listed())
                .map(|s| LobbyUpdate {
                    entry: s.lobby_entry(),
                    restricted: s.account_restricted(),
                })
                .filter(|u| u.visible_to(admin))
                .map(|u| u.message()),
        );
        msgs.push(ServerMessage::LobbyComplete);
        msgs
    }

    /// The message announcing a session's end.
    pub fn removal(
        id: SessionId,
        reason: EndReason,
        message: Option<String>,
        dump: Option<String>,
    ) -> ServerMessage {
        ServerMessage::LobbyRemove {
            id,
            reason: Some(reason),
            message,
            dump,
        }
    }
}
