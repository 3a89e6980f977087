//! The broker side of [`SessionContext`].

use super::{BrokerEvent, BrokerHandle, Deferred};
use crate::auth::profile::MUTELIST_KEY;
use crate::auth::ProfileStore;
use crate::client::ClientConnection;
use crate::lobby::LobbyBroadcaster;
use crate::session::{
    ConnId, ControlEvent, EventSink, RecorderEvent, SessionContext, SessionEvent, SessionId,
};
use crate::timer::TimerHandle;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use ttycast_core::ServerMessage;

/// Borrows everything a session may touch except the registry itself.
pub(super) struct BrokerContext<'a> {
    pub connections: &'a mut HashMap<ConnId, ClientConnection>,
    pub lobby: &'a mut LobbyBroadcaster,
    pub handle: &'a BrokerHandle,
    pub profiles: &'a Arc<dyn ProfileStore>,
    pub deferred: &'a mut Vec<Deferred>,
}

impl SessionContext for BrokerContext<'_> {
    fn queue(&mut self, conn: ConnId, msg: &ServerMessage) {
        if let Some(client) = self.connections.get_mut(&conn) {
            client.queue_message(msg);
        }
    }

    fn queue_raw(&mut self, conn: ConnId, raw: &str) {
        if let Some(client) = self.connections.get_mut(&conn) {
            client.append_raw(raw);
        }
    }

    fn flush(&mut self, conn: ConnId) {
        if let Some(client) = self.connections.get_mut(&conn) {
            if !client.flush() {
                self.deferred.push(Deferred::Abort(conn));
            }
        }
    }

    fn return_to_lobby(&mut self, conn: ConnId, session: SessionId, notice: Option<String>) {
        self.deferred.push(Deferred::ReturnToLobby {
            conn,
            session,
            notice,
        });
    }

    fn lobby_changed(&mut self, session: SessionId) {
        self.lobby.mark(session);
    }

    fn schedule(&mut self, session: SessionId, delay: Duration, event: SessionEvent) -> TimerHandle {
        let handle = self.handle.clone();
        TimerHandle::spawn(delay, move || {
            handle.send(BrokerEvent::Session { id: session, event });
        })
    }

    fn terminal_sink(&self, session: SessionId) -> EventSink<RecorderEvent> {
        let handle = self.handle.clone();
        Arc::new(move |e| {
            handle.send(BrokerEvent::Session {
                id: session,
                event: SessionEvent::Terminal(e),
            })
        })
    }

    fn control_sink(&self, session: SessionId) -> EventSink<ControlEvent> {
        let handle = self.handle.clone();
        Arc::new(move |e| {
            handle.send(BrokerEvent::Session {
                id: session,
                event: SessionEvent::Control(e),
            })
        })
    }

    fn save_blocklist(&mut self, owner: &str, value: String) {
        let profiles = self.profiles.clone();
        let owner = owner.to_string();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = profiles.set(&owner, MUTELIST_KEY, &value) {
                warn!(username = %owner, error = %e, "failed to save mute list");
            }
        });
    }
}
