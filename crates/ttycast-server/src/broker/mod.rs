//! The broker task.
//!
//! One task owns every session, every connection record and the lobby.
//! Socket tasks, PTY pumps, control sockets, the directory watcher and
//! timers only post [`BrokerEvent`]s; the broker consumes them in order.

mod context;
mod dispatch;

use crate::auth::profile::MUTELIST_KEY;
use crate::auth::{CredentialStore, ProfileStore};
use crate::client::{ClientConnection, ConnectionMode, OutboundFrame};
use crate::config::{ServerConfig, SessionSettings};
use crate::lobby::LobbyBroadcaster;
use crate::session::handler::SessionOrigin;
use crate::session::{ConnId, SessionEvent, SessionHandler, SessionId, SessionRegistry};
use crate::timer::TimerHandle;
use crate::watcher::{parse_socket_name, SocketEvent};
use context::BrokerContext;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use ttycast_core::ServerMessage;

const MAX_CONNECTIONS_REACHED: &str =
    "The maximum number of connections has been reached, sorry :(";
const SHUTTING_DOWN: &str = "The server is shutting down.";
const TIMED_OUT: &str = "Connection timed out";

/// Everything the broker reacts to.
#[derive(Debug)]
pub enum BrokerEvent {
    Connected {
        conn: ConnId,
        remote: SocketAddr,
        compression: bool,
        outbound: mpsc::UnboundedSender<OutboundFrame>,
    },
    ClientText {
        conn: ConnId,
        text: String,
    },
    Disconnected {
        conn: ConnId,
    },
    /// The socket task could not write a frame.
    SendFailed {
        conn: ConnId,
        error: String,
    },
    Session {
        id: SessionId,
        event: SessionEvent,
    },
    Heartbeat {
        conn: ConnId,
    },
    LobbyFlush,
    Socket(SocketEvent),
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Cheap handle for posting events to the broker.
#[derive(Clone, Debug)]
pub struct BrokerHandle {
    tx: mpsc::UnboundedSender<BrokerEvent>,
    next_conn: Arc<AtomicU64>,
}

impl BrokerHandle {
    pub fn send(&self, event: BrokerEvent) {
        if self.tx.send(event).is_err() {
            debug!("broker gone, event dropped");
        }
    }

    pub fn next_conn_id(&self) -> ConnId {
        self.next_conn.fetch_add(1, Ordering::Relaxed)
    }

    /// Ask the broker to shut down; resolves once every spawned session ended.
    pub async fn shutdown(&self) {
        let (done, wait) = oneshot::channel();
        self.send(BrokerEvent::Shutdown { done });
        let _ = wait.await;
    }
}

/// Work that must wait until the current session call returned.
#[derive(Debug)]
pub(crate) enum Deferred {
    ReturnToLobby {
        conn: ConnId,
        session: SessionId,
        notice: Option<String>,
    },
    Abort(ConnId),
}

pub struct Broker {
    config: Arc<ServerConfig>,
    settings: Arc<SessionSettings>,
    registry: SessionRegistry,
    connections: HashMap<ConnId, ClientConnection>,
    lobby: LobbyBroadcaster,
    credentials: Arc<dyn CredentialStore>,
    profiles: Arc<dyn ProfileStore>,
    handle: BrokerHandle,
    rx: mpsc::UnboundedReceiver<BrokerEvent>,
    deferred: Vec<Deferred>,
    shutdown: Option<oneshot::Sender<()>>,
    shutting_down: bool,
}

impl Broker {
    pub fn new(
        config: Arc<ServerConfig>,
        credentials: Arc<dyn CredentialStore>,
        profiles: Arc<dyn ProfileStore>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = BrokerHandle {
            tx,
            next_conn: Arc::new(AtomicU64::new(1)),
        };
        Self {
            settings: Arc::new(config.session.clone()),
            config,
            registry: SessionRegistry::new(),
            connections: HashMap::new(),
            lobby: LobbyBroadcaster::new(),
            credentials,
            profiles,
            handle,
            rx,
            deferred: Vec::new(),
            shutdown: None,
            shutting_down: false,
        }
    }

    pub fn handle(&self) -> BrokerHandle {
        self.handle.clone()
    }

    /// Consume events until every handle is gone.
    pub async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            self.handle_event(event);
        }
    }

    #[cfg(test)]
    async fn next_event(&mut self) -> Option<BrokerEvent> {
        self.rx.recv().await
    }

    pub fn handle_event(&mut self, event: BrokerEvent) {
        match event {
            BrokerEvent::Connected {
                conn,
                remote,
                compression,
                outbound,
            } => self.on_connected(conn, remote, compression, outbound),
            BrokerEvent::ClientText { conn, text } => self.on_client_text(conn, &text),
            BrokerEvent::Disconnected { conn } => self.on_disconnected(conn),
            BrokerEvent::SendFailed { conn, error } => {
                warn!(conn_id = conn, error = %error, "failed to send to client");
                let keep = self
                    .connections
                    .get_mut(&conn)
                    .map(ClientConnection::record_failure);
                if keep == Some(false) {
                    self.abort(conn);
                }
            }
            BrokerEvent::Session { id, event } => {
                if self.registry.get(id).is_none() {
                    debug!(session_id = id, event = ?event, "event for unknown session");
                    return;
                }
                self.with_session(id, |session, ctx| session.handle(event, ctx));
            }
            BrokerEvent::Heartbeat { conn } => self.on_heartbeat(conn),
            BrokerEvent::LobbyFlush => self.flush_lobby(),
            BrokerEvent::Socket(SocketEvent::Created(path)) => self.on_socket_created(path),
            BrokerEvent::Socket(SocketEvent::Removed(path)) => self.on_socket_removed(path),
            BrokerEvent::Shutdown { done } => self.on_shutdown(done),
        }
        self.run_deferred();
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Run `f` against one session with a context over the rest of the
    /// broker, then settle what the call changed.
    fn with_session<R>(
        &mut self,
        id: SessionId,
        f: impl FnOnce(&mut SessionHandler, &mut BrokerContext<'_>) -> R,
    ) -> Option<R> {
        let session = self.registry.get_mut(id)?;
        let mut ctx = BrokerContext {
            connections: &mut self.connections,
            lobby: &mut self.lobby,
            handle: &self.handle,
            profiles: &self.profiles,
            deferred: &mut self.deferred,
        };
        let result = f(session, &mut ctx);
        self.settle_session(id);
        Some(result)
    }

    fn settle_session(&mut self, id: SessionId) {
        self.registry.index_path(id);
        if self.registry.get(id).is_some_and(SessionHandler::is_gone) {
            self.finish_session(id);
        }
    }

    fn finish_session(&mut self, id: SessionId) {
        let Some(session) = self.registry.remove(id) else {
            return;
        };
        let (reason, message, dump) = session.end_summary();
        info!(
            session_id = id,
            username = %session.username(),
            reason = %reason,
            worker_version = ?session.worker_version(),
            "session removed"
        );
        self.lobby.remove(id);
        let removal = LobbyBroadcaster::removal(id, reason, message, dump);
        self.send_to_lobby(&removal);
        self.run_deferred();
        self.check_shutdown_complete();
    }

    fn run_deferred(&mut self) {
        while !self.deferred.is_empty() {
            for work in std::mem::take(&mut self.deferred) {
                match work {
                    Deferred::ReturnToLobby {
                        conn,
                        session,
                        notice,
                    } => self.return_to_lobby(conn, session, notice),
                    Deferred::Abort(conn) => self.abort(conn),
                }
            }
        }
    }

    fn restore_blocklist(&self, session: &mut SessionHandler) {
        match self.profiles.get(session.username(), MUTELIST_KEY) {
            Ok(Some(stored)) => session.restore_blocklist(&stored),
            Ok(None) => {}
            Err(e) => warn!(username = %session.username(), error = %e, "failed to load mute list"),
        }
    }

    fn on_socket_created(&mut self, path: PathBuf) {
        if self.registry.by_path(&path).is_some() {
            return;
        }
        let (Some(dir), Some(file_name)) = (
            path.parent(),
            path.file_name().and_then(|n| n.to_str()),
        ) else {
            return;
        };
        let Some((username, _)) = parse_socket_name(file_name) else {
            return;
        };
        let Some(game) = self.config.game_for_socket(dir, file_name) else {
            debug!(path = %path.display(), "socket does not belong to any game");
            return;
        };
        let bind_dir = self
            .settings
            .control_socket_dir
            .clone()
            .unwrap_or_else(|| dir.to_path_buf());

        let id = self.registry.next_id();
        info!(session_id = id, username, path = %path.display(), "discovered session");
        let mut session = SessionHandler::discovered(
            id,
            username.to_string(),
            game,
            self.settings.clone(),
            path.clone(),
        );
        self.restore_blocklist(&mut session);
        self.registry.insert(session);
        self.with_session(id, |session, ctx| session.connect_discovered(&bind_dir, ctx));
    }

    fn on_socket_removed(&mut self, path: PathBuf) {
        let Some(id) = self.registry.by_path(&path) else {
            return;
        };
        let discovered = self
            .registry
            .get(id)
            .is_some_and(|s| s.origin() == SessionOrigin::Discovered);
        if discovered {
            info!(session_id = id, path = %path.display(), "discovered session socket removed");
            self.with_session(id, |session, ctx| session.end_discovered(ctx));
        }
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    fn on_connected(
        &mut self,
        conn: ConnId,
        remote: SocketAddr,
        compression: bool,
        outbound: mpsc::UnboundedSender<OutboundFrame>,
    ) {
        let mut client = ClientConnection::new(conn, remote, compression, outbound);
        if self.shutting_down {
            client.queue_message(&ServerMessage::Close {
                reason: SHUTTING_DOWN.into(),
            });
            client.close();
            return;
        }
        if self.connections.len() >= self.config.max_connections {
            info!(conn_id = conn, remote = %remote, "connection limit reached, refusing");
            client.queue_message(&ServerMessage::Close {
                reason: MAX_CONNECTIONS_REACHED.into(),
            });
            client.close();
            return;
        }

        info!(conn_id = conn, remote = %remote, compression, "client connected");
        client.heartbeat = Some(self.arm_heartbeat(conn));
        client.queue_message(&ServerMessage::Ping);
        self.connections.insert(conn, client);
        self.send_lobby_snapshot(conn);
    }

    fn arm_heartbeat(&self, conn: ConnId) -> TimerHandle {
        let handle = self.handle.clone();
        TimerHandle::spawn(self.config.connection_timeout, move || {
            handle.send(BrokerEvent::Heartbeat { conn });
        })
    }

    fn on_heartbeat(&mut self, conn: ConnId) {
        let Some(client) = self.connections.get_mut(&conn) else {
            return;
        };
        if client.closed {
            return;
        }
        if !client.received_pong {
            info!(conn_id = conn, "connection timed out");
            client.queue_message(&ServerMessage::Close {
                reason: TIMED_OUT.into(),
            });
            client.close();
            self.on_disconnected(conn);
            return;
        }
        if let ConnectionMode::Playing(id) = client.mode {
            let over_limit = self
                .registry
                .get(id)
                .is_some_and(|s| s.idle_time() > self.settings.max_idle_time);
            if over_limit {
                info!(conn_id = conn, session_id = id, "stopping idle session");
                self.with_session(id, |session, ctx| session.request_stop(ctx));
            }
        }
        let heartbeat = self.arm_heartbeat(conn);
        if let Some(client) = self.connections.get_mut(&conn) {
            client.received_pong = false;
            client.heartbeat = Some(heartbeat);
            client.queue_message(&ServerMessage::Ping);
            if !client.flush() {
                self.abort(conn);
            }
        }
    }

    fn on_disconnected(&mut self, conn: ConnId) {
        let Some(client) = self.connections.get_mut(&conn) else {
            return;
        };
        client.closed = true;
        client.heartbeat = None;
        info!(
            conn_id = conn,
            username = ?client.username,
            bytes_queued = client.bytes_queued(),
            bytes_sent = client.bytes_sent(),
            "client disconnected"
        );
        match client.mode {
            ConnectionMode::Playing(id) if self.registry.get(id).is_some() => {
                // The record stays until the session has ended.
                self.with_session(id, |session, ctx| session.request_stop(ctx));
            }
            ConnectionMode::Spectating(id) => {
                self.with_session(id, |session, ctx| session.remove_watcher(conn, ctx));
                self.connections.remove(&conn);
            }
            _ => {
                self.connections.remove(&conn);
            }
        }
    }

    /// Close a connection that failed too often.
    fn abort(&mut self, conn: ConnId) {
        let Some(client) = self.connections.get_mut(&conn) else {
            return;
        };
        if client.closed {
            return;
        }
        warn!(conn_id = conn, failed_sends = client.failed_sends(), "aborting connection");
        client.close();
        self.on_disconnected(conn);
    }

    fn return_to_lobby(&mut self, conn: ConnId, session: SessionId, notice: Option<String>) {
        let Some(client) = self.connections.get_mut(&conn) else {
            return;
        };
        if client.mode.session() != Some(session) {
            return;
        }
        if client.closed {
            self.connections.remove(&conn);
            return;
        }
        client.mode = ConnectionMode::Lobby;
        client.game_id = None;
        if let Some(notice) = notice {
            client.queue_message(&ServerMessage::notice(notice));
        }
        client.queue_message(&ServerMessage::GoLobby);
        self.send_lobby_snapshot(conn);
    }

    fn send_lobby_snapshot(&mut self, conn: ConnId) {
        let Some(client) = self.connections.get_mut(&conn) else {
            return;
        };
        for msg in LobbyBroadcaster::snapshot(&self.registry, client.is_admin()) {
            client.queue_message(&msg);
        }
        if !client.flush() {
            self.deferred.push(Deferred::Abort(conn));
        }
    }

    fn send_to_lobby(&mut self, msg: &ServerMessage) {
        for client in self.connections.values_mut() {
            if client.is_in_lobby() && !client.closed {
                client.queue_message(msg);
                if !client.flush() {
                    self.deferred.push(Deferred::Abort(client.id));
                }
            }
        }
    }

    fn flush_lobby(&mut self) {
        if !self.lobby.has_pending() {
            return;
        }
        let updates = self.lobby.flush(&self.registry);
        for client in self.connections.values_mut() {
            if !client.is_in_lobby() || client.closed {
                continue;
            }
            let admin = client.is_admin();
            let mut queued = false;
            for update in updates.iter().filter(|u| u.visible_to(admin)) {
                client.queue_message(&update.message());
                queued = true;
            }
            if queued && !client.flush() {
                self.deferred.push(Deferred::Abort(client.id));
            }
        }
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    fn on_shutdown(&mut self, done: oneshot::Sender<()>) {
        info!(
            connections = self.connections.len(),
            sessions = self.registry.len(),
            "shutting down"
        );
        self.shutting_down = true;
        self.shutdown = Some(done);

        let conns: Vec<ConnId> = self.connections.keys().copied().collect();
        for conn in conns {
            if let Some(client) = self.connections.get_mut(&conn) {
                client.queue_message(&ServerMessage::Close {
                    reason: SHUTTING_DOWN.into(),
                });
                client.close();
            }
        }
        for id in self.registry.ids() {
            self.with_session(id, |session, ctx| session.request_stop(ctx));
        }
        self.check_shutdown_complete();
    }

    fn check_shutdown_complete(&mut self) {
        if !self.shutting_down {
            return;
        }
        let running = self
            .registry
            .iter()
            .any(|s| s.origin() == SessionOrigin::Spawned);
        if running {
            return;
        }
        if let Some(done) = self.shutdown.take() {
            info!("all sessions ended");
            let _ = done.send(());
        }
    }
}

#[cfg(test)]
mod tests;
