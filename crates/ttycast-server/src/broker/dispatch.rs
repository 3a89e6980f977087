//! Client message dispatch.

use super::Broker;
use crate::auth::LoginOutcome;
use crate::client::ConnectionMode;
use crate::session::{ConnId, SessionHandler, SessionId, Watcher};
use tracing::{debug, info, warn};
use ttycast_core::messages::message_tag;
use ttycast_core::{ClientMessage, ServerMessage};

const CHAT_HELP: &str = "Type /help for a list of chat commands.";
const SPECTATING_RESTRICTED: &str = "Spectating this player is restricted.";

impl Broker {
    pub(super) fn on_client_text(&mut self, conn: ConnId, text: &str) {
        let Some(client) = self.connections.get(&conn) else {
            return;
        };
        if client.closed {
            return;
        }
        let msg = match ClientMessage::decode(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(conn_id = conn, error = %e, "invalid client message");
                return;
            }
        };
        debug!(conn_id = conn, msg = ?message_tag(text), "client message");

        match msg {
            ClientMessage::Login { username, password } => self.login(conn, &username, &password),
            ClientMessage::Play { game_id } => self.play(conn, &game_id),
            ClientMessage::Watch { username } => self.watch(conn, &username),
            ClientMessage::GoLobby => self.go_lobby(conn),
            ClientMessage::Pong => {
                if let Some(client) = self.connections.get_mut(&conn) {
                    client.received_pong = true;
                }
            }
            ClientMessage::ChatMsg { text } => {
                if let Some(id) = self.session_of(conn) {
                    self.with_session(id, |session, ctx| session.handle_chat(conn, &text, ctx));
                }
            }
            other => self.player_message(conn, text, &other),
        }
    }

    fn session_of(&self, conn: ConnId) -> Option<SessionId> {
        self.connections.get(&conn).and_then(|c| c.mode.session())
    }

    fn send(&mut self, conn: ConnId, msg: &ServerMessage) {
        let Some(client) = self.connections.get_mut(&conn) else {
            return;
        };
        client.queue_message(msg);
        if !client.flush() {
            self.abort(conn);
        }
    }

    fn login(&mut self, conn: ConnId, username: &str, password: &str) {
        if self
            .connections
            .get(&conn)
            .is_some_and(|c| c.username.is_some())
        {
            return;
        }
        let (username, flags) = match self.credentials.verify(username, password) {
            LoginOutcome::Success { username, flags } => (username, flags),
            LoginOutcome::Failure { reason } => {
                warn!(conn_id = conn, username, "failed login");
                self.send(conn, &ServerMessage::LoginFail { reason });
                return;
            }
        };
        info!(conn_id = conn, username = %username, "user logged in");

        let Some(client) = self.connections.get_mut(&conn) else {
            return;
        };
        client.username = Some(username.clone());
        client.flags = flags;
        client.queue_message(&ServerMessage::LoginSuccess {
            username: username.clone(),
            admin: flags.admin,
        });
        if flags.account_hold {
            client.queue_message(&ServerMessage::SetAccountHold);
        }

        let mode = client.mode;
        match mode {
            ConnectionMode::Spectating(id) => {
                self.with_session(id, |session, ctx| {
                    session.update_watcher(conn, username, flags, ctx)
                });
                if let Some(client) = self.connections.get_mut(&conn) {
                    if !client.flush() {
                        self.abort(conn);
                    }
                }
            }
            _ => self.send_lobby_snapshot(conn),
        }
    }

    fn play(&mut self, conn: ConnId, game_id: &str) {
        let Some(game) = self.config.game(game_id).cloned() else {
            warn!(conn_id = conn, game_id, "play request for unknown game");
            self.send(conn, &ServerMessage::GoLobby);
            return;
        };
        let Some(client) = self.connections.get(&conn) else {
            return;
        };
        let Some(username) = client.username.clone() else {
            self.send(
                conn,
                &ServerMessage::LoginRequired {
                    game: game.name.clone(),
                },
            );
            return;
        };
        let mode = client.mode;
        let flags = self
            .credentials
            .flags(&username)
            .unwrap_or(client.flags);

        match mode {
            ConnectionMode::Playing(id) => {
                let same_game = self
                    .registry
                    .get(id)
                    .is_some_and(|s| s.game().id == game_id);
                if !same_game {
                    self.send(conn, &ServerMessage::GoLobby);
                }
                return;
            }
            ConnectionMode::Spectating(id) => self.stop_spectating(conn, id),
            ConnectionMode::Lobby => {}
        }

        if flags.banned || (flags.account_hold && !game.allowed_with_hold) {
            info!(conn_id = conn, username = %username, game_id, "play request refused");
            self.send(conn, &ServerMessage::GoLobby);
            return;
        }

        let id = self.registry.next_id();
        info!(conn_id = conn, session_id = id, username = %username, game_id, "starting game");
        let mut session =
            SessionHandler::new(id, username.clone(), game, self.settings.clone());
        self.restore_blocklist(&mut session);
        self.registry.insert(session);

        if let Some(client) = self.connections.get_mut(&conn) {
            client.mode = ConnectionMode::Playing(id);
            client.game_id = Some(game_id.to_string());
            client.flags = flags;
            client.queue_message(&ServerMessage::GameStarted);
            client.queue_message(&ServerMessage::notice(CHAT_HELP));
        }
        self.with_session(id, |session, ctx| {
            session.add_watcher(Watcher::player(conn, username, flags), ctx);
            session.start(ctx);
        });
    }

    fn watch(&mut self, conn: ConnId, username: &str) {
        let Some(client) = self.connections.get(&conn) else {
            return;
        };
        let mode = client.mode;
        let viewer = client.username.clone();
        let flags = client.flags;

        match mode {
            ConnectionMode::Playing(id) => {
                self.stop_playing(conn, id);
            }
            ConnectionMode::Spectating(id) => self.stop_spectating(conn, id),
            ConnectionMode::Lobby => {}
        }

        if flags.account_hold {
            self.send(
                conn,
                &ServerMessage::AuthError {
                    reason: "Account restricted.".into(),
                },
            );
            return;
        }

        let Some(id) = self.registry.find_by_username(username) else {
            debug!(conn_id = conn, target = username, "watch request for unknown player");
            self.enter_lobby(conn, None);
            return;
        };

        let refused = match self.registry.get_mut(id) {
            Some(session) => {
                !flags.admin
                    && (session.account_restricted() || session.is_blocked(viewer.as_deref()))
            }
            None => true,
        };
        if refused {
            info!(conn_id = conn, target = username, "spectating refused");
            self.enter_lobby(conn, Some(SPECTATING_RESTRICTED.to_string()));
            return;
        }

        let Some(player) = self.registry.get(id).map(|s| s.username().to_string()) else {
            return;
        };
        info!(conn_id = conn, session_id = id, viewer = ?viewer, player = %player, "spectating");
        if let Some(client) = self.connections.get_mut(&conn) {
            client.mode = ConnectionMode::Spectating(id);
            client.queue_message(&ServerMessage::WatchingStarted { username: player });
        }
        self.with_session(id, |session, ctx| {
            session.add_watcher(Watcher::spectator(conn, viewer, flags), ctx);
        });
    }

    fn go_lobby(&mut self, conn: ConnId) {
        match self.session_of(conn) {
            Some(id) if self.is_playing(conn) => {
                // Back to the lobby once the session has ended.
                self.with_session(id, |session, ctx| session.request_stop(ctx));
            }
            Some(id) => {
                self.stop_spectating(conn, id);
                self.enter_lobby(conn, None);
            }
            None => self.enter_lobby(conn, None),
        }
    }

    fn is_playing(&self, conn: ConnId) -> bool {
        self.connections
            .get(&conn)
            .is_some_and(|c| matches!(c.mode, ConnectionMode::Playing(_)))
    }

    /// Player-only messages: input, purge answers and everything the
    /// worker handles itself.
    fn player_message(&mut self, conn: ConnId, raw: &str, msg: &ClientMessage) {
        match self.connections.get(&conn).map(|c| c.mode) {
            Some(ConnectionMode::Playing(id)) => {
                self.with_session(id, |session, ctx| session.handle_player_input(raw, msg, ctx));
            }
            Some(ConnectionMode::Lobby) => {
                let tag = message_tag(raw);
                if tag.as_deref() != Some("ui_state_sync") {
                    debug!(conn_id = conn, msg = ?tag, "unhandled message in lobby");
                }
            }
            _ => {}
        }
    }

    /// Leave the own session and ask it to stop.
    fn stop_playing(&mut self, conn: ConnId, id: SessionId) {
        self.with_session(id, |session, ctx| {
            session.remove_watcher(conn, ctx);
            session.request_stop(ctx);
        });
        if let Some(client) = self.connections.get_mut(&conn) {
            client.mode = ConnectionMode::Lobby;
            client.game_id = None;
        }
    }

    fn stop_spectating(&mut self, conn: ConnId, id: SessionId) {
        self.with_session(id, |session, ctx| session.remove_watcher(conn, ctx));
        if let Some(client) = self.connections.get_mut(&conn) {
            client.mode = ConnectionMode::Lobby;
        }
    }

    /// Put a connection that is not attached to any session in the lobby.
    fn enter_lobby(&mut self, conn: ConnId, notice: Option<String>) {
        let Some(client) = self.connections.get_mut(&conn) else {
            return;
        };
        client.mode = ConnectionMode::Lobby;
        if let Some(notice) = notice {
            client.queue_message(&ServerMessage::notice(notice));
        }
        client.queue_message(&ServerMessage::GoLobby);
        self.send_lobby_snapshot(conn);
    }
}
