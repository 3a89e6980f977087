//! Session handler: the full lifecycle of one worker.
//!
//! `PURGING_LOCK → SPAWNING → ATTACHED → ENDING → GONE`. The handler never
//! touches connections or the lobby directly; every outside effect goes
//! through [`SessionContext`], and every input arrives as a
//! [`SessionEvent`] or a method call from the broker.

use super::control::{ControlChannel, ControlEvent};
use super::crash::{classify_error_line, reason_from_exit, CrashInfo, ExitContext};
use super::lock::{find_lock, read_lock_pid, remove_stale_lock, LockArtifact};
use super::moderation::{parse_chat_command, ChatCommand, Moderation, HELP_TEXT};
use super::pty::SpawnSpec;
use super::recorder::{RecorderEvent, TerminalRecorder};
use super::recording::id_header;
use super::signal::{send_signal, Signal, SignalOutcome};
use super::{ConnId, EventSink, SessionEvent, SessionId};
use crate::auth::UserFlags;
use crate::config::{GameConfig, SessionSettings};
use crate::timer::TimerHandle;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use ttycast_core::messages::LOBBY_WHERE_KEYS;
use ttycast_core::{
    ClientMessage, ControlMessage, EndReason, InboundControl, LobbyEntry, ServerMessage,
    WhereInfo, WorkerCommand,
};

/// Game messages this soon after a spectator joined are replays for the
/// newcomer, not player activity.
const SPECTATOR_JOIN_GRACE: Duration = Duration::from_secs(2);

const START_FAILED: &str = "Error while starting the worker process!";
const PURGE_FAILED: &str =
    "Error while trying to terminate a stale process.\nPlease contact an administrator.";
const SPECTATING_RESTRICTED: &str = "Spectating this player is restricted.";

/// Effects a session needs from the rest of the broker.
pub trait SessionContext {
    /// Queue a message for a connection without flushing.
    fn queue(&mut self, conn: ConnId, msg: &ServerMessage);
    /// Queue an already-serialized worker message.
    fn queue_raw(&mut self, conn: ConnId, raw: &str);
    fn flush(&mut self, conn: ConnId);
    /// Detach `conn` from `session` and put it back in the lobby once the
    /// current event has been handled.
    fn return_to_lobby(&mut self, conn: ConnId, session: SessionId, notice: Option<String>);
    fn lobby_changed(&mut self, session: SessionId);
    fn schedule(&mut self, session: SessionId, delay: Duration, event: SessionEvent) -> TimerHandle;
    fn terminal_sink(&self, session: SessionId) -> EventSink<RecorderEvent>;
    fn control_sink(&self, session: SessionId) -> EventSink<ControlEvent>;
    fn save_blocklist(&mut self, owner: &str, value: String);

    fn send(&mut self, conn: ConnId, msg: &ServerMessage) {
        self.queue(conn, msg);
        self.flush(conn);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    PurgingLock,
    Spawning,
    Attached,
    Ending,
    Gone,
}

/// Whether this broker launched the worker or found it on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOrigin {
    Spawned,
    Discovered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherRole {
    Player,
    Spectator,
}

/// A connection attached to the session.
#[derive(Debug, Clone)]
pub struct Watcher {
    pub conn: ConnId,
    pub username: Option<String>,
    pub role: WatcherRole,
    pub flags: UserFlags,
    pub chat_hidden: bool,
}

impl Watcher {
    pub fn player(conn: ConnId, username: String, flags: UserFlags) -> Self {
        Self {
            conn,
            username: Some(username),
            role: WatcherRole::Player,
            flags,
            chat_hidden: false,
        }
    }

    pub fn spectator(conn: ConnId, username: Option<String>, flags: UserFlags) -> Self {
        Self {
            conn,
            username,
            role: WatcherRole::Spectator,
            flags,
            chat_hidden: false,
        }
    }
}

struct StalePurge {
    path: PathBuf,
    pid: i32,
    rechecks_left: u32,
    timer: Option<TimerHandle>,
}

#[derive(Debug, Default, Clone)]
struct ExitInfo {
    reason: Option<EndReason>,
    message: Option<String>,
    dump_url: Option<String>,
    /// Set by the worker's `exit_reason` or by a failed start; the exit code
    /// no longer changes the outcome.
    authoritative: bool,
}

pub struct SessionHandler {
    id: SessionId,
    username: String,
    game: Arc<GameConfig>,
    settings: Arc<SessionSettings>,
    origin: SessionOrigin,
    state: SessionState,
    started_at: DateTime<Utc>,
    basename: String,
    socket_path: Option<PathBuf>,
    recorder: Option<TerminalRecorder>,
    control: Option<ControlChannel>,
    lock: Option<LockArtifact>,
    purge: Option<StalePurge>,
    purge_announced: bool,
    kill_timer: Option<TimerHandle>,
    idle_timer: Option<TimerHandle>,
    watchers: Vec<Watcher>,
    fresh_watchers: HashSet<ConnId>,
    handshake_complete: bool,
    queue_messages: bool,
    worker_version: Option<String>,
    location: WhereInfo,
    last_milestone: Option<WhereInfo>,
    moderation: Moderation,
    last_activity: Instant,
    last_watcher_join: Option<Instant>,
    was_idle: bool,
    exit: ExitInfo,
    stream_crash: Option<CrashInfo>,
    stop_requested: bool,
    escalated: bool,
}

impl SessionHandler {
    /// A session about to be launched for `username`.
    pub fn new(
        id: SessionId,
        username: String,
        game: Arc<GameConfig>,
        settings: Arc<SessionSettings>,
    ) -> Self {
        let started_at = Utc::now();
        Self {
            id,
            username,
            game,
            settings,
            origin: SessionOrigin::Spawned,
            state: SessionState::PurgingLock,
            started_at,
            basename: started_at.format("%Y-%m-%d.%H:%M:%S").to_string(),
            socket_path: None,
            recorder: None,
            control: None,
            lock: None,
            purge: None,
            purge_announced: false,
            kill_timer: None,
            idle_timer: None,
            watchers: Vec::new(),
            fresh_watchers: HashSet::new(),
            handshake_complete: false,
            queue_messages: false,
            worker_version: None,
            location: WhereInfo::new(),
            last_milestone: None,
            moderation: Moderation::new(),
            last_activity: Instant::now(),
            last_watcher_join: None,
            was_idle: false,
            exit: ExitInfo::default(),
            stream_crash: None,
            stop_requested: false,
            escalated: false,
        }
    }

    /// A session started outside this broker, found through its socket.
    pub fn discovered(
        id: SessionId,
        username: String,
        game: Arc<GameConfig>,
        settings: Arc<SessionSettings>,
        socket_path: PathBuf,
    ) -> Self {
        let mut handler = Self::new(id, username, game, settings);
        handler.origin = SessionOrigin::Discovered;
        handler.state = SessionState::Attached;
        handler.socket_path = Some(socket_path);
        handler
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn game(&self) -> &Arc<GameConfig> {
        &self.game
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn origin(&self) -> SessionOrigin {
        self.origin
    }

    pub fn is_gone(&self) -> bool {
        self.state == SessionState::Gone
    }

    pub fn socket_path(&self) -> Option<&Path> {
        self.socket_path.as_deref()
    }

    pub fn pid(&self) -> Option<u32> {
        self.recorder.as_ref().map(TerminalRecorder::pid)
    }

    /// Spawned or discovered and not yet torn down: shown in the lobby and
    /// open to spectators.
    pub fn is_listed(&self) -> bool {
        matches!(self.state, SessionState::Attached | SessionState::Ending)
    }

    pub fn worker_version(&self) -> Option<&str> {
        self.worker_version.as_deref()
    }

    pub fn watchers(&self) -> &[Watcher] {
        &self.watchers
    }

    pub fn has_watcher(&self, conn: ConnId) -> bool {
        self.watchers.iter().any(|w| w.conn == conn)
    }

    pub fn player_conn(&self) -> Option<ConnId> {
        self.watchers
            .iter()
            .find(|w| w.role == WatcherRole::Player)
            .map(|w| w.conn)
    }

    /// The player's account is on hold.
    pub fn account_restricted(&self) -> bool {
        self.watchers
            .iter()
            .any(|w| w.role == WatcherRole::Player && w.flags.account_hold)
    }

    pub fn idle_time(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn is_idle(&self) -> bool {
        self.idle_time() > self.settings.idle_threshold
    }

    /// Reason, message and dump URL the session ended with.
    pub fn end_summary(&self) -> (EndReason, Option<String>, Option<String>) {
        (
            self.exit.reason.unwrap_or(EndReason::Normal),
            self.exit.message.clone(),
            self.exit.dump_url.clone(),
        )
    }

    // ------------------------------------------------------------------
    // Startup: stale-lock purge and spawn
    // ------------------------------------------------------------------

    /// Begin the lifecycle: purge stale locks, then spawn.
    pub fn start(&mut self, ctx: &mut dyn SessionContext) {
        info!(
            session_id = self.id,
            username = %self.username,
            game = %self.game.id,
            "starting session"
        );
        self.purge_locks_and_start(true, ctx);
    }

    fn purge_locks_and_start(&mut self, mut first: bool, ctx: &mut dyn SessionContext) {
        let lock_dir = self.game.lock_dir(&self.username);
        loop {
            let path = match find_lock(&lock_dir, &self.username) {
                Ok(Some(path)) => path,
                Ok(None) => break,
                Err(e) => {
                    self.purge_failed(&format!("cannot scan {}: {e}", lock_dir.display()), ctx);
                    return;
                }
            };

            let pid = match read_lock_pid(&path) {
                Ok(Some(pid)) => pid,
                Ok(None) => {
                    error!(path = %path.display(), "invalid PID in lock file, clearing");
                    if let Err(e) = remove_stale_lock(&path) {
                        self.purge_failed(&e.to_string(), ctx);
                        return;
                    }
                    first = false;
                    continue;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    self.purge_failed(&e.to_string(), ctx);
                    return;
                }
            };

            self.purge = Some(StalePurge {
                path: path.clone(),
                pid,
                rechecks_left: self.settings.stale_recheck_limit,
                timer: None,
            });

            if !first {
                self.kill_stale(Signal::Hangup, ctx);
                return;
            }

            match send_signal(pid, Signal::Probe) {
                SignalOutcome::Delivered => {
                    info!(
                        session_id = self.id,
                        username = %self.username,
                        pid,
                        "found stale worker, announcing purge"
                    );
                    let announce = ServerMessage::StaleProcesses {
                        timeout: self.settings.stale_purge_grace.as_secs(),
                        game: self.game.name.clone(),
                    };
                    self.send_to_player(&announce, ctx);
                    self.purge_announced = true;
                    let timer = ctx.schedule(
                        self.id,
                        self.settings.stale_purge_grace,
                        SessionEvent::PurgeGraceElapsed,
                    );
                    if let Some(purge) = self.purge.as_mut() {
                        purge.timer = Some(timer);
                    }
                    return;
                }
                SignalOutcome::NoSuchProcess => {
                    info!(path = %path.display(), pid, "removing lock of dead worker");
                }
                SignalOutcome::PermissionDenied => {
                    error!(path = %path.display(), pid, "no permission to signal stale worker, clearing lock");
                }
                SignalOutcome::Failed(e) => {
                    self.purge_failed(&e.to_string(), ctx);
                    return;
                }
            }
            self.purge = None;
            if let Err(e) = remove_stale_lock(&path) {
                self.purge_failed(&e.to_string(), ctx);
                return;
            }
            first = false;
        }

        self.purge = None;
        if self.purge_announced {
            self.purge_announced = false;
            self.send_to_player(&ServerMessage::HideDialog, ctx);
        }
        self.spawn(ctx);
    }

    fn kill_stale(&mut self, signal: Signal, ctx: &mut dyn SessionContext) {
        let Some(purge) = self.purge.as_ref() else {
            return;
        };
        let pid = purge.pid;
        match send_signal(pid, signal) {
            SignalOutcome::Delivered => match signal {
                Signal::ForceTerminate => {
                    warn!(pid, username = %self.username, "stale worker force-terminated");
                    self.finish_stale_purge(ctx);
                }
                Signal::Hangup | Signal::Probe => {
                    if signal == Signal::Hangup {
                        info!(pid, username = %self.username, "sent SIGHUP to stale worker");
                    }
                    let timer = ctx.schedule(
                        self.id,
                        self.settings.stale_recheck_interval,
                        SessionEvent::PurgeRecheck,
                    );
                    if let Some(purge) = self.purge.as_mut() {
                        purge.timer = Some(timer);
                    }
                }
            },
            SignalOutcome::NoSuchProcess => self.finish_stale_purge(ctx),
            SignalOutcome::PermissionDenied => {
                error!(pid, "no permission to signal stale worker, clearing lock");
                self.finish_stale_purge(ctx);
            }
            SignalOutcome::Failed(e) => self.purge_failed(&e.to_string(), ctx),
        }
    }

    fn finish_stale_purge(&mut self, ctx: &mut dyn SessionContext) {
        let Some(purge) = self.purge.take() else {
            return;
        };
        if let Err(e) = remove_stale_lock(&purge.path) {
            self.purge_failed(&e.to_string(), ctx);
            return;
        }
        self.purge_locks_and_start(false, ctx);
    }

    fn on_purge_recheck(&mut self, ctx: &mut dyn SessionContext) {
        let Some(purge) = self.purge.as_mut() else {
            return;
        };
        purge.timer = None;
        if !purge.path.exists() {
            self.finish_stale_purge(ctx);
            return;
        }
        if purge.rechecks_left == 0 {
            warn!(pid = purge.pid, "stale worker ignored SIGHUP, escalating");
            self.kill_stale(Signal::ForceTerminate, ctx);
            return;
        }
        purge.rechecks_left -= 1;
        self.kill_stale(Signal::Probe, ctx);
    }

    fn purge_failed(&mut self, detail: &str, ctx: &mut dyn SessionContext) {
        error!(username = %self.username, error = detail, "stale process purge failed");
        self.purge = None;
        self.exit = ExitInfo {
            reason: Some(EndReason::Error),
            message: Some(PURGE_FAILED.to_string()),
            dump_url: None,
            authoritative: true,
        };
        self.end(ctx);
    }

    fn abort_purge(&mut self, ctx: &mut dyn SessionContext) {
        if self.purge.take().is_none() {
            return;
        }
        info!(username = %self.username, "stale process purge abandoned");
        if self.purge_announced {
            self.purge_announced = false;
            self.send_to_player(&ServerMessage::HideDialog, ctx);
        }
        self.end(ctx);
    }

    fn spawn(&mut self, ctx: &mut dyn SessionContext) {
        self.state = SessionState::Spawning;

        let socket_dir = match prepare_dir(&self.game.socket_dir(&self.username)) {
            Ok(dir) => dir,
            Err(e) => return self.fail_start(&e, ctx),
        };
        let socket_path = socket_dir.join(format!("{}:{}.sock", self.username, self.basename));
        let _ = std::fs::remove_file(&socket_path);

        let transcript = if self.settings.enable_transcripts {
            self.game
                .transcript_dir(&self.username)
                .map(|dir| dir.join(format!("{}.ttyrec", self.basename)))
        } else {
            None
        };
        let header = transcript.as_ref().map(|path| {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            id_header(
                &self.username,
                &self.game.name,
                &self.settings.server_id,
                &file_name,
                self.started_at,
            )
        });

        let (cols, rows) = self.settings.term_size;
        let spec = SpawnSpec {
            program: self.game.binary.clone(),
            args: self.game.invocation(&self.username, &socket_path),
            env: self.game.environment(&self.username),
            cwd: self.game.cwd.clone(),
            cols,
            rows,
        };

        let recorder =
            match TerminalRecorder::start(&spec, transcript, header, ctx.terminal_sink(self.id)) {
                Ok(recorder) => recorder,
                Err(e) => return self.fail_start(&e, ctx),
            };
        let pid = recorder.pid();
        debug!(
            session_id = self.id,
            pid,
            transcript = ?recorder.transcript_path(),
            "worker spawned"
        );
        self.recorder = Some(recorder);
        self.socket_path = Some(socket_path.clone());

        match LockArtifact::create(
            &self.game.lock_dir(&self.username),
            &self.username,
            &self.basename,
            pid,
            rows,
            cols,
        ) {
            Ok(lock) => self.lock = Some(lock),
            Err(e) => return self.fail_start(&e, ctx),
        }

        let bind_dir = self
            .settings
            .control_socket_dir
            .clone()
            .unwrap_or(socket_dir);
        match ControlChannel::connect(socket_path, &bind_dir, true, ctx.control_sink(self.id)) {
            Ok(control) => self.control = Some(control),
            Err(e) => return self.fail_start(&e, ctx),
        }

        self.state = SessionState::Attached;
        self.last_activity = Instant::now();
        self.arm_idle_check(ctx);
        ctx.lobby_changed(self.id);
        info!(session_id = self.id, username = %self.username, pid, "session attached");
    }

    fn fail_start(&mut self, error: &dyn std::fmt::Display, ctx: &mut dyn SessionContext) {
        warn!(session_id = self.id, username = %self.username, error = %error, "error while starting worker");
        self.exit = ExitInfo {
            reason: Some(EndReason::Error),
            message: Some(START_FAILED.to_string()),
            dump_url: None,
            authoritative: true,
        };
        if self.recorder.is_some() {
            self.state = SessionState::Ending;
            self.request_stop(ctx);
        } else {
            self.end(ctx);
        }
    }

    /// Attach to a discovered worker as a secondary viewer.
    pub fn connect_discovered(&mut self, bind_dir: &Path, ctx: &mut dyn SessionContext) -> bool {
        let Some(socket_path) = self.socket_path.clone() else {
            return false;
        };
        match ControlChannel::connect(socket_path, bind_dir, false, ctx.control_sink(self.id)) {
            Ok(control) => {
                self.control = Some(control);
                self.last_activity = Instant::now();
                self.arm_idle_check(ctx);
                ctx.lobby_changed(self.id);
                true
            }
            Err(e) => {
                warn!(username = %self.username, error = %e, "cannot attach to discovered session");
                self.end(ctx);
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    pub fn handle(&mut self, event: SessionEvent, ctx: &mut dyn SessionContext) {
        if self.is_gone() {
            debug!(session_id = self.id, event = ?event, "event for finished session ignored");
            return;
        }
        match event {
            SessionEvent::Terminal(RecorderEvent::OutputLine(line)) => self.on_output_line(line, ctx),
            SessionEvent::Terminal(RecorderEvent::ErrorLine(line)) => self.on_error_line(line),
            SessionEvent::Terminal(RecorderEvent::Ended { exit_code }) => {
                self.on_process_exit(exit_code, ctx)
            }
            SessionEvent::Control(ControlEvent::Message(text)) => self.on_control_message(&text, ctx),
            SessionEvent::Control(ControlEvent::Closed) => {
                info!(
                    session_id = self.id,
                    username = %self.username,
                    socket = ?self.control.as_ref().map(|c| c.peer().to_path_buf()),
                    "control channel closed"
                );
                self.control = None;
                if self.origin == SessionOrigin::Spawned {
                    self.request_stop(ctx);
                }
            }
            SessionEvent::PurgeGraceElapsed => {
                if let Some(purge) = self.purge.as_mut() {
                    purge.timer = None;
                    self.kill_stale(Signal::Hangup, ctx);
                }
            }
            SessionEvent::PurgeRecheck => self.on_purge_recheck(ctx),
            SessionEvent::IdleCheck => self.on_idle_check(ctx),
            SessionEvent::KillTimeout => self.on_kill_timeout(ctx),
        }
    }

    fn on_output_line(&mut self, line: String, ctx: &mut dyn SessionContext) {
        if self.handshake_complete {
            return;
        }
        if serde_json::from_str::<serde_json::Value>(&line).is_err() {
            warn!(session_id = self.id, line = %line, "invalid JSON output from worker");
        }
        // Wrapper-script output is only meant for the player.
        let players: Vec<ConnId> = self
            .watchers
            .iter()
            .filter(|w| w.role == WatcherRole::Player)
            .map(|w| w.conn)
            .collect();
        for conn in players {
            ctx.queue_raw(conn, &line);
            ctx.flush(conn);
        }
    }

    fn on_error_line(&mut self, line: String) {
        if self.handshake_complete {
            debug!(session_id = self.id, line = %line, "worker stderr");
            return;
        }
        let morgue = self.game.morgue_url(&self.username);
        if let Some(info) = classify_error_line(&line, morgue.as_deref()) {
            warn!(session_id = self.id, username = %self.username, line = %line, "crash marker from worker");
            match self.stream_crash.as_mut() {
                Some(existing) => existing.merge(info),
                None => self.stream_crash = Some(info),
            }
        } else {
            debug!(session_id = self.id, line = %line, "worker stderr");
        }
    }

    fn on_control_message(&mut self, text: &str, ctx: &mut dyn SessionContext) {
        if !self.handshake_complete {
            self.handshake_complete = true;
            debug!(session_id = self.id, "control channel handshake complete");
        }
        match InboundControl::parse(text) {
            Ok(InboundControl::ServerDirected(msg)) => self.on_server_directed(msg, ctx),
            Ok(InboundControl::Game(msg)) => {
                let replaying = self
                    .last_watcher_join
                    .is_some_and(|t| t.elapsed() <= SPECTATOR_JOIN_GRACE);
                if !replaying {
                    self.note_activity(ctx);
                }
                self.deliver_game_message(&msg, ctx);
            }
            Err(e) => warn!(session_id = self.id, error = %e, "protocol violation on control channel"),
        }
    }

    fn on_server_directed(&mut self, msg: ControlMessage, ctx: &mut dyn SessionContext) {
        match msg {
            ControlMessage::ClientPath { path, version } => {
                debug!(session_id = self.id, path = %path, version = ?version, "worker client path");
                if version.is_some() {
                    self.worker_version = version;
                }
            }
            ControlMessage::FlushMessages => {
                self.queue_messages = true;
                for conn in self.watcher_conns() {
                    ctx.flush(conn);
                }
            }
            ControlMessage::Dump { filename, kind } => {
                let Some(base) = self.game.morgue_url(&self.username) else {
                    return;
                };
                let url = format!("{base}{filename}");
                if kind == "command" {
                    let msg = ServerMessage::Dump { url };
                    for conn in self.watcher_conns() {
                        ctx.send(conn, &msg);
                    }
                } else {
                    self.exit.dump_url = Some(url);
                }
            }
            ControlMessage::ExitReason { kind, message } => {
                self.exit.reason = Some(EndReason::from_worker(&kind));
                self.exit.message = message;
                self.exit.authoritative = true;
            }
            ControlMessage::Milestone(info) => self.set_where(info, ctx),
            ControlMessage::Unknown => {
                warn!(session_id = self.id, "unknown server-directed control message")
            }
        }
    }

    fn deliver_game_message(&mut self, msg: &str, ctx: &mut dyn SessionContext) {
        let flush = !self.queue_messages;
        if !self.fresh_watchers.is_empty() && is_full_map(msg) {
            for conn in self.fresh_watchers.drain() {
                ctx.queue_raw(conn, msg);
                if flush {
                    ctx.flush(conn);
                }
            }
            return;
        }
        for conn in self.watcher_conns() {
            ctx.queue_raw(conn, msg);
            if flush {
                ctx.flush(conn);
            }
        }
    }

    fn set_where(&mut self, info: WhereInfo, ctx: &mut dyn SessionContext) {
        let status = info.get("status").and_then(|s| s.as_str());
        let interesting = info.contains_key("milestone")
            || status == Some("chargen")
            || LOBBY_WHERE_KEYS
                .iter()
                .any(|k| info.get(*k) != self.location.get(*k));
        let milestone_only = status == Some("milestone_only");

        if info.contains_key("milestone") {
            self.last_milestone = Some(info.clone());
        }
        if !milestone_only {
            self.location = info;
        }
        if interesting {
            ctx.lobby_changed(self.id);
        }
    }

    fn on_process_exit(&mut self, exit_code: Option<i32>, ctx: &mut dyn SessionContext) {
        info!(
            session_id = self.id,
            username = %self.username,
            exit_code = ?exit_code,
            "worker exited"
        );
        self.recorder = None;
        self.kill_timer = None;

        if !self.exit.authoritative {
            match self.stream_crash.take() {
                Some(crash) => {
                    self.exit.reason = Some(EndReason::Crash);
                    self.exit.message = crash.message;
                    if crash.dump_url.is_some() {
                        self.exit.dump_url = crash.dump_url;
                    }
                }
                None => {
                    self.exit.reason = Some(reason_from_exit(
                        exit_code,
                        ExitContext {
                            stop_requested: self.stop_requested,
                            escalated: self.escalated,
                        },
                    ));
                }
            }
        }
        self.end(ctx);
    }

    fn on_kill_timeout(&mut self, ctx: &mut dyn SessionContext) {
        self.kill_timer = None;
        let Some(recorder) = self.recorder.as_ref() else {
            return;
        };
        warn!(
            session_id = self.id,
            pid = recorder.pid(),
            "worker ignored SIGHUP, sending SIGKILL"
        );
        self.escalated = true;
        match recorder.signal(Signal::ForceTerminate) {
            SignalOutcome::Delivered | SignalOutcome::NoSuchProcess => {}
            SignalOutcome::PermissionDenied => {
                error!(session_id = self.id, "no permission to kill worker");
                self.abandon_process(ctx);
            }
            SignalOutcome::Failed(e) => {
                error!(session_id = self.id, error = %e, "failed to kill worker");
                self.abandon_process(ctx);
            }
        }
    }

    fn on_idle_check(&mut self, ctx: &mut dyn SessionContext) {
        self.idle_timer = None;
        self.check_idle(ctx);
        if self.recorder.is_some()
            && !self.stop_requested
            && self.idle_time() > self.settings.max_idle_time
        {
            info!(session_id = self.id, username = %self.username, "stopping session after idle time limit");
            self.request_stop(ctx);
        }
        if !self.is_gone() {
            self.arm_idle_check(ctx);
        }
    }

    fn arm_idle_check(&mut self, ctx: &mut dyn SessionContext) {
        self.idle_timer = Some(ctx.schedule(
            self.id,
            self.settings.idle_check_interval,
            SessionEvent::IdleCheck,
        ));
    }

    fn check_idle(&mut self, ctx: &mut dyn SessionContext) {
        let idle = self.is_idle();
        if idle != self.was_idle {
            self.was_idle = idle;
            ctx.lobby_changed(self.id);
        }
    }

    fn note_activity(&mut self, ctx: &mut dyn SessionContext) {
        self.last_activity = Instant::now();
        self.check_idle(ctx);
    }

    // ------------------------------------------------------------------
    // Stop and teardown
    // ------------------------------------------------------------------

    /// Ask the worker to stop: SIGHUP now, SIGKILL after the kill timeout.
    /// A session still purging stale locks ends immediately.
    pub fn request_stop(&mut self, ctx: &mut dyn SessionContext) {
        if self.is_gone() {
            return;
        }
        if self.purge.is_some() {
            self.abort_purge(ctx);
            return;
        }
        let Some(recorder) = self.recorder.as_ref() else {
            return;
        };
        if self.stop_requested {
            return;
        }
        self.stop_requested = true;
        recorder.flush_transcript();
        match recorder.signal(Signal::Hangup) {
            SignalOutcome::Delivered => {
                debug!(session_id = self.id, pid = recorder.pid(), "sent SIGHUP to worker");
                self.kill_timer = Some(ctx.schedule(
                    self.id,
                    self.settings.kill_timeout,
                    SessionEvent::KillTimeout,
                ));
            }
            SignalOutcome::NoSuchProcess => {
                debug!(session_id = self.id, "worker already gone, waiting for exit");
            }
            SignalOutcome::PermissionDenied => {
                error!(session_id = self.id, "no permission to stop worker");
                self.abandon_process(ctx);
            }
            SignalOutcome::Failed(e) => {
                error!(session_id = self.id, error = %e, "failed to stop worker");
                self.abandon_process(ctx);
            }
        }
    }

    /// Give up on a worker that cannot be signalled. Its recorder task still
    /// reaps it eventually; that exit is then ignored.
    fn abandon_process(&mut self, ctx: &mut dyn SessionContext) {
        self.recorder = None;
        self.end(ctx);
    }

    /// End a discovered session whose socket disappeared.
    pub fn end_discovered(&mut self, ctx: &mut dyn SessionContext) {
        if self.origin == SessionOrigin::Discovered {
            self.end(ctx);
        }
    }

    fn end(&mut self, ctx: &mut dyn SessionContext) {
        if self.is_gone() {
            return;
        }
        if self.recorder.is_some() {
            self.request_stop(ctx);
            return;
        }
        self.state = SessionState::Ending;
        self.purge = None;
        self.kill_timer = None;
        self.idle_timer = None;
        if let Some(mut lock) = self.lock.take() {
            lock.release();
        }
        self.control = None;

        let (reason, message, dump) = self.end_summary();
        let notice = ServerMessage::GameEnded {
            reason,
            message,
            dump,
        };
        for watcher in std::mem::take(&mut self.watchers) {
            ctx.send(watcher.conn, &notice);
            ctx.return_to_lobby(watcher.conn, self.id, None);
        }
        self.fresh_watchers.clear();
        self.state = SessionState::Gone;
        info!(session_id = self.id, username = %self.username, reason = %reason, "session ended");
    }

    // ------------------------------------------------------------------
    // Watchers
    // ------------------------------------------------------------------

    pub fn add_watcher(&mut self, watcher: Watcher, ctx: &mut dyn SessionContext) {
        if self.is_gone() || self.has_watcher(watcher.conn) {
            return;
        }
        let conn = watcher.conn;
        let spectator = watcher.role == WatcherRole::Spectator;
        self.watchers.push(watcher);
        if spectator {
            self.last_watcher_join = Some(Instant::now());
            if let Some(control) = &self.control {
                self.fresh_watchers.insert(conn);
                control.send_command(&WorkerCommand::SpectatorJoined);
            }
        }
        self.update_watcher_description(ctx);
    }

    /// Returns whether `conn` was attached.
    pub fn remove_watcher(&mut self, conn: ConnId, ctx: &mut dyn SessionContext) -> bool {
        let before = self.watchers.len();
        self.watchers.retain(|w| w.conn != conn);
        self.fresh_watchers.remove(&conn);
        let removed = self.watchers.len() != before;
        if removed && !self.is_gone() {
            self.update_watcher_description(ctx);
        }
        removed
    }

    /// A spectator logged in while watching.
    pub fn update_watcher(
        &mut self,
        conn: ConnId,
        username: String,
        flags: UserFlags,
        ctx: &mut dyn SessionContext,
    ) {
        let Some(watcher) = self.watchers.iter_mut().find(|w| w.conn == conn) else {
            return;
        };
        watcher.username = Some(username);
        watcher.flags = flags;
        self.update_watcher_description(ctx);
        self.enforce_blocks(ctx);
    }

    /// Whether `viewer` (None = anonymous) is blocked by the player.
    pub fn is_blocked(&mut self, viewer: Option<&str>) -> bool {
        self.moderation
            .is_blocked(&self.username, viewer, Instant::now())
    }

    pub fn restore_blocklist(&mut self, stored: &str) {
        self.moderation.restore(stored);
    }

    fn watcher_conns(&self) -> Vec<ConnId> {
        self.watchers.iter().map(|w| w.conn).collect()
    }

    fn send_to_player(&self, msg: &ServerMessage, ctx: &mut dyn SessionContext) {
        if let Some(conn) = self.player_conn() {
            ctx.send(conn, msg);
        }
    }

    /// Visible spectator count and the names line.
    fn spectator_summary(&self) -> (usize, String) {
        let mut names: Vec<String> = Vec::new();
        if let Some(player) = self
            .watchers
            .iter()
            .find(|w| w.role == WatcherRole::Player)
            .and_then(|w| w.username.clone())
        {
            names.push(player);
        }
        let visible: Vec<&Watcher> = self
            .watchers
            .iter()
            .filter(|w| w.role == WatcherRole::Spectator && !w.chat_hidden)
            .collect();
        let mut named: Vec<String> = visible
            .iter()
            .filter_map(|w| w.username.clone())
            .collect();
        named.sort_by_key(|n| n.to_lowercase());
        let anon = visible.iter().filter(|w| w.username.is_none()).count();
        names.extend(named);
        if anon > 0 {
            names.push(format!("{anon} Anon"));
        }
        (visible.len(), names.join(", "))
    }

    pub fn spectator_count(&self) -> usize {
        self.spectator_summary().0
    }

    fn update_watcher_description(&mut self, ctx: &mut dyn SessionContext) {
        let (count, names) = self.spectator_summary();
        let msg = ServerMessage::UpdateSpectators { count, names };
        for conn in self.watcher_conns() {
            ctx.send(conn, &msg);
        }
        ctx.lobby_changed(self.id);
    }

    /// Send blocked spectators back to the lobby.
    fn enforce_blocks(&mut self, ctx: &mut dyn SessionContext) {
        let now = Instant::now();
        let candidates: Vec<(ConnId, Option<String>)> = self
            .watchers
            .iter()
            .filter(|w| w.role == WatcherRole::Spectator && !w.flags.admin)
            .map(|w| (w.conn, w.username.clone()))
            .collect();
        let mut blocked = Vec::new();
        for (conn, name) in candidates {
            if self
                .moderation
                .is_blocked(&self.username, name.as_deref(), now)
            {
                blocked.push(conn);
            }
        }
        for conn in blocked {
            self.remove_watcher(conn, ctx);
            ctx.return_to_lobby(conn, self.id, Some(SPECTATING_RESTRICTED.to_string()));
        }
    }

    // ------------------------------------------------------------------
    // Player input and chat
    // ------------------------------------------------------------------

    /// Messages from the controlling player that the broker does not handle
    /// itself. `raw` is forwarded verbatim where appropriate.
    pub fn handle_player_input(
        &mut self,
        raw: &str,
        msg: &ClientMessage,
        ctx: &mut dyn SessionContext,
    ) {
        match msg {
            ClientMessage::ForceTerminate { answer } => {
                if self.purge.is_none() {
                    return;
                }
                if *answer {
                    if let Some(purge) = self.purge.as_mut() {
                        purge.timer = None;
                    }
                    self.kill_stale(Signal::ForceTerminate, ctx);
                } else {
                    self.abort_purge(ctx);
                }
            }
            ClientMessage::StopStaleProcessPurge => self.abort_purge(ctx),
            ClientMessage::Input { data, text } => {
                if self.recorder.is_none() {
                    return;
                }
                self.note_activity(ctx);
                let mut input: String = data.iter().filter_map(|c| char::from_u32(*c)).collect();
                if let Some(text) = text {
                    input.push_str(text);
                }
                let bytes = input.into_bytes();
                if let Some(recorder) = &self.recorder {
                    recorder.write_input(bytes);
                }
            }
            _ => {
                if self.control.is_none() {
                    return;
                }
                self.note_activity(ctx);
                if let Some(control) = &self.control {
                    control.send(raw.to_string());
                }
            }
        }
    }

    pub fn handle_chat(&mut self, conn: ConnId, text: &str, ctx: &mut dyn SessionContext) {
        let Some(watcher) = self.watchers.iter().find(|w| w.conn == conn).cloned() else {
            return;
        };
        let Some(sender) = watcher.username.clone() else {
            ctx.send(conn, &ServerMessage::notice("You need to log in to send messages!"));
            return;
        };
        if watcher.flags.account_hold {
            ctx.send(conn, &ServerMessage::notice("Account restricted; chat is unavailable."));
            return;
        }
        if let Some(command) = parse_chat_command(text) {
            self.run_chat_command(&watcher, command, ctx);
            return;
        }

        let text: String = text.chars().take(self.settings.max_chat_length).collect();
        if text.trim().is_empty() {
            return;
        }
        let msg = ServerMessage::Chat {
            sender: Some(sender.clone()),
            content: text.clone(),
            meta: false,
        };
        for conn in self.watcher_conns() {
            ctx.send(conn, &msg);
        }
        if let Some(control) = &self.control {
            control.send_command(&WorkerCommand::Note {
                content: format!("{sender}: {text}"),
            });
        }
    }

    fn run_chat_command(
        &mut self,
        watcher: &Watcher,
        command: ChatCommand,
        ctx: &mut dyn SessionContext,
    ) {
        let conn = watcher.conn;
        let is_owner = watcher.role == WatcherRole::Player;

        match command {
            ChatCommand::Help => send_notice(ctx, conn, HELP_TEXT.to_string()),
            ChatCommand::Hide { forever } => {
                if forever {
                    if let Some(w) = self.watchers.iter_mut().find(|w| w.conn == conn) {
                        w.chat_hidden = true;
                    }
                    ctx.send(conn, &ServerMessage::SuperHideChat);
                    self.update_watcher_description(ctx);
                } else {
                    ctx.send(conn, &ServerMessage::ToggleChat);
                }
            }
            ChatCommand::Usage(usage) => send_notice(ctx, conn, format!("Usage: {usage}")),
            ChatCommand::Unknown(name) => send_notice(
                ctx,
                conn,
                format!("Unknown command {name}. Type /help for a list of commands."),
            ),
            _ if !is_owner => send_notice(ctx, conn, "Only the player can moderate spectators."),
            ChatCommand::Kick { target, duration } => {
                if target.eq_ignore_ascii_case(&self.username) {
                    send_notice(ctx, conn, "You can't kick yourself.");
                    return;
                }
                self.moderation.kick(&target, duration, Instant::now());
                send_notice(
                    ctx,
                    conn,
                    format!("Kicked {target} for {} minutes.", duration.as_secs() / 60),
                );
                self.enforce_blocks(ctx);
            }
            ChatCommand::Block(target) => {
                if self.moderation.block(&target) {
                    ctx.save_blocklist(&self.username, self.moderation.to_profile_value());
                    send_notice(ctx, conn, format!("Blocked {target}."));
                } else {
                    send_notice(ctx, conn, format!("{target} is already blocked."));
                }
                self.enforce_blocks(ctx);
            }
            ChatCommand::Unblock(target) => {
                if self.moderation.unblock(&target) {
                    ctx.save_blocklist(&self.username, self.moderation.to_profile_value());
                    send_notice(ctx, conn, format!("Unblocked {target}."));
                } else {
                    send_notice(ctx, conn, format!("{target} was not blocked."));
                }
            }
            ChatCommand::BlockList => {
                let list = self.moderation.blocked();
                if list.is_empty() {
                    send_notice(ctx, conn, "Nobody is blocked.");
                } else {
                    send_notice(ctx, conn, format!("Blocked: {}", list.join(", ")));
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Lobby
    // ------------------------------------------------------------------

    pub fn lobby_entry(&self) -> LobbyEntry {
        let location = LOBBY_WHERE_KEYS
            .iter()
            .filter_map(|k| self.location.get(*k).map(|v| (k.to_string(), v.clone())))
            .collect();
        let username = if self.account_restricted() {
            format!("[account hold] {}", self.username)
        } else {
            self.username.clone()
        };
        LobbyEntry {
            id: self.id,
            username,
            spectator_count: self.spectator_count(),
            idle_time: if self.is_idle() {
                self.idle_time().as_secs()
            } else {
                0
            },
            game_id: self.game.id.clone(),
            location,
            milestone: self
                .last_milestone
                .as_ref()
                .and_then(|m| m.get("milestone"))
                .and_then(|m| m.as_str())
                .map(str::to_string),
        }
    }
}

fn send_notice(ctx: &mut dyn SessionContext, conn: ConnId, text: impl Into<String>) {
    ctx.send(conn, &ServerMessage::notice(text));
}

/// A worker message that redraws the whole map.
fn is_full_map(msg: &str) -> bool {
    let head = &msg.as_bytes()[..msg.len().min(50)];
    contains(head, b"\"msg\":\"map\"") && contains(head, b"\"clear\":true")
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Create a directory if needed and return its canonical path.
fn prepare_dir(dir: &Path) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    std::fs::canonicalize(dir)
}
