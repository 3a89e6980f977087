//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use ttycast_core::{CastError, CastResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub games: BTreeMap<String, GameSection>,
    #[serde(default)]
    pub users: BTreeMap<String, UserSection>,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    #[serde(default = "default_max_idle_time")]
    pub max_idle_time: u64,
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold: u64,
    #[serde(default = "default_idle_check_interval")]
    pub idle_check_interval: u64,
    #[serde(default = "default_lobby_update_rate")]
    pub lobby_update_rate: u64,
    #[serde(default = "default_kill_timeout")]
    pub kill_timeout: u64,
    #[serde(default = "default_stale_purge_grace")]
    pub stale_purge_grace: u64,
    #[serde(default = "default_term_size")]
    pub recording_term_size: (u16, u16),
    #[serde(default)]
    pub server_id: String,
    #[serde(default = "default_true")]
    pub enable_transcripts: bool,
    #[serde(default)]
    pub watch_socket_dirs: bool,
    #[serde(default = "default_max_chat_length")]
    pub max_chat_length: usize,
    #[serde(default)]
    pub control_socket_dir: Option<String>,
    #[serde(default = "default_profile_dir")]
    pub profile_dir: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            max_connections: default_max_connections(),
            connection_timeout: default_connection_timeout(),
            max_idle_time: default_max_idle_time(),
            idle_threshold: default_idle_threshold(),
            idle_check_interval: default_idle_check_interval(),
            lobby_update_rate: default_lobby_update_rate(),
            kill_timeout: default_kill_timeout(),
            stale_purge_grace: default_stale_purge_grace(),
            recording_term_size: default_term_size(),
            server_id: String::new(),
            enable_transcripts: true,
            watch_socket_dirs: false,
            max_chat_length: default_max_chat_length(),
            control_socket_dir: None,
            profile_dir: default_profile_dir(),
        }
    }
}

/// `[games.<id>]` section: how to launch one kind of worker.
#[derive(Debug, Clone, Deserialize)]
pub struct GameSection {
    #[serde(default)]
    pub name: Option<String>,
    pub binary: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub socket_path: String,
    pub lock_path: String,
    #[serde(default)]
    pub transcript_path: Option<String>,
    #[serde(default)]
    pub morgue_url: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default = "default_socket_arg")]
    pub socket_arg: String,
    #[serde(default = "default_extra_args")]
    pub extra_args: Vec<String>,
    #[serde(default = "default_true")]
    pub allowed_with_hold: bool,
}

/// `[users.<name>]` section consumed by the credential store.
#[derive(Debug, Clone, Deserialize)]
pub struct UserSection {
    pub password_sha256: String,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub account_hold: bool,
    #[serde(default)]
    pub banned: bool,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_max_connections() -> usize {
    100
}
fn default_connection_timeout() -> u64 {
    600
}
fn default_max_idle_time() -> u64 {
    5 * 3600
}
fn default_idle_threshold() -> u64 {
    30
}
fn default_idle_check_interval() -> u64 {
    10
}
fn default_lobby_update_rate() -> u64 {
    2
}
fn default_kill_timeout() -> u64 {
    10
}
fn default_stale_purge_grace() -> u64 {
    10
}
fn default_term_size() -> (u16, u16) {
    (80, 24)
}
fn default_max_chat_length() -> usize {
    1000
}
fn default_profile_dir() -> String {
    "~/.ttycast/profiles".to_string()
}
fn default_socket_arg() -> String {
    "-webtiles-socket".to_string()
}
fn default_extra_args() -> Vec<String> {
    vec!["-await-connection".to_string()]
}
fn default_true() -> bool {
    true
}

/// Resolved launch description of one game.
#[derive(Debug, Clone)]
pub struct GameConfig {
    pub id: String,
    pub name: String,
    pub binary: PathBuf,
    pub args: Vec<String>,
    socket_path: String,
    lock_path: String,
    transcript_path: Option<String>,
    morgue_url: Option<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub socket_arg: String,
    pub extra_args: Vec<String>,
    pub allowed_with_hold: bool,
}

impl GameConfig {
    fn from_section(id: &str, section: GameSection) -> Self {
        Self {
            id: id.to_string(),
            name: section.name.unwrap_or_else(|| id.to_string()),
            binary: expand_tilde_str(&section.binary),
            args: section.args,
            socket_path: section.socket_path,
            lock_path: section.lock_path,
            transcript_path: section.transcript_path,
            morgue_url: section.morgue_url,
            env: section.env,
            cwd: section.cwd.map(|c| expand_tilde_str(&c)),
            socket_arg: section.socket_arg,
            extra_args: section.extra_args,
            allowed_with_hold: section.allowed_with_hold,
        }
    }

    /// Directory the worker creates its control socket in.
    pub fn socket_dir(&self, username: &str) -> PathBuf {
        expand_tilde_str(&substitute_username(&self.socket_path, username))
    }

    /// Directory holding the per-user lock artifacts.
    pub fn lock_dir(&self, username: &str) -> PathBuf {
        expand_tilde_str(&substitute_username(&self.lock_path, username))
    }

    pub fn transcript_dir(&self, username: &str) -> Option<PathBuf> {
        self.transcript_path
            .as_deref()
            .map(|p| expand_tilde_str(&substitute_username(p, username)))
    }

    pub fn morgue_url(&self, username: &str) -> Option<String> {
        self.morgue_url
            .as_deref()
            .map(|u| substitute_username(u, username))
    }

    /// Socket directory without username substitution, used to attribute
    /// discovered sockets to a game.
    pub fn socket_dir_template(&self) -> PathBuf {
        expand_tilde_str(&self.socket_path)
    }

    /// Full argument list for a worker owned by `username`.
    pub fn invocation(&self, username: &str, socket: &Path) -> Vec<String> {
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|a| substitute_username(a, username))
            .collect();
        args.push(self.socket_arg.clone());
        args.push(socket.to_string_lossy().into_owned());
        args.extend(self.extra_args.iter().cloned());
        args
    }

    /// Whitelisted environment for the worker.
    pub fn environment(&self, username: &str) -> Vec<(String, String)> {
        self.env
            .iter()
            .map(|(k, v)| (k.clone(), substitute_username(v, username)))
            .collect()
    }
}

/// Timing and size knobs shared by every session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub idle_threshold: Duration,
    pub max_idle_time: Duration,
    pub idle_check_interval: Duration,
    pub kill_timeout: Duration,
    pub stale_purge_grace: Duration,
    pub stale_recheck_interval: Duration,
    pub stale_recheck_limit: u32,
    pub term_size: (u16, u16),
    pub server_id: String,
    pub enable_transcripts: bool,
    pub max_chat_length: usize,
    pub control_socket_dir: Option<PathBuf>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_section(&ServerSection::default())
    }
}

impl SessionSettings {
    fn from_section(server: &ServerSection) -> Self {
        Self {
            idle_threshold: Duration::from_secs(server.idle_threshold),
            max_idle_time: Duration::from_secs(server.max_idle_time),
            idle_check_interval: Duration::from_secs(server.idle_check_interval.max(1)),
            kill_timeout: Duration::from_secs(server.kill_timeout),
            stale_purge_grace: Duration::from_secs(server.stale_purge_grace),
            stale_recheck_interval: Duration::from_secs(1),
            stale_recheck_limit: 10,
            term_size: server.recording_term_size,
            server_id: server.server_id.clone(),
            enable_transcripts: server.enable_transcripts,
            max_chat_length: server.max_chat_length,
            control_socket_dir: server
                .control_socket_dir
                .as_deref()
                .map(expand_tilde_str),
        }
    }
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub max_connections: usize,
    pub connection_timeout: Duration,
    pub lobby_update_rate: Duration,
    pub watch_socket_dirs: bool,
    pub profile_dir: PathBuf,
    pub session: SessionSettings,
    pub games: BTreeMap<String, std::sync::Arc<GameConfig>>,
    pub users: HashMap<String, UserSection>,
}

/// CLI values that override the config file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub max_connections: Option<usize>,
    pub watch_socket_dirs: bool,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> CastResult<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                Self::parse(&content)?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        Ok(Self::from_file(file_config, cli))
    }

    pub fn parse(content: &str) -> CastResult<ConfigFile> {
        toml::from_str::<ConfigFile>(content)
            .map_err(|e| CastError::Other(format!("config parse error: {e}")))
    }

    pub fn from_file(file_config: ConfigFile, cli: CliOverrides) -> Self {
        let server = file_config.server;
        let games = file_config
            .games
            .into_iter()
            .map(|(id, section)| {
                let game = GameConfig::from_section(&id, section);
                (id, std::sync::Arc::new(game))
            })
            .collect();

        Self {
            bind: cli.bind.unwrap_or_else(|| server.bind.clone()),
            port: cli.port.unwrap_or(server.port),
            max_connections: cli.max_connections.unwrap_or(server.max_connections),
            connection_timeout: Duration::from_secs(server.connection_timeout),
            lobby_update_rate: Duration::from_secs(server.lobby_update_rate.max(1)),
            watch_socket_dirs: cli.watch_socket_dirs || server.watch_socket_dirs,
            profile_dir: expand_tilde_str(&server.profile_dir),
            session: SessionSettings::from_section(&server),
            games,
            users: file_config.users.into_iter().collect(),
        }
    }

    pub fn game(&self, id: &str) -> Option<&std::sync::Arc<GameConfig>> {
        self.games.get(id)
    }

    /// Every directory the directory watcher should observe.
    pub fn socket_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = self
            .games
            .values()
            .map(|g| g.socket_dir_template())
            .collect();
        dirs.sort();
        dirs.dedup();
        dirs
    }

    /// Attribute a discovered socket to a game. The text between `:` and
    /// `.sock` wins when it names a game with a matching socket dir.
    pub fn game_for_socket(&self, dir: &Path, file_name: &str) -> Option<std::sync::Arc<GameConfig>> {
        let same_dir = |g: &GameConfig| same_path(&g.socket_dir_template(), dir);
        if let Some(named) = file_name
            .split_once(':')
            .and_then(|(_, rest)| rest.strip_suffix(".sock"))
        {
            if let Some(game) = self.games.get(named) {
                if same_dir(game) {
                    return Some(game.clone());
                }
            }
        }
        self.games.values().find(|g| same_dir(g)).cloned()
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Replace `%n` with the username.
pub fn substitute_username(template: &str, username: &str) -> String {
    template.replace("%n", username)
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
