//! JSON envelopes exchanged between browser clients and the broker.
//!
//! Every envelope is an object whose `msg` field selects the type. The
//! broker batches outbound envelopes (see [`crate::codec`]); inbound
//! envelopes arrive one per WebSocket frame.

use crate::error::CastResult;
use serde::{Deserialize, Serialize};

/// Free-form "where" snapshot reported by a worker (level, place, god, ...).
pub type WhereInfo = serde_json::Map<String, serde_json::Value>;

/// Keys of a [`WhereInfo`] that are shown in the lobby and whose change is
/// worth a lobby update.
pub const LOBBY_WHERE_KEYS: [&str; 7] = ["xl", "char", "place", "turn", "dur", "god", "title"];

/// Messages sent by a client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "msg", rename_all = "snake_case")]
pub enum ClientMessage {
    Login {
        username: String,
        password: String,
    },
    Play {
        game_id: String,
    },
    Watch {
        username: String,
    },
    Pong,
    GoLobby,
    ChatMsg {
        text: String,
    },
    /// Keyboard input for the worker: either char codes or literal text.
    Input {
        #[serde(default)]
        data: Vec<u32>,
        #[serde(default)]
        text: Option<String>,
    },
    /// Answer to the stale-process dialog.
    ForceTerminate {
        answer: bool,
    },
    StopStaleProcessPurge,
    /// Any other message; forwarded verbatim to the worker while playing.
    #[serde(other)]
    Other,
}

impl ClientMessage {
    /// Decode one client envelope.
    pub fn decode(raw: &str) -> CastResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Extract the `msg` tag of a raw envelope without decoding the rest.
pub fn message_tag(raw: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct Tag {
        msg: String,
    }
    serde_json::from_str::<Tag>(raw).ok().map(|t| t.msg)
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndReason {
    Normal,
    Crash,
    Error,
    Forced,
}

impl EndReason {
    /// Map the `type` of a worker `exit_reason` message.
    pub fn from_worker(kind: &str) -> Self {
        match kind {
            "crash" => Self::Crash,
            "error" => Self::Error,
            "forced" | "killed" => Self::Forced,
            _ => Self::Normal,
        }
    }
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Normal => "normal",
            Self::Crash => "crash",
            Self::Error => "error",
            Self::Forced => "forced",
        };
        f.write_str(s)
    }
}

/// Summary of one session as shown in the lobby.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LobbyEntry {
    pub id: u64,
    pub username: String,
    pub spectator_count: usize,
    /// Seconds since last activity, or 0 while not idle.
    pub idle_time: u64,
    pub game_id: String,
    #[serde(flatten)]
    pub location: WhereInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub milestone: Option<String>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Messages sent by the broker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "msg", rename_all = "snake_case")]
pub enum ServerMessage {
    Ping,
    LoginSuccess {
        username: String,
        admin: bool,
    },
    LoginFail {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    SetAccountHold,
    LoginRequired {
        game: String,
    },
    GameStarted,
    GameEnded {
        reason: EndReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        dump: Option<String>,
    },
    GoLobby,
    LobbyClear,
    LobbyEntry(LobbyEntry),
    LobbyRemove {
        id: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<EndReason>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        dump: Option<String>,
    },
    LobbyComplete,
    WatchingStarted {
        username: String,
    },
    UpdateSpectators {
        count: usize,
        names: String,
    },
    Chat {
        #[serde(skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
        content: String,
        #[serde(skip_serializing_if = "is_false")]
        meta: bool,
    },
    ToggleChat,
    SuperHideChat,
    StaleProcesses {
        timeout: u64,
        game: String,
    },
    HideDialog,
    Dump {
        url: String,
    },
    AuthError {
        reason: String,
    },
    Close {
        reason: String,
    },
}

impl ServerMessage {
    /// A chat line that only the addressed user sees.
    pub fn notice(content: impl Into<String>) -> Self {
        Self::Chat {
            sender: None,
            content: content.into(),
            meta: true,
        }
    }

    pub fn to_json(&self) -> CastResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}
