//! Spectator blocking, kicks and chat commands.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

/// Block entry matching every spectator except the owner.
pub const BLOCK_ALL: &str = "[all]";
/// Block entry matching anonymous spectators.
pub const BLOCK_ANON: &str = "[anon]";
pub const DEFAULT_KICK: Duration = Duration::from_secs(15 * 60);
/// Commands are cut to this length before parsing.
pub const MAX_COMMAND_LENGTH: usize = 500;

pub const HELP_TEXT: &str = "Chat commands: /help, /hide [forever], /kick <name> [minutes], \
/block <name|[anon]|[all]>, /unblock <name|*>, /blocklist (/mute, /unmute and /mutelist also work)";

/// Per-session block list, owned by the session's player.
#[derive(Debug, Default)]
pub struct Moderation {
    blocked: BTreeSet<String>,
    kicked: HashMap<String, Instant>,
}

impl Moderation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the block list with a stored space-separated list.
    pub fn restore(&mut self, stored: &str) {
        self.blocked = stored.split_whitespace().map(str::to_string).collect();
    }

    /// Space-separated form for the profile store.
    pub fn to_profile_value(&self) -> String {
        self.blocked.iter().cloned().collect::<Vec<_>>().join(" ")
    }

    pub fn blocked(&self) -> Vec<String> {
        self.blocked.iter().cloned().collect()
    }

    fn find(&self, name: &str) -> Option<&String> {
        self.blocked.iter().find(|b| b.eq_ignore_ascii_case(name))
    }

    /// Returns false if `name` was already blocked.
    pub fn block(&mut self, name: &str) -> bool {
        if self.find(name).is_some() {
            return false;
        }
        self.blocked.insert(name.to_string())
    }

    /// `*` clears the whole list. Returns whether anything changed.
    pub fn unblock(&mut self, name: &str) -> bool {
        if name == "*" {
            let changed = !self.blocked.is_empty();
            self.blocked.clear();
            return changed;
        }
        match self.find(name).cloned() {
            Some(entry) => self.blocked.remove(&entry),
            None => false,
        }
    }

    pub fn kick(&mut self, name: &str, duration: Duration, now: Instant) {
        self.kicked.insert(name.to_lowercase(), now + duration);
    }

    /// Whether `viewer` (None = anonymous) may not watch `owner`'s session.
    pub fn is_blocked(&mut self, owner: &str, viewer: Option<&str>, now: Instant) -> bool {
        self.kicked.retain(|_, until| *until > now);
        let Some(viewer) = viewer else {
            return self.find(BLOCK_ANON).is_some() || self.find(BLOCK_ALL).is_some();
        };
        if viewer.eq_ignore_ascii_case(owner) {
            return false;
        }
        self.find(BLOCK_ALL).is_some()
            || self.find(viewer).is_some()
            || self.kicked.contains_key(&viewer.to_lowercase())
    }
}

/// A parsed chat command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Help,
    Hide { forever: bool },
    Kick { target: String, duration: Duration },
    Block(String),
    Unblock(String),
    BlockList,
    /// Known command with bad arguments; carries the usage line.
    Usage(&'static str),
    Unknown(String),
}

/// Parse `text` as a chat command. Returns `None` for ordinary chat.
pub fn parse_chat_command(text: &str) -> Option<ChatCommand> {
    let text = text.trim();
    if !text.starts_with('/') {
        return None;
    }
    let text: String = text.chars().take(MAX_COMMAND_LENGTH).collect();
    let mut parts = text.split_whitespace();
    let command = parts.next()?.to_lowercase();
    let first = parts.next().map(str::to_string);
    let second = parts.next();

    let parsed = match command.as_str() {
        "/help" => ChatCommand::Help,
        "/hide" => ChatCommand::Hide {
            forever: first.as_deref() == Some("forever"),
        },
        "/kick" => match first {
            Some(target) => match second.map(str::parse::<u64>) {
                None => ChatCommand::Kick {
                    target,
                    duration: DEFAULT_KICK,
                },
                Some(Ok(minutes)) if minutes > 0 => ChatCommand::Kick {
                    target,
                    duration: Duration::from_secs(minutes * 60),
                },
                Some(_) => ChatCommand::Usage("/kick <name> [minutes]"),
            },
            None => ChatCommand::Usage("/kick <name> [minutes]"),
        },
        "/block" | "/mute" => match first {
            Some(target) => ChatCommand::Block(target),
            None => ChatCommand::Usage("/block <name|[anon]|[all]>"),
        },
        "/unblock" | "/unmute" => match first {
            Some(target) => ChatCommand::Unblock(target),
            None => ChatCommand::Usage("/unblock <name|*>"),
        },
        "/blocklist" | "/mutelist" => ChatCommand::BlockList,
        _ => ChatCommand::Unknown(command),
    };
    Some(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_block_is_case_insensitive() {
        let mut m = Moderation::new();
        let now = Instant::now();
        assert!(m.block("Bob"));
        assert!(!m.block("bob"));
        assert!(m.is_blocked("alice", Some("BOB"), now));
        assert!(!m.is_blocked("alice", Some("carol"), now));
        assert!(!m.is_blocked("alice", None, now));
    }

    #[test]
    fn special_entries() {
        let now = Instant::now();
        let mut m = Moderation::new();
        m.block(BLOCK_ANON);
        assert!(m.is_blocked("alice", None, now));
        assert!(!m.is_blocked("alice", Some("bob"), now));

        let mut m = Moderation::new();
        m.block(BLOCK_ALL);
        assert!(m.is_blocked("alice", None, now));
        assert!(m.is_blocked("alice", Some("bob"), now));
        assert!(!m.is_blocked("alice", Some("Alice"), now));
    }

    #[test]
    fn kicks_expire() {
        let mut m = Moderation::new();
        let now = Instant::now();
        m.kick("Bob", Duration::from_secs(60), now);
        assert!(m.is_blocked("alice", Some("bob"), now));
        assert!(!m.is_blocked("alice", Some("bob"), now + Duration::from_secs(61)));
        assert_eq!(m.to_profile_value(), "");
    }

    #[test]
    fn unblock_star_clears() {
        let mut m = Moderation::new();
        m.restore("bob  carol [anon]");
        assert_eq!(m.blocked().len(), 3);
        assert!(m.unblock("CAROL"));
        assert!(!m.unblock("carol"));
        assert_eq!(m.to_profile_value(), "[anon] bob");
        assert!(m.unblock("*"));
        assert!(m.blocked().is_empty());
        assert!(!m.unblock("*"));
    }

    #[test]
    fn parse_commands() {
        assert_eq!(parse_chat_command("hello"), None);
        assert_eq!(parse_chat_command("/help"), Some(ChatCommand::Help));
        assert_eq!(
            parse_chat_command("/hide forever"),
            Some(ChatCommand::Hide { forever: true })
        );
        assert_eq!(
            parse_chat_command("/kick bob 5"),
            Some(ChatCommand::Kick {
                target: "bob".into(),
                duration: Duration::from_secs(300)
            })
        );
        assert_eq!(
            parse_chat_command("/kick bob"),
            Some(ChatCommand::Kick {
                target: "bob".into(),
                duration: DEFAULT_KICK
            })
        );
        assert_eq!(
            parse_chat_command("/kick bob soon"),
            Some(ChatCommand::Usage("/kick <name> [minutes]"))
        );
        assert_eq!(
            parse_chat_command("/MUTE bob"),
            Some(ChatCommand::Block("bob".into()))
        );
        assert_eq!(parse_chat_command("/mutelist"), Some(ChatCommand::BlockList));
        assert_eq!(
            parse_chat_command("/dance"),
            Some(ChatCommand::Unknown("/dance".into()))
        );
    }
}
