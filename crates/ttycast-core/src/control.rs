//! Worker control-channel messages.
//!
//! The worker talks to the broker over a Unix datagram socket. Each message
//! is a JSON object terminated by `\n`; a large message may be split over
//! several datagrams, so the receiver reassembles until a datagram ends with
//! the terminator. Messages whose text starts with `*` are addressed to the
//! broker itself; everything else is a game message for the viewers.

use crate::error::{CastError, CastResult};
use crate::messages::WhereInfo;
use serde::{Deserialize, Serialize};

/// Prefix marking a worker message as directed at the broker.
pub const SERVER_DIRECTED_PREFIX: char = '*';

/// Upper bound for a single control datagram.
pub const MAX_DATAGRAM: usize = 128 * 1024;

/// Broker-directed messages sent by the worker.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "msg", rename_all = "snake_case")]
pub enum ControlMessage {
    ClientPath {
        path: String,
        #[serde(default)]
        version: Option<String>,
    },
    FlushMessages,
    Dump {
        filename: String,
        #[serde(rename = "type")]
        kind: String,
    },
    ExitReason {
        #[serde(rename = "type")]
        kind: String,
        #[serde(default)]
        message: Option<String>,
    },
    Milestone(WhereInfo),
    #[serde(other)]
    Unknown,
}

/// A complete inbound control message, classified.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundControl {
    ServerDirected(ControlMessage),
    /// Game message to forward verbatim to viewers (terminator stripped).
    Game(String),
}

impl InboundControl {
    /// Classify one reassembled message.
    pub fn parse(text: &str) -> CastResult<Self> {
        let text = text.trim_end_matches(['\n', '\r']);
        match text.strip_prefix(SERVER_DIRECTED_PREFIX) {
            Some(rest) => {
                let msg = serde_json::from_str(rest).map_err(|e| {
                    CastError::InvalidMessage(format!("control message: {e}"))
                })?;
                Ok(Self::ServerDirected(msg))
            }
            None => Ok(Self::Game(text.to_string())),
        }
    }
}

/// Messages the broker sends to the worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "msg", rename_all = "snake_case")]
pub enum WorkerCommand {
    Attach { primary: bool },
    SpectatorJoined,
    Note { content: String },
    ServerAnnouncement { content: String },
}

impl WorkerCommand {
    pub fn encode(&self) -> CastResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Buffers a partial message across datagrams. At most one fragment is
/// outstanding at any time.
#[derive(Debug, Default)]
pub struct DatagramReassembler {
    pending: Option<Vec<u8>>,
}

impl DatagramReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one datagram. Returns the complete message once a datagram
    /// ending in `\n` arrives.
    pub fn push(&mut self, datagram: &[u8]) -> Option<Vec<u8>> {
        let data = match self.pending.take() {
            Some(mut fragment) => {
                fragment.extend_from_slice(datagram);
                fragment
            }
            None => datagram.to_vec(),
        };
        if data.last() == Some(&b'\n') {
            Some(data)
        } else {
            self.pending = Some(data);
            None
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn reset(&mut self) {
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn split_message_equals_single_datagram() {
        let message = b"{\"msg\":\"map\",\"cells\":[1,2,3,4,5,6,7,8]}\n";

        let mut single = DatagramReassembler::new();
        let whole = single.push(message).unwrap();

        for split in 1..message.len() {
            let mut r = DatagramReassembler::new();
            assert_eq!(r.push(&message[..split]), None);
            assert!(r.has_pending());
            let joined = r.push(&message[split..]).unwrap();
            assert_eq!(joined, whole);
            assert!(!r.has_pending());
        }
    }

    #[test]
    fn three_fragments() {
        let mut r = DatagramReassembler::new();
        assert_eq!(r.push(b"{\"msg\":"), None);
        assert_eq!(r.push(b"\"ping\""), None);
        assert_eq!(r.push(b"}\n").unwrap(), b"{\"msg\":\"ping\"}\n".to_vec());
    }

    #[test]
    fn reset_drops_fragment() {
        let mut r = DatagramReassembler::new();
        r.push(b"{\"partial");
        r.reset();
        assert_eq!(r.push(b"{}\n").unwrap(), b"{}\n".to_vec());
    }

    #[test]
    fn parse_server_directed() {
        let msg = InboundControl::parse("*{\"msg\":\"exit_reason\",\"type\":\"crash\",\"message\":\"boom\"}\n")
            .unwrap();
        assert_eq!(
            msg,
            InboundControl::ServerDirected(ControlMessage::ExitReason {
                kind: "crash".into(),
                message: Some("boom".into()),
            })
        );

        let msg = InboundControl::parse("*{\"msg\":\"milestone\",\"xl\":3,\"milestone\":\"reached XL3\"}")
            .unwrap();
        match msg {
            InboundControl::ServerDirected(ControlMessage::Milestone(info)) => {
                assert_eq!(info.get("xl"), Some(&json!(3)));
                assert!(info.get("msg").is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parse_unknown_and_game_messages() {
        assert_eq!(
            InboundControl::parse("*{\"msg\":\"whatever\"}").unwrap(),
            InboundControl::ServerDirected(ControlMessage::Unknown)
        );
        assert_eq!(
            InboundControl::parse("{\"msg\":\"map\"}\n").unwrap(),
            InboundControl::Game("{\"msg\":\"map\"}".into())
        );
        assert!(InboundControl::parse("*not json").is_err());
    }

    #[test]
    fn attach_encoding() {
        let v: serde_json::Value =
            serde_json::from_str(&WorkerCommand::Attach { primary: true }.encode().unwrap())
                .unwrap();
        assert_eq!(v, json!({"msg": "attach", "primary": true}));
    }
}
