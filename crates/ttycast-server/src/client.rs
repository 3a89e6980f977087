//! Per-connection protocol state kept by the broker.
//!
//! The WebSocket task owns the socket; the broker owns this record and
//! talks to the task through an outbound frame channel. Messages are queued
//! and coalesced into one `{"msgs":[...]}` batch per flush.

use crate::auth::UserFlags;
use crate::session::{ConnId, SessionId};
use crate::timer::TimerHandle;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use ttycast_core::{encode_batch, CastResult, Deflater, ServerMessage};

/// Failed sends after which the connection is aborted.
pub const MAX_FAILED_SENDS: u32 = 3;

/// Frames handed to a connection's socket task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// What a connection is doing. Exactly one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    Lobby,
    Playing(SessionId),
    Spectating(SessionId),
}

impl ConnectionMode {
    pub fn session(self) -> Option<SessionId> {
        match self {
            Self::Lobby => None,
            Self::Playing(id) | Self::Spectating(id) => Some(id),
        }
    }
}

pub struct ClientConnection {
    pub id: ConnId,
    pub remote: SocketAddr,
    pub username: Option<String>,
    pub flags: UserFlags,
    pub mode: ConnectionMode,
    pub game_id: Option<String>,
    pub received_pong: bool,
    pub heartbeat: Option<TimerHandle>,
    /// The socket is gone; the record lives on until its session ends.
    pub closed: bool,
    queue: Vec<String>,
    deflater: Option<Deflater>,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    failed_sends: u32,
    bytes_queued: u64,
    bytes_sent: u64,
}

impl ClientConnection {
    pub fn new(
        id: ConnId,
        remote: SocketAddr,
        compression: bool,
        outbound: mpsc::UnboundedSender<OutboundFrame>,
    ) -> Self {
        Self {
            id,
            remote,
            username: None,
            flags: UserFlags::default(),
            mode: ConnectionMode::Lobby,
            game_id: None,
            received_pong: false,
            heartbeat: None,
            closed: false,
            queue: Vec::new(),
            deflater: compression.then(Deflater::new),
            outbound,
            failed_sends: 0,
            bytes_queued: 0,
            bytes_sent: 0,
        }
    }

    pub fn is_in_lobby(&self) -> bool {
        self.mode == ConnectionMode::Lobby
    }

    pub fn is_admin(&self) -> bool {
        self.flags.admin
    }

    pub fn compression(&self) -> bool {
        self.deflater.is_some()
    }

    pub fn bytes_queued(&self) -> u64 {
        self.bytes_queued
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn failed_sends(&self) -> u32 {
        self.failed_sends
    }

    /// Queue a message; it goes out with the next flush.
    pub fn queue_message(&mut self, msg: &ServerMessage) {
        match msg.to_json() {
            Ok(json) => self.append_raw(json),
            Err(e) => warn!(conn_id = self.id, error = %e, "failed to encode message"),
        }
    }

    /// Queue an already-encoded message.
    pub fn append_raw(&mut self, raw: impl Into<String>) {
        if self.closed {
            return;
        }
        let raw = raw.into();
        self.bytes_queued += raw.len() as u64;
        self.queue.push(raw);
    }

    pub fn has_queued(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Send the queue as one batch. Returns false when the connection has
    /// failed too often and should be aborted.
    pub fn flush(&mut self) -> bool {
        if self.closed || self.queue.is_empty() {
            return true;
        }
        let batch = encode_batch(&self.queue);
        self.queue.clear();

        let frame = match self.frame(batch) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(conn_id = self.id, error = %e, "failed to compress batch");
                return self.record_failure();
            }
        };
        let len = match &frame {
            OutboundFrame::Text(t) => t.len(),
            OutboundFrame::Binary(b) => b.len(),
            OutboundFrame::Close => 0,
        };
        if self.outbound.send(frame).is_err() {
            debug!(conn_id = self.id, "send on closed socket");
            return self.record_failure();
        }
        self.bytes_sent += len as u64;
        true
    }

    fn frame(&mut self, batch: String) -> CastResult<OutboundFrame> {
        match self.deflater.as_mut() {
            Some(deflater) => Ok(OutboundFrame::Binary(deflater.compress(batch.as_bytes())?)),
            None => Ok(OutboundFrame::Text(batch)),
        }
    }

    /// Count a failed send reported by the socket task. Returns false once
    /// the connection should be aborted.
    pub fn record_failure(&mut self) -> bool {
        self.failed_sends += 1;
        self.failed_sends < MAX_FAILED_SENDS
    }

    /// Flush what is queued, then ask the socket task to close.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.flush();
        let _ = self.outbound.send(OutboundFrame::Close);
        self.closed = true;
        self.heartbeat = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{Decompress, FlushDecompress};

    fn remote() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn flush_coalesces_into_one_text_batch() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut conn = ClientConnection::new(1, remote(), false, tx);
        conn.queue_message(&ServerMessage::Ping);
        conn.append_raw(r#"{"msg":"txt"}"#);
        assert!(conn.flush());
        assert_eq!(
            rx.try_recv().unwrap(),
            OutboundFrame::Text(r#"{"msgs":[{"msg":"ping"},{"msg":"txt"}]}"#.into())
        );
        assert!(rx.try_recv().is_err());

        assert!(conn.flush());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn compressed_batches_inflate_back() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut conn = ClientConnection::new(1, remote(), true, tx);
        conn.queue_message(&ServerMessage::LobbyComplete);
        conn.flush();
        let OutboundFrame::Binary(mut data) = rx.try_recv().unwrap() else {
            panic!("expected binary frame");
        };
        data.extend_from_slice(&[0, 0, 0xff, 0xff]);
        let mut inflater = Decompress::new(false);
        let mut out = Vec::with_capacity(256);
        inflater
            .decompress_vec(&data, &mut out, FlushDecompress::Sync)
            .unwrap();
        assert_eq!(out, br#"{"msgs":[{"msg":"lobby_complete"}]}"#);
    }

    #[test]
    fn aborts_after_repeated_failures() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut conn = ClientConnection::new(1, remote(), false, tx);
        conn.queue_message(&ServerMessage::Ping);
        assert!(conn.flush());
        conn.queue_message(&ServerMessage::Ping);
        assert!(conn.flush());
        conn.queue_message(&ServerMessage::Ping);
        assert!(!conn.flush());
        assert_eq!(conn.failed_sends(), MAX_FAILED_SENDS);
    }

    #[test]
    fn closed_connection_drops_messages() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut conn = ClientConnection::new(1, remote(), false, tx);
        conn.close();
        assert_eq!(rx.try_recv().unwrap(), OutboundFrame::Close);
        conn.queue_message(&ServerMessage::Ping);
        assert!(!conn.has_queued());
    }
}
