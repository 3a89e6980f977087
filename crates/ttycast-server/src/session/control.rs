//! Control channel: Unix datagram link to a worker's control socket.
//!
//! The broker binds a private socket and addresses the worker's socket. The
//! first datagram is always `attach`. Inbound datagrams are reassembled into
//! newline-terminated messages and handed to the owning session; outbound
//! sends retry while the worker's socket does not exist yet.

use super::EventSink;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::UnixDatagram;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use ttycast_core::control::MAX_DATAGRAM;
use ttycast_core::{CastError, CastResult, DatagramReassembler, WorkerCommand};

const RETRY_INTERVAL: Duration = Duration::from_millis(100);
const WARN_AFTER_ATTEMPTS: u32 = 10;
const MAX_SEND_ATTEMPTS: u32 = 100;
const SLOW_SEND: Duration = Duration::from_secs(1);

static NEXT_CHANNEL: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// A complete message, terminator included.
    Message(String),
    /// The link failed; nothing more will arrive.
    Closed,
}

pub struct ControlChannel {
    outbound: mpsc::UnboundedSender<String>,
    local_path: PathBuf,
    peer: PathBuf,
    task: JoinHandle<()>,
}

impl ControlChannel {
    /// Bind a private socket in `bind_dir` and attach to the worker at `peer`.
    pub fn connect(
        peer: PathBuf,
        bind_dir: &Path,
        primary: bool,
        sink: EventSink<ControlEvent>,
    ) -> CastResult<Self> {
        std::fs::create_dir_all(bind_dir)?;
        let local_path = bind_dir.join(format!(
            "ttycast-{}-{}.socket",
            std::process::id(),
            NEXT_CHANNEL.fetch_add(1, Ordering::Relaxed)
        ));
        let _ = std::fs::remove_file(&local_path);
        let socket = UnixDatagram::bind(&local_path).map_err(|e| {
            CastError::Transport(format!("cannot bind {}: {e}", local_path.display()))
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(WorkerCommand::Attach { primary }.encode()?);
        let task = tokio::spawn(run(socket, peer.clone(), rx, sink));
        debug!(peer = %peer.display(), local = %local_path.display(), primary, "control channel bound");

        Ok(Self {
            outbound: tx,
            local_path,
            peer,
            task,
        })
    }

    pub fn peer(&self) -> &Path {
        &self.peer
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    /// Send a raw message to the worker.
    pub fn send(&self, message: String) {
        let _ = self.outbound.send(message);
    }

    pub fn send_command(&self, command: &WorkerCommand) {
        match command.encode() {
            Ok(message) => self.send(message),
            Err(e) => warn!(error = %e, "failed to encode worker command"),
        }
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.task.abort();
        let _ = std::fs::remove_file(&self.local_path);
    }
}

async fn run(
    socket: UnixDatagram,
    peer: PathBuf,
    mut outbound: mpsc::UnboundedReceiver<String>,
    sink: EventSink<ControlEvent>,
) {
    let mut reassembler = DatagramReassembler::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            ready = socket.readable() => {
                if let Err(e) = ready {
                    warn!(peer = %peer.display(), error = %e, "control socket poll failed");
                    sink(ControlEvent::Closed);
                    break;
                }
                match socket.try_recv(&mut buf) {
                    Ok(0) => {}
                    Ok(n) => {
                        if let Some(message) = reassembler.push(&buf[..n]) {
                            sink(ControlEvent::Message(String::from_utf8_lossy(&message).into_owned()));
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => {
                        warn!(peer = %peer.display(), error = %e, "control socket receive failed");
                        sink(ControlEvent::Closed);
                        break;
                    }
                }
            }
            message = outbound.recv() => match message {
                Some(message) => {
                    if let Err(e) = send_with_retry(&socket, &peer, message.as_bytes()).await {
                        warn!(peer = %peer.display(), error = %e, "control socket send failed");
                        sink(ControlEvent::Closed);
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused | io::ErrorKind::WouldBlock
    ) || e.raw_os_error() == Some(libc::ENOBUFS)
}

async fn send_with_retry(socket: &UnixDatagram, peer: &Path, data: &[u8]) -> io::Result<()> {
    let mut attempts = 0u32;
    loop {
        let started = Instant::now();
        match socket.send_to(data, peer).await {
            Ok(_) => {
                let elapsed = started.elapsed();
                if elapsed > SLOW_SEND {
                    warn!(
                        peer = %peer.display(),
                        elapsed_ms = elapsed.as_millis() as u64,
                        bytes = data.len(),
                        "slow control socket send"
                    );
                }
                return Ok(());
            }
            Err(e) if is_transient(&e) && attempts < MAX_SEND_ATTEMPTS => {
                attempts += 1;
                if attempts == WARN_AFTER_ATTEMPTS {
                    warn!(peer = %peer.display(), error = %e, "control socket unavailable, still retrying");
                }
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
            Err(e) => return Err(e),
        }
    }
}
