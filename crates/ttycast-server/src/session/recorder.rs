//! Terminal recorder: one worker process on a PTY.
//!
//! A dedicated task owns the child, the PTY master and the transcript. It
//! records every master read, splits output into lines, forwards stderr
//! lines, drains queued input with partial-write retry, and reports the
//! exit code exactly once after the child has been reaped.

use super::pty::{self, SpawnSpec, SpawnedWorker};
use super::recording::TranscriptWriter;
use super::signal::{send_signal, Signal, SignalOutcome};
use super::EventSink;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use ttycast_core::CastResult;

const READ_CHUNK: usize = 4096;
/// Output without a newline beyond this is dropped from the line buffer.
const MAX_LINE: usize = 64 * 1024;
/// How long to keep reading stderr after the child was reaped.
const STDERR_DRAIN: Duration = Duration::from_millis(250);

/// Events reported by the recorder task, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecorderEvent {
    /// A newline-terminated line of terminal output.
    OutputLine(String),
    /// A line the worker wrote to stderr.
    ErrorLine(String),
    /// Worker reaped. `None` when the wait status could not be classified.
    Ended { exit_code: Option<i32> },
}

enum RecorderCommand {
    Input(Vec<u8>),
    FlushTranscript,
}

/// Handle to a running recorder task.
pub struct TerminalRecorder {
    pid: u32,
    commands: mpsc::UnboundedSender<RecorderCommand>,
    transcript: Option<PathBuf>,
}

impl TerminalRecorder {
    /// Open the transcript, spawn the worker and start the recorder task.
    pub fn start(
        spec: &SpawnSpec,
        transcript: Option<PathBuf>,
        id_header: Option<Vec<u8>>,
        sink: EventSink<RecorderEvent>,
    ) -> CastResult<Self> {
        let writer = transcript.clone().map(TranscriptWriter::create).transpose()?;

        let worker = match pty::spawn(spec) {
            Ok(worker) => worker,
            Err(e) => {
                if let Some(path) = &transcript {
                    remove_if_empty(path);
                }
                return Err(e);
            }
        };

        let pid = worker.pid;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(worker, writer, id_header, rx, sink));

        Ok(Self {
            pid,
            commands: tx,
            transcript,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn transcript_path(&self) -> Option<&PathBuf> {
        self.transcript.as_ref()
    }

    /// Queue bytes for the worker's terminal.
    pub fn write_input(&self, data: Vec<u8>) {
        if !data.is_empty() && self.commands.send(RecorderCommand::Input(data)).is_err() {
            debug!(pid = self.pid, "input dropped, recorder finished");
        }
    }

    pub fn flush_transcript(&self) {
        let _ = self.commands.send(RecorderCommand::FlushTranscript);
    }

    pub fn signal(&self, signal: Signal) -> SignalOutcome {
        send_signal(self.pid as i32, signal)
    }
}

fn remove_if_empty(path: &PathBuf) {
    if let Ok(meta) = std::fs::metadata(path) {
        if meta.len() == 0 {
            let _ = std::fs::remove_file(path);
        }
    }
}

async fn run(
    mut worker: SpawnedWorker,
    mut transcript: Option<TranscriptWriter>,
    id_header: Option<Vec<u8>>,
    mut commands: mpsc::UnboundedReceiver<RecorderCommand>,
    sink: EventSink<RecorderEvent>,
) {
    let pid = worker.pid;
    if let (Some(writer), Some(header)) = (transcript.as_mut(), id_header) {
        if let Err(e) = writer.write_chunk(&header).await {
            warn!(pid, error = %e, "failed to write transcript header");
        }
    }

    let mut stderr_lines = BufReader::new(worker.stderr).lines();
    let mut lines = LineBuffer::default();
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut master_open = true;
    let mut stderr_open = true;
    let mut commands_open = true;

    let status = loop {
        tokio::select! {
            ready = worker.master.readable(), if master_open => {
                let mut guard = match ready {
                    Ok(guard) => guard,
                    Err(e) => {
                        warn!(pid, error = %e, "PTY poll failed");
                        master_open = false;
                        continue;
                    }
                };
                match guard.try_io(|fd| pty::read_master(fd.get_ref(), &mut buf)) {
                    Ok(Ok(0)) => master_open = false,
                    Ok(Ok(n)) => {
                        handle_output(&buf[..n], &mut transcript, &mut lines, &sink).await;
                    }
                    Ok(Err(e)) => {
                        if !pty::is_hangup(&e) {
                            warn!(pid, error = %e, "PTY read failed");
                        }
                        master_open = false;
                    }
                    Err(_would_block) => {}
                }
            }
            line = stderr_lines.next_line(), if stderr_open => match line {
                Ok(Some(line)) => sink(RecorderEvent::ErrorLine(line)),
                Ok(None) => stderr_open = false,
                Err(e) => {
                    debug!(pid, error = %e, "stderr read failed");
                    stderr_open = false;
                }
            },
            cmd = commands.recv(), if commands_open => match cmd {
                Some(RecorderCommand::Input(data)) => pending.extend_from_slice(&data),
                Some(RecorderCommand::FlushTranscript) => {
                    if let Some(writer) = transcript.as_mut() {
                        if let Err(e) = writer.flush().await {
                            warn!(pid, error = %e, "transcript flush failed");
                        }
                    }
                }
                None => commands_open = false,
            },
            ready = worker.master.writable(), if master_open && !pending.is_empty() => {
                match ready {
                    Ok(mut guard) => match guard.try_io(|fd| pty::write_master(fd.get_ref(), &pending)) {
                        Ok(Ok(n)) => {
                            pending.drain(..n);
                        }
                        Ok(Err(e)) => {
                            warn!(pid, error = %e, dropped = pending.len(), "PTY write failed");
                            pending.clear();
                        }
                        Err(_would_block) => {}
                    },
                    Err(e) => {
                        warn!(pid, error = %e, "PTY poll failed");
                        pending.clear();
                    }
                }
            }
            status = worker.child.wait() => break status,
        }
    };

    // Output written just before exit may still sit in the master.
    while master_open {
        match pty::read_master(worker.master.get_ref(), &mut buf) {
            Ok(0) | Err(_) => master_open = false,
            Ok(n) => handle_output(&buf[..n], &mut transcript, &mut lines, &sink).await,
        }
    }
    if stderr_open {
        let drain = async {
            while let Ok(Some(line)) = stderr_lines.next_line().await {
                sink(RecorderEvent::ErrorLine(line));
            }
        };
        let _ = tokio::time::timeout(STDERR_DRAIN, drain).await;
    }

    if let Some(writer) = transcript.take() {
        if let Err(e) = writer.close().await {
            warn!(pid, error = %e, "failed to close transcript");
        }
    }

    let exit_code = match status {
        Ok(status) => classify_exit(status),
        Err(e) => {
            error!(pid, error = %e, "waiting for worker failed");
            None
        }
    };
    info!(pid, exit_code = ?exit_code, "worker reaped");
    sink(RecorderEvent::Ended { exit_code });
}

async fn handle_output(
    data: &[u8],
    transcript: &mut Option<TranscriptWriter>,
    lines: &mut LineBuffer,
    sink: &EventSink<RecorderEvent>,
) {
    if let Some(writer) = transcript.as_mut() {
        if let Err(e) = writer.write_chunk(data).await {
            warn!(path = %writer.path().display(), error = %e, "transcript write failed, recording stopped");
            *transcript = None;
        }
    }
    for line in lines.push(data) {
        sink(RecorderEvent::OutputLine(line));
    }
}

/// Signal deaths map to the negated signal number.
fn classify_exit(status: ExitStatus) -> Option<i32> {
    if let Some(sig) = status.signal() {
        Some(-sig)
    } else if let Some(code) = status.code() {
        Some(code)
    } else {
        error!(status = ?status, "unclassifiable wait status");
        None
    }
}

/// Splits terminal output into lines. Trailing `\r` is stripped and empty
/// lines are skipped.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(data);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if !line.is_empty() {
                lines.push(String::from_utf8_lossy(&line).into_owned());
            }
        }
        if self.buf.len() > MAX_LINE {
            self.buf.clear();
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use ttycast_core::transcript::decode_records;

    fn sh(script: &str) -> SpawnSpec {
        SpawnSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".into(), script.into()],
            env: vec![("PATH".into(), "/bin:/usr/bin".into())],
            cwd: None,
            cols: 80,
            rows: 24,
        }
    }

    fn channel_sink() -> (EventSink<RecorderEvent>, mpsc::UnboundedReceiver<RecorderEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink: EventSink<RecorderEvent> = Arc::new(move |e| {
            let _ = tx.send(e);
        });
        (sink, rx)
    }

    async fn collect_until_end(rx: &mut mpsc::UnboundedReceiver<RecorderEvent>) -> Vec<RecorderEvent> {
        let mut events = Vec::new();
        let fut = async {
            while let Some(event) = rx.recv().await {
                let done = matches!(event, RecorderEvent::Ended { .. });
                events.push(event);
                if done {
                    break;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(15), fut)
            .await
            .expect("recorder did not finish");
        events
    }

    fn output_lines(events: &[RecorderEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                RecorderEvent::OutputLine(l) => Some(l.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn line_buffer_splits_and_strips() {
        let mut lb = LineBuffer::default();
        assert!(lb.push(b"par").is_empty());
        assert_eq!(lb.push(b"tial\r\n\r\nnext\nrest"), vec!["partial", "next"]);
        assert_eq!(lb.push(b"\n"), vec!["rest"]);
    }

    #[tokio::test]
    async fn three_lines_then_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alice/game.ttyrec");
        let (sink, mut rx) = channel_sink();
        let recorder = TerminalRecorder::start(
            &sh("echo one; sleep 0.3; echo two; sleep 0.3; echo three; exit 1"),
            Some(path.clone()),
            None,
            sink,
        )
        .unwrap();
        assert!(recorder.pid() > 0);

        let events = collect_until_end(&mut rx).await;
        assert_eq!(output_lines(&events), vec!["one", "two", "three"]);
        assert_eq!(
            events.last(),
            Some(&RecorderEvent::Ended { exit_code: Some(1) })
        );

        let records = decode_records(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(records.len(), 3);
        let replay: Vec<u8> = records.into_iter().flat_map(|r| r.data).collect();
        assert_eq!(replay, b"one\r\ntwo\r\nthree\r\n");
    }

    #[tokio::test]
    async fn id_header_is_first_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.ttyrec");
        let (sink, mut rx) = channel_sink();
        TerminalRecorder::start(
            &sh("echo hi"),
            Some(path.clone()),
            Some(b"HEADER".to_vec()),
            sink,
        )
        .unwrap();
        collect_until_end(&mut rx).await;

        let records = decode_records(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(records[0].data, b"HEADER");
        assert!(records.len() >= 2);
    }

    #[tokio::test]
    async fn input_reaches_worker() {
        let (sink, mut rx) = channel_sink();
        let recorder =
            TerminalRecorder::start(&sh("read x; echo got:$x"), None, None, sink).unwrap();
        recorder.write_input(b"hello\n".to_vec());

        let events = collect_until_end(&mut rx).await;
        assert!(output_lines(&events).contains(&"got:hello".to_string()));
        assert_eq!(
            events.last(),
            Some(&RecorderEvent::Ended { exit_code: Some(0) })
        );
    }

    #[tokio::test]
    async fn stderr_lines_are_separate() {
        let (sink, mut rx) = channel_sink();
        TerminalRecorder::start(
            &sh("echo out; echo 'We crashed! (/tmp/c.txt)' >&2; exit 3"),
            None,
            None,
            sink,
        )
        .unwrap();

        let events = collect_until_end(&mut rx).await;
        assert!(events.contains(&RecorderEvent::ErrorLine("We crashed! (/tmp/c.txt)".into())));
        assert_eq!(output_lines(&events), vec!["out"]);
        assert_eq!(
            events.last(),
            Some(&RecorderEvent::Ended { exit_code: Some(3) })
        );
    }

    #[tokio::test]
    async fn hangup_reports_negative_signal() {
        let (sink, mut rx) = channel_sink();
        let spec = SpawnSpec {
            program: PathBuf::from("/bin/sleep"),
            args: vec!["30".into()],
            env: vec![],
            cwd: None,
            cols: 80,
            rows: 24,
        };
        let recorder = TerminalRecorder::start(&spec, None, None, sink).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(matches!(recorder.signal(Signal::Hangup), SignalOutcome::Delivered));

        let events = collect_until_end(&mut rx).await;
        assert_eq!(
            events.last(),
            Some(&RecorderEvent::Ended {
                exit_code: Some(-libc::SIGHUP)
            })
        );
    }

    #[tokio::test]
    async fn missing_binary_fails_without_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.ttyrec");
        let (sink, _rx) = channel_sink();
        let spec = SpawnSpec {
            program: PathBuf::from("/nonexistent/worker"),
            args: vec![],
            env: vec![],
            cwd: None,
            cols: 80,
            rows: 24,
        };
        assert!(TerminalRecorder::start(&spec, Some(path.clone()), None, sink).is_err());
        assert!(!path.exists());
    }
}
