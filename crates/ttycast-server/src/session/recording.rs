//! Session transcript writer.
//!
//! Appends timestamped ttyrec records (see `ttycast_core::transcript`) to a
//! file for later replay. Writing is buffered; callers flush before stop
//! signals and the recorder closes the file once the worker is reaped.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::debug;
use ttycast_core::transcript::encode_record;
use ttycast_core::{CastError, CastResult};

/// Clear screen and home the cursor.
const CLEAR_SCREEN: &str = "\x1b[1;1H\x1b[2J";

pub struct TranscriptWriter {
    path: PathBuf,
    file: BufWriter<tokio::fs::File>,
    records: u64,
}

impl TranscriptWriter {
    /// Create (or append to) the transcript at `path`, creating parent dirs.
    pub fn create(path: PathBuf) -> CastResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                CastError::Transcript(format!("cannot open {}: {e}", path.display()))
            })?;
        debug!(path = %path.display(), "transcript opened");
        Ok(Self {
            path,
            file: BufWriter::new(tokio::fs::File::from_std(file)),
            records: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    /// Append one record stamped with the current time.
    pub async fn write_chunk(&mut self, data: &[u8]) -> CastResult<()> {
        let record = encode_record(SystemTime::now(), data)?;
        self.file.write_all(&record).await?;
        self.records += 1;
        Ok(())
    }

    pub async fn flush(&mut self) -> CastResult<()> {
        self.file.flush().await?;
        Ok(())
    }

    /// Flush and close. Consumes the writer so it cannot be reused.
    pub async fn close(mut self) -> CastResult<()> {
        self.file.flush().await?;
        self.file.get_mut().sync_all().await?;
        debug!(path = %self.path.display(), records = self.records, "transcript closed");
        Ok(())
    }
}

/// Identification record written at the start of every transcript.
pub fn id_header(
    username: &str,
    game: &str,
    server_id: &str,
    file_name: &str,
    started: DateTime<Utc>,
) -> Vec<u8> {
    format!(
        "{CLEAR_SCREEN}Player: {username}\r\nGame: {game}\r\nServer: {server_id}\r\n\
         Filename: {file_name}\r\nTime: ({}) {}\r\n{CLEAR_SCREEN}",
        started.timestamp(),
        started.format("%Y-%m-%d %H:%M:%S UTC"),
    )
    .into_bytes()
}
