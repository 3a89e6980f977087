//! Transcript (ttyrec) record format.
//!
//! Wire format per record: `[sec: i32 LE][usec: i32 LE][len: i32 LE][len bytes]`.
//! A transcript is an append-only sequence of records; replaying the payloads
//! in order reproduces the terminal output byte for byte.

use crate::error::{CastError, CastResult};
use std::time::{SystemTime, UNIX_EPOCH};

/// Size of the fixed record header.
pub const RECORD_HEADER_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub sec: i32,
    pub usec: i32,
    pub len: i32,
}

impl RecordHeader {
    /// Header for a payload of `len` bytes captured at `time`.
    pub fn at(time: SystemTime, len: usize) -> CastResult<Self> {
        let since_epoch = time
            .duration_since(UNIX_EPOCH)
            .map_err(|e| CastError::Transcript(format!("clock before epoch: {e}")))?;
        let len = i32::try_from(len)
            .map_err(|_| CastError::Transcript(format!("record too large: {len} bytes")))?;
        Ok(Self {
            sec: since_epoch.as_secs() as i32,
            usec: since_epoch.subsec_micros() as i32,
            len,
        })
    }

    pub fn encode(&self) -> [u8; RECORD_HEADER_LEN] {
        let mut out = [0u8; RECORD_HEADER_LEN];
        out[0..4].copy_from_slice(&self.sec.to_le_bytes());
        out[4..8].copy_from_slice(&self.usec.to_le_bytes());
        out[8..12].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8; RECORD_HEADER_LEN]) -> Self {
        Self {
            sec: i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            usec: i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            len: i32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        }
    }
}

/// Encode one record (header followed by payload).
pub fn encode_record(time: SystemTime, data: &[u8]) -> CastResult<Vec<u8>> {
    let header = RecordHeader::at(time, data.len())?;
    let mut record = Vec::with_capacity(RECORD_HEADER_LEN + data.len());
    record.extend_from_slice(&header.encode());
    record.extend_from_slice(data);
    Ok(record)
}

/// A decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptRecord {
    pub header: RecordHeader,
    pub data: Vec<u8>,
}

/// Streaming decoder: accumulates bytes and yields complete records.
#[derive(Debug, Default)]
pub struct TranscriptDecoder {
    buffer: Vec<u8>,
}

impl TranscriptDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed bytes and return every record completed by them.
    pub fn feed(&mut self, data: &[u8]) -> CastResult<Vec<TranscriptRecord>> {
        self.buffer.extend_from_slice(data);
        let mut records = Vec::new();

        loop {
            if self.buffer.len() < RECORD_HEADER_LEN {
                break;
            }
            let mut raw = [0u8; RECORD_HEADER_LEN];
            raw.copy_from_slice(&self.buffer[..RECORD_HEADER_LEN]);
            let header = RecordHeader::decode(&raw);
            let len = usize::try_from(header.len).map_err(|_| {
                CastError::Transcript(format!("negative record length {}", header.len))
            })?;

            if self.buffer.len() < RECORD_HEADER_LEN + len {
                break;
            }

            let data = self.buffer[RECORD_HEADER_LEN..RECORD_HEADER_LEN + len].to_vec();
            records.push(TranscriptRecord { header, data });
            self.buffer.drain(..RECORD_HEADER_LEN + len);
        }

        Ok(records)
    }

    /// Number of bytes of an incomplete record still buffered.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Decode a whole transcript. Trailing partial records are an error.
pub fn decode_records(bytes: &[u8]) -> CastResult<Vec<TranscriptRecord>> {
    let mut decoder = TranscriptDecoder::new();
    let records = decoder.feed(bytes)?;
    if decoder.pending() > 0 {
        return Err(CastError::Transcript(format!(
            "truncated record ({} trailing bytes)",
            decoder.pending()
        )));
    }
    Ok(records)
}
