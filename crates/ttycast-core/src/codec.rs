//! Outbound batching and compression for client connections.
//!
//! Queued envelopes are coalesced into one `{"msgs":[...]}` document per
//! flush. When compression is negotiated the document is raw-deflated with a
//! sync flush and the trailing `00 00 FF FF` marker is removed; the
//! compressor context persists for the lifetime of the connection.

use crate::error::{CastError, CastResult};
use flate2::{Compress, Compression, FlushCompress, Status};

/// Trailer emitted by a deflate sync flush, stripped before sending.
pub const SYNC_FLUSH_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Join already-serialized envelopes into a batch document.
pub fn encode_batch<S: AsRef<str>>(messages: &[S]) -> String {
    let body_len: usize = messages.iter().map(|m| m.as_ref().len() + 1).sum();
    let mut out = String::with_capacity(body_len + 10);
    out.push_str("{\"msgs\":[");
    for (i, msg) in messages.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(msg.as_ref());
    }
    out.push_str("]}");
    out
}

/// Per-connection raw deflate context.
pub struct Deflater {
    inner: Compress,
}

impl Default for Deflater {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Deflater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deflater")
            .field("total_in", &self.inner.total_in())
            .field("total_out", &self.inner.total_out())
            .finish()
    }
}

impl Deflater {
    pub fn new() -> Self {
        Self {
            inner: Compress::new(Compression::default(), false),
        }
    }

    /// Compress `input` with a sync flush and strip the flush trailer.
    pub fn compress(&mut self, input: &[u8]) -> CastResult<Vec<u8>> {
        let mut out = Vec::with_capacity(input.len() / 2 + 64);
        let start = self.inner.total_in();

        loop {
            let consumed = (self.inner.total_in() - start) as usize;
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(64));
            }
            let status = self
                .inner
                .compress_vec(&input[consumed..], &mut out, FlushCompress::Sync)
                .map_err(|e| CastError::Codec(format!("deflate failed: {e}")))?;
            let consumed = (self.inner.total_in() - start) as usize;
            let done = consumed == input.len() && out.len() < out.capacity();
            if done || status == Status::StreamEnd {
                break;
            }
        }

        if out.ends_with(&SYNC_FLUSH_TRAILER) {
            out.truncate(out.len() - SYNC_FLUSH_TRAILER.len());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{Decompress, FlushDecompress};

    fn inflate(inflater: &mut Decompress, data: &[u8]) -> Vec<u8> {
        let mut input = data.to_vec();
        input.extend_from_slice(&SYNC_FLUSH_TRAILER);
        let mut out = Vec::with_capacity(input.len() * 8 + 1024);
        inflater
            .decompress_vec(&input, &mut out, FlushDecompress::Sync)
            .unwrap();
        out
    }

    #[test]
    fn batch_envelope() {
        assert_eq!(encode_batch::<&str>(&[]), r#"{"msgs":[]}"#);
        let batch = encode_batch(&[r#"{"msg":"ping"}"#, r#"{"msg":"lobby_complete"}"#]);
        let v: serde_json::Value = serde_json::from_str(&batch).unwrap();
        assert_eq!(v["msgs"].as_array().unwrap().len(), 2);
        assert_eq!(v["msgs"][1]["msg"], "lobby_complete");
    }

    #[test]
    fn deflated_batches_inflate_with_shared_context() {
        let mut deflater = Deflater::new();
        let mut inflater = Decompress::new(false);

        let first = encode_batch(&[r#"{"msg":"lobby_clear"}"#]);
        let second = encode_batch(&[r#"{"msg":"lobby_clear"}"#, r#"{"msg":"lobby_complete"}"#]);

        let c1 = deflater.compress(first.as_bytes()).unwrap();
        assert!(!c1.ends_with(&SYNC_FLUSH_TRAILER));
        assert_eq!(inflate(&mut inflater, &c1), first.as_bytes());

        let c2 = deflater.compress(second.as_bytes()).unwrap();
        assert_eq!(inflate(&mut inflater, &c2), second.as_bytes());
    }

    #[test]
    fn large_input_compresses() {
        let big = "x".repeat(200_000);
        let mut deflater = Deflater::new();
        let mut inflater = Decompress::new(false);
        let compressed = deflater.compress(big.as_bytes()).unwrap();
        assert!(compressed.len() < big.len() / 10);
        assert_eq!(inflate(&mut inflater, &compressed), big.as_bytes());
    }
}
