//! NDJSON framing for the proxy protocol.
//!
//! One JSON object per line. The decoder keeps whatever follows the last
//! newline and completes it on the next read, so frames may be split at
//! any byte offset.

use crate::error::{Result, TerminalError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use tracing::warn;

/// Largest frame accepted without a newline
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Serialize a message as a single newline-terminated line
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(msg)
        .map_err(|e| TerminalError::protocol(format!("encode failed: {}", e), ""))?;
    line.push(b'\n');
    Ok(line)
}

/// Streaming NDJSON decoder
pub struct NdjsonDecoder<T> {
    buf: Vec<u8>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Default for NdjsonDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> NdjsonDecoder<T> {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Bytes held back waiting for a newline
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Feed raw bytes, returning every complete message.
    ///
    /// Malformed lines go to `on_error` and decoding continues with the
    /// next line.
    pub fn feed<F>(&mut self, chunk: &[u8], mut on_error: F) -> Vec<T>
    where
        F: FnMut(TerminalError),
    {
        self.buf.extend_from_slice(chunk);
        let mut messages = Vec::new();

        let mut start = 0;
        while let Some(offset) = self.buf[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            let line = &self.buf[start..end];
            start = end + 1;

            let text = String::from_utf8_lossy(line);
            let trimmed = text.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<T>(trimmed) {
                Ok(msg) => messages.push(msg),
                Err(e) => on_error(TerminalError::protocol(
                    format!("invalid frame: {}", e),
                    trimmed,
                )),
            }
        }
        self.buf.drain(..start);

        if self.buf.len() > MAX_FRAME_BYTES {
            warn!(
                "Discarding {} bytes without a newline (frame limit {})",
                self.buf.len(),
                MAX_FRAME_BYTES
            );
            let preview = String::from_utf8_lossy(&self.buf[..self.buf.len().min(64)]).to_string();
            self.buf.clear();
            on_error(TerminalError::protocol("frame too large", preview));
        }

        messages
    }
}
