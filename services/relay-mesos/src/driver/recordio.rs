//! RecordIO framing used by the Mesos streaming API.
//!
//! Each record is `<decimal length>\n<payload>`. Chunks from the HTTP body
//! are pushed in as they arrive; complete records are pulled out.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

/// Longest accepted length prefix, in digits.
const MAX_HEADER_DIGITS: usize = 20;

/// Largest accepted record. Mesos events are far smaller.
pub const MAX_RECORD_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordIoError {
    #[error("invalid record length header: {0:?}")]
    InvalidHeader(String),

    #[error("record of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
}

#[derive(Debug, Default)]
pub struct RecordIoDecoder {
    buf: BytesMut,
}

impl RecordIoDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Returns the next complete record, or `None` if more input is needed.
    pub fn next_record(&mut self) -> Result<Option<Bytes>, RecordIoError> {
        let Some(newline) = self.buf.iter().position(|b| *b == b'\n') else {
            if self.buf.len() > MAX_HEADER_DIGITS {
                return Err(self.invalid_header(self.buf.len()));
            }
            return Ok(None);
        };

        let header = &self.buf[..newline];
        if header.is_empty()
            || header.len() > MAX_HEADER_DIGITS
            || !header.iter().all(u8::is_ascii_digit)
        {
            return Err(self.invalid_header(newline));
        }
        let len: usize = std::str::from_utf8(header)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| self.invalid_header(newline))?;

        if len > MAX_RECORD_BYTES {
            return Err(RecordIoError::TooLarge {
                len,
                max: MAX_RECORD_BYTES,
            });
        }
        let end = newline
            .checked_add(1)
            .and_then(|start| start.checked_add(len))
            .ok_or_else(|| self.invalid_header(newline))?;
        if self.buf.len() < end {
            return Ok(None);
        }

        self.buf.advance(newline + 1);
        Ok(Some(self.buf.split_to(len).freeze()))
    }

    /// Bytes buffered but not yet returned as a record.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    fn invalid_header(&self, end: usize) -> RecordIoError {
        let end = end.min(MAX_HEADER_DIGITS + 1).min(self.buf.len());
        RecordIoError::InvalidHeader(String::from_utf8_lossy(&self.buf[..end]).into_owned())
    }
}

/// Encodes one record. Used to build streams in tests.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = format!("{}\n", payload.len()).into_bytes();
    out.extend_from_slice(payload);
    out
}
