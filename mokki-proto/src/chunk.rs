//! Chunked transfer framing
//!
//! A message is its canonical bytes followed by a single [`TERMINATOR`] byte,
//! cut into consecutive chunks of at most `chunk_size` bytes. There is no
//! sequence number and no acknowledgment: the receiver concatenates
//! fragments in arrival order until it sees the terminator.
//!
//! The message body must not contain the terminator. JSON produced by
//! `serde_json` never does, control characters are always escaped.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// End-of-message marker.
pub const TERMINATOR: u8 = 0x00;

/// Largest message body, terminator excluded. Both directions enforce it.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("chunk size must be at least 1")]
    ZeroChunkSize,
    #[error("message body contains the terminator byte at offset {0}")]
    EmbeddedTerminator(usize),
    #[error("{0} bytes after the terminator")]
    TrailingBytes(usize),
    #[error("message exceeds {MAX_MESSAGE_SIZE} bytes")]
    TooLarge,
    #[error("stream ended before the terminator")]
    Incomplete,
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Splits `body` plus terminator into ordered chunks.
pub fn encode_bytes(body: &[u8], chunk_size: usize) -> Result<Vec<Vec<u8>>, CodecError> {
    if chunk_size == 0 {
        return Err(CodecError::ZeroChunkSize);
    }
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::TooLarge);
    }
    if let Some(pos) = body.iter().position(|b| *b == TERMINATOR) {
        return Err(CodecError::EmbeddedTerminator(pos));
    }

    let mut framed = Vec::with_capacity(body.len() + 1);
    framed.extend_from_slice(body);
    framed.push(TERMINATOR);

    Ok(framed.chunks(chunk_size).map(<[u8]>::to_vec).collect())
}

/// Serializes `value` as JSON and splits it into ordered chunks.
pub fn encode<T: Serialize>(value: &T, chunk_size: usize) -> Result<Vec<Vec<u8>>, CodecError> {
    let body = serde_json::to_vec(value)?;
    encode_bytes(&body, chunk_size)
}

/// Parses a reassembled message body.
pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, CodecError> {
    Ok(serde_json::from_slice(body)?)
}

/// Receive side: concatenates fragments until the terminator.
#[derive(Debug, Default)]
pub struct Reassembler {
    buf: Vec<u8>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one fragment.
    ///
    /// Returns the message body once the terminator is seen. Bytes following
    /// the terminator in the same fragment are a framing error; the partial
    /// message is discarded either way, so the reassembler is ready for the
    /// next message after any `Err` or `Some`.
    pub fn push(&mut self, fragment: &[u8]) -> Result<Option<Vec<u8>>, CodecError> {
        match fragment.iter().position(|b| *b == TERMINATOR) {
            Some(pos) => {
                let trailing = fragment.len() - pos - 1;
                if trailing > 0 {
                    self.buf.clear();
                    return Err(CodecError::TrailingBytes(trailing));
                }
                if self.buf.len() + pos > MAX_MESSAGE_SIZE {
                    self.buf.clear();
                    return Err(CodecError::TooLarge);
                }
                self.buf.extend_from_slice(&fragment[..pos]);
                Ok(Some(std::mem::take(&mut self.buf)))
            }
            None => {
                if self.buf.len() + fragment.len() > MAX_MESSAGE_SIZE {
                    self.buf.clear();
                    return Err(CodecError::TooLarge);
                }
                self.buf.extend_from_slice(fragment);
                Ok(None)
            }
        }
    }

    /// Bytes buffered for the message in progress.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Reassembles a complete, in-order fragment sequence.
pub fn reassemble<I, B>(fragments: I) -> Result<Vec<u8>, CodecError>
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let mut reassembler = Reassembler::new();
    let mut fragments = fragments.into_iter();
    while let Some(fragment) = fragments.next() {
        if let Some(body) = reassembler.push(fragment.as_ref())? {
            if let Some(extra) = fragments.next() {
                return Err(CodecError::TrailingBytes(extra.as_ref().len()));
            }
            return Ok(body);
        }
    }
    Err(CodecError::Incomplete)
}
