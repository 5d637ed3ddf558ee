use bytes::{BufMut, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Default maximum line length (64 KiB)
pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

/// Errors that can occur during encoding/decoding
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Line too long: more than {0} bytes without a newline")]
    LineTooLong(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Newline-delimited JSON codec for control channel messages
///
/// Wire format:
/// ```text
/// {"command":"auth","params":{}}\n
/// {"success":true,"endpointId":"abc123"}\n
/// ```
///
/// `T` is the decoded message type. Any serializable value can be encoded, so
/// one framed connection can read client commands and write server messages.
pub struct JsonLinesCodec<T> {
    max_length: usize,
    /// Bytes already scanned for a newline on a previous call
    next_index: usize,
    _phantom: std::marker::PhantomData<T>,
}

impl<T> JsonLinesCodec<T> {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            _phantom: std::marker::PhantomData,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl<T> Default for JsonLinesCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

impl<T: DeserializeOwned> Decoder for JsonLinesCodec<T> {
    type Item = T;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let newline = src[self.next_index..].iter().position(|b| *b == b'\n');

            let Some(offset) = newline else {
                if src.len() > self.max_length {
                    return Err(CodecError::LineTooLong(self.max_length));
                }
                // Remember how far we looked so the next call only scans new bytes
                self.next_index = src.len();
                return Ok(None);
            };

            let line_end = self.next_index + offset;
            self.next_index = 0;

            if line_end > self.max_length {
                return Err(CodecError::LineTooLong(self.max_length));
            }

            let line = src.split_to(line_end + 1);
            let line = trim_line(&line);

            // Tolerate blank keepalive lines
            if line.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }

            return Ok(Some(serde_json::from_slice(line)?));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(message) = self.decode(src)? {
            return Ok(Some(message));
        }

        // A final unterminated line is still a message
        self.next_index = 0;
        let line = src.split_to(src.len());
        let line = trim_line(&line);
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(line)?))
    }
}

impl<T, I: Serialize> Encoder<I> for JsonLinesCodec<T> {
    type Error = CodecError;

    fn encode(&mut self, item: I, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;

        if json.len() > self.max_length {
            return Err(CodecError::LineTooLong(self.max_length));
        }

        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');

        Ok(())
    }
}
