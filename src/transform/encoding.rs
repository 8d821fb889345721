//! Encoding conversion stage.
//!
//! Converts the raw byte stream of an output fd into the requested text
//! encoding, or passes bytes through untouched for `Encoding::Buffer`.
//! Conversion is incremental: multi-byte UTF-8 sequences and base64 input
//! groups split across chunk boundaries are buffered until complete.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use super::stage::{Chunk, Transform};
use crate::error::ExecError;

/// Output encoding of a captured fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Utf8,
    /// No conversion, the result carries raw bytes.
    Buffer,
    Base64,
    Hex,
}

pub struct EncodingStage {
    encoding: Encoding,
    pending: Vec<u8>,
}

impl EncodingStage {
    pub fn new(encoding: Encoding) -> Self {
        EncodingStage {
            encoding,
            pending: Vec::new(),
        }
    }

    /// Decode the longest valid UTF-8 prefix of `pending`, keeping an
    /// incomplete trailing sequence buffered for the next chunk. Invalid
    /// byte runs inside the stream become replacement characters.
    fn take_valid_utf8(&mut self) -> String {
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(std::str::from_utf8(&self.pending[..valid]).unwrap_or(""));
                    match e.error_len() {
                        // Incomplete trailing sequence: keep it buffered.
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                        Some(len) => {
                            out.push('\u{FFFD}');
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
    }

    fn into_bytes(chunk: Chunk) -> Vec<u8> {
        match chunk {
            Chunk::Bytes(b) => b,
            Chunk::Text(s) => s.into_bytes(),
            Chunk::Value(_) => Vec::new(),
        }
    }
}

impl Transform for EncodingStage {
    fn transform(&mut self, chunk: Chunk) -> Result<Vec<Chunk>, ExecError> {
        if chunk.is_object() {
            return Ok(vec![chunk]);
        }
        match self.encoding {
            Encoding::Buffer => Ok(vec![chunk]),
            Encoding::Utf8 => {
                self.pending.extend(Self::into_bytes(chunk));
                let text = self.take_valid_utf8();
                if text.is_empty() {
                    Ok(Vec::new())
                } else {
                    Ok(vec![Chunk::Text(text)])
                }
            }
            Encoding::Base64 => {
                self.pending.extend(Self::into_bytes(chunk));
                // Encode whole 3-byte groups so concatenated output equals
                // the encoding of the concatenated input.
                let whole = self.pending.len() - self.pending.len() % 3;
                if whole == 0 {
                    return Ok(Vec::new());
                }
                let encoded = BASE64.encode(&self.pending[..whole]);
                self.pending.drain(..whole);
                Ok(vec![Chunk::Text(encoded)])
            }
            Encoding::Hex => {
                let bytes = Self::into_bytes(chunk);
                Ok(vec![Chunk::Text(hex_encode(&bytes))])
            }
        }
    }

    fn finish(&mut self) -> Result<Vec<Chunk>, ExecError> {
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }
        let rest = std::mem::take(&mut self.pending);
        let text = match self.encoding {
            Encoding::Utf8 => String::from_utf8_lossy(&rest).into_owned(),
            Encoding::Base64 => BASE64.encode(&rest),
            // Hex and Buffer never buffer.
            Encoding::Hex | Encoding::Buffer => return Ok(Vec::new()),
        };
        Ok(vec![Chunk::Text(text)])
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    const TABLE: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(TABLE[(b >> 4) as usize] as char);
        out.push(TABLE[(b & 0xf) as usize] as char);
    }
    out
}
