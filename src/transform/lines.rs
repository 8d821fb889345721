//! Line splitting and newline restore stages.
//!
//! The splitter buffers partial lines across chunks, recognizes both `\n`
//! and `\r\n`, and flushes a trailing unterminated fragment at
//! end-of-stream. With `keep_newlines` the emitted lines retain their
//! original separators, so re-joining them reconstructs the stream
//! exactly; without it the separators are stripped (the shape user
//! transforms and line-mode results see).

use super::stage::{Chunk, Transform};
use crate::error::ExecError;

pub struct LineSplitStage {
    keep_newlines: bool,
    pending_text: String,
    pending_bytes: Vec<u8>,
}

impl LineSplitStage {
    pub fn new(keep_newlines: bool) -> Self {
        LineSplitStage {
            keep_newlines,
            pending_text: String::new(),
            pending_bytes: Vec::new(),
        }
    }

    fn strip(line: &str) -> &str {
        let line = line.strip_suffix('\n').unwrap_or(line);
        line.strip_suffix('\r').unwrap_or(line)
    }

    fn split_text(&mut self, chunk: String, out: &mut Vec<Chunk>) {
        self.pending_text.push_str(&chunk);
        while let Some(pos) = self.pending_text.find('\n') {
            let rest = self.pending_text.split_off(pos + 1);
            let line = std::mem::replace(&mut self.pending_text, rest);
            if self.keep_newlines {
                out.push(Chunk::Text(line));
            } else {
                out.push(Chunk::Text(Self::strip(&line).to_string()));
            }
        }
    }

    fn split_bytes(&mut self, chunk: Vec<u8>, out: &mut Vec<Chunk>) {
        self.pending_bytes.extend(chunk);
        while let Some(pos) = self.pending_bytes.iter().position(|&b| b == b'\n') {
            let rest = self.pending_bytes.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.pending_bytes, rest);
            if !self.keep_newlines {
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
            }
            out.push(Chunk::Bytes(line));
        }
    }
}

impl Transform for LineSplitStage {
    fn transform(&mut self, chunk: Chunk) -> Result<Vec<Chunk>, ExecError> {
        let mut out = Vec::new();
        match chunk {
            Chunk::Text(s) => self.split_text(s, &mut out),
            Chunk::Bytes(b) => self.split_bytes(b, &mut out),
            object => out.push(object),
        }
        Ok(out)
    }

    fn finish(&mut self) -> Result<Vec<Chunk>, ExecError> {
        let mut out = Vec::new();
        if !self.pending_text.is_empty() {
            out.push(Chunk::Text(std::mem::take(&mut self.pending_text)));
        }
        if !self.pending_bytes.is_empty() {
            out.push(Chunk::Bytes(std::mem::take(&mut self.pending_bytes)));
        }
        Ok(out)
    }
}

/// Re-appends a `\n` terminator to stripped lines after user transforms,
/// so downstream consumers see a contiguous stream again. `\r\n`
/// separators are normalized to `\n`.
pub struct NewlineRestoreStage;

impl Transform for NewlineRestoreStage {
    fn transform(&mut self, chunk: Chunk) -> Result<Vec<Chunk>, ExecError> {
        let restored = match chunk {
            Chunk::Text(mut s) => {
                if !s.ends_with('\n') {
                    s.push('\n');
                }
                Chunk::Text(s)
            }
            Chunk::Bytes(mut b) => {
                if b.last() != Some(&b'\n') {
                    b.push(b'\n');
                }
                Chunk::Bytes(b)
            }
            object => object,
        };
        Ok(vec![restored])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(keep: bool, chunks: &[&str]) -> Vec<String> {
        let mut stage = LineSplitStage::new(keep);
        let mut out = Vec::new();
        for chunk in chunks {
            for c in stage.transform(Chunk::Text(chunk.to_string())).unwrap() {
                if let Chunk::Text(s) = c {
                    out.push(s);
                }
            }
        }
        for c in stage.finish().unwrap() {
            if let Chunk::Text(s) = c {
                out.push(s);
            }
        }
        out
    }

    #[test]
    fn splits_and_strips() {
        assert_eq!(
            split(false, &["a\nb\r\nc"]),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }

    #[test]
    fn partial_lines_buffered_across_chunks() {
        assert_eq!(
            split(false, &["hel", "lo\nwor", "ld"]),
            vec!["hello".to_string(), "world".to_string()]
        );
    }

    #[test]
    fn lossless_with_kept_separators() {
        for input in ["a\nb\r\nc", "no newline", "\n\n\n", "trailing\n", ""] {
            let chunks: Vec<String> = input
                .as_bytes()
                .chunks(2)
                .map(|c| String::from_utf8_lossy(c).into_owned())
                .collect();
            let refs: Vec<&str> = chunks.iter().map(|s| s.as_str()).collect();
            let joined = split(true, &refs).concat();
            assert_eq!(joined, input, "input {input:?}");
        }
    }

    #[test]
    fn all_newline_stream_of_length_n() {
        let input = "\n".repeat(17);
        let lines = split(false, &[input.as_str()]);
        assert_eq!(lines.len(), 17);
        assert!(lines.iter().all(String::is_empty));
    }

    #[test]
    fn byte_mode_lines() {
        let mut stage = LineSplitStage::new(false);
        let out = stage.transform(Chunk::Bytes(b"x\r\ny".to_vec())).unwrap();
        assert_eq!(out, vec![Chunk::Bytes(b"x".to_vec())]);
        assert_eq!(stage.finish().unwrap(), vec![Chunk::Bytes(b"y".to_vec())]);
    }

    #[test]
    fn restore_appends_newline() {
        let mut stage = NewlineRestoreStage;
        let out = stage.transform(Chunk::Text("abc".into())).unwrap();
        assert_eq!(out, vec![Chunk::Text("abc\n".into())]);
    }
}
