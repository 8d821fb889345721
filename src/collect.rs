//! Stream output collector: drains one fd's pipeline output and enforces
//! the buffering cap.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{BufferUnit, ExecError};
use crate::result::FdOutput;
use crate::transform::{Chunk, Encoding};

/// How one collector accounts and stores its output.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CollectorSettings {
    pub fd: u32,
    pub encoding: Encoding,
    pub lines: bool,
    pub object_mode: bool,
    /// Cap in the unit the mode implies; `None` disables it.
    pub limit: Option<u64>,
    /// When false, the collector only awaits stream completion.
    pub buffered: bool,
    /// Emit a trace event per collected line.
    pub verbose: bool,
}

impl CollectorSettings {
    pub fn unit(&self) -> BufferUnit {
        if self.object_mode {
            BufferUnit::Objects
        } else if self.lines {
            BufferUnit::Lines
        } else if self.encoding == Encoding::Buffer {
            BufferUnit::Bytes
        } else {
            BufferUnit::Characters
        }
    }
}

/// What a collector hands back to the resolver: whatever data it had
/// buffered when it stopped, plus the error that stopped it, if any.
#[derive(Debug)]
pub(crate) struct Collected {
    pub output: FdOutput,
    pub error: Option<ExecError>,
}

/// Accumulates pipeline chunks into an [`FdOutput`], truncating the chunk
/// that crosses the cap so the attached data holds exactly `limit` units.
/// Shared by the async collector and the synchronous mode.
pub(crate) struct Accumulator {
    unit: BufferUnit,
    limit: Option<u64>,
    used: u64,
    bytes: Vec<u8>,
    text: String,
    lines: Vec<String>,
    values: Vec<serde_json::Value>,
    object_mode: bool,
    lines_mode: bool,
    byte_mode: bool,
}

impl Accumulator {
    pub fn new(settings: &CollectorSettings) -> Self {
        Accumulator {
            unit: settings.unit(),
            limit: settings.limit,
            used: 0,
            bytes: Vec::new(),
            text: String::new(),
            lines: Vec::new(),
            values: Vec::new(),
            object_mode: settings.object_mode,
            lines_mode: settings.lines,
            byte_mode: settings.encoding == Encoding::Buffer,
        }
    }

    /// Add one chunk. Returns `true` when the cap was hit; the part of the
    /// chunk that fit is kept.
    pub fn push(&mut self, chunk: Chunk) -> bool {
        let remaining = match self.limit {
            Some(limit) => limit.saturating_sub(self.used),
            None => u64::MAX,
        };
        match self.unit {
            BufferUnit::Objects | BufferUnit::Lines => {
                if remaining == 0 {
                    return true;
                }
                self.used += 1;
                self.store_whole(chunk);
                false
            }
            BufferUnit::Bytes => {
                let bytes = match chunk {
                    Chunk::Bytes(b) => b,
                    Chunk::Text(s) => s.into_bytes(),
                    Chunk::Value(_) => return false,
                };
                let capped = (bytes.len() as u64) > remaining;
                let take = bytes.len().min(remaining as usize);
                self.used += take as u64;
                self.bytes.extend(&bytes[..take]);
                capped
            }
            BufferUnit::Characters => {
                let s = match chunk {
                    Chunk::Text(s) => s,
                    Chunk::Bytes(b) => String::from_utf8_lossy(&b).into_owned(),
                    Chunk::Value(_) => return false,
                };
                let char_count = s.chars().count() as u64;
                if char_count <= remaining {
                    self.used += char_count;
                    self.text.push_str(&s);
                    false
                } else {
                    self.text
                        .extend(s.chars().take(remaining as usize));
                    self.used += remaining;
                    true
                }
            }
        }
    }

    fn store_whole(&mut self, chunk: Chunk) {
        match chunk {
            Chunk::Value(v) => self.values.push(v),
            Chunk::Text(s) => {
                if self.lines_mode {
                    self.lines.push(s);
                } else {
                    self.text.push_str(&s);
                }
            }
            Chunk::Bytes(b) => {
                if self.lines_mode {
                    self.lines.push(String::from_utf8_lossy(&b).into_owned());
                } else {
                    self.bytes.extend(b);
                }
            }
        }
    }

    pub fn finish(self) -> FdOutput {
        if self.object_mode {
            FdOutput::Values(self.values)
        } else if self.lines_mode {
            FdOutput::Lines(self.lines)
        } else if self.byte_mode {
            FdOutput::Bytes(self.bytes)
        } else {
            FdOutput::Text(self.text)
        }
    }
}

/// Drain one fd's pipeline output until end-of-stream, cap violation,
/// stream error, or invocation-wide cancellation. On the failure path the
/// already-accumulated data is still returned.
pub(crate) async fn collect_stream(
    settings: CollectorSettings,
    mut rx: mpsc::Receiver<Result<Chunk, ExecError>>,
    done: CancellationToken,
) -> Collected {
    let mut accumulator = Accumulator::new(&settings);
    let mut error = None;
    loop {
        let item = tokio::select! {
            _ = done.cancelled() => break,
            item = rx.recv() => item,
        };
        let chunk = match item {
            None => break,
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                error = Some(e);
                break;
            }
        };
        if !settings.buffered {
            continue;
        }
        if settings.verbose {
            if let Chunk::Text(line) = &chunk {
                tracing::trace!(fd = settings.fd, "{}", line.trim_end_matches('\n'));
            }
        }
        if accumulator.push(chunk) {
            tracing::warn!(
                fd = settings.fd,
                limit = settings.limit.unwrap_or(0),
                "output exceeded max buffer ({})",
                settings.unit()
            );
            error = Some(ExecError::CappedOutput {
                fd: settings.fd,
                unit: settings.unit(),
            });
            // Dropping the receiver makes upstream stages and the reader
            // stop; the stream is closed rather than drained.
            break;
        }
    }
    let output = if settings.buffered {
        accumulator.finish()
    } else {
        FdOutput::None
    };
    Collected { output, error }
}
