use std::fmt;
use std::time::Duration;

use crate::result::ExecResult;

/// Unit in which a buffering cap is accounted, depending on the output mode
/// of the fd it guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUnit {
    Bytes,
    Characters,
    Lines,
    Objects,
}

impl fmt::Display for BufferUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BufferUnit::Bytes => "bytes",
            BufferUnit::Characters => "characters",
            BufferUnit::Lines => "lines",
            BufferUnit::Objects => "objects",
        };
        f.write_str(s)
    }
}

/// Fd tag used by [`ExecError::CappedOutput`] when the interleaved
/// stdout+stderr collector exceeds its cap.
pub const ALL_FD: u32 = u32::MAX;

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("stream error on fd {fd}: {source}")]
    Stream {
        fd: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid transform output: {0}")]
    InvalidTransformOutput(String),

    #[error("max buffer exceeded on fd {fd} ({unit})")]
    CappedOutput { fd: u32, unit: BufferUnit },

    #[error("process timed out after {0:?}")]
    Timeout(Duration),

    #[error("process was canceled")]
    Canceled,

    #[error("process was canceled gracefully")]
    GracefulCanceled,

    #[error("pipe was canceled")]
    PipeCanceled,

    #[error("ipc error: {0}")]
    Ipc(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("{}", .0.failure_summary())]
    CommandFailed(Box<ExecResult>),
}

impl ExecError {
    /// Whether this error was produced before any process was spawned.
    pub fn is_pre_spawn(&self) -> bool {
        matches!(self, ExecError::Config(_) | ExecError::Spawn { .. })
    }
}
