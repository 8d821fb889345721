//! Stdio data model: per-fd item lists and their resolved specs.

pub mod resolve;

use std::fmt;
use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::transform::Stage;

pub const STDIN_FD: u32 = 0;
pub const STDOUT_FD: u32 = 1;
pub const STDERR_FD: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

/// One stdio configuration item. Multiple items on the same fd are
/// composed in direction-aware order.
pub enum StdioItem {
    /// Capture through a pipe (the default).
    Pipe,
    /// Pass the parent's own stream through.
    Inherit,
    /// Discard (`/dev/null`).
    Ignore,
    /// Reserve the fd for the structured IPC channel.
    Ipc,
    /// Read input from, or tee output to, a file.
    File(PathBuf),
    /// Literal input data.
    Literal(Vec<u8>),
    /// External stream supplying input.
    Reader(Box<dyn AsyncRead + Send + Unpin>),
    /// External stream receiving output.
    Writer(Box<dyn AsyncWrite + Send + Unpin>),
    /// A transform stage in this fd's pipeline.
    Stage(Stage),
}

impl StdioItem {
    pub fn kind(&self) -> &'static str {
        match self {
            StdioItem::Pipe => "pipe",
            StdioItem::Inherit => "inherit",
            StdioItem::Ignore => "ignore",
            StdioItem::Ipc => "ipc",
            StdioItem::File(_) => "file",
            StdioItem::Literal(_) => "input data",
            StdioItem::Reader(_) => "reader",
            StdioItem::Writer(_) => "writer",
            StdioItem::Stage(_) => "transform",
        }
    }

    /// `ignore` and `ipc` cannot be combined with other items on one fd.
    pub fn is_exclusive(&self) -> bool {
        matches!(self, StdioItem::Ignore | StdioItem::Ipc)
    }
}

impl fmt::Debug for StdioItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StdioItem::File(path) => write!(f, "File({})", path.display()),
            StdioItem::Literal(data) => write!(f, "Literal({} bytes)", data.len()),
            other => f.write_str(other.kind()),
        }
    }
}

/// Resolved configuration of one stream slot. Immutable after resolution;
/// created once per invocation and discarded at process exit.
#[derive(Debug)]
pub struct FdSpec {
    pub fd: u32,
    pub direction: Direction,
    pub items: Vec<StdioItem>,
    pub object_mode: bool,
}

impl FdSpec {
    pub fn has(&self, predicate: impl Fn(&StdioItem) -> bool) -> bool {
        self.items.iter().any(predicate)
    }

    pub(crate) fn take_stages(&mut self) -> Vec<Stage> {
        let mut stages = Vec::new();
        let mut rest = Vec::new();
        for item in self.items.drain(..) {
            match item {
                StdioItem::Stage(stage) => stages.push(stage),
                other => rest.push(other),
            }
        }
        self.items = rest;
        stages
    }
}
