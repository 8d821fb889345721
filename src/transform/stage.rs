//! Transform stages: one unit of a stream pipeline.
//!
//! A stage takes a chunk and yields zero or more chunks; it may flush a
//! final batch when the stream ends. Synchronous stages ([`Transform`])
//! never suspend and are the only kind allowed in the fully-synchronous
//! execution mode; [`AsyncTransform`] stages may await between chunks and
//! run only in the asynchronous mode.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ExecError;

/// One unit of data moving through a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    Bytes(Vec<u8>),
    Text(String),
    /// Object-mode chunk: a discrete structured value.
    Value(Value),
}

impl Chunk {
    pub fn is_object(&self) -> bool {
        matches!(self, Chunk::Value(_))
    }

    /// Size in bytes, for byte-unit cap accounting.
    pub fn byte_len(&self) -> usize {
        match self {
            Chunk::Bytes(b) => b.len(),
            Chunk::Text(s) => s.len(),
            Chunk::Value(_) => 1,
        }
    }

    /// Size in characters, for character-unit cap accounting.
    pub fn char_len(&self) -> usize {
        match self {
            Chunk::Bytes(b) => b.len(),
            Chunk::Text(s) => s.chars().count(),
            Chunk::Value(_) => 1,
        }
    }
}

/// A non-suspending transform stage.
///
/// `transform` receives one chunk and returns the chunks it emits, in
/// order. `finish` runs once at end-of-stream; its output is re-run
/// through every subsequent stage before being emitted.
pub trait Transform: Send {
    fn transform(&mut self, chunk: Chunk) -> Result<Vec<Chunk>, ExecError>;

    fn finish(&mut self) -> Result<Vec<Chunk>, ExecError> {
        Ok(Vec::new())
    }

    /// Object-mode of the chunks this stage accepts.
    fn writable_object_mode(&self) -> bool {
        false
    }

    /// Object-mode of the chunks this stage emits.
    fn readable_object_mode(&self) -> bool {
        false
    }
}

/// A transform stage that may suspend between chunks.
#[async_trait]
pub trait AsyncTransform: Send {
    async fn transform(&mut self, chunk: Chunk) -> Result<Vec<Chunk>, ExecError>;

    async fn finish(&mut self) -> Result<Vec<Chunk>, ExecError> {
        Ok(Vec::new())
    }

    fn writable_object_mode(&self) -> bool {
        false
    }

    fn readable_object_mode(&self) -> bool {
        false
    }
}

/// A stage as carried by stdio specs and pipelines.
pub enum Stage {
    Sync(Box<dyn Transform + 'static>),
    Async(Box<dyn AsyncTransform + 'static>),
}

impl Stage {
    pub fn sync<T: Transform + 'static>(transform: T) -> Self {
        Stage::Sync(Box::new(transform))
    }

    pub fn asynchronous<T: AsyncTransform + 'static>(transform: T) -> Self {
        Stage::Async(Box::new(transform))
    }

    pub fn is_sync(&self) -> bool {
        matches!(self, Stage::Sync(_))
    }

    pub fn writable_object_mode(&self) -> bool {
        match self {
            Stage::Sync(t) => t.writable_object_mode(),
            Stage::Async(t) => t.writable_object_mode(),
        }
    }

    pub fn readable_object_mode(&self) -> bool {
        match self {
            Stage::Sync(t) => t.readable_object_mode(),
            Stage::Async(t) => t.readable_object_mode(),
        }
    }

    pub(crate) async fn transform(&mut self, chunk: Chunk) -> Result<Vec<Chunk>, ExecError> {
        match self {
            Stage::Sync(t) => t.transform(chunk),
            Stage::Async(t) => t.transform(chunk).await,
        }
    }

    pub(crate) async fn finish(&mut self) -> Result<Vec<Chunk>, ExecError> {
        match self {
            Stage::Sync(t) => t.finish(),
            Stage::Async(t) => t.finish().await,
        }
    }

    /// Synchronous dispatch; errors on a suspending stage. The composer
    /// rejects async stages before the synchronous mode runs, so hitting
    /// the error arm means a composition bug.
    pub(crate) fn transform_sync(&mut self, chunk: Chunk) -> Result<Vec<Chunk>, ExecError> {
        match self {
            Stage::Sync(t) => t.transform(chunk),
            Stage::Async(_) => Err(ExecError::Config(
                "async transform stages are not supported in synchronous mode".to_string(),
            )),
        }
    }

    pub(crate) fn finish_sync(&mut self) -> Result<Vec<Chunk>, ExecError> {
        match self {
            Stage::Sync(t) => t.finish(),
            Stage::Async(_) => Err(ExecError::Config(
                "async transform stages are not supported in synchronous mode".to_string(),
            )),
        }
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Sync(_) => f.write_str("Stage::Sync"),
            Stage::Async(_) => f.write_str("Stage::Async"),
        }
    }
}
