//! Pipe bridge: feeds one process's output into another's stdin.
//!
//! Output fds publish their transformed chunks to [`Taps`]; a pipe link
//! subscribes to a tap and forwards the bytes into the destination's
//! stdin merge group. Links must be attached before the destination is
//! awaited; chunks published before a link attaches are not replayed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ExecError, ALL_FD};
use crate::result::ExecResult;
use crate::transform::Chunk;

/// Which of the source's streams a pipe link reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeSource {
    Stdout,
    Stderr,
    /// Stdout and stderr interleaved in delivery order.
    All,
    Fd(u32),
}

impl PipeSource {
    pub(crate) fn fd(self) -> u32 {
        match self {
            PipeSource::Stdout => crate::stdio::STDOUT_FD,
            PipeSource::Stderr => crate::stdio::STDERR_FD,
            PipeSource::All => ALL_FD,
            PipeSource::Fd(fd) => fd,
        }
    }
}

/// Per-fd fan-out points for pipe links. Each captured output fd gets a
/// tap; subscribing yields a bounded channel with backpressure, so a slow
/// destination slows the source instead of dropping chunks.
#[derive(Default)]
pub(crate) struct Taps {
    links: Mutex<HashMap<u32, Vec<mpsc::Sender<Chunk>>>>,
}

impl Taps {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, fd: u32) -> mpsc::Receiver<Chunk> {
        let (tx, rx) = mpsc::channel(16);
        self.links.lock().await.entry(fd).or_default().push(tx);
        rx
    }

    /// Forward one chunk to every link on `fd`. Links whose receiver has
    /// gone away are dropped.
    pub async fn publish(&self, fd: u32, chunk: &Chunk) {
        let senders = {
            let mut links = self.links.lock().await;
            match links.get_mut(&fd) {
                Some(senders) if !senders.is_empty() => senders.clone(),
                _ => return,
            }
        };
        let mut any_dead = false;
        for sender in &senders {
            if sender.send(chunk.clone()).await.is_err() {
                any_dead = true;
            }
        }
        if any_dead {
            let mut links = self.links.lock().await;
            if let Some(senders) = links.get_mut(&fd) {
                senders.retain(|sender| !sender.is_closed());
            }
        }
    }

    /// Drop every link on `fd`, signalling end-of-stream downstream.
    pub async fn close(&self, fd: u32) {
        self.links.lock().await.remove(&fd);
    }

    pub async fn close_all(&self) {
        self.links.lock().await.clear();
    }
}

/// Interest-counted gate in front of a destination's stdin. The stdin
/// writer holds the receiving end; it observes end-of-input only once
/// every registered source has finished and the group is sealed.
pub(crate) struct MergeGroup {
    tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    registered: AtomicUsize,
}

impl MergeGroup {
    pub fn new(tx: mpsc::Sender<Vec<u8>>) -> Self {
        MergeGroup {
            tx: Mutex::new(Some(tx)),
            registered: AtomicUsize::new(0),
        }
    }

    /// Register one source. `None` once the group is sealed.
    pub async fn register(&self) -> Option<mpsc::Sender<Vec<u8>>> {
        let guard = self.tx.lock().await;
        let tx = guard.as_ref()?.clone();
        self.registered.fetch_add(1, Ordering::SeqCst);
        Some(tx)
    }

    #[cfg(test)]
    pub fn registered(&self) -> usize {
        self.registered.load(Ordering::SeqCst)
    }

    /// Drop the group's own sender; stdin half-closes once the remaining
    /// registered sources finish.
    pub async fn seal(&self) {
        self.tx.lock().await.take();
    }
}

/// One running pipe link. Dropping the token cancels the link without
/// touching the destination.
#[derive(Debug)]
pub struct PipeLink {
    pub(crate) cancel: CancellationToken,
    pub(crate) task: JoinHandle<Result<(), ExecError>>,
}

impl PipeLink {
    /// Detach this link: stop forwarding and release its stdin interest.
    /// The destination keeps running on its remaining sources.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Await the forwarding task and return how the link ended.
    pub async fn finish(self) -> Result<(), ExecError> {
        match self.task.await {
            Ok(result) => result,
            Err(_) => Err(ExecError::Internal("pipe link task panicked".to_string())),
        }
    }
}

/// Spawn the forwarding task for one link.
pub(crate) fn spawn_link(
    mut source: mpsc::Receiver<Chunk>,
    dest: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
) -> PipeLink {
    let task_cancel = cancel.clone();
    let task = tokio::spawn(async move {
        loop {
            let chunk = tokio::select! {
                _ = task_cancel.cancelled() => return Err(ExecError::PipeCanceled),
                chunk = source.recv() => chunk,
            };
            let Some(chunk) = chunk else {
                // Source finished; dropping our sender releases the
                // stdin interest.
                return Ok(());
            };
            let bytes = chunk_to_bytes(chunk);
            if bytes.is_empty() {
                continue;
            }
            if dest.send(bytes).await.is_err() {
                // Destination stdin closed early. Stop reading; the
                // source is not force-destroyed.
                return Ok(());
            }
        }
    });
    PipeLink { cancel, task }
}

/// Wire form of a pipeline chunk: bytes pass through, text keeps its
/// UTF-8 encoding, objects become JSON lines.
pub(crate) fn chunk_to_bytes(chunk: Chunk) -> Vec<u8> {
    match chunk {
        Chunk::Bytes(bytes) => bytes,
        Chunk::Text(text) => text.into_bytes(),
        Chunk::Value(value) => {
            let mut line = value.to_string().into_bytes();
            line.push(b'\n');
            line
        }
    }
}

/// Combine a pipe's two outcomes under pipefail: any failure fails the
/// pipe; when both fail the destination's error is primary and the
/// source's result rides along as pipe-source context.
pub fn combine_pipe_results(
    source: Result<ExecResult, ExecError>,
    destination: Result<ExecResult, ExecError>,
) -> Result<ExecResult, ExecError> {
    match (source, destination) {
        (Ok(source), Ok(mut dest)) => {
            dest.pipe_sources.push(source);
            Ok(dest)
        }
        (Ok(source), Err(ExecError::CommandFailed(mut dest))) => {
            dest.pipe_sources.push(source);
            Err(ExecError::CommandFailed(dest))
        }
        (Err(ExecError::CommandFailed(source)), Err(ExecError::CommandFailed(mut dest))) => {
            dest.pipe_sources.push(*source);
            Err(ExecError::CommandFailed(dest))
        }
        // Source failed while the destination succeeded: the source's
        // error is the pipe's error.
        (Err(source), Ok(_)) => Err(source),
        (Ok(_), Err(dest)) => Err(dest),
        (Err(_), Err(dest)) => Err(dest),
    }
}
