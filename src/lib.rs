//! # Procflow
//!
//! A process-execution engine: spawn OS processes with composable stdio
//! transform pipelines, buffered or streamed output capture, structured
//! IPC, timeouts, cancellation, and shell-style pipes with pipefail
//! semantics.
//!
//! ## Usage
//!
//! ```no_run
//! use procflow::{run, ProcessCommandBuilder};
//!
//! # async fn example() -> Result<(), procflow::ExecError> {
//! let result = run(
//!     ProcessCommandBuilder::new("git")
//!         .args(["status", "--porcelain"])
//!         .lines()
//!         .build(),
//! )
//! .await?;
//! for line in result.stdout.as_lines().unwrap_or_default() {
//!     println!("{line}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - `command` - Command specification and fluent builder
//! - `stdio` - Per-fd stdio items and the resolver that validates them
//! - `transform` - Composable transform stages with sync and async drivers
//! - `lifecycle` - Kill escalation, timeout and cancellation watchers
//! - `ipc` - Structured JSON message channel with the child process
//! - `pipe` - Process-to-process pipes with pipefail semantics
//! - `result` - Outcome shapes
//! - `error` - Error taxonomy
//! - `sync_mode` - Fully synchronous execution path

pub mod command;
pub mod error;
pub mod ipc;
pub mod pipe;
pub mod result;
pub mod stdio;
pub mod transform;

mod collect;
mod lifecycle;
mod resolve;
mod sync_mode;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use command::{
    ProcessCommand, ProcessCommandBuilder, StdioSpec, DEFAULT_FORCE_KILL_AFTER, DEFAULT_MAX_BUFFER,
};
pub use error::{BufferUnit, ExecError, ALL_FD};
pub use ipc::{ChildIpc, IpcSender, IPC_ENV_VAR};
pub use nix::sys::signal::Signal;
pub use pipe::{combine_pipe_results, PipeLink, PipeSource};
pub use result::{ExecResult, FdOutput};
pub use stdio::StdioItem;
pub use transform::{AsyncTransform, Chunk, Encoding, Stage, Transform};

use lifecycle::KillHandle;
use pipe::{spawn_link, MergeGroup, Taps};

/// Spawn a process and return a handle for interacting with it while it
/// runs.
pub async fn spawn(command: ProcessCommand) -> Result<ProcessHandle, ExecError> {
    let spawned = resolve::spawn_process(command).await?;
    Ok(ProcessHandle {
        pid: spawned.pid,
        kill: spawned.kill,
        taps: spawned.taps,
        stdin_group: spawned.stdin_group,
        ipc_sender: spawned.ipc_sender,
        detached: spawned.detached,
        command_line: spawned.command_line,
        escaped_command: spawned.escaped_command,
        outcome: Some(spawned.outcome),
    })
}

/// Run a process to completion. A failed invocation becomes
/// [`ExecError::CommandFailed`] wrapping the full result.
pub async fn run(command: ProcessCommand) -> Result<ExecResult, ExecError> {
    spawn(command).await?.join().await
}

/// Run a process to completion on the calling thread. Only
/// non-suspending transform stages and buffered capture are available.
pub fn run_sync(command: ProcessCommand) -> Result<ExecResult, ExecError> {
    let result = sync_mode::execute_sync(command)?;
    if result.failed {
        Err(ExecError::CommandFailed(Box::new(result)))
    } else {
        Ok(result)
    }
}

/// Run `source`, feeding its stdout into `destination`'s stdin, with
/// pipefail semantics.
pub async fn pipe(
    source: ProcessCommand,
    destination: ProcessCommand,
) -> Result<ExecResult, ExecError> {
    pipe_with(source, PipeSource::Stdout, destination).await
}

/// Like [`pipe`], reading the given source stream.
pub async fn pipe_with(
    source: ProcessCommand,
    stream: PipeSource,
    destination: ProcessCommand,
) -> Result<ExecResult, ExecError> {
    let source = spawn(source).await?;
    let destination = spawn(destination).await?;
    let link = source.pipe_into(&destination, stream).await?;
    let (source_result, destination_result) =
        tokio::join!(source.join(), destination.join());
    let _ = link.finish().await;
    combine_pipe_results(source_result, destination_result)
}

/// A running process. Dropping the handle without joining kills a
/// non-detached process.
pub struct ProcessHandle {
    pid: Option<u32>,
    kill: Arc<KillHandle>,
    taps: Arc<Taps>,
    stdin_group: Arc<MergeGroup>,
    ipc_sender: Option<IpcSender>,
    detached: bool,
    command_line: String,
    escaped_command: String,
    outcome: Option<JoinHandle<ExecResult>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    /// Send the configured kill signal, with SIGKILL escalation.
    pub fn kill(&self) {
        self.kill.kill();
    }

    /// Send a specific signal. Escalation is armed only for the
    /// configured default kill signal.
    pub fn kill_with_signal(&self, signal: Signal) {
        self.kill.kill_with_signal(signal);
    }

    /// Fail the eventual outcome with `error` and kill the process.
    pub fn kill_with_error(&self, error: ExecError) {
        self.kill.kill_with_error(error);
    }

    /// Send a structured message over the IPC channel.
    pub async fn send_message(&self, message: &serde_json::Value) -> Result<(), ExecError> {
        match &self.ipc_sender {
            Some(sender) => sender.send(message).await,
            None => Err(ExecError::Config(
                "ipc is not enabled for this process".to_string(),
            )),
        }
    }

    /// Attach a pipe link feeding one of this process's output streams
    /// into `destination`'s stdin. Must be called before `destination`
    /// is joined.
    pub async fn pipe_into(
        &self,
        destination: &ProcessHandle,
        stream: PipeSource,
    ) -> Result<PipeLink, ExecError> {
        if let PipeSource::Fd(fd) = stream {
            // Extra output fds are not captured, so a link on one would
            // never see a chunk.
            return Err(ExecError::Config(format!(
                "fd {fd} is not a capturable pipe source; use stdout, stderr or all"
            )));
        }
        let chunks = self.taps.subscribe(stream.fd()).await;
        let dest_tx = destination.stdin_group.register().await.ok_or_else(|| {
            ExecError::Config("destination stdin is already closed to new sources".to_string())
        })?;
        Ok(spawn_link(chunks, dest_tx, CancellationToken::new()))
    }

    /// Await completion. A failed invocation becomes
    /// [`ExecError::CommandFailed`] wrapping the full result.
    pub async fn join(self) -> Result<ExecResult, ExecError> {
        let result = self.join_lenient().await;
        if result.failed {
            Err(ExecError::CommandFailed(Box::new(result)))
        } else {
            Ok(result)
        }
    }

    /// Await completion, returning the result as a value whether or not
    /// the invocation failed.
    pub async fn join_lenient(mut self) -> ExecResult {
        self.stdin_group.seal().await;
        let Some(outcome) = self.outcome.take() else {
            return ExecResult::internal_failure(
                self.command_line.clone(),
                self.escaped_command.clone(),
                "resolver task already consumed".to_string(),
            );
        };
        match outcome.await {
            Ok(result) => result,
            Err(_) => ExecResult::internal_failure(
                self.command_line.clone(),
                self.escaped_command.clone(),
                "resolver task panicked".to_string(),
            ),
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        // A handle dropped before joining abandons the invocation; a
        // non-detached process must not outlive its handle.
        if self.outcome.is_some() && !self.detached {
            tracing::debug!(command = %self.escaped_command, "handle dropped, killing process");
            self.kill.force_kill_now();
        }
    }
}
