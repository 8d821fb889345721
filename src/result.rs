//! Outcome shapes produced by the result resolver.

use std::time::Duration;

use serde_json::Value;

use crate::error::ExecError;

/// Collected output of one fd, in the shape its mode implies.
#[derive(Debug, Clone, PartialEq)]
pub enum FdOutput {
    /// The fd was not buffered (or not captured at all).
    None,
    /// Raw bytes (`Encoding::Buffer`).
    Bytes(Vec<u8>),
    /// Decoded text.
    Text(String),
    /// Line mode.
    Lines(Vec<String>),
    /// Object mode.
    Values(Vec<Value>),
}

impl FdOutput {
    pub fn is_none(&self) -> bool {
        matches!(self, FdOutput::None)
    }

    /// Text view of the output, when it has one.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FdOutput::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_lines(&self) -> Option<&[String]> {
        match self {
            FdOutput::Lines(lines) => Some(lines),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FdOutput::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_values(&self) -> Option<&[Value]> {
        match self {
            FdOutput::Values(v) => Some(v),
            _ => None,
        }
    }
}

/// The single deterministic result of one invocation.
///
/// Produced exactly once, after every completion signal has settled. A
/// failed invocation is the same shape with `failed` set and `cause`
/// carrying the triggering error; [`crate::ProcessHandle::join`] wraps it
/// in [`ExecError::CommandFailed`], while `join_lenient` returns it as a
/// value.
#[derive(Debug)]
pub struct ExecResult {
    /// Program and arguments joined with spaces.
    pub command: String,
    /// Shell-quoted rendering of the command, for logging.
    pub escaped_command: String,
    pub duration: Duration,
    /// Exit code, when the process exited on its own.
    pub exit_code: Option<i32>,
    /// Terminating signal number, when the process was killed.
    pub signal: Option<i32>,
    pub stdout: FdOutput,
    pub stderr: FdOutput,
    /// Interleaved stdout+stderr, when the `all` option was enabled.
    pub all: Option<FdOutput>,
    /// Structured messages received over the IPC channel.
    pub ipc_messages: Vec<Value>,
    pub failed: bool,
    pub timed_out: bool,
    pub is_canceled: bool,
    pub is_gracefully_canceled: bool,
    /// The process was terminated by a signal.
    pub is_terminated: bool,
    /// The force-kill timer escalated to SIGKILL.
    pub is_forcefully_terminated: bool,
    /// The error that decided a failed outcome. Recoverable bookkeeping
    /// errors (an expected EPIPE swallow) never appear here.
    pub cause: Option<Box<ExecError>>,
    /// Results of processes piped into this one, most recent link last.
    pub pipe_sources: Vec<ExecResult>,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        !self.failed
    }

    /// One-line summary used by `ExecError::CommandFailed`'s display.
    pub fn failure_summary(&self) -> String {
        if let Some(cause) = &self.cause {
            format!("command `{}` failed: {}", self.command, cause)
        } else if let Some(signal) = self.signal {
            format!("command `{}` was killed by signal {}", self.command, signal)
        } else {
            format!(
                "command `{}` exited with code {}",
                self.command,
                self.exit_code.unwrap_or(-1)
            )
        }
    }

    /// Synthetic failure for an invocation whose resolver task was lost.
    pub(crate) fn internal_failure(command: String, escaped_command: String, msg: String) -> Self {
        ExecResult {
            command,
            escaped_command,
            duration: Duration::ZERO,
            exit_code: None,
            signal: None,
            stdout: FdOutput::None,
            stderr: FdOutput::None,
            all: None,
            ipc_messages: Vec::new(),
            failed: true,
            timed_out: false,
            is_canceled: false,
            is_gracefully_canceled: false,
            is_terminated: false,
            is_forcefully_terminated: false,
            cause: Some(Box::new(ExecError::Internal(msg))),
            pipe_sources: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_with(exit_code: Option<i32>, signal: Option<i32>) -> ExecResult {
        ExecResult {
            command: "false".to_string(),
            escaped_command: "false".to_string(),
            duration: Duration::from_millis(1),
            exit_code,
            signal,
            stdout: FdOutput::None,
            stderr: FdOutput::None,
            all: None,
            ipc_messages: Vec::new(),
            failed: true,
            timed_out: false,
            is_canceled: false,
            is_gracefully_canceled: false,
            is_terminated: signal.is_some(),
            is_forcefully_terminated: false,
            cause: None,
            pipe_sources: Vec::new(),
        }
    }

    #[test]
    fn summary_prefers_cause_then_signal_then_code() {
        let mut r = result_with(Some(1), None);
        assert_eq!(r.failure_summary(), "command `false` exited with code 1");

        r.signal = Some(15);
        assert_eq!(
            r.failure_summary(),
            "command `false` was killed by signal 15"
        );

        r.cause = Some(Box::new(ExecError::Canceled));
        assert_eq!(
            r.failure_summary(),
            "command `false` failed: process was canceled"
        );
    }

    #[test]
    fn fd_output_accessors() {
        assert_eq!(FdOutput::Text("hi".into()).as_text(), Some("hi"));
        assert!(FdOutput::Text("hi".into()).as_bytes().is_none());
        assert!(FdOutput::None.is_none());
    }
}
