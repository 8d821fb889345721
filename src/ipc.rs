//! Structured IPC channel between parent and child.
//!
//! Transport is a pair of anonymous pipes inherited by the child; the
//! child's fd numbers are advertised through the [`IPC_ENV_VAR`]
//! environment variable as `"<read_fd>,<write_fd>"`. Messages are JSON
//! values, one per line.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::pipe;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{BufferUnit, ExecError};

/// Environment variable naming the child's IPC fd pair.
pub const IPC_ENV_VAR: &str = "PROCFLOW_IPC_FDS";

/// Message sent to request graceful termination.
pub fn abort_message() -> Value {
    serde_json::json!({ "type": "abort" })
}

pub fn is_abort(message: &Value) -> bool {
    message.get("type").and_then(Value::as_str) == Some("abort")
}

/// Both pipe pairs, created before spawn. The child ends stay open in the
/// parent until the spawn completes, then [`IpcChannel::into_parent_ends`]
/// closes them and wraps the parent ends for async use.
pub(crate) struct IpcChannel {
    parent_write: OwnedFd,
    parent_read: OwnedFd,
    child_read: OwnedFd,
    child_write: OwnedFd,
}

impl IpcChannel {
    pub fn new() -> Result<Self, ExecError> {
        // Plain pipe(2), no CLOEXEC: the child ends must survive exec.
        let (child_read, parent_write) =
            nix::unistd::pipe().map_err(|e| ExecError::Ipc(format!("pipe failed: {e}")))?;
        let (parent_read, child_write) =
            nix::unistd::pipe().map_err(|e| ExecError::Ipc(format!("pipe failed: {e}")))?;
        Ok(IpcChannel {
            parent_write,
            parent_read,
            child_read,
            child_write,
        })
    }

    /// The child's write-end fd number, used to tag IPC errors.
    pub fn child_write_raw_fd(&self) -> i32 {
        self.child_write.as_raw_fd()
    }

    /// Value for [`IPC_ENV_VAR`] in the child's environment.
    pub fn env_value(&self) -> String {
        format!(
            "{},{}",
            self.child_read.as_raw_fd(),
            self.child_write.as_raw_fd()
        )
    }

    /// Close the child's ends and wrap the parent's for async use. Call
    /// after the spawn so the child inherits its ends first.
    pub fn into_parent_ends(self) -> Result<(IpcSender, IpcReceiver), ExecError> {
        drop(self.child_read);
        drop(self.child_write);
        let sender = wrap_nonblocking(self.parent_write, pipe::Sender::from_owned_fd)?;
        let receiver = wrap_nonblocking(self.parent_read, pipe::Receiver::from_owned_fd)?;
        Ok((
            IpcSender {
                inner: Arc::new(Mutex::new(sender)),
            },
            IpcReceiver { inner: receiver },
        ))
    }
}

fn wrap_nonblocking<T>(
    fd: OwnedFd,
    wrap: impl FnOnce(OwnedFd) -> std::io::Result<T>,
) -> Result<T, ExecError> {
    fcntl(&fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
        .map_err(|e| ExecError::Ipc(format!("failed to set ipc pipe non-blocking: {e}")))?;
    wrap(fd).map_err(|e| ExecError::Ipc(format!("failed to register ipc pipe: {e}")))
}

/// Parent-side message sender. Cloneable; writes are serialized so two
/// concurrent sends cannot interleave their lines.
#[derive(Clone)]
pub struct IpcSender {
    inner: Arc<Mutex<pipe::Sender>>,
}

impl IpcSender {
    pub async fn send(&self, message: &Value) -> Result<(), ExecError> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        let mut sender = self.inner.lock().await;
        sender
            .write_all(&line)
            .await
            .map_err(|e| ExecError::Ipc(format!("failed to send ipc message: {e}")))
    }
}

/// Parent-side message receiver, consumed by the drain task.
pub(crate) struct IpcReceiver {
    inner: pipe::Receiver,
}

/// Everything the drain had buffered when it stopped, plus the error that
/// stopped it, if any.
pub(crate) struct DrainedIpc {
    pub messages: Vec<Value>,
    pub error: Option<ExecError>,
}

/// Read messages until the child closes its write end, the cap is hit, or
/// the invocation completes. A malformed line is a protocol error; the
/// cap is reported in the same shape as an output buffer cap.
pub(crate) async fn drain_messages(
    receiver: IpcReceiver,
    fd: u32,
    max_messages: Option<u64>,
    done: CancellationToken,
) -> DrainedIpc {
    let mut lines = BufReader::new(receiver.inner).lines();
    let mut messages = Vec::new();
    let mut error = None;
    loop {
        let line = tokio::select! {
            _ = done.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error = Some(ExecError::Ipc(format!("ipc read failed: {e}")));
                break;
            }
        };
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(&line) {
            Ok(message) => {
                if let Some(max) = max_messages {
                    if messages.len() as u64 >= max {
                        tracing::warn!(fd, max, "ipc message count exceeded max buffer");
                        error = Some(ExecError::CappedOutput {
                            fd,
                            unit: BufferUnit::Objects,
                        });
                        break;
                    }
                }
                messages.push(message);
            }
            Err(e) => {
                error = Some(ExecError::Ipc(format!("malformed ipc message: {e}")));
                break;
            }
        }
    }
    DrainedIpc { messages, error }
}

/// Child-side endpoint for programs that are themselves built with this
/// crate. Present only when the parent enabled IPC.
pub struct ChildIpc {
    reader: tokio::io::Lines<BufReader<pipe::Receiver>>,
    writer: pipe::Sender,
}

impl ChildIpc {
    /// Adopt the fd pair advertised by the parent. Returns `Ok(None)` when
    /// the process was not started with an IPC channel.
    pub fn from_env() -> Result<Option<Self>, ExecError> {
        let Ok(raw) = std::env::var(IPC_ENV_VAR) else {
            return Ok(None);
        };
        let mut parts = raw.splitn(2, ',');
        let read_fd = parse_fd(parts.next(), &raw)?;
        let write_fd = parse_fd(parts.next(), &raw)?;
        // The parent guarantees these fds are open and owned by no one
        // else in this process.
        let read = unsafe { OwnedFd::from_raw_fd(read_fd) };
        let write = unsafe { OwnedFd::from_raw_fd(write_fd) };
        let receiver = wrap_nonblocking(read, pipe::Receiver::from_owned_fd)?;
        let sender = wrap_nonblocking(write, pipe::Sender::from_owned_fd)?;
        Ok(Some(ChildIpc {
            reader: BufReader::new(receiver).lines(),
            writer: sender,
        }))
    }

    /// Next message from the parent, or `None` once the parent closed the
    /// channel.
    pub async fn recv(&mut self) -> Result<Option<Value>, ExecError> {
        loop {
            let line = self
                .reader
                .next_line()
                .await
                .map_err(|e| ExecError::Ipc(format!("ipc read failed: {e}")))?;
            match line {
                None => return Ok(None),
                Some(line) if line.is_empty() => continue,
                Some(line) => {
                    let message = serde_json::from_str(&line)?;
                    return Ok(Some(message));
                }
            }
        }
    }

    pub async fn send(&mut self, message: &Value) -> Result<(), ExecError> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .await
            .map_err(|e| ExecError::Ipc(format!("failed to send ipc message: {e}")))
    }
}

fn parse_fd(part: Option<&str>, raw: &str) -> Result<i32, ExecError> {
    part.and_then(|p| p.parse().ok())
        .ok_or_else(|| ExecError::Ipc(format!("malformed {IPC_ENV_VAR} value: {raw:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_message_round_trips() {
        assert!(is_abort(&abort_message()));
        assert!(!is_abort(&serde_json::json!({ "type": "progress" })));
        assert!(!is_abort(&serde_json::json!(42)));
    }

    #[tokio::test]
    async fn messages_flow_parent_to_drain() {
        let channel = IpcChannel::new().unwrap();
        // Keep the child write end open as if a child were attached.
        let child_write = nix::unistd::dup(&channel.child_write).unwrap();
        let (_sender, receiver) = channel.into_parent_ends().unwrap();

        let mut writer = std::fs::File::from(child_write);
        use std::io::Write;
        writeln!(writer, r#"{{"type":"progress","pct":50}}"#).unwrap();
        writeln!(writer, r#"{{"type":"progress","pct":100}}"#).unwrap();
        drop(writer);

        let drained = drain_messages(receiver, 3, None, CancellationToken::new()).await;
        assert!(drained.error.is_none());
        assert_eq!(drained.messages.len(), 2);
        assert_eq!(drained.messages[0]["pct"], 50);
    }

    #[tokio::test]
    async fn message_cap_reported_as_capped_output() {
        let channel = IpcChannel::new().unwrap();
        let child_write = nix::unistd::dup(&channel.child_write).unwrap();
        let (_sender, receiver) = channel.into_parent_ends().unwrap();

        let mut writer = std::fs::File::from(child_write);
        use std::io::Write;
        for i in 0..5 {
            writeln!(writer, r#"{{"n":{i}}}"#).unwrap();
        }
        drop(writer);

        let drained = drain_messages(receiver, 3, Some(2), CancellationToken::new()).await;
        assert!(matches!(
            drained.error,
            Some(ExecError::CappedOutput {
                fd: 3,
                unit: BufferUnit::Objects
            })
        ));
        assert_eq!(drained.messages.len(), 2);
    }

    #[tokio::test]
    async fn malformed_line_is_a_protocol_error() {
        let channel = IpcChannel::new().unwrap();
        let child_write = nix::unistd::dup(&channel.child_write).unwrap();
        let (_sender, receiver) = channel.into_parent_ends().unwrap();

        let mut writer = std::fs::File::from(child_write);
        use std::io::Write;
        writeln!(writer, "not json").unwrap();
        drop(writer);

        let drained = drain_messages(receiver, 3, None, CancellationToken::new()).await;
        assert!(matches!(drained.error, Some(ExecError::Ipc(_))));
    }
}
