//! Command specification and builder.
//!
//! `ProcessCommand` is the fully-resolved configuration object the engine
//! consumes; `ProcessCommandBuilder` is the fluent surface callers use.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio_util::sync::CancellationToken;

use crate::stdio::StdioItem;
use crate::transform::{Encoding, Stage};

/// Default cap on accumulated output per fd.
pub const DEFAULT_MAX_BUFFER: u64 = 100_000_000;

/// Default delay before a kill with the default signal escalates to
/// SIGKILL.
pub const DEFAULT_FORCE_KILL_AFTER: Duration = Duration::from_millis(5000);

/// Raw per-fd option: a scalar item or an ordered item list.
pub enum StdioSpec {
    Default,
    Single(StdioItem),
    List(Vec<StdioItem>),
}

#[derive(Debug)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Start from an empty environment instead of inheriting.
    pub env_clear: bool,
    pub working_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
    /// Signal sent by `kill()` and by the timeout/cancel watchers.
    pub kill_signal: Signal,
    /// `None` disables SIGKILL escalation.
    pub force_kill_after: Option<Duration>,
    pub cancel: Option<CancellationToken>,
    /// On cancellation, send an IPC abort message and let the process
    /// self-terminate before escalating. Requires `ipc`.
    pub graceful_cancel: bool,
    pub ipc: bool,
    /// Cap on buffered IPC messages, in messages.
    pub ipc_max_messages: Option<u64>,
    /// Detached processes are not killed when their handle is dropped.
    pub detached: bool,
    pub encoding: Encoding,
    /// Produce line-mode output.
    pub lines: bool,
    /// Cap on accumulated output per fd; `None` disables the cap.
    pub max_buffer: Option<u64>,
    pub buffer_stdout: bool,
    pub buffer_stderr: bool,
    /// Also collect stdout+stderr interleaved in delivery order.
    pub all: bool,
    /// Emit per-line trace events for captured output.
    pub verbose: bool,
    pub input: Option<Vec<u8>>,
    pub input_file: Option<PathBuf>,
    pub(crate) stdin: StdioSpec,
    pub(crate) stdout: StdioSpec,
    pub(crate) stderr: StdioSpec,
    pub(crate) extra_fds: Vec<(u32, StdioSpec)>,
}

impl std::fmt::Debug for StdioSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StdioSpec::Default => f.write_str("Default"),
            StdioSpec::Single(item) => write!(f, "Single({item:?})"),
            StdioSpec::List(items) => write!(f, "List({items:?})"),
        }
    }
}

impl ProcessCommand {
    pub fn new(program: impl Into<String>) -> Self {
        ProcessCommand {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            env_clear: false,
            working_dir: None,
            timeout: None,
            kill_signal: Signal::SIGTERM,
            force_kill_after: Some(DEFAULT_FORCE_KILL_AFTER),
            cancel: None,
            graceful_cancel: false,
            ipc: false,
            ipc_max_messages: None,
            detached: false,
            encoding: Encoding::Utf8,
            lines: false,
            max_buffer: Some(DEFAULT_MAX_BUFFER),
            buffer_stdout: true,
            buffer_stderr: true,
            all: false,
            verbose: false,
            input: None,
            input_file: None,
            stdin: StdioSpec::Default,
            stdout: StdioSpec::Default,
            stderr: StdioSpec::Default,
            extra_fds: Vec::new(),
        }
    }

    /// Program and arguments joined with spaces, for result reporting.
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }

    /// Shell-quoted rendering used by verbose logging and results.
    pub fn escaped_command(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|token| escape_token(token))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn escape_token(token: &str) -> String {
    let safe = !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:@%+,".contains(c));
    if safe {
        token.to_string()
    } else {
        format!("'{}'", token.replace('\'', r"'\''"))
    }
}

pub struct ProcessCommandBuilder {
    command: ProcessCommand,
}

impl ProcessCommandBuilder {
    pub fn new(program: impl Into<String>) -> Self {
        ProcessCommandBuilder {
            command: ProcessCommand::new(program),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.command.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.command
            .args
            .extend(args.into_iter().map(|s| s.as_ref().to_string()));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.command.env.insert(key.into(), value.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            self.command
                .env
                .insert(key.as_ref().to_string(), value.as_ref().to_string());
        }
        self
    }

    pub fn env_clear(mut self) -> Self {
        self.command.env_clear = true;
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.command.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.command.timeout = Some(timeout);
        self
    }

    pub fn kill_signal(mut self, signal: Signal) -> Self {
        self.command.kill_signal = signal;
        self
    }

    /// `None` disables SIGKILL escalation entirely.
    pub fn force_kill_after(mut self, delay: Option<Duration>) -> Self {
        self.command.force_kill_after = delay;
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.command.cancel = Some(token);
        self
    }

    pub fn graceful_cancel(mut self) -> Self {
        self.command.graceful_cancel = true;
        self.command.ipc = true;
        self
    }

    pub fn ipc(mut self) -> Self {
        self.command.ipc = true;
        self
    }

    pub fn ipc_max_messages(mut self, limit: u64) -> Self {
        self.command.ipc_max_messages = Some(limit);
        self
    }

    pub fn detached(mut self) -> Self {
        self.command.detached = true;
        self
    }

    pub fn encoding(mut self, encoding: Encoding) -> Self {
        self.command.encoding = encoding;
        self
    }

    pub fn lines(mut self) -> Self {
        self.command.lines = true;
        self
    }

    /// Cap on accumulated output per fd, in the unit the mode implies.
    pub fn max_buffer(mut self, limit: u64) -> Self {
        self.command.max_buffer = Some(limit);
        self
    }

    pub fn no_max_buffer(mut self) -> Self {
        self.command.max_buffer = None;
        self
    }

    /// Disable buffering for stdout; completion is still awaited.
    pub fn no_buffer_stdout(mut self) -> Self {
        self.command.buffer_stdout = false;
        self
    }

    pub fn no_buffer_stderr(mut self) -> Self {
        self.command.buffer_stderr = false;
        self
    }

    pub fn all(mut self) -> Self {
        self.command.all = true;
        self
    }

    pub fn verbose(mut self) -> Self {
        self.command.verbose = true;
        self
    }

    pub fn input(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.command.input = Some(data.into());
        self
    }

    pub fn input_file(mut self, path: impl AsRef<Path>) -> Self {
        self.command.input_file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn stdin(mut self, item: StdioItem) -> Self {
        self.command.stdin = StdioSpec::Single(item);
        self
    }

    pub fn stdin_items(mut self, items: Vec<StdioItem>) -> Self {
        self.command.stdin = StdioSpec::List(items);
        self
    }

    pub fn stdout(mut self, item: StdioItem) -> Self {
        self.command.stdout = StdioSpec::Single(item);
        self
    }

    pub fn stdout_items(mut self, items: Vec<StdioItem>) -> Self {
        self.command.stdout = StdioSpec::List(items);
        self
    }

    pub fn stderr(mut self, item: StdioItem) -> Self {
        self.command.stderr = StdioSpec::Single(item);
        self
    }

    pub fn stderr_items(mut self, items: Vec<StdioItem>) -> Self {
        self.command.stderr = StdioSpec::List(items);
        self
    }

    /// Append a transform stage to stdout's pipeline.
    pub fn stdout_transform(mut self, stage: Stage) -> Self {
        self.command.stdout = push_item(self.command.stdout, StdioItem::Stage(stage));
        self
    }

    pub fn stderr_transform(mut self, stage: Stage) -> Self {
        self.command.stderr = push_item(self.command.stderr, StdioItem::Stage(stage));
        self
    }

    pub fn stdin_transform(mut self, stage: Stage) -> Self {
        self.command.stdin = push_item(self.command.stdin, StdioItem::Stage(stage));
        self
    }

    pub fn fd(mut self, fd: u32, spec: StdioSpec) -> Self {
        self.command.extra_fds.push((fd, spec));
        self
    }

    pub fn build(self) -> ProcessCommand {
        self.command
    }
}

fn push_item(spec: StdioSpec, item: StdioItem) -> StdioSpec {
    match spec {
        StdioSpec::Default => StdioSpec::List(vec![StdioItem::Pipe, item]),
        StdioSpec::Single(existing) => StdioSpec::List(vec![existing, item]),
        StdioSpec::List(mut items) => {
            items.push(item);
            StdioSpec::List(items)
        }
    }
}
