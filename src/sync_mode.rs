//! Fully synchronous execution: blocking spawn, complete-buffer capture,
//! and the same outcome shape as the asynchronous engine.
//!
//! Streaming-only features are rejected up front; transform stages must
//! be non-suspending. Timeout and SIGKILL escalation run on a dedicated
//! timer thread signalled through a condvar when the process exits.

use std::io::{Read, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Command, Stdio};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;

use crate::collect::{Accumulator, Collected, CollectorSettings};
use crate::command::ProcessCommand;
use crate::error::ExecError;
use crate::lifecycle::{send_group_signal, ResolutionContext, TerminationReason};
use crate::pipe::chunk_to_bytes;
use crate::resolve::{assemble_result, log_result, AssembleInput};
use crate::result::{ExecResult, FdOutput};
use crate::stdio::{resolve::resolve_stdio, Direction, FdSpec, StdioItem, STDIN_FD};
use crate::transform::pipeline::ComposeOptions;
use crate::transform::{Chunk, Pipeline};

/// Run to completion on the calling thread. Returns the outcome as a
/// value; the caller decides whether a failed result becomes an error.
pub(crate) fn execute_sync(mut command: ProcessCommand) -> Result<ExecResult, ExecError> {
    let mut specs = resolve_stdio(&mut command)?;
    reject_streaming_options(&command, &specs)?;

    let command_line = command.command_line();
    let escaped_command = command.escaped_command();

    specs.truncate(3);
    let mut stderr_spec = specs.pop().ok_or_else(missing_spec)?;
    let mut stdout_spec = specs.pop().ok_or_else(missing_spec)?;
    let mut stdin_spec = specs.pop().ok_or_else(missing_spec)?;

    let stdout_pipeline = output_pipeline(&mut stdout_spec, &command)?;
    let stderr_pipeline = output_pipeline(&mut stderr_spec, &command)?;
    let input_bytes = prepare_input(&mut stdin_spec, &command)?;

    let mut os_command = Command::new(&command.program);
    os_command.args(&command.args);
    if command.env_clear {
        os_command.env_clear();
    }
    os_command.envs(&command.env);
    if let Some(dir) = &command.working_dir {
        os_command.current_dir(dir);
    }
    os_command.process_group(0);
    os_command.stdin(sync_stdio(&stdin_spec, input_bytes.is_some()));
    os_command.stdout(sync_stdio(&stdout_spec, true));
    os_command.stderr(sync_stdio(&stderr_spec, true));

    tracing::debug!(command = %escaped_command, "starting process (sync)");
    let start = Instant::now();
    let mut child = os_command.spawn().map_err(|source| ExecError::Spawn {
        command: escaped_command.clone(),
        source,
    })?;
    let pid = child.id() as i32;

    let ctx = Arc::new(ResolutionContext::new());
    let exited = Arc::new((Mutex::new(false), Condvar::new()));
    let timer = command.timeout.map(|timeout| {
        spawn_timer_thread(
            pid,
            command.kill_signal,
            timeout,
            command.force_kill_after,
            Arc::clone(&ctx),
            Arc::clone(&exited),
        )
    });

    let first_error: Arc<Mutex<Option<ExecError>>> = Arc::new(Mutex::new(None));
    let stdin_thread = child.stdin.take().map(|mut stdin| {
        let first_error = Arc::clone(&first_error);
        let bytes = input_bytes.unwrap_or_default();
        thread::spawn(move || {
            if let Err(e) = stdin.write_all(&bytes) {
                // The process not wanting all of its input is routine.
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    record_error(
                        &first_error,
                        ExecError::Stream {
                            fd: STDIN_FD,
                            source: e,
                        },
                    );
                }
            }
        })
    });
    let stdout_thread = child.stdout.take().map(spawn_capture_thread);
    let stderr_thread = child.stderr.take().map(spawn_capture_thread);

    let status = child.wait();
    ctx.mark_exited();
    signal_exit(&exited);
    if let Some(timer) = timer {
        let _ = timer.join();
    }
    if let Some(handle) = stdin_thread {
        let _ = handle.join();
    }

    let (exit_code, signal) = match &status {
        Ok(status) => (status.code(), status.signal()),
        Err(_) => (None, None),
    };
    let mut discrete_error = match status {
        Ok(_) => None,
        Err(e) => Some(ExecError::Io(e)),
    };
    if discrete_error.is_none() {
        discrete_error = match first_error.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
    }

    let stdout = finish_capture(
        stdout_thread,
        stdout_pipeline,
        output_settings(&command, &stdout_spec, command.buffer_stdout),
        tee_paths(&stdout_spec),
    );
    let stderr = finish_capture(
        stderr_thread,
        stderr_pipeline,
        output_settings(&command, &stderr_spec, command.buffer_stderr),
        tee_paths(&stderr_spec),
    );

    let result = assemble_result(AssembleInput {
        command_line,
        escaped_command,
        duration: start.elapsed(),
        exit_code,
        signal,
        stdout,
        stderr,
        all: None,
        ipc_messages: Vec::new(),
        ipc_error: None,
        first_error: discrete_error,
        timeout: command.timeout,
        ctx: &ctx,
    });
    log_result(&result);
    Ok(result)
}

fn missing_spec() -> ExecError {
    ExecError::Internal("stdio resolution produced no standard fd specs".to_string())
}

/// Streaming features have no synchronous counterpart.
fn reject_streaming_options(
    command: &ProcessCommand,
    specs: &[FdSpec],
) -> Result<(), ExecError> {
    if command.ipc || command.graceful_cancel {
        return Err(ExecError::Config(
            "synchronous mode does not support ipc".to_string(),
        ));
    }
    if command.cancel.is_some() {
        return Err(ExecError::Config(
            "synchronous mode does not support cancellation tokens".to_string(),
        ));
    }
    if command.all {
        return Err(ExecError::Config(
            "synchronous mode cannot interleave stdout and stderr".to_string(),
        ));
    }
    for spec in specs {
        if spec.has(|item| {
            matches!(
                item,
                StdioItem::Reader(_) | StdioItem::Writer(_) | StdioItem::Ipc
            )
        }) {
            return Err(ExecError::Config(format!(
                "fd {}: external streams are not supported in synchronous mode",
                spec.fd
            )));
        }
    }
    Ok(())
}

fn output_pipeline(
    spec: &mut FdSpec,
    command: &ProcessCommand,
) -> Result<Pipeline, ExecError> {
    let pipeline = Pipeline::compose(ComposeOptions {
        fd: spec.fd,
        direction: Direction::Output,
        encoding: command.encoding,
        lines: command.lines,
        object_mode: spec.object_mode,
        user_stages: spec.take_stages(),
    })?;
    pipeline.ensure_sync()?;
    Ok(pipeline)
}

/// Gather stdin data from literal and file items and run it through the
/// input pipeline. `None` means stdin carries no data at all.
fn prepare_input(
    spec: &mut FdSpec,
    command: &ProcessCommand,
) -> Result<Option<Vec<u8>>, ExecError> {
    let stages = spec.take_stages();
    let mut data = Vec::new();
    let mut has_input = false;
    for item in &spec.items {
        match item {
            StdioItem::Literal(bytes) => {
                data.extend_from_slice(bytes);
                has_input = true;
            }
            StdioItem::File(path) => {
                let bytes = std::fs::read(path).map_err(|source| ExecError::Stream {
                    fd: STDIN_FD,
                    source,
                })?;
                data.extend_from_slice(&bytes);
                has_input = true;
            }
            _ => {}
        }
    }
    if !has_input {
        return Ok(None);
    }
    let pipeline = Pipeline::compose(ComposeOptions {
        fd: STDIN_FD,
        direction: Direction::Input,
        encoding: command.encoding,
        lines: false,
        object_mode: spec.object_mode,
        user_stages: stages,
    })?;
    pipeline.ensure_sync()?;
    let chunks = pipeline.run_sync(vec![Chunk::Bytes(data)])?;
    let mut bytes = Vec::new();
    for chunk in chunks {
        bytes.extend(chunk_to_bytes(chunk));
    }
    Ok(Some(bytes))
}

fn sync_stdio(spec: &FdSpec, piped: bool) -> Stdio {
    match spec.items.as_slice() {
        [StdioItem::Inherit] => Stdio::inherit(),
        [StdioItem::Ignore] => Stdio::null(),
        _ if piped => Stdio::piped(),
        _ => Stdio::null(),
    }
}

fn spawn_capture_thread(
    mut stream: impl Read + Send + 'static,
) -> thread::JoinHandle<std::io::Result<Vec<u8>>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf)?;
        Ok(buf)
    })
}

fn output_settings(
    command: &ProcessCommand,
    spec: &FdSpec,
    buffered: bool,
) -> CollectorSettings {
    CollectorSettings {
        fd: spec.fd,
        encoding: command.encoding,
        lines: command.lines,
        object_mode: spec.object_mode,
        limit: command.max_buffer,
        buffered,
        verbose: false,
    }
}

/// File items on an output fd receive the full transformed stream, in
/// sync mode rendered from the captured buffer.
fn tee_paths(spec: &FdSpec) -> Vec<std::path::PathBuf> {
    spec.items
        .iter()
        .filter_map(|item| match item {
            StdioItem::File(path) => Some(path.clone()),
            _ => None,
        })
        .collect()
}

/// Run the captured bytes through the fd's pipeline, write file tees, and
/// apply the cap by truncation, yielding the same error shape as the
/// streaming collector. Tees see the full stream, uncapped.
fn finish_capture(
    thread: Option<thread::JoinHandle<std::io::Result<Vec<u8>>>>,
    pipeline: Pipeline,
    settings: CollectorSettings,
    tees: Vec<std::path::PathBuf>,
) -> Collected {
    let fd = settings.fd;
    let Some(thread) = thread else {
        return Collected {
            output: FdOutput::None,
            error: None,
        };
    };
    let bytes = match thread.join() {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(source)) => {
            return Collected {
                output: FdOutput::None,
                error: Some(ExecError::Stream { fd, source }),
            }
        }
        Err(_) => {
            return Collected {
                output: FdOutput::None,
                error: Some(ExecError::Internal("capture thread panicked".to_string())),
            }
        }
    };
    if !settings.buffered && tees.is_empty() {
        return Collected {
            output: FdOutput::None,
            error: None,
        };
    }
    let input = if bytes.is_empty() {
        Vec::new()
    } else {
        vec![Chunk::Bytes(bytes)]
    };
    let chunks = match pipeline.run_sync(input) {
        Ok(chunks) => chunks,
        Err(e) => {
            return Collected {
                output: FdOutput::None,
                error: Some(e),
            }
        }
    };
    if !tees.is_empty() {
        let mut rendered = Vec::new();
        for chunk in &chunks {
            rendered.extend(crate::resolve::tee_bytes(chunk, settings.lines));
        }
        for path in &tees {
            if let Err(source) = std::fs::write(path, &rendered) {
                return Collected {
                    output: FdOutput::None,
                    error: Some(ExecError::Stream { fd, source }),
                };
            }
        }
    }
    if !settings.buffered {
        return Collected {
            output: FdOutput::None,
            error: None,
        };
    }
    let mut accumulator = Accumulator::new(&settings);
    let mut error = None;
    for chunk in chunks {
        if accumulator.push(chunk) {
            error = Some(ExecError::CappedOutput {
                fd,
                unit: settings.unit(),
            });
            break;
        }
    }
    Collected {
        output: accumulator.finish(),
        error,
    }
}

fn spawn_timer_thread(
    pid: i32,
    kill_signal: Signal,
    timeout: Duration,
    force_kill_after: Option<Duration>,
    ctx: Arc<ResolutionContext>,
    exited: Arc<(Mutex<bool>, Condvar)>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let (lock, cvar) = &*exited;
        let guard = match lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Ok((guard, wait)) = cvar.wait_timeout_while(guard, timeout, |done| !*done) else {
            return;
        };
        if !wait.timed_out() || *guard {
            return;
        }
        ctx.set_termination_reason(TerminationReason::Timeout);
        tracing::warn!("process timed out after {timeout:?}");
        send_group_signal(Some(pid), kill_signal);
        let Some(delay) = force_kill_after else {
            return;
        };
        let Ok((guard, wait)) = cvar.wait_timeout_while(guard, delay, |done| !*done) else {
            return;
        };
        if wait.timed_out() && !*guard {
            ctx.mark_forcefully_terminated();
            tracing::warn!("process did not exit after {delay:?}, sending SIGKILL");
            send_group_signal(Some(pid), Signal::SIGKILL);
        }
    })
}

fn signal_exit(exited: &(Mutex<bool>, Condvar)) {
    let (lock, cvar) = exited;
    let mut done = match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    *done = true;
    cvar.notify_all();
}

fn record_error(slot: &Mutex<Option<ExecError>>, error: ExecError) {
    let mut guard = match slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if guard.is_none() {
        *guard = Some(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ProcessCommandBuilder;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn echo_captures_stdout() {
        let command = ProcessCommandBuilder::new("echo").arg("hello").build();
        let result = execute_sync(command).unwrap();
        assert!(result.success());
        assert_eq!(result.stdout.as_text(), Some("hello\n"));
    }

    #[test]
    fn nonzero_exit_is_a_failed_result() {
        let command = ProcessCommandBuilder::new("false").build();
        let result = execute_sync(command).unwrap();
        assert!(result.failed);
        assert_eq!(result.exit_code, Some(1));
        assert!(result.cause.is_none());
    }

    #[test]
    fn literal_input_reaches_stdin() {
        let command = ProcessCommandBuilder::new("cat").input("ping\n").build();
        let result = execute_sync(command).unwrap();
        assert_eq!(result.stdout.as_text(), Some("ping\n"));
    }

    #[test]
    fn lines_mode_splits_output() {
        let command = ProcessCommandBuilder::new("printf")
            .arg("a\\nb\\nc\\n")
            .lines()
            .build();
        let result = execute_sync(command).unwrap();
        assert_eq!(
            result.stdout.as_lines(),
            Some(["a".to_string(), "b".to_string(), "c".to_string()].as_slice())
        );
    }

    #[test]
    fn file_tee_is_written_from_the_captured_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tee.log");
        let command = ProcessCommandBuilder::new("printf")
            .arg("teed")
            .stdout_items(vec![StdioItem::Pipe, StdioItem::File(path.clone())])
            .build();
        let result = execute_sync(command).unwrap();
        assert_eq!(result.stdout.as_text(), Some("teed"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "teed");
    }

    #[test]
    fn unbuffered_capture_still_writes_file_tees() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tee.log");
        let command = ProcessCommandBuilder::new("printf")
            .arg("quiet")
            .no_buffer_stdout()
            .stdout_items(vec![StdioItem::Pipe, StdioItem::File(path.clone())])
            .build();
        let result = execute_sync(command).unwrap();
        assert!(matches!(result.stdout, FdOutput::None));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "quiet");
    }

    #[test]
    fn max_buffer_truncates_and_tags_the_error() {
        let command = ProcessCommandBuilder::new("printf")
            .arg("abcdefgh")
            .max_buffer(4)
            .build();
        let result = execute_sync(command).unwrap();
        assert!(result.failed);
        assert_eq!(result.stdout.as_text(), Some("abcd"));
        assert!(matches!(
            result.cause.as_deref(),
            Some(ExecError::CappedOutput { fd: 1, .. })
        ));
    }

    #[test]
    fn timeout_kills_and_stamps_the_result() {
        let command = ProcessCommandBuilder::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(100))
            .build();
        let start = Instant::now();
        let result = execute_sync(command).unwrap();
        assert!(start.elapsed() < Duration::from_secs(4));
        assert!(result.timed_out);
        assert!(result.failed);
        assert!(result.is_terminated);
    }

    #[test]
    fn cancellation_token_is_rejected() {
        let command = ProcessCommandBuilder::new("true")
            .cancel(CancellationToken::new())
            .build();
        assert!(matches!(
            execute_sync(command).unwrap_err(),
            ExecError::Config(_)
        ));
    }

    #[test]
    fn ipc_is_rejected() {
        let command = ProcessCommandBuilder::new("true").ipc().build();
        assert!(matches!(
            execute_sync(command).unwrap_err(),
            ExecError::Config(_)
        ));
    }
}
