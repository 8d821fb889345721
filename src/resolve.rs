//! Result resolver: spawns the OS process, wires every stream, and runs
//! the concurrent completion race down to exactly one [`ExecResult`].

use std::os::unix::process::ExitStatusExt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::collect::{collect_stream, Collected, CollectorSettings};
use crate::command::ProcessCommand;
use crate::error::{ExecError, ALL_FD};
use crate::ipc::{self, IpcChannel, IpcSender};
use crate::lifecycle::{
    spawn_watchers, KillHandle, ResolutionContext, TerminationReason, WatcherConfig,
};
use crate::pipe::{chunk_to_bytes, MergeGroup, Taps};
use crate::result::{ExecResult, FdOutput};
use crate::stdio::{Direction, FdSpec, StdioItem, STDERR_FD, STDIN_FD};
use crate::transform::{Chunk, Pipeline};
use crate::transform::pipeline::ComposeOptions;

const READ_CHUNK: usize = 8192;
const WIRE_CHANNEL_CAPACITY: usize = 16;

/// A spawned invocation: the control surfaces a [`crate::ProcessHandle`]
/// exposes plus the resolver task that will produce the outcome.
pub(crate) struct SpawnedProcess {
    pub pid: Option<u32>,
    pub kill: Arc<KillHandle>,
    pub taps: Arc<Taps>,
    pub stdin_group: Arc<MergeGroup>,
    pub ipc_sender: Option<IpcSender>,
    pub detached: bool,
    pub command_line: String,
    pub escaped_command: String,
    pub outcome: JoinHandle<ExecResult>,
}

/// Resolve stdio, spawn the child, and wire collectors, watchers and the
/// resolver task. Errors here are pre-spawn (`Config`) or `Spawn`.
pub(crate) async fn spawn_process(mut command: ProcessCommand) -> Result<SpawnedProcess, ExecError> {
    let mut specs = crate::stdio::resolve::resolve_stdio(&mut command)?;
    let command_line = command.command_line();
    let escaped_command = command.escaped_command();

    let ipc_spec_fd = specs
        .iter()
        .find(|spec| spec.fd > STDERR_FD && spec.has(|item| matches!(item, StdioItem::Ipc)))
        .map(|spec| spec.fd);
    let ipc_enabled = command.ipc || ipc_spec_fd.is_some();

    // Extra fds carry only the IPC marker, validated by the resolver.
    specs.truncate(3);
    let mut stderr_spec = specs.pop().ok_or_else(missing_spec)?;
    let mut stdout_spec = specs.pop().ok_or_else(missing_spec)?;
    let mut stdin_spec = specs.pop().ok_or_else(missing_spec)?;

    let mut os_command = Command::new(&command.program);
    os_command.args(&command.args);
    if command.env_clear {
        os_command.env_clear();
    }
    os_command.envs(&command.env);
    if let Some(dir) = &command.working_dir {
        os_command.current_dir(dir);
    }
    // Own process group, so kills reach the whole tree. Drop cleanup is
    // handled by the handle, not by tokio.
    os_command.process_group(0);
    os_command.kill_on_drop(false);
    os_command.stdin(stdio_config(&stdin_spec)?);
    os_command.stdout(stdio_config(&stdout_spec)?);
    os_command.stderr(stdio_config(&stderr_spec)?);

    // Every pipeline is composed before the spawn: a bad stage chain is
    // a configuration error and must leave no process behind.
    let stdout_pipeline = output_pipeline(&mut stdout_spec, &command)?;
    let stderr_pipeline = output_pipeline(&mut stderr_spec, &command)?;
    let stdin_pipeline = Pipeline::compose(ComposeOptions {
        fd: STDIN_FD,
        direction: Direction::Input,
        encoding: crate::transform::Encoding::Buffer,
        lines: false,
        object_mode: stdin_spec.object_mode,
        user_stages: stdin_spec.take_stages(),
    })?;

    let ipc_channel = if ipc_enabled {
        let channel = IpcChannel::new()?;
        os_command.env(ipc::IPC_ENV_VAR, channel.env_value());
        Some(channel)
    } else {
        None
    };
    // For error tagging: the configured extra fd, or the real child fd.
    let ipc_fd = ipc_spec_fd.or_else(|| {
        ipc_channel
            .as_ref()
            .map(|c| c.child_write_raw_fd() as u32)
    });

    tracing::debug!(command = %escaped_command, "starting process");
    let start = Instant::now();
    let mut child = os_command.spawn().map_err(|source| ExecError::Spawn {
        command: escaped_command.clone(),
        source,
    })?;
    let pid = child.id();

    let ctx = Arc::new(ResolutionContext::new());
    let done = CancellationToken::new();
    let taps = Arc::new(Taps::new());
    let (error_tx, mut error_rx) = mpsc::unbounded_channel();
    let kill = Arc::new(KillHandle::new(
        pid,
        Arc::clone(&ctx),
        command.kill_signal,
        command.force_kill_after,
        error_tx.clone(),
    ));

    let (ipc_sender, ipc_drain) = match ipc_channel {
        Some(channel) => match channel.into_parent_ends() {
            Ok((sender, receiver)) => {
                let drain = tokio::spawn(ipc::drain_messages(
                    receiver,
                    ipc_fd.unwrap_or(ALL_FD),
                    command.ipc_max_messages,
                    done.clone(),
                ));
                (Some(sender), Some(drain))
            }
            Err(e) => {
                // Wiring failed with the child already running: kill it
                // and reap before surfacing the error.
                kill.force_kill_now();
                let _ = child.wait().await;
                return Err(e);
            }
        },
        None => (None, None),
    };

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // Interleaved stdout+stderr collector.
    let (all_collector, all_tx) = if command.all {
        let (tx, rx) = mpsc::channel(WIRE_CHANNEL_CAPACITY);
        let settings = CollectorSettings {
            fd: ALL_FD,
            encoding: command.encoding,
            lines: command.lines,
            object_mode: false,
            limit: command.max_buffer,
            buffered: true,
            verbose: false,
        };
        (
            Some(tokio::spawn(collect_stream(settings, rx, done.clone()))),
            Some(tx),
        )
    } else {
        (None, None)
    };

    let stdout_collector = wire_output(
        &mut stdout_spec,
        stdout_pipeline,
        child.stdout.take().map(box_reader),
        OutputSettings {
            encoding: command.encoding,
            lines: command.lines,
            limit: command.max_buffer,
            buffered: command.buffer_stdout,
            verbose: command.verbose,
        },
        Arc::clone(&taps),
        all_tx.clone(),
        Arc::clone(&ctx),
        done.clone(),
        &mut tasks,
    );
    let stderr_collector = wire_output(
        &mut stderr_spec,
        stderr_pipeline,
        child.stderr.take().map(box_reader),
        OutputSettings {
            encoding: command.encoding,
            lines: command.lines,
            limit: command.max_buffer,
            buffered: command.buffer_stderr,
            verbose: command.verbose,
        },
        Arc::clone(&taps),
        all_tx,
        Arc::clone(&ctx),
        done.clone(),
        &mut tasks,
    );

    let stdin_group = wire_stdin(
        &mut stdin_spec,
        stdin_pipeline,
        child.stdin.take(),
        Arc::clone(&ctx),
        error_tx.clone(),
        done.clone(),
        &mut tasks,
    )
    .await;

    let watchers = spawn_watchers(
        Arc::clone(&kill),
        Arc::clone(&ctx),
        WatcherConfig {
            timeout: command.timeout,
            cancel: command.cancel.clone(),
            graceful_cancel: command.graceful_cancel,
            ipc: ipc_sender.clone(),
        },
        done.clone(),
    );

    let outcome = {
        let ctx = Arc::clone(&ctx);
        let kill = Arc::clone(&kill);
        let done = done.clone();
        let taps = Arc::clone(&taps);
        let command_line = command_line.clone();
        let escaped = escaped_command.clone();
        let timeout = command.timeout;
        // Keeps the error channel open for the lifetime of the race.
        let _error_tx = error_tx;
        tokio::spawn(async move {
            let mut first_error: Option<ExecError> = None;
            // The race: the real exit status against the first discrete
            // runtime error. An error settles the outcome immediately,
            // without waiting for the process to terminate.
            let status = tokio::select! {
                status = child.wait() => Some(status),
                err = error_rx.recv() => {
                    first_error = err;
                    None
                }
            };

            let mut exit_code = None;
            let mut signal = None;
            match status {
                Some(status) => {
                    // An error delivered in the same instant the process
                    // exited may still be queued.
                    while let Ok(err) = error_rx.try_recv() {
                        if first_error.is_none() {
                            first_error = Some(err);
                        }
                    }
                    ctx.mark_exited();
                    kill.disarm();
                    match status {
                        Ok(status) => {
                            exit_code = status.code();
                            signal = status.signal();
                        }
                        Err(e) => {
                            if first_error.is_none() {
                                first_error = Some(ExecError::Io(e));
                            }
                        }
                    }
                }
                None => {
                    // Error-settled outcome: stop every stream now, make
                    // sure the process goes away, and reap it off to the
                    // side. Its exit status is not part of this result.
                    kill.kill();
                    done.cancel();
                    let ctx = Arc::clone(&ctx);
                    let kill = Arc::clone(&kill);
                    tokio::spawn(async move {
                        let _ = child.wait().await;
                        ctx.mark_exited();
                        kill.disarm();
                    });
                }
            }

            // Exit-settled collectors end at stream EOF, which the exit
            // guarantees; error-settled ones observe the cancellation and
            // return whatever they buffered.
            let stdout = finish_collector(stdout_collector).await;
            let stderr = finish_collector(stderr_collector).await;
            let all = match all_collector {
                Some(handle) => Some(finish_collector(Some(handle)).await),
                None => None,
            };
            let ipc_drained = match ipc_drain {
                Some(handle) => match handle.await {
                    Ok(drained) => Some(drained),
                    Err(_) => None,
                },
                None => None,
            };

            // Everything still pending is cleanup; stop it.
            done.cancel();
            futures::future::join_all(watchers).await;
            futures::future::join_all(tasks).await;
            taps.close_all().await;

            let (ipc_messages, ipc_error) = match ipc_drained {
                Some(drained) => (drained.messages, drained.error),
                None => (Vec::new(), None),
            };

            let result = assemble_result(AssembleInput {
                command_line,
                escaped_command: escaped,
                duration: start.elapsed(),
                exit_code,
                signal,
                stdout,
                stderr,
                all,
                ipc_messages,
                ipc_error,
                first_error,
                timeout,
                ctx: &ctx,
            });
            log_result(&result);
            result
        })
    };

    Ok(SpawnedProcess {
        pid,
        kill,
        taps,
        stdin_group,
        ipc_sender,
        detached: command.detached,
        command_line,
        escaped_command,
        outcome,
    })
}

fn missing_spec() -> ExecError {
    ExecError::Internal("stdio resolution produced no standard fd specs".to_string())
}

fn box_reader(reader: impl AsyncRead + Send + Unpin + 'static) -> Box<dyn AsyncRead + Send + Unpin> {
    Box::new(reader)
}

/// Map a resolved fd spec onto the OS-level stdio configuration.
fn stdio_config(spec: &FdSpec) -> Result<std::process::Stdio, ExecError> {
    match spec.items.as_slice() {
        [StdioItem::Inherit] => Ok(std::process::Stdio::inherit()),
        [StdioItem::Ignore] => Ok(std::process::Stdio::null()),
        items => {
            if spec.direction == Direction::Input
                && items.iter().any(|item| matches!(item, StdioItem::Inherit))
            {
                return Err(ExecError::Config(
                    "inherit cannot be combined with other stdin items".to_string(),
                ));
            }
            Ok(std::process::Stdio::piped())
        }
    }
}

struct OutputSettings {
    encoding: crate::transform::Encoding,
    lines: bool,
    limit: Option<u64>,
    buffered: bool,
    verbose: bool,
}

/// Wire one captured output fd: reader, transform pipeline, fan-out to
/// taps/tees/interleaved collector, and the per-fd collector. The
/// pipeline was composed before the spawn.
#[allow(clippy::too_many_arguments)]
fn wire_output(
    spec: &mut FdSpec,
    pipeline: Pipeline,
    stream: Option<Box<dyn AsyncRead + Send + Unpin>>,
    settings: OutputSettings,
    taps: Arc<Taps>,
    all_tx: Option<mpsc::Sender<Result<Chunk, ExecError>>>,
    ctx: Arc<ResolutionContext>,
    done: CancellationToken,
    tasks: &mut Vec<JoinHandle<()>>,
) -> Option<JoinHandle<Collected>> {
    let Some(mut stream) = stream else {
        // Inherited or discarded fd: nothing to capture.
        return None;
    };
    let fd = spec.fd;

    let mut tees: Vec<Box<dyn AsyncWrite + Send + Unpin>> = Vec::new();
    let mut tee_files = Vec::new();
    for item in spec.items.drain(..) {
        match item {
            StdioItem::Writer(writer) => tees.push(writer),
            StdioItem::File(path) => tee_files.push(path),
            StdioItem::Inherit => tees.push(inherit_writer(fd)),
            _ => {}
        }
    }

    let (raw_tx, raw_rx) = mpsc::channel(WIRE_CHANNEL_CAPACITY);
    {
        let ctx = Arc::clone(&ctx);
        let done = done.clone();
        tasks.push(tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                let read = tokio::select! {
                    // An error-settled outcome stops reading even while
                    // the process is still alive.
                    _ = done.cancelled() => break,
                    read = stream.read(&mut buf) => read,
                };
                match read {
                    Ok(0) => break,
                    Ok(n) => {
                        if raw_tx
                            .send(Ok(Chunk::Bytes(buf[..n].to_vec())))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        // Read failures after exit are cleanup noise.
                        if !ctx.has_exited() {
                            let _ = raw_tx.send(Err(ExecError::Stream { fd, source: e })).await;
                        }
                        break;
                    }
                }
            }
        }));
    }

    let pipeline_output = pipeline.spawn(raw_rx);
    tasks.extend(pipeline_output.tasks);

    let (collector_tx, collector_rx) = mpsc::channel(WIRE_CHANNEL_CAPACITY);
    {
        let mut rx = pipeline_output.rx;
        let lines_mode = settings.lines;
        tasks.push(tokio::spawn(async move {
            for path in tee_files {
                match tokio::fs::File::create(&path).await {
                    Ok(file) => tees.push(Box::new(file)),
                    Err(e) => {
                        let _ = collector_tx
                            .send(Err(ExecError::Stream { fd, source: e }))
                            .await;
                        return;
                    }
                }
            }
            while let Some(item) = rx.recv().await {
                let chunk = match item {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = collector_tx.send(Err(e)).await;
                        break;
                    }
                };
                taps.publish(fd, &chunk).await;
                taps.publish(ALL_FD, &chunk).await;
                if let Some(all_tx) = &all_tx {
                    let _ = all_tx.send(Ok(chunk.clone())).await;
                }
                if !tees.is_empty() {
                    let bytes = tee_bytes(&chunk, lines_mode);
                    for tee in &mut tees {
                        if let Err(e) = tee.write_all(&bytes).await {
                            tracing::warn!(fd, "tee write failed: {e}");
                        }
                    }
                }
                if collector_tx.send(Ok(chunk)).await.is_err() {
                    // Collector hit its cap; stop the whole chain.
                    break;
                }
            }
            for tee in &mut tees {
                let _ = tee.flush().await;
            }
            taps.close(fd).await;
        }));
    }

    let settings = CollectorSettings {
        fd,
        encoding: settings.encoding,
        lines: settings.lines,
        object_mode: spec.object_mode,
        limit: settings.limit,
        buffered: settings.buffered,
        verbose: settings.verbose,
    };
    Some(tokio::spawn(collect_stream(settings, collector_rx, done)))
}

fn output_pipeline(spec: &mut FdSpec, command: &ProcessCommand) -> Result<Pipeline, ExecError> {
    Pipeline::compose(ComposeOptions {
        fd: spec.fd,
        direction: Direction::Output,
        encoding: command.encoding,
        lines: command.lines,
        object_mode: spec.object_mode,
        user_stages: spec.take_stages(),
    })
}

fn inherit_writer(fd: u32) -> Box<dyn AsyncWrite + Send + Unpin> {
    if fd == STDERR_FD {
        Box::new(tokio::io::stderr())
    } else {
        Box::new(tokio::io::stdout())
    }
}

/// Rendering used for file/writer tees. Line mode re-appends the
/// separator the splitter stripped.
pub(crate) fn tee_bytes(chunk: &Chunk, lines_mode: bool) -> Vec<u8> {
    let mut bytes = chunk_to_bytes(chunk.clone());
    if lines_mode && matches!(chunk, Chunk::Text(_)) {
        bytes.push(b'\n');
    }
    bytes
}

/// Wire stdin: static input items and late pipe links merge into one
/// bounded channel; bytes run through the precomposed input pipeline and
/// into the child. Returns the merge group pipe links register on.
async fn wire_stdin(
    spec: &mut FdSpec,
    pipeline: Pipeline,
    stdin: Option<tokio::process::ChildStdin>,
    ctx: Arc<ResolutionContext>,
    error_tx: mpsc::UnboundedSender<ExecError>,
    done: CancellationToken,
    tasks: &mut Vec<JoinHandle<()>>,
) -> Arc<MergeGroup> {
    let (merge_tx, mut merge_rx) = mpsc::channel::<Vec<u8>>(WIRE_CHANNEL_CAPACITY);
    let group = Arc::new(MergeGroup::new(merge_tx));

    let Some(mut stdin) = stdin else {
        // Inherited or discarded stdin takes no sources.
        group.seal().await;
        return group;
    };

    // Static input sources, registered before any pipe link can attach.
    for item in spec.items.drain(..) {
        match item {
            StdioItem::Literal(data) => {
                if let Some(tx) = group.register().await {
                    tasks.push(tokio::spawn(async move {
                        let _ = tx.send(data).await;
                    }));
                }
            }
            StdioItem::File(path) => {
                if let Some(tx) = group.register().await {
                    let error_tx = error_tx.clone();
                    tasks.push(tokio::spawn(async move {
                        match tokio::fs::File::open(&path).await {
                            Ok(file) => feed_reader(Box::new(file), tx, error_tx).await,
                            Err(e) => {
                                let _ = error_tx.send(ExecError::Stream {
                                    fd: STDIN_FD,
                                    source: e,
                                });
                            }
                        }
                    }));
                }
            }
            StdioItem::Reader(reader) => {
                if let Some(tx) = group.register().await {
                    let error_tx = error_tx.clone();
                    tasks.push(tokio::spawn(async move {
                        feed_reader(reader, tx, error_tx).await;
                    }));
                }
            }
            _ => {}
        }
    }

    let (pipeline_tx, pipeline_rx) = mpsc::channel(WIRE_CHANNEL_CAPACITY);
    tasks.push(tokio::spawn(async move {
        while let Some(bytes) = merge_rx.recv().await {
            if pipeline_tx.send(Ok(Chunk::Bytes(bytes))).await.is_err() {
                break;
            }
        }
    }));
    let pipeline_output = pipeline.spawn(pipeline_rx);
    tasks.extend(pipeline_output.tasks);

    {
        let mut rx = pipeline_output.rx;
        tasks.push(tokio::spawn(async move {
            let mut epipe_seen = false;
            loop {
                let item = tokio::select! {
                    _ = done.cancelled() => break,
                    item = rx.recv() => item,
                };
                let Some(item) = item else { break };
                let chunk = match item {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = error_tx.send(e);
                        break;
                    }
                };
                let bytes = chunk_to_bytes(chunk);
                if bytes.is_empty() {
                    continue;
                }
                if let Err(e) = stdin.write_all(&bytes).await {
                    // Closure driven by the process's own exit is routine.
                    if ctx.has_exited() {
                        break;
                    }
                    if e.kind() == std::io::ErrorKind::BrokenPipe && !epipe_seen {
                        epipe_seen = true;
                        continue;
                    }
                    let _ = error_tx.send(ExecError::Stream {
                        fd: STDIN_FD,
                        source: e,
                    });
                    break;
                }
            }
            let _ = stdin.shutdown().await;
        }));
    }

    group
}

async fn feed_reader(
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    tx: mpsc::Sender<Vec<u8>>,
    error_tx: mpsc::UnboundedSender<ExecError>,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = error_tx.send(ExecError::Stream {
                    fd: STDIN_FD,
                    source: e,
                });
                break;
            }
        }
    }
}

async fn finish_collector(handle: Option<JoinHandle<Collected>>) -> Collected {
    match handle {
        Some(handle) => match handle.await {
            Ok(collected) => collected,
            Err(_) => Collected {
                output: FdOutput::None,
                error: Some(ExecError::Internal("collector task panicked".to_string())),
            },
        },
        None => Collected {
            output: FdOutput::None,
            error: None,
        },
    }
}

pub(crate) struct AssembleInput<'a> {
    pub command_line: String,
    pub escaped_command: String,
    pub duration: Duration,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: Collected,
    pub stderr: Collected,
    pub all: Option<Collected>,
    pub ipc_messages: Vec<serde_json::Value>,
    pub ipc_error: Option<ExecError>,
    pub first_error: Option<ExecError>,
    pub timeout: Option<Duration>,
    pub ctx: &'a ResolutionContext,
}

/// Build the single outcome. Cause precedence: termination reason, then
/// the first discrete runtime error, then collector caps, then the plain
/// exit status.
pub(crate) fn assemble_result(input: AssembleInput<'_>) -> ExecResult {
    let AssembleInput {
        command_line,
        escaped_command,
        duration,
        exit_code,
        signal,
        stdout,
        stderr,
        all,
        ipc_messages,
        ipc_error,
        first_error,
        timeout,
        ctx,
    } = input;

    let (all_output, all_error) = match all {
        Some(collected) => (Some(collected.output), collected.error),
        None => (None, None),
    };

    let cause = match ctx.termination_reason() {
        Some(TerminationReason::Timeout) => {
            Some(ExecError::Timeout(timeout.unwrap_or_default()))
        }
        Some(TerminationReason::GracefulCancel) => Some(ExecError::GracefulCanceled),
        Some(TerminationReason::Cancel) => Some(ExecError::Canceled),
        _ => None,
    }
    .or(first_error)
    .or(stdout.error)
    .or(stderr.error)
    .or(all_error)
    .or(ipc_error);

    let failed = cause.is_some() || signal.is_some() || exit_code != Some(0);

    ExecResult {
        command: command_line,
        escaped_command,
        duration,
        exit_code,
        signal,
        stdout: stdout.output,
        stderr: stderr.output,
        all: all_output,
        ipc_messages,
        failed,
        timed_out: ctx.timed_out(),
        is_canceled: ctx.is_canceled(),
        is_gracefully_canceled: ctx.is_gracefully_canceled(),
        is_terminated: signal.is_some(),
        is_forcefully_terminated: ctx.is_forcefully_terminated(),
        cause: cause.map(Box::new),
        pipe_sources: Vec::new(),
    }
}

pub(crate) fn log_result(result: &ExecResult) {
    if result.failed {
        tracing::warn!(
            command = %result.escaped_command,
            duration_ms = result.duration.as_millis() as u64,
            "{}",
            result.failure_summary()
        );
    } else {
        tracing::debug!(
            command = %result.escaped_command,
            duration_ms = result.duration.as_millis() as u64,
            "process completed"
        );
    }
}
