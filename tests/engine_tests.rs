//! End-to-end tests for the asynchronous execution engine.

use std::io::Cursor;
use std::time::{Duration, Instant};

use procflow::{
    run, spawn, BufferUnit, Chunk, Encoding, ExecError, FdOutput, ProcessCommandBuilder, Stage,
    StdioItem, Transform,
};
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn captures_stdout_as_text() {
    init_tracing();
    let result = run(ProcessCommandBuilder::new("echo").arg("hello").build())
        .await
        .unwrap();
    assert!(result.success());
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.stdout.as_text(), Some("hello\n"));
    assert_eq!(result.stderr.as_text(), Some(""));
}

#[tokio::test]
async fn captures_stderr_separately() {
    let result = run(
        ProcessCommandBuilder::new("sh")
            .args(["-c", "echo out; echo err >&2"])
            .build(),
    )
    .await
    .unwrap();
    assert_eq!(result.stdout.as_text(), Some("out\n"));
    assert_eq!(result.stderr.as_text(), Some("err\n"));
}

#[tokio::test]
async fn nonzero_exit_becomes_command_failed() {
    let err = run(ProcessCommandBuilder::new("false").build())
        .await
        .unwrap_err();
    match err {
        ExecError::CommandFailed(result) => {
            assert!(result.failed);
            assert_eq!(result.exit_code, Some(1));
            assert!(result.cause.is_none());
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn join_lenient_returns_failures_as_values() {
    let handle = spawn(ProcessCommandBuilder::new("false").build())
        .await
        .unwrap();
    let result = handle.join_lenient().await;
    assert!(result.failed);
    assert_eq!(result.exit_code, Some(1));
}

#[tokio::test]
async fn missing_program_is_a_spawn_error() {
    let err = run(ProcessCommandBuilder::new("definitely-not-a-command-zzz").build())
        .await
        .unwrap_err();
    assert!(err.is_pre_spawn());
    assert!(matches!(err, ExecError::Spawn { .. }));
}

#[tokio::test]
async fn lines_mode_splits_and_strips() {
    let result = run(
        ProcessCommandBuilder::new("printf")
            .arg("one\\ntwo\\nthree\\n")
            .lines()
            .build(),
    )
    .await
    .unwrap();
    assert_eq!(
        result.stdout.as_lines(),
        Some(
            [
                "one".to_string(),
                "two".to_string(),
                "three".to_string()
            ]
            .as_slice()
        )
    );
}

#[tokio::test]
async fn buffer_encoding_returns_raw_bytes() {
    let result = run(
        ProcessCommandBuilder::new("printf")
            .arg("ab")
            .encoding(Encoding::Buffer)
            .build(),
    )
    .await
    .unwrap();
    assert_eq!(result.stdout.as_bytes(), Some(b"ab".as_slice()));
}

#[tokio::test]
async fn base64_encoding_is_concat_safe() {
    let result = run(
        ProcessCommandBuilder::new("printf")
            .arg("hi")
            .encoding(Encoding::Base64)
            .build(),
    )
    .await
    .unwrap();
    assert_eq!(result.stdout.as_text(), Some("aGk="));
}

#[tokio::test]
async fn literal_input_feeds_stdin() {
    let result = run(ProcessCommandBuilder::new("cat").input("ping\n").build())
        .await
        .unwrap();
    assert_eq!(result.stdout.as_text(), Some("ping\n"));
}

#[tokio::test]
async fn input_file_feeds_stdin() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("input.txt");
    std::fs::write(&path, "from a file\n").unwrap();
    let result = run(
        ProcessCommandBuilder::new("cat")
            .input_file(&path)
            .build(),
    )
    .await
    .unwrap();
    assert_eq!(result.stdout.as_text(), Some("from a file\n"));
}

#[tokio::test]
async fn reader_item_feeds_stdin() {
    let reader = Cursor::new(b"streamed input".to_vec());
    let result = run(
        ProcessCommandBuilder::new("cat")
            .stdin_items(vec![StdioItem::Pipe, StdioItem::Reader(Box::new(reader))])
            .build(),
    )
    .await
    .unwrap();
    assert_eq!(result.stdout.as_text(), Some("streamed input"));
}

#[tokio::test]
async fn file_item_tees_stdout() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tee.log");
    let result = run(
        ProcessCommandBuilder::new("echo")
            .arg("teed")
            .stdout_items(vec![StdioItem::Pipe, StdioItem::File(path.clone())])
            .build(),
    )
    .await
    .unwrap();
    assert_eq!(result.stdout.as_text(), Some("teed\n"));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "teed\n");
}

#[tokio::test]
async fn writer_item_receives_stdout() {
    let (client, mut server) = tokio::io::duplex(4096);
    let result = run(
        ProcessCommandBuilder::new("echo")
            .arg("to a writer")
            .stdout_items(vec![StdioItem::Pipe, StdioItem::Writer(Box::new(client))])
            .build(),
    )
    .await
    .unwrap();
    assert!(result.success());
    let mut received = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut server, &mut received)
        .await
        .unwrap();
    assert_eq!(received, b"to a writer\n");
}

#[tokio::test]
async fn all_option_interleaves_both_streams() {
    let result = run(
        ProcessCommandBuilder::new("sh")
            .args(["-c", "echo out; echo err >&2"])
            .all()
            .build(),
    )
    .await
    .unwrap();
    let all = result.all.as_ref().and_then(FdOutput::as_text).unwrap();
    assert!(all.contains("out\n"));
    assert!(all.contains("err\n"));
}

#[tokio::test]
async fn no_buffer_still_awaits_completion() {
    let result = run(
        ProcessCommandBuilder::new("echo")
            .arg("discarded")
            .no_buffer_stdout()
            .build(),
    )
    .await
    .unwrap();
    assert!(result.success());
    assert!(result.stdout.is_none());
}

#[tokio::test]
async fn max_buffer_truncates_and_tags_unit() {
    let err = run(
        ProcessCommandBuilder::new("printf")
            .arg("abcdefgh")
            .max_buffer(3)
            .build(),
    )
    .await
    .unwrap_err();
    match err {
        ExecError::CommandFailed(result) => {
            assert_eq!(result.stdout.as_text(), Some("abc"));
            assert!(matches!(
                result.cause.as_deref(),
                Some(ExecError::CappedOutput {
                    fd: 1,
                    unit: BufferUnit::Characters
                })
            ));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn max_buffer_counts_lines_in_line_mode() {
    let err = run(
        ProcessCommandBuilder::new("printf")
            .arg("1\\n2\\n3\\n4\\n")
            .lines()
            .max_buffer(2)
            .build(),
    )
    .await
    .unwrap_err();
    match err {
        ExecError::CommandFailed(result) => {
            assert_eq!(
                result.stdout.as_lines(),
                Some(["1".to_string(), "2".to_string()].as_slice())
            );
            assert!(matches!(
                result.cause.as_deref(),
                Some(ExecError::CappedOutput {
                    fd: 1,
                    unit: BufferUnit::Lines
                })
            ));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn timeout_kills_the_process() {
    let start = Instant::now();
    let err = run(
        ProcessCommandBuilder::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(150))
            .build(),
    )
    .await
    .unwrap_err();
    assert!(start.elapsed() < Duration::from_secs(4));
    match err {
        ExecError::CommandFailed(result) => {
            assert!(result.timed_out);
            assert!(result.is_terminated);
            assert!(matches!(
                result.cause.as_deref(),
                Some(ExecError::Timeout(_))
            ));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn sigterm_ignoring_process_is_force_killed() {
    init_tracing();
    let start = Instant::now();
    let err = run(
        ProcessCommandBuilder::new("bash")
            .args(["-c", "trap '' TERM; while :; do sleep 0.05; done"])
            .timeout(Duration::from_millis(200))
            .force_kill_after(Some(Duration::from_millis(300)))
            .build(),
    )
    .await
    .unwrap_err();
    assert!(start.elapsed() < Duration::from_secs(5));
    match err {
        ExecError::CommandFailed(result) => {
            assert!(result.timed_out);
            assert!(result.is_forcefully_terminated);
            assert_eq!(result.signal, Some(libc::SIGKILL));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn cancellation_token_stops_the_process() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });
    let err = run(
        ProcessCommandBuilder::new("sleep")
            .arg("5")
            .cancel(cancel)
            .build(),
    )
    .await
    .unwrap_err();
    match err {
        ExecError::CommandFailed(result) => {
            assert!(result.is_canceled);
            assert!(!result.is_gracefully_canceled);
            assert!(result.failed);
            assert!(matches!(result.cause.as_deref(), Some(ExecError::Canceled)));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn cancel_teardown_leaves_no_pending_timers() {
    // A long timeout stays armed alongside the cancellation watcher; the
    // join must not wait for it.
    let cancel = CancellationToken::new();
    let handle = spawn(
        ProcessCommandBuilder::new("sleep")
            .arg("30")
            .timeout(Duration::from_secs(60))
            .cancel(cancel.clone())
            .build(),
    )
    .await
    .unwrap();
    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(3), handle.join_lenient())
        .await
        .expect("join should return promptly after cancellation");
    assert!(result.is_canceled);
    assert!(!result.is_forcefully_terminated);
}

#[tokio::test]
async fn recorded_error_settles_the_outcome_immediately() {
    init_tracing();
    // The loop respawns its sleep, so the group TERM never ends it.
    let handle = spawn(
        ProcessCommandBuilder::new("bash")
            .args(["-c", "trap '' TERM; while :; do sleep 0.2; done"])
            .force_kill_after(None)
            .build(),
    )
    .await
    .unwrap();
    let pid = handle.pid().unwrap() as i32;
    handle.kill_with_error(ExecError::Internal("stream gave up".to_string()));
    let result = tokio::time::timeout(Duration::from_secs(2), handle.join_lenient())
        .await
        .expect("outcome should settle while the process is still alive");
    assert!(result.failed);
    assert_eq!(result.exit_code, None);
    assert!(matches!(
        result.cause.as_deref(),
        Some(ExecError::Internal(_))
    ));
    unsafe { libc::kill(-pid, libc::SIGKILL) };
}

#[tokio::test]
async fn env_and_working_dir_apply() {
    let dir = tempfile::tempdir().unwrap();
    let canonical = dir.path().canonicalize().unwrap();
    let result = run(
        ProcessCommandBuilder::new("/bin/sh")
            .args(["-c", "echo \"$GREETING\"; pwd"])
            .env("GREETING", "hey")
            .current_dir(&canonical)
            .lines()
            .build(),
    )
    .await
    .unwrap();
    let lines = result.stdout.as_lines().unwrap();
    assert_eq!(lines[0], "hey");
    assert_eq!(lines[1], canonical.display().to_string());
}

#[tokio::test]
async fn dropped_handle_kills_non_detached_process() {
    let handle = spawn(ProcessCommandBuilder::new("sleep").arg("30").build())
        .await
        .unwrap();
    let pid = handle.pid().unwrap() as i32;
    drop(handle);
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        // ESRCH once the resolver has reaped the killed process.
        if unsafe { libc::kill(pid, 0) } != 0 {
            break;
        }
        assert!(Instant::now() < deadline, "process {pid} still alive");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn detached_process_survives_its_handle() {
    let handle = spawn(
        ProcessCommandBuilder::new("sleep")
            .arg("30")
            .detached()
            .build(),
    )
    .await
    .unwrap();
    let pid = handle.pid().unwrap() as i32;
    drop(handle);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(unsafe { libc::kill(pid, 0) }, 0, "process should be alive");
    unsafe { libc::kill(pid, libc::SIGKILL) };
}

struct Upper;

impl Transform for Upper {
    fn transform(&mut self, chunk: Chunk) -> Result<Vec<Chunk>, ExecError> {
        Ok(match chunk {
            Chunk::Text(s) => vec![Chunk::Text(s.to_uppercase())],
            other => vec![other],
        })
    }
}

#[tokio::test]
async fn user_stage_transforms_stdout() {
    let result = run(
        ProcessCommandBuilder::new("printf")
            .arg("hello\\nworld\\n")
            .stdout_transform(Stage::sync(Upper))
            .build(),
    )
    .await
    .unwrap();
    assert_eq!(result.stdout.as_text(), Some("HELLO\nWORLD\n"));
}

struct JsonLines;

impl Transform for JsonLines {
    fn transform(&mut self, chunk: Chunk) -> Result<Vec<Chunk>, ExecError> {
        match chunk {
            Chunk::Text(line) => Ok(vec![Chunk::Value(serde_json::from_str(&line)?)]),
            other => Ok(vec![other]),
        }
    }

    fn readable_object_mode(&self) -> bool {
        true
    }
}

#[tokio::test]
async fn object_mode_stage_yields_values() {
    let result = run(
        ProcessCommandBuilder::new("printf")
            .arg("{\"n\":1}\\n{\"n\":2}\\n")
            .stdout_transform(Stage::sync(JsonLines))
            .build(),
    )
    .await
    .unwrap();
    let values = result.stdout.as_values().unwrap();
    assert_eq!(values.len(), 2);
    assert_eq!(values[0]["n"], 1);
    assert_eq!(values[1]["n"], 2);
}

struct NeedsObjects;

impl Transform for NeedsObjects {
    fn transform(&mut self, chunk: Chunk) -> Result<Vec<Chunk>, ExecError> {
        Ok(vec![chunk])
    }

    fn writable_object_mode(&self) -> bool {
        true
    }

    fn readable_object_mode(&self) -> bool {
        true
    }
}

#[tokio::test]
async fn stage_config_error_does_not_start_the_process() {
    // An object-mode stage with no producer fails composition; the
    // command itself must never run.
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("started");
    let err = run(
        ProcessCommandBuilder::new("sh")
            .args(["-c", &format!("sleep 0.3; touch {}", marker.display())])
            .stdout_transform(Stage::sync(NeedsObjects))
            .build(),
    )
    .await
    .unwrap_err();
    assert!(err.is_pre_spawn());
    assert!(matches!(err, ExecError::Config(_)));
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(!marker.exists(), "process ran despite the config error");
}

#[test]
fn run_works_from_a_blocking_context() {
    let result = tokio_test::block_on(run(
        ProcessCommandBuilder::new("echo").arg("blocking").build(),
    ))
    .unwrap();
    assert_eq!(result.stdout.as_text(), Some("blocking\n"));
}
