//! Process lifecycle controller: kill escalation, timeout, cancellation
//! and graceful cancellation.
//!
//! No other component sends signals to the OS process directly; every
//! termination goes through [`KillHandle`], which composes the raw kill
//! with the force-escalation policy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::ExecError;
use crate::ipc::{abort_message, IpcSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    Timeout,
    Cancel,
    GracefulCancel,
}

/// Mutable flags shared by the result resolver and the lifecycle
/// controller for one invocation. The termination reason is set at most
/// once; the first writer wins.
#[derive(Debug, Default)]
pub struct ResolutionContext {
    exited: AtomicBool,
    killed: AtomicBool,
    forcefully_terminated: AtomicBool,
    reason: OnceLock<TerminationReason>,
}

impl ResolutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set synchronously as soon as the exit status is observed, before
    /// any cleanup-driven stream closure. A stream closure observed after
    /// this flag is routine cleanup, not a user abort.
    pub fn mark_exited(&self) {
        self.exited.store(true, Ordering::SeqCst);
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    pub fn mark_killed(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn mark_forcefully_terminated(&self) {
        self.forcefully_terminated.store(true, Ordering::SeqCst);
    }

    pub fn is_forcefully_terminated(&self) -> bool {
        self.forcefully_terminated.load(Ordering::SeqCst)
    }

    /// First writer wins; returns whether this call set the reason.
    pub fn set_termination_reason(&self, reason: TerminationReason) -> bool {
        self.reason.set(reason).is_ok()
    }

    pub fn termination_reason(&self) -> Option<TerminationReason> {
        self.reason.get().copied()
    }

    pub fn timed_out(&self) -> bool {
        self.termination_reason() == Some(TerminationReason::Timeout)
    }

    pub fn is_canceled(&self) -> bool {
        matches!(
            self.termination_reason(),
            Some(TerminationReason::Cancel) | Some(TerminationReason::GracefulCancel)
        )
    }

    pub fn is_gracefully_canceled(&self) -> bool {
        self.termination_reason() == Some(TerminationReason::GracefulCancel)
    }
}

/// Wrapper around the raw OS kill: sends the requested (or default)
/// signal and, when that signal is the configured default, arms a
/// force-kill timer that escalates to SIGKILL once.
pub struct KillHandle {
    pid: Option<i32>,
    ctx: std::sync::Arc<ResolutionContext>,
    default_signal: Signal,
    force_kill_after: Option<Duration>,
    error_tx: mpsc::UnboundedSender<ExecError>,
    force_timer: Mutex<Option<JoinHandle<()>>>,
}

impl KillHandle {
    pub(crate) fn new(
        pid: Option<u32>,
        ctx: std::sync::Arc<ResolutionContext>,
        default_signal: Signal,
        force_kill_after: Option<Duration>,
        error_tx: mpsc::UnboundedSender<ExecError>,
    ) -> Self {
        KillHandle {
            pid: pid.map(|p| p as i32),
            ctx,
            default_signal,
            force_kill_after,
            error_tx,
            force_timer: Mutex::new(None),
        }
    }

    /// Kill with the configured default signal and arm escalation.
    pub fn kill(&self) {
        self.kill_with_signal(self.default_signal);
    }

    /// Kill with an explicit signal. Escalation is armed only when the
    /// signal equals the configured default kill signal.
    pub fn kill_with_signal(&self, signal: Signal) {
        if self.ctx.has_exited() {
            return;
        }
        self.ctx.mark_killed();
        self.send_signal(signal);
        if signal == self.default_signal {
            self.arm_force_kill();
        }
    }

    /// Fail the eventual outcome with `error` without waiting for the
    /// process to actually terminate, then kill it.
    pub fn kill_with_error(&self, error: ExecError) {
        let _ = self.error_tx.send(error);
        self.kill();
    }

    /// Arm the SIGKILL escalation timer. Armed at most once.
    pub(crate) fn arm_force_kill(&self) {
        let Some(delay) = self.force_kill_after else {
            return;
        };
        let mut guard = match self.force_timer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.is_some() {
            return;
        }
        let ctx = std::sync::Arc::clone(&self.ctx);
        let pid = self.pid;
        *guard = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !ctx.has_exited() {
                ctx.mark_forcefully_terminated();
                tracing::warn!("process did not exit after {delay:?}, sending SIGKILL");
                send_group_signal(pid, Signal::SIGKILL);
            }
        }));
    }

    /// Abort the escalation timer once the exit status is in.
    pub(crate) fn disarm(&self) {
        let mut guard = match self.force_timer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(timer) = guard.take() {
            timer.abort();
        }
    }

    /// Immediate SIGKILL, used by drop cleanup of non-detached handles.
    pub(crate) fn force_kill_now(&self) {
        if self.ctx.has_exited() {
            return;
        }
        self.ctx.mark_killed();
        send_group_signal(self.pid, Signal::SIGKILL);
    }

    fn send_signal(&self, signal: Signal) {
        send_group_signal(self.pid, signal);
    }
}

/// Signal the whole process group; the child is spawned as a group
/// leader. ESRCH just means it already exited.
pub(crate) fn send_group_signal(pid: Option<i32>, sig: Signal) {
    let Some(pid) = pid else { return };
    if let Err(errno) = signal::kill(Pid::from_raw(-pid), sig) {
        tracing::debug!("kill({pid}, {sig}) failed: {errno}");
    }
}

/// Lifecycle watcher configuration for one invocation.
pub(crate) struct WatcherConfig {
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
    pub graceful_cancel: bool,
    pub ipc: Option<IpcSender>,
}

/// Spawn the timeout and cancellation watchers. All watchers observe the
/// invocation-wide `done` token and stop without acting once it fires.
pub(crate) fn spawn_watchers(
    kill: std::sync::Arc<KillHandle>,
    ctx: std::sync::Arc<ResolutionContext>,
    config: WatcherConfig,
    done: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut watchers = Vec::new();

    if let Some(timeout) = config.timeout {
        let kill = std::sync::Arc::clone(&kill);
        let ctx = std::sync::Arc::clone(&ctx);
        let done = done.clone();
        watchers.push(tokio::spawn(async move {
            tokio::select! {
                _ = done.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if ctx.set_termination_reason(TerminationReason::Timeout) {
                        tracing::warn!("process timed out after {timeout:?}");
                        kill.kill();
                    }
                }
            }
        }));
    }

    if let Some(cancel) = config.cancel {
        let graceful = config.graceful_cancel;
        let ipc = config.ipc;
        watchers.push(tokio::spawn(async move {
            tokio::select! {
                _ = done.cancelled() => {}
                _ = cancel.cancelled() => {
                    if let Err(e) = handle_cancel(&kill, &ctx, graceful, ipc).await {
                        tracing::warn!("graceful cancel fell back to kill: {e}");
                        kill.kill();
                    }
                }
            }
        }));
    }

    watchers
}

async fn handle_cancel(
    kill: &KillHandle,
    ctx: &ResolutionContext,
    graceful: bool,
    ipc: Option<IpcSender>,
) -> anyhow::Result<()> {
    if graceful {
        if let Some(ipc) = ipc {
            if ctx.set_termination_reason(TerminationReason::GracefulCancel) {
                tracing::debug!("requesting graceful termination over ipc");
                ipc.send(&abort_message()).await?;
                kill.arm_force_kill();
            }
            return Ok(());
        }
    }
    if ctx.set_termination_reason(TerminationReason::Cancel) {
        tracing::debug!("cancellation requested, killing process");
        kill.kill();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn termination_reason_first_writer_wins() {
        let ctx = ResolutionContext::new();
        assert!(ctx.set_termination_reason(TerminationReason::Timeout));
        assert!(!ctx.set_termination_reason(TerminationReason::Cancel));
        assert_eq!(ctx.termination_reason(), Some(TerminationReason::Timeout));
        assert!(ctx.timed_out());
        assert!(!ctx.is_canceled());
    }

    #[test]
    fn graceful_cancel_counts_as_canceled() {
        let ctx = ResolutionContext::new();
        ctx.set_termination_reason(TerminationReason::GracefulCancel);
        assert!(ctx.is_canceled());
        assert!(ctx.is_gracefully_canceled());
        assert!(!ctx.timed_out());
    }

    #[tokio::test]
    async fn kill_after_exit_is_a_no_op() {
        let ctx = std::sync::Arc::new(ResolutionContext::new());
        ctx.mark_exited();
        let (tx, _rx) = mpsc::unbounded_channel();
        let kill = KillHandle::new(None, std::sync::Arc::clone(&ctx), Signal::SIGTERM, None, tx);
        kill.kill();
        assert!(!ctx.was_killed());
    }

    #[tokio::test]
    async fn kill_with_error_delivers_error_first() {
        let ctx = std::sync::Arc::new(ResolutionContext::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let kill = KillHandle::new(None, ctx, Signal::SIGTERM, None, tx);
        kill.kill_with_error(ExecError::Internal("boom".to_string()));
        let err = rx.recv().await.expect("error delivered");
        assert!(matches!(err, ExecError::Internal(_)));
    }

    #[tokio::test]
    async fn force_timer_is_armed_once_and_disarmable() {
        let ctx = std::sync::Arc::new(ResolutionContext::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let kill = KillHandle::new(
            None,
            std::sync::Arc::clone(&ctx),
            Signal::SIGTERM,
            Some(Duration::from_secs(60)),
            tx,
        );
        kill.arm_force_kill();
        kill.arm_force_kill();
        kill.disarm();
        assert!(!ctx.is_forcefully_terminated());
    }
}
