//! Asynchronous child-process execution with streamed output and bounded
//! cancellation.
//!
//! [`ExecutionEngine`] runs one external program at a time. `execute` spawns
//! the child and hands it to a dedicated tokio worker task; the caller never
//! blocks on child I/O. Stdout is streamed line-by-line to `output`
//! callbacks as it is produced, stderr is drained after stdout (reading them
//! out of order can deadlock a full pipe), and a single `finished` callback
//! reports the exit code.
//!
//! All callbacks fire on the worker task, not on the caller's thread. A
//! caller that needs UI-thread delivery must marshal explicitly, e.g. by
//! forwarding into a channel its event loop drains; the engine never
//! marshals implicitly.
//!
//! `stop` requests graceful termination (SIGTERM on unix) and escalates to a
//! forceful kill after a bounded grace period, so cancellation always
//! completes within a known upper bound.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Default bound on graceful termination before the forced kill.
pub const DEFAULT_GRACE_TIMEOUT: Duration = Duration::from_secs(5);

/// Execution lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    Idle,
    Running,
    Terminating,
}

/// Typed error for execution requests. Spawn-stage failures also surface
/// through the `error` callback, so callers have one place to observe all
/// child-process failures.
#[derive(Debug, Error)]
pub enum ExecError {
    /// An execution is already in progress; concurrent requests are
    /// rejected, never queued.
    #[error("an execution is already in progress")]
    Busy,

    /// The target path does not exist.
    #[error("execution target not found: {0}")]
    TargetNotFound(PathBuf),

    /// The child process could not be started. Distinct from a successful
    /// spawn that exits non-zero, which is reported via `finished`.
    #[error("failed to spawn {target}: {source}")]
    Spawn {
        target: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

type OutputFn = Arc<dyn Fn(&str) + Send + Sync>;
type FinishedFn = Arc<dyn Fn(i32) + Send + Sync>;

#[derive(Default, Clone)]
struct CallbackSet {
    output: Vec<OutputFn>,
    error: Vec<OutputFn>,
    finished: Vec<FinishedFn>,
}

/// What to run: target program, arguments, optional working directory
/// (defaults to the target's containing directory).
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    target: PathBuf,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl ExecutionRequest {
    pub fn new(target: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn target(&self) -> &Path {
        &self.target
    }
}

/// Single-flight external-process executor. Thread-safe; all methods take
/// `&self`.
pub struct ExecutionEngine {
    state_tx: watch::Sender<ExecState>,
    pid: Arc<Mutex<Option<u32>>>,
    callbacks: Mutex<CallbackSet>,
    grace: Duration,
}

impl ExecutionEngine {
    pub fn new() -> Self {
        Self::with_grace(DEFAULT_GRACE_TIMEOUT)
    }

    /// Create an engine with a custom graceful-termination bound.
    pub fn with_grace(grace: Duration) -> Self {
        let (state_tx, _) = watch::channel(ExecState::Idle);
        Self {
            state_tx,
            pid: Arc::new(Mutex::new(None)),
            callbacks: Mutex::new(CallbackSet::default()),
            grace,
        }
    }

    /// Register a callback for streamed stdout chunks. Additive; callbacks
    /// run in registration order on the worker task.
    pub fn on_output(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().output.push(Arc::new(callback));
    }

    /// Register a callback for stderr output and spawn-stage failures.
    pub fn on_error(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().error.push(Arc::new(callback));
    }

    /// Register a callback for process completion. Fires exactly once per
    /// execution, after all output and error callbacks; the engine is
    /// already idle when it runs, so a new `execute` may be issued from
    /// inside it.
    pub fn on_finished(&self, callback: impl Fn(i32) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().finished.push(Arc::new(callback));
    }

    /// Start executing `request` on a dedicated worker task.
    ///
    /// Returns `ExecError::Busy` without side effects while an execution is
    /// in flight; the busy check precedes all other validation. A target
    /// that cannot be resolved or spawned is reported both as the returned
    /// error and through the `error` callbacks, and the engine is left idle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn execute(&self, request: ExecutionRequest) -> Result<(), ExecError> {
        let callbacks = self.callbacks.lock().unwrap().clone();

        // Busy wins over everything else: while a run is in flight no other
        // checks fire and no callbacks are invoked for the rejected request.
        let started = self.state_tx.send_if_modified(|state| {
            if *state == ExecState::Idle {
                *state = ExecState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(ExecError::Busy);
        }

        if !request.target.exists() {
            self.state_tx.send_replace(ExecState::Idle);
            let err = ExecError::TargetNotFound(request.target.clone());
            report_error(&callbacks, &err.to_string());
            return Err(err);
        }

        let working_dir = request
            .working_dir
            .clone()
            .or_else(|| request.target.parent().map(Path::to_path_buf));

        let mut cmd = Command::new(&request.target);
        cmd.args(&request.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &working_dir {
            cmd.current_dir(dir);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                self.state_tx.send_replace(ExecState::Idle);
                let err = ExecError::Spawn {
                    target: request.target.clone(),
                    source,
                };
                report_error(&callbacks, &err.to_string());
                return Err(err);
            }
        };

        *self.pid.lock().unwrap() = child.id();
        info!(
            target = %request.target.display(),
            pid = child.id(),
            "execution started"
        );

        let state_tx = self.state_tx.clone();
        let pid = self.pid.clone();
        tokio::spawn(async move {
            let stdout = child.stdout.take();
            let stderr = child.stderr.take();

            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            let chunk = format!("{line}\n");
                            for cb in &callbacks.output {
                                cb(&chunk);
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "error reading child stdout");
                            break;
                        }
                    }
                }
            }

            // Stderr is drained only after stdout hits EOF; reading the
            // pipes in the other order can deadlock when both fill up.
            if let Some(mut stderr) = stderr {
                let mut buf = String::new();
                if let Err(e) = stderr.read_to_string(&mut buf).await {
                    warn!(error = %e, "error reading child stderr");
                }
                if !buf.is_empty() {
                    for cb in &callbacks.error {
                        cb(&buf);
                    }
                }
            }

            let code = match child.wait().await {
                Ok(status) => exit_code(status),
                Err(e) => {
                    warn!(error = %e, "failed to reap child process");
                    -1
                }
            };

            *pid.lock().unwrap() = None;
            // Idle before `finished`: an execute() issued once the callback
            // has fired (including from inside it) must never see Busy.
            state_tx.send_replace(ExecState::Idle);
            debug!(code, "execution finished");
            for cb in &callbacks.finished {
                cb(code);
            }
        });

        Ok(())
    }

    /// Request termination of the running child.
    ///
    /// No-op when idle. Otherwise sends a graceful stop signal, waits up to
    /// the configured grace period for the child to exit, then escalates to
    /// a forceful kill. Either path ends with the worker's single `finished`
    /// callback.
    pub async fn stop(&self) {
        if *self.state_tx.borrow() == ExecState::Idle {
            return;
        }

        let newly_terminating = self.state_tx.send_if_modified(|state| {
            if *state == ExecState::Running {
                *state = ExecState::Terminating;
                true
            } else {
                false
            }
        });
        let pid = *self.pid.lock().unwrap();

        if newly_terminating {
            if let Some(pid) = pid {
                info!(pid, "requesting graceful termination");
                terminate_gracefully(pid);
            }
        }

        let mut rx = self.state_tx.subscribe();
        let graceful = tokio::time::timeout(self.grace, rx.wait_for(|s| *s == ExecState::Idle));
        if graceful.await.is_ok() {
            return;
        }

        // Re-read the pid: the worker clears it once the child is reaped, so
        // a child that exited right at the deadline is not force-killed (and
        // a recycled pid is not signalled).
        let pid = *self.pid.lock().unwrap();
        if let Some(pid) = pid {
            warn!(
                pid,
                grace_secs = self.grace.as_secs_f64(),
                "child did not exit within grace period; forcing kill"
            );
            kill_forcefully(pid);
        }
        // SIGKILL cannot be ignored; the worker reaps the child promptly.
        let _ = tokio::time::timeout(
            Duration::from_secs(2),
            rx.wait_for(|s| *s == ExecState::Idle),
        )
        .await;
    }

    /// Cheap read of the current state.
    pub fn state(&self) -> ExecState {
        *self.state_tx.borrow()
    }

    /// Whether an execution is in flight (`Running` or `Terminating`).
    pub fn is_executing(&self) -> bool {
        self.state() != ExecState::Idle
    }
}

impl Default for ExecutionEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn report_error(callbacks: &CallbackSet, message: &str) {
    for cb in &callbacks.error {
        cb(message);
    }
}

/// Exit code for a reaped child: the process code, or `-signal` when the
/// child was killed by a signal (unix).
fn exit_code(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    status.code().unwrap_or(-1)
}

#[cfg(unix)]
fn terminate_gracefully(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate_gracefully(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string()])
        .status();
}

#[cfg(unix)]
fn kill_forcefully(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_forcefully(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/F", "/PID", &pid.to_string()])
        .status();
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(10);

    /// Engine wired to collect output and deliver the exit code over a
    /// channel.
    fn instrumented(
        grace: Duration,
    ) -> (
        ExecutionEngine,
        Arc<Mutex<String>>,
        Arc<Mutex<String>>,
        mpsc::UnboundedReceiver<i32>,
    ) {
        let engine = ExecutionEngine::with_grace(grace);
        let output = Arc::new(Mutex::new(String::new()));
        let errors = Arc::new(Mutex::new(String::new()));
        let (fin_tx, fin_rx) = mpsc::unbounded_channel();

        {
            let output = output.clone();
            engine.on_output(move |chunk| output.lock().unwrap().push_str(chunk));
        }
        {
            let errors = errors.clone();
            engine.on_error(move |message| errors.lock().unwrap().push_str(message));
        }
        engine.on_finished(move |code| {
            let _ = fin_tx.send(code);
        });

        (engine, output, errors, fin_rx)
    }

    async fn finished_code(rx: &mut mpsc::UnboundedReceiver<i32>) -> i32 {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("finished callback within deadline")
            .expect("finished channel open")
    }

    #[tokio::test]
    async fn streams_output_and_reports_exit_code() {
        let (engine, output, _, mut fin_rx) = instrumented(DEFAULT_GRACE_TIMEOUT);

        engine
            .execute(ExecutionRequest::new("/bin/echo").arg("hi"))
            .unwrap();

        assert_eq!(finished_code(&mut fin_rx).await, 0);
        assert_eq!(output.lock().unwrap().as_str(), "hi\n");
        assert!(!engine.is_executing());
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_via_finished_not_error() {
        let (engine, _, errors, mut fin_rx) = instrumented(DEFAULT_GRACE_TIMEOUT);

        engine
            .execute(ExecutionRequest::new("/bin/sh").args(["-c", "exit 3"]))
            .unwrap();

        assert_eq!(finished_code(&mut fin_rx).await, 3);
        assert!(errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stderr_is_surfaced_through_error_callback() {
        let (engine, output, errors, mut fin_rx) = instrumented(DEFAULT_GRACE_TIMEOUT);

        engine
            .execute(ExecutionRequest::new("/bin/sh").args(["-c", "echo oops >&2"]))
            .unwrap();

        assert_eq!(finished_code(&mut fin_rx).await, 0);
        assert!(errors.lock().unwrap().contains("oops"));
        assert!(output.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_execute_while_running_is_rejected() {
        let (engine, _, _, mut fin_rx) = instrumented(DEFAULT_GRACE_TIMEOUT);

        engine
            .execute(ExecutionRequest::new("/bin/sleep").arg("30"))
            .unwrap();
        assert!(engine.is_executing());

        let err = engine
            .execute(ExecutionRequest::new("/bin/echo").arg("nope"))
            .unwrap_err();
        assert!(matches!(err, ExecError::Busy));

        engine.stop().await;
        finished_code(&mut fin_rx).await;
    }

    #[tokio::test]
    async fn busy_rejection_precedes_target_resolution() {
        let (engine, _, errors, mut fin_rx) = instrumented(DEFAULT_GRACE_TIMEOUT);

        engine
            .execute(ExecutionRequest::new("/bin/sleep").arg("30"))
            .unwrap();

        // An unresolvable target must still be rejected as Busy, with no
        // error callbacks leaking into the in-flight run's stream.
        let err = engine
            .execute(ExecutionRequest::new("/nonexistent/program"))
            .unwrap_err();
        assert!(matches!(err, ExecError::Busy));
        assert!(errors.lock().unwrap().is_empty());
        assert!(engine.is_executing());

        engine.stop().await;
        finished_code(&mut fin_rx).await;
    }

    #[tokio::test]
    async fn missing_target_reports_error_and_stays_idle() {
        let (engine, _, errors, _) = instrumented(DEFAULT_GRACE_TIMEOUT);

        let err = engine
            .execute(ExecutionRequest::new("/nonexistent/program"))
            .unwrap_err();
        assert!(matches!(err, ExecError::TargetNotFound(_)));
        assert!(errors.lock().unwrap().contains("not found"));
        assert!(!engine.is_executing());
    }

    #[tokio::test]
    async fn unspawnable_target_reports_error_and_stays_idle() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("not_executable.txt");
        std::fs::write(&target, "plain text").unwrap();

        let (engine, _, errors, _) = instrumented(DEFAULT_GRACE_TIMEOUT);
        let err = engine.execute(ExecutionRequest::new(&target)).unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
        assert!(errors.lock().unwrap().contains("failed to spawn"));
        assert!(!engine.is_executing());
    }

    #[tokio::test]
    async fn stop_terminates_cooperative_child_quickly() {
        let (engine, _, _, mut fin_rx) = instrumented(Duration::from_secs(5));

        engine
            .execute(ExecutionRequest::new("/bin/sleep").arg("30"))
            .unwrap();

        let started = Instant::now();
        engine.stop().await;
        let code = finished_code(&mut fin_rx).await;

        assert_eq!(code, -libc::SIGTERM);
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(!engine.is_executing());
    }

    #[tokio::test]
    async fn stop_escalates_to_forced_kill_within_bound() {
        // Child ignores SIGTERM and busy-waits without spawning helpers
        // that would hold the stdout pipe open past the kill.
        let (engine, _, _, mut fin_rx) = instrumented(Duration::from_millis(500));

        engine
            .execute(
                ExecutionRequest::new("/bin/sh").args(["-c", "trap '' TERM; while :; do :; done"]),
            )
            .unwrap();

        // Give the shell a moment to install its trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = Instant::now();
        engine.stop().await;
        let code = finished_code(&mut fin_rx).await;

        assert_eq!(code, -libc::SIGKILL);
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(!engine.is_executing());
    }

    #[tokio::test]
    async fn stop_does_not_escalate_when_child_exits_during_grace() {
        // The child shrugs off SIGTERM but finishes on its own well inside
        // the grace window; stop() must see the worker's cleanup and never
        // reach the forced-kill path.
        let (engine, _, _, mut fin_rx) = instrumented(Duration::from_secs(5));

        engine
            .execute(ExecutionRequest::new("/bin/sh").args(["-c", "trap '' TERM; sleep 1"]))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        engine.stop().await;
        let code = finished_code(&mut fin_rx).await;

        assert_eq!(code, 0);
        assert!(!engine.is_executing());
    }

    #[tokio::test]
    async fn stop_when_idle_is_a_noop() {
        let engine = ExecutionEngine::new();
        engine.stop().await;
        assert!(!engine.is_executing());
    }

    #[tokio::test]
    async fn engine_is_reusable_after_completion() {
        let (engine, output, _, mut fin_rx) = instrumented(DEFAULT_GRACE_TIMEOUT);

        engine
            .execute(ExecutionRequest::new("/bin/echo").arg("one"))
            .unwrap();
        finished_code(&mut fin_rx).await;

        engine
            .execute(ExecutionRequest::new("/bin/echo").arg("two"))
            .unwrap();
        finished_code(&mut fin_rx).await;

        assert_eq!(output.lock().unwrap().as_str(), "one\ntwo\n");
    }

    #[tokio::test]
    async fn finished_fires_exactly_once_per_execution() {
        let engine = ExecutionEngine::new();
        let count = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        {
            let count = count.clone();
            engine.on_finished(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
                let _ = done_tx.send(());
            });
        }

        engine
            .execute(ExecutionRequest::new("/bin/sleep").arg("30"))
            .unwrap();
        // Two stops racing the same execution still yield one finished.
        engine.stop().await;
        engine.stop().await;

        tokio::time::timeout(WAIT, done_rx.recv()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exit_code_prefers_process_code() {
        // Smoke-check the helper on a real status.
        let status = std::process::Command::new("/bin/true").status().unwrap();
        assert_eq!(exit_code(status), 0);
    }
}
