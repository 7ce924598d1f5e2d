//! External-process execution primitive.
//!
//! A [`ProcessRunner`] owns one process slot: concurrent calls on the same
//! instance queue behind each other. Inside a call, process exit races a
//! timeout watchdog and a cancellation token; whichever fires first decides
//! the terminal status. Timeout and cancellation terminate the whole process
//! group and are reported as statuses, never as errors. Only a failure to
//! spawn is an error.

pub mod mock;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::RunnerSettings;

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("failed to spawn '{program}': {reason}")]
    Spawn { program: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Terminal status of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Failed,
    Timeout,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Duration,
    /// Owned by the caller. A request whose token is already cancelled
    /// spawns nothing.
    pub cancel: CancellationToken,
}

/// Line callback. Invoked from the reader task, without the trailing newline.
pub type LineCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone, Default)]
pub struct OutputSink {
    pub on_stdout: Option<LineCallback>,
    pub on_stderr: Option<LineCallback>,
}

impl OutputSink {
    pub fn none() -> Self {
        Self::default()
    }
}

/// What a finished process produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    pub status: ExecutionStatus,
    /// Real exit code; `128 + signal` for a signal-terminated child.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration: Duration,
}

impl RunOutput {
    /// Cancelled before any process existed: no exit code, no output.
    pub fn cancelled_before_start() -> Self {
        let now = Utc::now();
        RunOutput {
            status: ExecutionStatus::Cancelled,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            start_time: now,
            end_time: now,
            duration: Duration::ZERO,
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, request: RunRequest, sink: OutputSink) -> Result<RunOutput, RunnerError>;

    /// Request termination of the in-flight process. No-op when idle.
    /// Cancelling the request's own token has the same effect.
    fn cancel(&self);
}

enum Ended {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

pub struct ProcessRunner {
    env: BTreeMap<String, String>,
    grace: Duration,
    drain_timeout: Duration,
    slot: tokio::sync::Mutex<()>,
    active: Mutex<Option<CancellationToken>>,
}

/// Clears the active token when a run ends, however it ends.
struct ActiveGuard<'a>(&'a Mutex<Option<CancellationToken>>);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut active) = self.0.lock() {
            *active = None;
        }
    }
}

impl ProcessRunner {
    pub fn new(settings: &RunnerSettings) -> Self {
        Self {
            env: settings.environment(),
            grace: settings.termination_grace(),
            drain_timeout: settings.drain_timeout(),
            slot: tokio::sync::Mutex::new(()),
            active: Mutex::new(None),
        }
    }

    async fn run_in_slot(
        &self,
        request: RunRequest,
        sink: OutputSink,
        token: CancellationToken,
    ) -> Result<RunOutput, RunnerError> {
        if token.is_cancelled() {
            log::info!("'{}' cancelled before it started", request.program);
            return Ok(RunOutput::cancelled_before_start());
        }

        let mut cmd = tokio::process::Command::new(&request.program);
        cmd.args(&request.args)
            .env_clear()
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = request.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let start_time = Utc::now();
        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| RunnerError::Spawn {
            program: request.program.clone(),
            reason: e.to_string(),
        })?;
        log::debug!(
            "Spawned '{}' (pid {:?}, timeout {:?})",
            request.program,
            child.id(),
            request.timeout
        );

        let stdout_buf = Arc::new(Mutex::new(String::new()));
        let stderr_buf = Arc::new(Mutex::new(String::new()));
        let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            readers.push(spawn_reader(out, stdout_buf.clone(), sink.on_stdout.clone()));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(spawn_reader(err, stderr_buf.clone(), sink.on_stderr.clone()));
        }

        let ended = tokio::select! {
            status = child.wait() => Ended::Exited(status),
            _ = tokio::time::sleep(request.timeout) => Ended::TimedOut,
            _ = token.cancelled() => Ended::Cancelled,
        };

        let (status, exit) = match ended {
            Ended::Exited(exit) => {
                let exit = exit?;
                let status = if exit.success() {
                    ExecutionStatus::Success
                } else {
                    ExecutionStatus::Failed
                };
                (status, exit)
            }
            Ended::TimedOut => {
                log::warn!(
                    "'{}' exceeded its {:?} timeout, terminating",
                    request.program,
                    request.timeout
                );
                (ExecutionStatus::Timeout, self.terminate(&mut child).await?)
            }
            Ended::Cancelled => {
                log::info!("Cancelling '{}'", request.program);
                (ExecutionStatus::Cancelled, self.terminate(&mut child).await?)
            }
        };

        // A grandchild holding the pipes open must not hang the runner.
        let drained = tokio::time::timeout(self.drain_timeout, async {
            for reader in readers.iter_mut() {
                let _ = reader.await;
            }
        })
        .await;
        if drained.is_err() {
            log::warn!("Output of '{}' still open after exit, abandoning", request.program);
            for reader in &readers {
                reader.abort();
            }
        }

        let take = |buf: &Arc<Mutex<String>>| {
            buf.lock()
                .map(|mut b| std::mem::take(&mut *b))
                .map_err(|_| RunnerError::Other("output buffer lock poisoned".into()))
        };

        Ok(RunOutput {
            status,
            exit_code: exit_code(&exit),
            stdout: take(&stdout_buf)?,
            stderr: take(&stderr_buf)?,
            start_time,
            end_time: Utc::now(),
            duration: started.elapsed(),
        })
    }

    /// SIGTERM the process group, wait out the grace period, then SIGKILL.
    async fn terminate(&self, child: &mut Child) -> Result<ExitStatus, RunnerError> {
        signal_group(child, Signal::Term);
        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(status) => Ok(status?),
            Err(_) => {
                log::warn!("Process ignored SIGTERM for {:?}, killing", self.grace);
                signal_group(child, Signal::Kill);
                let _ = child.start_kill();
                Ok(child.wait().await?)
            }
        }
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, request: RunRequest, sink: OutputSink) -> Result<RunOutput, RunnerError> {
        let _slot = self.slot.lock().await;
        let token = request.cancel.child_token();
        {
            let mut active = self
                .active
                .lock()
                .map_err(|_| RunnerError::Other("runner state lock poisoned".into()))?;
            *active = Some(token.clone());
        }
        let _guard = ActiveGuard(&self.active);
        self.run_in_slot(request, sink, token).await
    }

    fn cancel(&self) {
        if let Ok(active) = self.active.lock() {
            if let Some(ref token) = *active {
                token.cancel();
            }
        }
    }
}

enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(child: &mut Child, signal: Signal) {
    let Some(pid) = child.id() else {
        return;
    };
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // The child leads its own group (process_group(0)), so pgid == pid.
    let rc = unsafe { libc::killpg(pid as libc::pid_t, sig) };
    if rc != 0 {
        log::debug!(
            "killpg({}, {}) failed: {}",
            pid,
            sig,
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _signal: Signal) {
    let _ = child.start_kill();
}

fn exit_code(status: &ExitStatus) -> Option<i32> {
    if let Some(code) = status.code() {
        return Some(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return Some(128 + sig);
        }
    }
    None
}

fn spawn_reader<R>(
    reader: R,
    buffer: Arc<Mutex<String>>,
    callback: Option<LineCallback>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&line);
                    if let Ok(mut buf) = buffer.lock() {
                        buf.push_str(&text);
                    }
                    if let Some(ref cb) = callback {
                        cb(text.trim_end_matches(['\n', '\r']));
                    }
                }
                Err(e) => {
                    log::debug!("Output reader stopped: {}", e);
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> ProcessRunner {
        ProcessRunner::new(&RunnerSettings {
            termination_grace_ms: 500,
            drain_timeout_ms: 500,
            ..Default::default()
        })
    }

    fn sh(script: &str, timeout: Duration) -> RunRequest {
        RunRequest {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
            working_dir: None,
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let out = runner()
            .run(sh("echo out; echo err >&2; exit 3", Duration::from_secs(5)), OutputSink::none())
            .await
            .unwrap();
        assert_eq!(out.status, ExecutionStatus::Failed);
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
        assert!(out.end_time >= out.start_time);
    }

    #[tokio::test]
    async fn success_within_timeout() {
        let out = runner()
            .run(sh("true", Duration::from_secs(5)), OutputSink::none())
            .await
            .unwrap();
        assert_eq!(out.status, ExecutionStatus::Success);
        assert_eq!(out.exit_code, Some(0));
    }

    #[tokio::test]
    async fn timeout_terminates_process() {
        let started = Instant::now();
        let out = runner()
            .run(sh("echo begin; sleep 30", Duration::from_millis(300)), OutputSink::none())
            .await
            .unwrap();
        assert_eq!(out.status, ExecutionStatus::Timeout);
        assert_eq!(out.stdout, "begin\n");
        assert_eq!(out.exit_code, Some(128 + libc::SIGTERM));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn sigterm_ignoring_process_is_killed() {
        let out = runner()
            .run(
                sh("trap '' TERM; sleep 30", Duration::from_millis(200)),
                OutputSink::none(),
            )
            .await
            .unwrap();
        assert_eq!(out.status, ExecutionStatus::Timeout);
        assert_eq!(out.exit_code, Some(128 + libc::SIGKILL));
    }

    #[tokio::test]
    async fn cancel_reports_cancelled_after_exit() {
        let runner = Arc::new(runner());
        let r = runner.clone();
        let handle = tokio::spawn(async move {
            r.run(sh("sleep 30", Duration::from_secs(30)), OutputSink::none()).await
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        runner.cancel();
        let out = handle.await.unwrap().unwrap();
        assert_eq!(out.status, ExecutionStatus::Cancelled);
        assert!(out.exit_code.is_some());
    }

    #[tokio::test]
    async fn request_token_cancels_run() {
        let request = sh("echo begin; sleep 30", Duration::from_secs(30));
        let trigger = request.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });
        let out = runner().run(request, OutputSink::none()).await.unwrap();
        assert_eq!(out.status, ExecutionStatus::Cancelled);
        assert_eq!(out.stdout, "begin\n");
    }

    #[tokio::test]
    async fn pre_cancelled_request_spawns_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let request = sh(&format!("touch {}", marker.display()), Duration::from_secs(5));
        request.cancel.cancel();

        let out = runner().run(request, OutputSink::none()).await.unwrap();

        assert_eq!(out.status, ExecutionStatus::Cancelled);
        assert_eq!(out.exit_code, None);
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn cancel_while_idle_is_noop() {
        let runner = runner();
        runner.cancel();
        let out = runner
            .run(sh("echo ok", Duration::from_secs(5)), OutputSink::none())
            .await
            .unwrap();
        assert_eq!(out.status, ExecutionStatus::Success);
    }

    #[tokio::test]
    async fn streams_lines_to_callbacks() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let seen = lines.clone();
        let sink = OutputSink {
            on_stdout: Some(Arc::new(move |line: &str| {
                seen.lock().unwrap().push(line.to_string());
            })),
            on_stderr: None,
        };
        runner()
            .run(sh("printf 'a\\nb\\n'", Duration::from_secs(5)), sink)
            .await
            .unwrap();
        assert_eq!(*lines.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn environment_is_explicit() {
        let mut settings = RunnerSettings {
            env_allowlist: Vec::new(),
            ..Default::default()
        };
        settings.extra_env.insert("CARETAKER_TEST".into(), "1".into());
        let out = ProcessRunner::new(&settings)
            .run(sh("/usr/bin/env", Duration::from_secs(5)), OutputSink::none())
            .await
            .unwrap();
        assert!(out.stdout.contains("CARETAKER_TEST=1"));
        assert!(!out.stdout.contains("HOME="));
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error() {
        let err = runner()
            .run(
                RunRequest {
                    program: "/nonexistent/binary".into(),
                    args: Vec::new(),
                    working_dir: None,
                    timeout: Duration::from_secs(1),
                    cancel: CancellationToken::new(),
                },
                OutputSink::none(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Spawn { .. }));
    }
}
