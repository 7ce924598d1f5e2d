//! Scripted [`CommandRunner`] that records every request and never spawns.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::{CommandRunner, ExecutionStatus, OutputSink, RunOutput, RunRequest, RunnerError};

/// Scripted response for one call.
#[derive(Debug, Clone)]
pub enum Scripted {
    Exit {
        code: i32,
        stdout: String,
        stderr: String,
    },
    Status(ExecutionStatus),
    SpawnFailure(String),
}

#[derive(Default)]
struct Inner {
    calls: Vec<RunRequest>,
    script: VecDeque<Scripted>,
    cancels: usize,
}

#[derive(Default)]
pub struct MockRunner {
    inner: Mutex<Inner>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a normal exit. Unscripted calls exit 0 with no output.
    pub fn with_exit(self, code: i32, stdout: &str) -> Self {
        self.push(Scripted::Exit {
            code,
            stdout: stdout.to_string(),
            stderr: String::new(),
        })
    }

    pub fn with_status(self, status: ExecutionStatus) -> Self {
        self.push(Scripted::Status(status))
    }

    pub fn fail_spawn(self, reason: &str) -> Self {
        self.push(Scripted::SpawnFailure(reason.to_string()))
    }

    fn push(self, scripted: Scripted) -> Self {
        if let Ok(mut inner) = self.inner.lock() {
            inner.script.push_back(scripted);
        }
        self
    }

    pub fn calls(&self) -> Vec<RunRequest> {
        self.inner.lock().map(|i| i.calls.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls().len()
    }

    pub fn was_called(&self) -> bool {
        self.call_count() > 0
    }

    pub fn cancel_count(&self) -> usize {
        self.inner.lock().map(|i| i.cancels).unwrap_or_default()
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(&self, request: RunRequest, sink: OutputSink) -> Result<RunOutput, RunnerError> {
        let scripted = {
            let mut inner = self
                .inner
                .lock()
                .map_err(|_| RunnerError::Other("mock lock poisoned".into()))?;
            inner.calls.push(request.clone());
            inner.script.pop_front()
        };
        if request.cancel.is_cancelled() {
            return Ok(RunOutput::cancelled_before_start());
        }

        let (status, exit_code, stdout, stderr) = match scripted {
            None => (ExecutionStatus::Success, Some(0), String::new(), String::new()),
            Some(Scripted::Exit { code, stdout, stderr }) => {
                let status = if code == 0 {
                    ExecutionStatus::Success
                } else {
                    ExecutionStatus::Failed
                };
                (status, Some(code), stdout, stderr)
            }
            Some(Scripted::Status(status)) => (status, Some(143), String::new(), String::new()),
            Some(Scripted::SpawnFailure(reason)) => {
                return Err(RunnerError::Spawn {
                    program: request.program,
                    reason,
                })
            }
        };

        if let Some(ref cb) = sink.on_stdout {
            stdout.lines().for_each(|l| cb(l));
        }
        if let Some(ref cb) = sink.on_stderr {
            stderr.lines().for_each(|l| cb(l));
        }

        let now = Utc::now();
        Ok(RunOutput {
            status,
            exit_code,
            stdout,
            stderr,
            start_time: now,
            end_time: now,
            duration: Duration::ZERO,
        })
    }

    fn cancel(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.cancels += 1;
        }
    }
}
