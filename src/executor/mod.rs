//! Capability executors.
//!
//! Both executors share one pipeline ([`ExecutionServices`]): privilege gate,
//! preflight, template interpolation, then (after the spawn) parsing, output
//! persistence and the audit record. They differ only in how the command
//! is actually run.

pub mod elevated;
pub mod user;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditStore, NewRunRecord, OutputBlobStore, RunStatus};
use crate::capability::template::{interpolate, CommandLine};
use crate::capability::{Capability, PrivilegeLevel};
use crate::error::{EngineError, EngineResult};
use crate::parser::{self, ParsedOutput};
use crate::permissions::PermissionRemediator;
use crate::preflight::PreflightValidator;
use crate::runner::{ExecutionStatus, OutputSink, RunOutput};

pub use elevated::ElevatedExecutor;
pub use user::UserExecutor;

/// Outcome of one execution that reached a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub capability_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub parsed_output: Option<ParsedOutput>,
    pub status: ExecutionStatus,
    pub duration_ms: u64,
    /// Id of the audit record written for this run.
    pub record_id: String,
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// The one tier this executor accepts.
    fn tier(&self) -> PrivilegeLevel;

    async fn execute(
        &self,
        capability: &Capability,
        arguments: &HashMap<String, String>,
        sink: OutputSink,
    ) -> EngineResult<ExecutionResult>;

    /// Request termination of every execution currently under way, from
    /// preflight to process exit.
    fn cancel(&self);
}

/// Cancellation tokens of the executions an executor is currently running.
///
/// A token is registered before the first gate runs, so a cancel that lands
/// during preflight or interpolation is still observed.
#[derive(Default)]
pub(crate) struct ActiveRuns {
    next_id: AtomicU64,
    tokens: Mutex<HashMap<u64, CancellationToken>>,
}

/// Deregisters its token on drop.
pub(crate) struct ActiveRun<'a> {
    runs: &'a ActiveRuns,
    id: u64,
    pub token: CancellationToken,
}

impl ActiveRuns {
    pub(crate) fn begin(&self) -> ActiveRun<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.insert(id, token.clone());
        }
        ActiveRun {
            runs: self,
            id,
            token,
        }
    }

    pub(crate) fn cancel_all(&self) {
        if let Ok(tokens) = self.tokens.lock() {
            tokens.values().for_each(CancellationToken::cancel);
        }
    }
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        if let Ok(mut tokens) = self.runs.tokens.lock() {
            tokens.remove(&self.id);
        }
    }
}

/// A finished command, however it was run.
#[derive(Debug, Clone)]
pub(crate) struct Finished {
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl From<RunOutput> for Finished {
    fn from(out: RunOutput) -> Self {
        Finished {
            status: out.status,
            exit_code: out.exit_code,
            stdout: out.stdout,
            stderr: out.stderr,
            start_time: out.start_time,
            end_time: out.end_time,
        }
    }
}

/// Collaborators shared by both executors.
pub struct ExecutionServices {
    pub preflight: Arc<PreflightValidator>,
    pub remediator: Arc<dyn PermissionRemediator>,
    pub audit: Arc<AuditStore>,
    pub blobs: OutputBlobStore,
}

impl ExecutionServices {
    /// Every gate that must pass before anything is spawned.
    pub(crate) async fn prepare(
        &self,
        capability: &Capability,
        arguments: &HashMap<String, String>,
        tier: PrivilegeLevel,
    ) -> EngineResult<CommandLine> {
        if capability.privilege_level != tier {
            return Err(EngineError::PrivilegeMismatch {
                capability_id: capability.id.clone(),
                required: capability.privilege_level,
                executor: tier,
            });
        }

        let preflight = self.preflight.validate(capability).await;
        if !preflight.can_execute {
            if preflight.has_remediable() {
                // Remediation runs out of band; this call still fails.
                self.remediator
                    .request(&capability.id, &preflight.missing_permissions);
            }
            return Err(EngineError::PreflightFailed(preflight.failures));
        }

        interpolate(&capability.command_template, arguments).map_err(|e| match e {
            crate::capability::template::TemplateError::Empty => {
                EngineError::EmptyTemplate(capability.id.clone())
            }
            other => EngineError::Template(other),
        })
    }

    /// Audit an attempt that stopped before producing output and hand the
    /// error back. A failed audit write replaces the original error.
    pub(crate) fn reject(
        &self,
        capability_id: &str,
        arguments: &HashMap<String, String>,
        started: DateTime<Utc>,
        error: EngineError,
    ) -> EngineError {
        let status = if error.is_rejection() {
            RunStatus::Rejected
        } else {
            RunStatus::Error
        };
        log::warn!("Capability '{}' {}: {}", capability_id, status.as_str(), error);

        let record = NewRunRecord {
            capability_id: capability_id.to_string(),
            arguments: sorted(arguments),
            start_time: started,
            end_time: Utc::now(),
            exit_code: None,
            status,
            error: Some(error.to_string()),
            output: None,
            parsed_summary: None,
        };
        match self.audit.append(record) {
            Ok(_) => error,
            Err(audit_err) => {
                log::error!(
                    "Failed to audit rejected run of '{}': {}",
                    capability_id,
                    audit_err
                );
                EngineError::Audit(audit_err)
            }
        }
    }

    /// Parse, persist output bodies and audit a run that reached a terminal
    /// status.
    pub(crate) async fn complete(
        &self,
        capability: &Capability,
        arguments: &HashMap<String, String>,
        finished: Finished,
    ) -> EngineResult<ExecutionResult> {
        let parsed_output = parser::parse(
            capability.output_parser,
            capability.parser_pattern.as_deref(),
            &finished.stdout,
        );

        let record = async {
            let output = self.blobs.write(&finished.stdout, &finished.stderr).await?;
            self.audit.append(NewRunRecord {
                capability_id: capability.id.clone(),
                arguments: sorted(arguments),
                start_time: finished.start_time,
                end_time: finished.end_time,
                exit_code: finished.exit_code,
                status: finished.status.into(),
                error: None,
                output: Some(output),
                parsed_summary: parsed_output.as_ref().map(ParsedOutput::summary),
            })
        }
        .await
        .map_err(|e| {
            log::error!("Failed to audit run of '{}': {}", capability.id, e);
            EngineError::Audit(e)
        })?;

        log::info!(
            "Capability '{}' finished: {} (exit {:?})",
            capability.id,
            finished.status.as_str(),
            finished.exit_code
        );

        let duration = (finished.end_time - finished.start_time)
            .to_std()
            .unwrap_or(Duration::ZERO);
        Ok(ExecutionResult {
            capability_id: capability.id.clone(),
            start_time: finished.start_time,
            end_time: finished.end_time,
            exit_code: finished.exit_code,
            stdout: finished.stdout,
            stderr: finished.stderr,
            parsed_output,
            status: finished.status,
            duration_ms: duration.as_millis() as u64,
            record_id: record.id,
        })
    }
}

fn sorted(arguments: &HashMap<String, String>) -> BTreeMap<String, String> {
    arguments
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
