use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use super::{ActiveRuns, ExecutionResult, ExecutionServices, Executor, Finished};
use crate::capability::{Capability, PrivilegeLevel};
use crate::error::{EngineError, EngineResult};
use crate::helper::{
    Authorizer, HelperError, HelperHealth, RemoteExecutor, RemoteRequest, ELEVATED_RIGHT,
};
use crate::runner::{OutputSink, RunOutput};

/// Runs `elevated`-tier capabilities through the privileged helper.
///
/// Before every call the helper's health is checked and a fresh
/// authorization token is obtained; neither step talks to the helper's
/// execute method. One call is in flight per executor.
pub struct ElevatedExecutor {
    services: Arc<ExecutionServices>,
    remote: Arc<dyn RemoteExecutor>,
    authorizer: Arc<dyn Authorizer>,
    slot: tokio::sync::Mutex<()>,
    active: ActiveRuns,
}

impl ElevatedExecutor {
    pub fn new(
        services: Arc<ExecutionServices>,
        remote: Arc<dyn RemoteExecutor>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        Self {
            services,
            remote,
            authorizer,
            slot: tokio::sync::Mutex::new(()),
            active: ActiveRuns::default(),
        }
    }

    async fn ensure_ready(&self) -> EngineResult<()> {
        match self.remote.health().await {
            Ok(HelperHealth::Ready { version }) => {
                log::debug!("Helper {} ready", version);
                Ok(())
            }
            Ok(HelperHealth::NotInstalled) => Err(EngineError::HelperNotInstalled),
            Ok(HelperHealth::Outdated {
                installed,
                required,
            }) => Err(EngineError::HelperOutdated {
                installed,
                required,
            }),
            Err(e) => Err(helper_error(e)),
        }
    }
}

fn helper_error(error: HelperError) -> EngineError {
    match error {
        HelperError::NotInstalled => EngineError::HelperNotInstalled,
        HelperError::Outdated {
            installed,
            required,
        } => EngineError::HelperOutdated {
            installed,
            required,
        },
        HelperError::Unauthorized(msg) => EngineError::Authorization(msg),
        HelperError::InvalidRequest(msg) | HelperError::Execution(msg) => EngineError::Spawn(msg),
        other => EngineError::HelperUnreachable(other.to_string()),
    }
}

#[async_trait]
impl Executor for ElevatedExecutor {
    fn tier(&self) -> PrivilegeLevel {
        PrivilegeLevel::Elevated
    }

    async fn execute(
        &self,
        capability: &Capability,
        arguments: &HashMap<String, String>,
        // The helper returns output in one piece; there is nothing to stream.
        _sink: OutputSink,
    ) -> EngineResult<ExecutionResult> {
        let started = Utc::now();
        let run = self.active.begin();
        log::info!("Executing '{}' ({} tier)", capability.id, capability.privilege_level);

        let command = match self.services.prepare(capability, arguments, self.tier()).await {
            Ok(command) => command,
            Err(e) => return Err(self.services.reject(&capability.id, arguments, started, e)),
        };

        if let Err(e) = self.ensure_ready().await {
            return Err(self.services.reject(&capability.id, arguments, started, e));
        }

        let auth_token = match self.authorizer.authorize(ELEVATED_RIGHT) {
            Ok(token) => token,
            Err(e) => {
                let error = EngineError::Authorization(e.to_string());
                return Err(self.services.reject(&capability.id, arguments, started, error));
            }
        };

        let _slot = self.slot.lock().await;
        if run.token.is_cancelled() {
            log::info!("'{}' cancelled before it reached the helper", capability.id);
            let finished = RunOutput::cancelled_before_start().into();
            return self.services.complete(capability, arguments, finished).await;
        }

        let start_time = Utc::now();
        let outcome = self
            .remote
            .run(
                RemoteRequest {
                    program: command.program,
                    args: command.args,
                    working_dir: capability.working_directory.as_ref().map(PathBuf::from),
                    timeout: capability.timeout(),
                    auth_token,
                },
                run.token.clone(),
            )
            .await;

        let output = match outcome {
            Ok(output) => output,
            Err(e) => {
                let error = helper_error(e);
                return Err(self.services.reject(&capability.id, arguments, started, error));
            }
        };

        let finished = Finished {
            status: output.status,
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            start_time,
            end_time: Utc::now(),
        };
        self.services.complete(capability, arguments, finished).await
    }

    fn cancel(&self) {
        self.active.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::audit::{AuditQuery, AuditStore, OutputBlobStore, RunStatus};
    use crate::capability::{PreflightCheck, RiskClass};
    use crate::helper::service::RunnerFactory;
    use crate::helper::{HelperService, InProcessHelper, LocalAuthority};
    use crate::parser::ParserKind;
    use crate::permissions::{
        Permission, PermissionState, RecordingRemediator, StaticPermissions,
    };
    use crate::preflight::mock::FakeProbe;
    use crate::preflight::{PreflightCheckType, PreflightValidator};
    use crate::runner::mock::MockRunner;
    use crate::runner::{CommandRunner, ExecutionStatus};

    struct Fixture {
        _dir: tempfile::TempDir,
        audit: Arc<AuditStore>,
        runner: Arc<MockRunner>,
        helper: Arc<InProcessHelper>,
        remediator: Arc<RecordingRemediator>,
        executor: ElevatedExecutor,
    }

    fn fixture(runner: MockRunner, health: Option<HelperHealth>) -> Fixture {
        let permissions = StaticPermissions::new()
            .with(Permission::Administrator, PermissionState::Granted)
            .with(Permission::FullDiskAccess, PermissionState::Denied);
        fixture_with(runner, health, permissions)
    }

    fn fixture_with(
        runner: MockRunner,
        health: Option<HelperHealth>,
        permissions: StaticPermissions,
    ) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(
            AuditStore::open(&dir.path().join("audit.db"), &dir.path().join("exports")).unwrap(),
        );
        let remediator = Arc::new(RecordingRemediator::new());
        let services = Arc::new(ExecutionServices {
            preflight: Arc::new(PreflightValidator::new(
                Arc::new(permissions),
                Arc::new(FakeProbe::new()),
            )),
            remediator: remediator.clone(),
            audit: audit.clone(),
            blobs: OutputBlobStore::new(dir.path().join("outputs")),
        });

        let authority = Arc::new(LocalAuthority::generate(Duration::from_secs(30)));
        let runner = Arc::new(runner);
        let shared = runner.clone();
        let factory: RunnerFactory = Arc::new(move || shared.clone() as Arc<dyn CommandRunner>);
        let service = Arc::new(HelperService::new(
            factory,
            authority.verifier(),
            Duration::from_secs(60),
        ));
        let mut helper = InProcessHelper::new(service);
        if let Some(health) = health {
            helper = helper.with_health(health);
        }
        let helper = Arc::new(helper);

        Fixture {
            executor: ElevatedExecutor::new(services, helper.clone(), authority),
            _dir: dir,
            audit,
            runner,
            helper,
            remediator,
        }
    }

    fn purge() -> Capability {
        Capability {
            id: "quick.mem.purge".into(),
            title: "Purge inactive memory".into(),
            description: String::new(),
            group: "quick".into(),
            command_template: "/usr/sbin/purge".into(),
            working_directory: None,
            timeout_secs: 30,
            privilege_level: PrivilegeLevel::Elevated,
            risk_class: RiskClass::Moderate,
            output_parser: ParserKind::Text,
            parser_pattern: None,
            preflight_checks: Vec::new(),
            required_paths: Vec::new(),
            required_apps: Vec::new(),
        }
    }

    #[tokio::test]
    async fn runs_through_the_helper() {
        let fx = fixture(MockRunner::new().with_exit(0, "done\n"), None);
        let result = fx
            .executor
            .execute(&purge(), &HashMap::new(), OutputSink::none())
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.stdout, "done\n");
        assert_eq!(fx.runner.calls()[0].program, "/usr/sbin/purge");
        let records = fx.audit.query(&AuditQuery::default()).unwrap();
        assert_eq!(records[0].status, RunStatus::Success);
    }

    #[tokio::test]
    async fn not_installed_fails_before_any_rpc() {
        let fx = fixture(MockRunner::new(), Some(HelperHealth::NotInstalled));
        let err = fx
            .executor
            .execute(&purge(), &HashMap::new(), OutputSink::none())
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::HelperNotInstalled));
        assert_eq!(fx.helper.rpc_calls(), 0);
        assert!(!fx.runner.was_called());
        let records = fx.audit.query(&AuditQuery::default()).unwrap();
        assert_eq!(records[0].status, RunStatus::Error);
    }

    #[tokio::test]
    async fn outdated_is_distinct_from_not_installed() {
        let fx = fixture(
            MockRunner::new(),
            Some(HelperHealth::Outdated {
                installed: "0.1.0".into(),
                required: "0.4.0".into(),
            }),
        );
        let err = fx
            .executor
            .execute(&purge(), &HashMap::new(), OutputSink::none())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "helper_outdated");
        assert_eq!(fx.helper.rpc_calls(), 0);
    }

    #[tokio::test]
    async fn user_capability_is_refused() {
        let fx = fixture(MockRunner::new(), None);
        let mut cap = purge();
        cap.privilege_level = PrivilegeLevel::User;
        let err = fx
            .executor
            .execute(&cap, &HashMap::new(), OutputSink::none())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PrivilegeMismatch { .. }));
        assert_eq!(fx.helper.rpc_calls(), 0);
    }

    #[tokio::test]
    async fn missing_permission_triggers_remediation_and_fails() {
        let fx = fixture(MockRunner::new(), None);
        let mut cap = purge();
        cap.preflight_checks.push(PreflightCheck {
            check_type: PreflightCheckType::FullDiskAccessPermission,
            target: String::new(),
            failure_message: "Full Disk Access is required".into(),
        });

        let err = fx
            .executor
            .execute(&cap, &HashMap::new(), OutputSink::none())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "permission_missing");
        assert!(!fx.runner.was_called());

        let requests = fx.remediator.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, "quick.mem.purge");
        assert_eq!(requests[0].1, vec![Permission::FullDiskAccess]);
    }

    #[tokio::test]
    async fn administrator_grant_is_read_before_the_helper() {
        let permissions =
            StaticPermissions::new().with(Permission::Administrator, PermissionState::Denied);
        let fx = fixture_with(MockRunner::new(), None, permissions);

        let err = fx
            .executor
            .execute(&purge(), &HashMap::new(), OutputSink::none())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "permission_missing");
        assert_eq!(fx.helper.rpc_calls(), 0);
        assert!(!fx.runner.was_called());
        let requests = fx.remediator.requests();
        assert_eq!(requests[0].1, vec![Permission::Administrator]);
        let records = fx.audit.query(&AuditQuery::default()).unwrap();
        assert_eq!(records[0].status, RunStatus::Rejected);
    }

    #[tokio::test]
    async fn cancel_before_the_helper_call_spawns_nothing() {
        let fx = Arc::new(fixture(MockRunner::new(), None));
        // Holding the slot parks the execution just before the helper call.
        let slot = fx.executor.slot.lock().await;
        let running = fx.clone();
        let handle = tokio::spawn(async move {
            running
                .executor
                .execute(&purge(), &HashMap::new(), OutputSink::none())
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        fx.executor.cancel();
        drop(slot);

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert_eq!(result.exit_code, None);
        assert_eq!(fx.helper.rpc_calls(), 0);
        let records = fx.audit.query(&AuditQuery::default()).unwrap();
        assert_eq!(records[0].status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn helper_timeout_status_is_preserved() {
        let fx = fixture(MockRunner::new().with_status(ExecutionStatus::Timeout), None);
        let result = fx
            .executor
            .execute(&purge(), &HashMap::new(), OutputSink::none())
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Timeout);
        let records = fx.audit.query(&AuditQuery::default()).unwrap();
        assert_eq!(records[0].status, RunStatus::Timeout);
    }
}
