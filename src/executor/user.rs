use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use super::{ActiveRuns, ExecutionResult, ExecutionServices, Executor};
use crate::capability::{Capability, PrivilegeLevel};
use crate::error::{EngineError, EngineResult};
use crate::runner::{CommandRunner, OutputSink, RunOutput, RunRequest};

/// Runs `user`-tier capabilities directly through a [`CommandRunner`].
pub struct UserExecutor {
    services: Arc<ExecutionServices>,
    runner: Arc<dyn CommandRunner>,
    active: ActiveRuns,
}

impl UserExecutor {
    pub fn new(services: Arc<ExecutionServices>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            services,
            runner,
            active: ActiveRuns::default(),
        }
    }
}

#[async_trait]
impl Executor for UserExecutor {
    fn tier(&self) -> PrivilegeLevel {
        PrivilegeLevel::User
    }

    async fn execute(
        &self,
        capability: &Capability,
        arguments: &HashMap<String, String>,
        sink: OutputSink,
    ) -> EngineResult<ExecutionResult> {
        let started = Utc::now();
        let run = self.active.begin();
        log::info!("Executing '{}' ({} tier)", capability.id, capability.privilege_level);

        let command = match self.services.prepare(capability, arguments, self.tier()).await {
            Ok(command) => command,
            Err(e) => return Err(self.services.reject(&capability.id, arguments, started, e)),
        };
        if run.token.is_cancelled() {
            log::info!("'{}' cancelled before it started", capability.id);
            let finished = RunOutput::cancelled_before_start().into();
            return self.services.complete(capability, arguments, finished).await;
        }

        let request = RunRequest {
            program: command.program,
            args: command.args,
            working_dir: capability.working_directory.as_ref().map(PathBuf::from),
            timeout: capability.timeout(),
            cancel: run.token.clone(),
        };
        let output = match self.runner.run(request, sink).await {
            Ok(output) => output,
            Err(e) => {
                let error = EngineError::Spawn(e.to_string());
                return Err(self.services.reject(&capability.id, arguments, started, error));
            }
        };

        self.services
            .complete(capability, arguments, output.into())
            .await
    }

    fn cancel(&self) {
        self.active.cancel_all();
    }
}
