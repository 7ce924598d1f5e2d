//! Caller-facing facade: `execute`, audit queries, export and verification.
//!
//! An [`Engine`] is built once at startup from explicit services and passed
//! to whoever needs it; nothing here is global.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::audit::{AuditQuery, AuditStore, ChainVerification, OutputBlobStore, RunRecord};
use crate::capability::catalog::CapabilityCatalog;
use crate::capability::PrivilegeLevel;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::executor::{
    ElevatedExecutor, ExecutionResult, ExecutionServices, Executor, UserExecutor,
};
use crate::helper::{Authorizer, RemoteExecutor};
use crate::permissions::{PermissionRemediator, PermissionSource};
use crate::preflight::{PreflightValidator, SystemProbe};
use crate::runner::{CommandRunner, OutputSink};

/// Everything an [`Engine`] is built from.
pub struct EngineServices {
    pub catalog: Arc<CapabilityCatalog>,
    pub permissions: Arc<dyn PermissionSource>,
    pub remediator: Arc<dyn PermissionRemediator>,
    pub probe: Arc<dyn SystemProbe>,
    pub runner: Arc<dyn CommandRunner>,
    pub remote: Arc<dyn RemoteExecutor>,
    pub authorizer: Arc<dyn Authorizer>,
    pub audit: Arc<AuditStore>,
    pub blobs: OutputBlobStore,
}

pub struct Engine {
    catalog: Arc<CapabilityCatalog>,
    audit: Arc<AuditStore>,
    services: Arc<ExecutionServices>,
    user: UserExecutor,
    elevated: ElevatedExecutor,
}

impl Engine {
    pub fn new(services: EngineServices) -> Self {
        let shared = Arc::new(ExecutionServices {
            preflight: Arc::new(PreflightValidator::new(services.permissions, services.probe)),
            remediator: services.remediator,
            audit: services.audit.clone(),
            blobs: services.blobs,
        });
        Self {
            user: UserExecutor::new(shared.clone(), services.runner),
            elevated: ElevatedExecutor::new(shared.clone(), services.remote, services.authorizer),
            catalog: services.catalog,
            audit: services.audit,
            services: shared,
        }
    }

    /// Open the audit store and output directory named by `config`; the
    /// remaining services are supplied by the caller.
    pub fn open_audit(config: &EngineConfig) -> EngineResult<(Arc<AuditStore>, OutputBlobStore)> {
        std::fs::create_dir_all(config.data_dir())?;
        let audit = AuditStore::open(&config.audit_db_path(), &config.exports_dir())?;
        Ok((Arc::new(audit), OutputBlobStore::new(config.outputs_dir())))
    }

    pub fn catalog(&self) -> &CapabilityCatalog {
        &self.catalog
    }

    pub async fn execute(
        &self,
        capability_id: &str,
        arguments: &HashMap<String, String>,
    ) -> EngineResult<ExecutionResult> {
        self.execute_with(capability_id, arguments, OutputSink::none())
            .await
    }

    /// [`Engine::execute`] with line callbacks for stdout and stderr.
    pub async fn execute_with(
        &self,
        capability_id: &str,
        arguments: &HashMap<String, String>,
        sink: OutputSink,
    ) -> EngineResult<ExecutionResult> {
        let started = Utc::now();
        let Some(capability) = self.catalog.lookup(capability_id) else {
            let error = EngineError::UnknownCapability(capability_id.to_string());
            return Err(self.services.reject(capability_id, arguments, started, error));
        };

        match capability.privilege_level {
            PrivilegeLevel::User => self.user.execute(&capability, arguments, sink).await,
            PrivilegeLevel::Elevated => self.elevated.execute(&capability, arguments, sink).await,
            // Driven by external collaborators, never by this engine.
            tier @ (PrivilegeLevel::Automation | PrivilegeLevel::FullDiskAccess) => {
                let error = EngineError::NoExecutorForTier(tier);
                Err(self.services.reject(capability_id, arguments, started, error))
            }
        }
    }

    /// Request termination of whatever is in flight. The running `execute`
    /// call reports `cancelled` once the process has exited.
    pub fn cancel(&self) {
        self.user.cancel();
        self.elevated.cancel();
    }

    pub fn query_audit_log(&self, query: &AuditQuery) -> EngineResult<Vec<RunRecord>> {
        Ok(self.audit.query(query)?)
    }

    pub fn export_audit_log(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> EngineResult<PathBuf> {
        if from > to {
            return Err(EngineError::Other(format!(
                "export range starts after it ends ({} > {})",
                from, to
            )));
        }
        Ok(self.audit.export_range(from, to)?)
    }

    pub fn verify_audit_log(&self) -> EngineResult<ChainVerification> {
        Ok(self.audit.verify()?)
    }
}
