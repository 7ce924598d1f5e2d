use serde::Serialize;

use crate::capability::template::TemplateError;
use crate::capability::PrivilegeLevel;
use crate::preflight::PreflightFailure;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    #[error("Capability '{capability_id}' requires the {required} tier, executor serves {executor}")]
    PrivilegeMismatch {
        capability_id: String,
        required: PrivilegeLevel,
        executor: PrivilegeLevel,
    },

    #[error("No executor serves the {0} tier")]
    NoExecutorForTier(PrivilegeLevel),

    #[error("Capability '{0}' has an empty command template")]
    EmptyTemplate(String),

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Preflight failed: {}", summarize(.0))]
    PreflightFailed(Vec<PreflightFailure>),

    #[error("Failed to spawn process: {0}")]
    Spawn(String),

    #[error("Privileged helper is not installed")]
    HelperNotInstalled,

    #[error("Privileged helper is outdated (installed {installed}, required {required})")]
    HelperOutdated { installed: String, required: String },

    #[error("Privileged helper unreachable: {0}")]
    HelperUnreachable(String),

    #[error("Authorization failed: {0}")]
    Authorization(String),

    #[error("Audit log error: {0}")]
    Audit(#[from] crate::audit::AuditError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] crate::capability::catalog::CatalogError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

fn summarize(failures: &[PreflightFailure]) -> String {
    failures
        .iter()
        .map(|f| f.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

impl EngineError {
    /// Stable machine-readable kind, used by callers to route recovery
    /// (install prompt, permission prompt, retry, generic failure).
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::UnknownCapability(_) => "unknown_capability",
            EngineError::PrivilegeMismatch { .. } => "privilege_mismatch",
            EngineError::NoExecutorForTier(_) => "no_executor_for_tier",
            EngineError::EmptyTemplate(_) => "empty_template",
            EngineError::Template(_) => "template",
            EngineError::PreflightFailed(failures) => {
                if failures.iter().any(|f| f.reason.is_remediable()) {
                    "permission_missing"
                } else {
                    "preflight_failed"
                }
            }
            EngineError::Spawn(_) => "spawn_failed",
            EngineError::HelperNotInstalled => "helper_not_installed",
            EngineError::HelperOutdated { .. } => "helper_outdated",
            EngineError::HelperUnreachable(_) => "helper_unreachable",
            EngineError::Authorization(_) => "authorization",
            EngineError::Audit(_) => "audit",
            EngineError::Catalog(_) => "catalog",
            EngineError::Io(_) => "io",
            EngineError::Json(_) => "json",
            EngineError::Other(_) => "other",
        }
    }

    /// Validation and preflight errors are recorded as `rejected`; everything
    /// else that stops an attempt is recorded as `error`.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            EngineError::UnknownCapability(_)
                | EngineError::PrivilegeMismatch { .. }
                | EngineError::NoExecutorForTier(_)
                | EngineError::EmptyTemplate(_)
                | EngineError::Template(_)
                | EngineError::PreflightFailed(_)
        )
    }
}

impl Serialize for EngineError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
