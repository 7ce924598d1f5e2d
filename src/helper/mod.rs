//! Bridge to the privileged helper process.
//!
//! The elevated executor only ever sees [`RemoteExecutor`]: a health check
//! and a single run-command call. [`client::HelperClient`] talks to the real
//! helper over a Unix socket; [`service::InProcessHelper`] drives the same
//! [`service::HelperService`] without one.

pub mod auth;
#[cfg(unix)]
pub mod client;
pub mod protocol;
#[cfg(unix)]
pub mod server;
pub mod service;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::runner::ExecutionStatus;

pub use auth::{AuthError, Authorizer, LocalAuthority, TokenVerifier, ELEVATED_RIGHT};
#[cfg(unix)]
pub use client::HelperClient;
pub use service::{HelperService, InProcessHelper};

#[derive(Debug, thiserror::Error)]
pub enum HelperError {
    #[error("helper is not installed")]
    NotInstalled,

    #[error("helper {installed} is older than required {required}")]
    Outdated { installed: String, required: String },

    #[error("helper unreachable: {0}")]
    Unreachable(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Installation state of the helper as seen from the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum HelperHealth {
    NotInstalled,
    Outdated { installed: String, required: String },
    Ready { version: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRequest {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Duration,
    pub auth_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOutput {
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Whether the helper is installed, current, and answering.
    async fn health(&self) -> Result<HelperHealth, HelperError>;

    /// Run one command. Cancelling `cancel` asks the helper to terminate it;
    /// the call still returns once the helper reports the outcome.
    async fn run(
        &self,
        request: RemoteRequest,
        cancel: CancellationToken,
    ) -> Result<RemoteOutput, HelperError>;
}
