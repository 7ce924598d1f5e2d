//! Scripted [`SystemProbe`] for tests. Anything not configured is absent,
//! not running, or (for disk space and SIP) unavailable.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use super::probe::{ProbeError, SystemProbe};

#[derive(Debug, Clone, Default)]
pub struct FakeProbe {
    paths: HashSet<PathBuf>,
    writable: HashSet<PathBuf>,
    apps: HashSet<String>,
    free_space: Option<u64>,
    integrity_protection: Option<bool>,
    delay: Option<Duration>,
}

impl FakeProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.paths.insert(path.into());
        self
    }

    /// A writable path also exists.
    pub fn with_writable_path(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.paths.insert(path.clone());
        self.writable.insert(path);
        self
    }

    pub fn with_running_app(mut self, app: &str) -> Self {
        self.apps.insert(app.to_string());
        self
    }

    pub fn with_free_space(mut self, bytes: u64) -> Self {
        self.free_space = Some(bytes);
        self
    }

    pub fn with_integrity_protection(mut self, enabled: bool) -> Self {
        self.integrity_protection = Some(enabled);
        self
    }

    /// Every lookup sleeps this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl SystemProbe for FakeProbe {
    async fn path_exists(&self, path: &Path) -> bool {
        self.pause().await;
        self.paths.contains(path)
    }

    async fn path_writable(&self, path: &Path) -> bool {
        self.pause().await;
        self.writable.contains(path)
    }

    async fn app_running(&self, app: &str) -> Result<bool, ProbeError> {
        self.pause().await;
        Ok(self.apps.contains(app))
    }

    async fn available_space(&self, _path: &Path) -> Result<u64, ProbeError> {
        self.pause().await;
        self.free_space
            .ok_or_else(|| ProbeError::Unavailable("no disk configured".into()))
    }

    async fn integrity_protection_enabled(&self) -> Result<bool, ProbeError> {
        self.pause().await;
        self.integrity_protection
            .ok_or_else(|| ProbeError::Unavailable("no SIP status configured".into()))
    }
}
