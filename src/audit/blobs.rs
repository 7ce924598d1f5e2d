use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::AuditError;

/// Where one run's output bodies were written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredOutput {
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub size_bytes: u64,
}

/// Writes stdout/stderr bodies to `<root>/<yyyy-mm-dd>/<uuid>.stdout|.stderr`.
///
/// Every write gets a fresh uuid, so identical output from two runs lands in
/// two distinct files.
#[derive(Debug, Clone)]
pub struct OutputBlobStore {
    root: PathBuf,
}

impl OutputBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn write(&self, stdout: &str, stderr: &str) -> Result<StoredOutput, AuditError> {
        let dir = self.root.join(Utc::now().format("%Y-%m-%d").to_string());
        tokio::fs::create_dir_all(&dir).await?;

        let id = uuid::Uuid::new_v4();
        let stdout_path = dir.join(format!("{}.stdout", id));
        let stderr_path = dir.join(format!("{}.stderr", id));
        tokio::fs::write(&stdout_path, stdout.as_bytes()).await?;
        tokio::fs::write(&stderr_path, stderr.as_bytes()).await?;

        Ok(StoredOutput {
            stdout_path,
            stderr_path,
            size_bytes: (stdout.len() + stderr.len()) as u64,
        })
    }
}
