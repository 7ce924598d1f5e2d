use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::service::PermissionSource;
use super::types::{Permission, PermissionState};

/// On-disk shape of `permissions.json`, written by the permission-detection
/// collaborator. Keys are permission keys (`fullDiskAccess`, `automation:Finder`).
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PermissionSnapshot {
    #[serde(default)]
    pub grants: HashMap<String, PermissionState>,
}

/// Reads `permissions.json` from the data directory.
///
/// The file is re-read on every lookup so a grant made by the remediation
/// flow is seen by the next invocation. The engine never writes it.
pub struct JsonPermissionSource {
    path: PathBuf,
}

impl JsonPermissionSource {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join("permissions.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn snapshot(&self) -> PermissionSnapshot {
        if !self.path.exists() {
            return PermissionSnapshot::default();
        }
        match std::fs::read_to_string(&self.path)
            .map_err(|e| e.to_string())
            .and_then(|data| serde_json::from_str(&data).map_err(|e| e.to_string()))
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::warn!("Failed to read {}: {}", self.path.display(), e);
                PermissionSnapshot::default()
            }
        }
    }
}

impl PermissionSource for JsonPermissionSource {
    fn status(&self, permission: &Permission) -> PermissionState {
        self.snapshot()
            .grants
            .get(&permission.as_key())
            .copied()
            .unwrap_or_default()
    }
}
