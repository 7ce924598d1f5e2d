use std::collections::HashMap;
use std::sync::Mutex;

use super::types::{Permission, PermissionState};

/// Read-only view of the OS permission subsystem.
///
/// The engine only ever reads permission state; granting happens in the
/// external remediation flow.
pub trait PermissionSource: Send + Sync {
    fn status(&self, permission: &Permission) -> PermissionState;

    fn is_granted(&self, permission: &Permission) -> bool {
        self.status(permission) == PermissionState::Granted
    }
}

/// Hook into the external remediation flow (settings deep link, prompt).
///
/// Called with every missing permission of a failed preflight. The call
/// signals intent only; the current invocation still fails.
pub trait PermissionRemediator: Send + Sync {
    fn request(&self, capability_id: &str, missing: &[Permission]);
}

/// Remediator used when no UI is attached: logs what would be requested.
pub struct LoggingRemediator;

impl PermissionRemediator for LoggingRemediator {
    fn request(&self, capability_id: &str, missing: &[Permission]) {
        let names: Vec<String> = missing.iter().map(Permission::as_key).collect();
        log::warn!(
            "Capability '{}' needs permission(s): {}",
            capability_id,
            names.join(", ")
        );
    }
}

/// Fixed permission map; anything not listed is `NotDetermined`.
#[derive(Default)]
pub struct StaticPermissions {
    states: HashMap<Permission, PermissionState>,
}

impl StaticPermissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, permission: Permission, state: PermissionState) -> Self {
        self.states.insert(permission, state);
        self
    }

    pub fn granted(permission: Permission) -> Self {
        Self::new().with(permission, PermissionState::Granted)
    }
}

impl PermissionSource for StaticPermissions {
    fn status(&self, permission: &Permission) -> PermissionState {
        self.states.get(permission).copied().unwrap_or_default()
    }
}

/// Remediator that remembers each request, for assertions in tests.
#[derive(Default)]
pub struct RecordingRemediator {
    requests: Mutex<Vec<(String, Vec<Permission>)>>,
}

impl RecordingRemediator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<(String, Vec<Permission>)> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl PermissionRemediator for RecordingRemediator {
    fn request(&self, capability_id: &str, missing: &[Permission]) {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push((capability_id.to_string(), missing.to_vec()));
        }
    }
}
