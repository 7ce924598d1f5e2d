//! Precondition checks run before any process is spawned.
//!
//! Every check of a capability (declared and implicit) is evaluated in order
//! and all failures are collected. Each failure carries a [`FailureReason`]
//! so callers can tell a missing permission, which the remediation flow can
//! fix, from an unconditional blocker such as a full disk.

pub mod mock;
pub mod probe;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

pub use crate::capability::PreflightCheckType;
use crate::capability::{Capability, PreflightCheck, PrivilegeLevel};
use crate::parser::parse_size;
use crate::permissions::{Permission, PermissionSource};
pub use probe::{HostProbe, ProbeError, SystemProbe};

/// Machine-readable cause of a failed check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureReason {
    PermissionMissing(Permission),
    PathMissing,
    PathNotWritable,
    AppNotRunning,
    AppRunning,
    InsufficientDiskSpace,
    IntegrityProtectionMismatch,
    /// The probe itself could not answer (tool missing, malformed target).
    ProbeUnavailable,
}

impl FailureReason {
    /// Whether the external remediation flow can resolve this failure.
    pub fn is_remediable(&self) -> bool {
        matches!(self, FailureReason::PermissionMissing(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightFailure {
    pub check: PreflightCheckType,
    pub target: String,
    pub reason: FailureReason,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightResult {
    pub can_execute: bool,
    pub missing_permissions: Vec<Permission>,
    pub summary: String,
    pub failures: Vec<PreflightFailure>,
}

impl PreflightResult {
    fn from_failures(failures: Vec<PreflightFailure>) -> Self {
        let missing_permissions = failures
            .iter()
            .filter_map(|f| match &f.reason {
                FailureReason::PermissionMissing(p) => Some(p.clone()),
                _ => None,
            })
            .collect();
        let summary = if failures.is_empty() {
            "All preflight checks passed".to_string()
        } else {
            failures
                .iter()
                .map(|f| f.message.as_str())
                .collect::<Vec<_>>()
                .join("; ")
        };
        Self {
            can_execute: failures.is_empty(),
            missing_permissions,
            summary,
            failures,
        }
    }

    /// True when at least one failure could be fixed by remediation.
    pub fn has_remediable(&self) -> bool {
        self.failures.iter().any(|f| f.reason.is_remediable())
    }
}

/// Expand a leading `~/` to the home directory.
pub fn expand_path(target: &str) -> PathBuf {
    if let Some(rest) = target.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(target)
}

pub struct PreflightValidator {
    permissions: Arc<dyn PermissionSource>,
    probe: Arc<dyn SystemProbe>,
}

impl PreflightValidator {
    pub fn new(permissions: Arc<dyn PermissionSource>, probe: Arc<dyn SystemProbe>) -> Self {
        Self { permissions, probe }
    }

    /// Declared checks followed by the implicit ones derived from
    /// `requiredPaths`, `requiredApps` and the privilege tier.
    pub fn checks_for(capability: &Capability) -> Vec<PreflightCheck> {
        let mut checks = capability.preflight_checks.clone();
        for path in &capability.required_paths {
            checks.push(PreflightCheck {
                check_type: PreflightCheckType::PathExists,
                target: path.clone(),
                failure_message: format!("Required path {} does not exist", path),
            });
        }
        for app in &capability.required_apps {
            checks.push(PreflightCheck {
                check_type: PreflightCheckType::AppRunning,
                target: app.clone(),
                failure_message: format!("{} must be running", app),
            });
        }
        match capability.privilege_level {
            PrivilegeLevel::Automation => {
                let targets: Vec<String> = if capability.required_apps.is_empty() {
                    vec!["System Events".to_string()]
                } else {
                    capability.required_apps.clone()
                };
                for app in targets {
                    let declared = checks.iter().any(|c| {
                        c.check_type == PreflightCheckType::AutomationPermission && c.target == app
                    });
                    if !declared {
                        checks.push(PreflightCheck {
                            check_type: PreflightCheckType::AutomationPermission,
                            failure_message: format!("Automation of {} is not allowed", app),
                            target: app,
                        });
                    }
                }
            }
            PrivilegeLevel::FullDiskAccess => checks.push(PreflightCheck {
                check_type: PreflightCheckType::FullDiskAccessPermission,
                target: String::new(),
                failure_message: "Full Disk Access is not granted".to_string(),
            }),
            PrivilegeLevel::Elevated => checks.push(PreflightCheck {
                check_type: PreflightCheckType::AdministratorPermission,
                target: String::new(),
                failure_message: "Administrator authorization is not granted".to_string(),
            }),
            PrivilegeLevel::User => {}
        }
        checks
    }

    pub async fn validate(&self, capability: &Capability) -> PreflightResult {
        let mut failures = Vec::new();
        for check in Self::checks_for(capability) {
            if let Some(reason) = self.evaluate(capability, &check).await {
                failures.push(PreflightFailure {
                    check: check.check_type,
                    target: check.target,
                    reason,
                    message: check.failure_message,
                });
            }
        }
        let result = PreflightResult::from_failures(failures);
        if !result.can_execute {
            log::info!(
                "Preflight for '{}' failed: {}",
                capability.id,
                result.summary
            );
        }
        result
    }

    /// `None` when the check passes.
    async fn evaluate(&self, capability: &Capability, check: &PreflightCheck) -> Option<FailureReason> {
        let unavailable = |e: ProbeError| {
            log::warn!("Preflight probe for '{}' unavailable: {}", check.target, e);
            FailureReason::ProbeUnavailable
        };

        match check.check_type {
            PreflightCheckType::PathExists => {
                let exists = self.probe.path_exists(&expand_path(&check.target)).await;
                (!exists).then_some(FailureReason::PathMissing)
            }
            PreflightCheckType::PathWritable => {
                let writable = self.probe.path_writable(&expand_path(&check.target)).await;
                (!writable).then_some(FailureReason::PathNotWritable)
            }
            PreflightCheckType::AppRunning => match self.probe.app_running(&check.target).await {
                Ok(true) => None,
                Ok(false) => Some(FailureReason::AppNotRunning),
                Err(e) => Some(unavailable(e)),
            },
            PreflightCheckType::AppNotRunning => match self.probe.app_running(&check.target).await {
                Ok(false) => None,
                Ok(true) => Some(FailureReason::AppRunning),
                Err(e) => Some(unavailable(e)),
            },
            PreflightCheckType::DiskSpaceAvailable => {
                let Some(required) = parse_size(&check.target) else {
                    return Some(unavailable(ProbeError::Unavailable(format!(
                        "'{}' is not a size",
                        check.target
                    ))));
                };
                let location = capability
                    .working_directory
                    .as_deref()
                    .map(Path::new)
                    .unwrap_or(Path::new("/"));
                match self.probe.available_space(location).await {
                    Ok(available) if available >= required => None,
                    Ok(_) => Some(FailureReason::InsufficientDiskSpace),
                    Err(e) => Some(unavailable(e)),
                }
            }
            PreflightCheckType::IntegrityProtectionStatus => {
                let expected = check.target.eq_ignore_ascii_case("enabled");
                match self.probe.integrity_protection_enabled().await {
                    Ok(actual) if actual == expected => None,
                    Ok(_) => Some(FailureReason::IntegrityProtectionMismatch),
                    Err(e) => Some(unavailable(e)),
                }
            }
            PreflightCheckType::AutomationPermission => {
                self.permission(Permission::Automation(check.target.clone()))
            }
            PreflightCheckType::FullDiskAccessPermission => {
                self.permission(Permission::FullDiskAccess)
            }
            PreflightCheckType::AdministratorPermission => {
                self.permission(Permission::Administrator)
            }
        }
    }

    fn permission(&self, permission: Permission) -> Option<FailureReason> {
        if self.permissions.is_granted(&permission) {
            None
        } else {
            Some(FailureReason::PermissionMissing(permission))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::FakeProbe;
    use super::*;
    use crate::capability::RiskClass;
    use crate::parser::ParserKind;
    use crate::permissions::StaticPermissions;

    fn capability(level: PrivilegeLevel, checks: Vec<PreflightCheck>) -> Capability {
        Capability {
            id: "test.cap".into(),
            title: "Test".into(),
            description: String::new(),
            group: "test".into(),
            command_template: "/bin/true".into(),
            working_directory: None,
            timeout_secs: 5,
            privilege_level: level,
            risk_class: RiskClass::Safe,
            output_parser: ParserKind::Text,
            parser_pattern: None,
            preflight_checks: checks,
            required_paths: Vec::new(),
            required_apps: Vec::new(),
        }
    }

    fn check(check_type: PreflightCheckType, target: &str) -> PreflightCheck {
        PreflightCheck {
            check_type,
            target: target.into(),
            failure_message: format!("{:?} {} failed", check_type, target),
        }
    }

    fn validator(probe: FakeProbe, perms: StaticPermissions) -> PreflightValidator {
        PreflightValidator::new(Arc::new(perms), Arc::new(probe))
    }

    #[tokio::test]
    async fn passing_checks_allow_execution() {
        let probe = FakeProbe::new()
            .with_path("/var/log")
            .with_running_app("Finder")
            .with_free_space(10 << 30)
            .with_integrity_protection(true);
        let cap = capability(
            PrivilegeLevel::User,
            vec![
                check(PreflightCheckType::PathExists, "/var/log"),
                check(PreflightCheckType::AppRunning, "Finder"),
                check(PreflightCheckType::DiskSpaceAvailable, "1GB"),
                check(PreflightCheckType::IntegrityProtectionStatus, "enabled"),
            ],
        );
        let result = validator(probe, StaticPermissions::new()).validate(&cap).await;
        assert!(result.can_execute, "{}", result.summary);
        assert!(result.failures.is_empty());
    }

    #[tokio::test]
    async fn collects_every_failure_in_order() {
        let probe = FakeProbe::new()
            .with_running_app("Safari")
            .with_free_space(100);
        let mut cap = capability(
            PrivilegeLevel::User,
            vec![
                check(PreflightCheckType::PathWritable, "/nope"),
                check(PreflightCheckType::AppNotRunning, "Safari"),
                check(PreflightCheckType::DiskSpaceAvailable, "1MB"),
            ],
        );
        cap.required_paths = vec!["/missing".into()];
        let result = validator(probe, StaticPermissions::new()).validate(&cap).await;

        assert!(!result.can_execute);
        let reasons: Vec<_> = result.failures.iter().map(|f| f.reason.clone()).collect();
        assert_eq!(
            reasons,
            vec![
                FailureReason::PathNotWritable,
                FailureReason::AppRunning,
                FailureReason::InsufficientDiskSpace,
                FailureReason::PathMissing,
            ]
        );
        assert!(!result.has_remediable());
        assert!(result.summary.contains("Required path /missing does not exist"));
    }

    #[tokio::test]
    async fn automation_tier_requires_permission_per_app() {
        let mut cap = capability(PrivilegeLevel::Automation, Vec::new());
        cap.required_apps = vec!["Safari".into()];
        let probe = FakeProbe::new().with_running_app("Safari");

        let result = validator(probe.clone(), StaticPermissions::new()).validate(&cap).await;
        assert!(!result.can_execute);
        assert_eq!(
            result.missing_permissions,
            vec![Permission::Automation("Safari".into())]
        );
        assert!(result.has_remediable());

        let granted = StaticPermissions::granted(Permission::Automation("Safari".into()));
        assert!(validator(probe, granted).validate(&cap).await.can_execute);
    }

    #[tokio::test]
    async fn elevated_tier_requires_administrator() {
        let cap = capability(PrivilegeLevel::Elevated, Vec::new());
        let result = validator(FakeProbe::new(), StaticPermissions::new())
            .validate(&cap)
            .await;
        assert!(!result.can_execute);
        assert_eq!(result.missing_permissions, vec![Permission::Administrator]);
        assert!(result.has_remediable());

        let granted = StaticPermissions::granted(Permission::Administrator);
        assert!(validator(FakeProbe::new(), granted).validate(&cap).await.can_execute);

        let user = capability(PrivilegeLevel::User, Vec::new());
        assert!(validator(FakeProbe::new(), StaticPermissions::new())
            .validate(&user)
            .await
            .can_execute);
    }

    #[tokio::test]
    async fn full_disk_access_tier_is_checked() {
        let cap = capability(PrivilegeLevel::FullDiskAccess, Vec::new());
        let result = validator(FakeProbe::new(), StaticPermissions::new())
            .validate(&cap)
            .await;
        assert_eq!(result.missing_permissions, vec![Permission::FullDiskAccess]);
    }

    #[tokio::test]
    async fn unavailable_probe_blocks() {
        let cap = capability(
            PrivilegeLevel::User,
            vec![check(PreflightCheckType::IntegrityProtectionStatus, "disabled")],
        );
        let result = validator(FakeProbe::new(), StaticPermissions::new())
            .validate(&cap)
            .await;
        assert_eq!(result.failures[0].reason, FailureReason::ProbeUnavailable);

        let probe = FakeProbe::new().with_integrity_protection(true);
        let result = validator(probe, StaticPermissions::new()).validate(&cap).await;
        assert_eq!(
            result.failures[0].reason,
            FailureReason::IntegrityProtectionMismatch
        );
    }

    #[test]
    fn expands_home() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_path("~/Library"), home.join("Library"));
        }
        assert_eq!(expand_path("/tmp"), PathBuf::from("/tmp"));
    }
}
