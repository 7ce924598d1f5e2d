//! Declarative capability model.
//!
//! A capability is one curated maintenance operation: a command template plus
//! the constraints the engine enforces before and around running it. Capabilities
//! are data, loaded from the catalog document; adding an operation never needs a
//! code change.

pub mod catalog;
pub mod template;
pub mod validation;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::parser::ParserKind;

/// Which executor (and which OS privilege) a capability needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PrivilegeLevel {
    User,
    Elevated,
    Automation,
    FullDiskAccess,
}

impl PrivilegeLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrivilegeLevel::User => "user",
            PrivilegeLevel::Elevated => "elevated",
            PrivilegeLevel::Automation => "automation",
            PrivilegeLevel::FullDiskAccess => "fullDiskAccess",
        }
    }
}

impl fmt::Display for PrivilegeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// UI-facing severity label. Independent of the privilege tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskClass {
    Safe,
    Moderate,
    Destructive,
}

impl RiskClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskClass::Safe => "safe",
            RiskClass::Moderate => "moderate",
            RiskClass::Destructive => "destructive",
        }
    }
}

/// Kind of precondition a preflight check validates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PreflightCheckType {
    PathExists,
    PathWritable,
    AppRunning,
    AppNotRunning,
    DiskSpaceAvailable,
    IntegrityProtectionStatus,
    AutomationPermission,
    /// Added implicitly for the `fullDiskAccess` tier; catalogs cannot declare it.
    FullDiskAccessPermission,
    /// Added implicitly for the `elevated` tier; catalogs cannot declare it.
    AdministratorPermission,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightCheck {
    #[serde(rename = "type")]
    pub check_type: PreflightCheckType,
    pub target: String,
    pub failure_message: String,
}

/// Immutable catalog entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capability {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub group: String,
    /// Command line with `{{key}}` placeholders, e.g. `/usr/bin/du -sh {{path}}`.
    pub command_template: String,
    #[serde(default)]
    pub working_directory: Option<String>,
    /// Timeout in seconds.
    #[serde(rename = "timeout")]
    pub timeout_secs: u64,
    pub privilege_level: PrivilegeLevel,
    pub risk_class: RiskClass,
    #[serde(default)]
    pub output_parser: ParserKind,
    #[serde(default)]
    pub parser_pattern: Option<String>,
    #[serde(default)]
    pub preflight_checks: Vec<PreflightCheck>,
    #[serde(default)]
    pub required_paths: Vec<String>,
    #[serde(default)]
    pub required_apps: Vec<String>,
}

impl Capability {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Case-insensitive match against id, title, description and group.
    pub fn matches(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        [&self.id, &self.title, &self.description, &self.group]
            .iter()
            .any(|field| field.to_lowercase().contains(&needle))
    }
}
