use serde::{Deserialize, Serialize};

/// Granted/denied state reported by the OS permission subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum PermissionState {
    Granted,
    Denied,
    /// The user has not been asked yet.
    #[default]
    NotDetermined,
}

/// OS permission types the engine reads before running a capability.
///
/// Automation grants are per target application and serialize as
/// `automation:{app}`, e.g. `automation:Finder`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Permission {
    FullDiskAccess,
    Administrator,
    Automation(String),
}

const KNOWN_PERMISSIONS: &[&str] = &["fullDiskAccess", "administrator", "automation:{app}"];

impl Permission {
    /// The serialized string form of this permission.
    pub fn as_key(&self) -> String {
        match self {
            Permission::FullDiskAccess => "fullDiskAccess".to_string(),
            Permission::Administrator => "administrator".to_string(),
            Permission::Automation(app) => format!("automation:{}", app),
        }
    }

    pub fn description(&self) -> String {
        match self {
            Permission::FullDiskAccess => "Full Disk Access".to_string(),
            Permission::Administrator => "Administrator authorization".to_string(),
            Permission::Automation(app) => format!("Automation of {}", app),
        }
    }

    fn from_key(s: &str) -> Option<Self> {
        match s {
            "fullDiskAccess" => Some(Permission::FullDiskAccess),
            "administrator" => Some(Permission::Administrator),
            _ => s
                .strip_prefix("automation:")
                .filter(|app| !app.is_empty())
                .map(|app| Permission::Automation(app.to_string())),
        }
    }
}

impl Serialize for Permission {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.as_key())
    }
}

impl<'de> Deserialize<'de> for Permission {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Permission::from_key(&s).ok_or_else(|| serde::de::Error::unknown_variant(&s, KNOWN_PERMISSIONS))
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_key())
    }
}
