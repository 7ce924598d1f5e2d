use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineResult;
use crate::util::atomic_write;

pub const DATA_DIR_ENV: &str = "CARETAKER_DATA_DIR";

/// Resolve the data directory: explicit path, then `CARETAKER_DATA_DIR`, then
/// the platform data dir. The directory is created if missing.
pub fn resolve_data_dir(explicit: Option<PathBuf>) -> EngineResult<PathBuf> {
    let dir = explicit
        .or_else(|| std::env::var_os(DATA_DIR_ENV).map(PathBuf::from))
        .or_else(|| dirs::data_dir().map(|d| d.join("caretaker")))
        .ok_or_else(|| crate::error::EngineError::Other("no data directory available".into()))?;
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
    /// Ambient variables passed through to children. Everything else is cleared.
    pub env_allowlist: Vec<String>,
    /// Merged over the allowlisted variables.
    pub extra_env: BTreeMap<String, String>,
    /// SIGTERM to SIGKILL delay when terminating a timed-out or cancelled run.
    pub termination_grace_ms: u64,
    /// How long to wait for output pipes to close after the child exits.
    pub drain_timeout_ms: u64,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            env_allowlist: ["PATH", "HOME", "USER", "LANG", "TMPDIR"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            extra_env: BTreeMap::new(),
            termination_grace_ms: 2000,
            drain_timeout_ms: 2000,
        }
    }
}

impl RunnerSettings {
    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// The explicit child environment: allowlisted ambient variables that are
    /// set, overridden by `extra_env`.
    pub fn environment(&self) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = self
            .env_allowlist
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|v| (key.clone(), v)))
            .collect();
        env.extend(self.extra_env.clone());
        env
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperSettings {
    pub socket_path: Option<PathBuf>,
    pub binary_path: Option<PathBuf>,
    pub required_version: String,
    pub public_key_path: Option<PathBuf>,
    pub token_ttl_secs: u64,
    pub max_runtime_secs: u64,
}

impl Default for HelperSettings {
    fn default() -> Self {
        Self {
            socket_path: None,
            binary_path: None,
            required_version: env!("CARGO_PKG_VERSION").to_string(),
            public_key_path: None,
            token_ttl_secs: 30,
            max_runtime_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    pub outputs_dir: Option<PathBuf>,
    pub exports_dir: Option<PathBuf>,
}

/// Engine configuration, stored as `config.json` in the data directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub catalog_path: Option<PathBuf>,
    pub runner: RunnerSettings,
    pub helper: HelperSettings,
    pub audit: AuditSettings,
    #[serde(skip)]
    data_dir: PathBuf,
}

impl EngineConfig {
    pub fn load(data_dir: &Path) -> EngineResult<Self> {
        let path = data_dir.join("config.json");
        let mut config = if path.exists() {
            let data = std::fs::read_to_string(&path)?;
            serde_json::from_str(&data)?
        } else {
            EngineConfig::default()
        };
        config.data_dir = data_dir.to_path_buf();
        Ok(config)
    }

    pub fn save(&self) -> EngineResult<()> {
        let data = serde_json::to_string_pretty(self)?;
        atomic_write(&self.data_dir.join("config.json"), data.as_bytes())?;
        Ok(())
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.catalog_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("capabilities.json"))
    }

    pub fn audit_db_path(&self) -> PathBuf {
        self.data_dir.join("audit.db")
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.audit
            .outputs_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("outputs"))
    }

    pub fn exports_dir(&self) -> PathBuf {
        self.audit
            .exports_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("exports"))
    }

    pub fn helper_socket_path(&self) -> PathBuf {
        self.helper
            .socket_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("helper.sock"))
    }

    pub fn helper_binary_path(&self) -> PathBuf {
        self.helper.binary_path.clone().unwrap_or_else(|| {
            if cfg!(target_os = "macos") {
                PathBuf::from("/Library/PrivilegedHelperTools/caretaker-helper")
            } else {
                PathBuf::from("/usr/local/libexec/caretaker-helper")
            }
        })
    }

    pub fn authority_public_key_path(&self) -> PathBuf {
        self.helper
            .public_key_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("authority.pub"))
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.helper.token_ttl_secs)
    }

    pub fn helper_max_runtime(&self) -> Duration {
        Duration::from_secs(self.helper.max_runtime_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(dir.path()).unwrap();
        assert_eq!(config.catalog_path(), dir.path().join("capabilities.json"));
        assert_eq!(config.outputs_dir(), dir.path().join("outputs"));
        assert_eq!(config.runner.termination_grace(), Duration::from_secs(2));
        assert_eq!(config.helper.token_ttl_secs, 30);
        assert_eq!(config.helper.required_version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn partial_file_keeps_field_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"runner": {"extra_env": {"LC_ALL": "C"}}, "helper": {"max_runtime_secs": 60}}"#,
        )
        .unwrap();
        let config = EngineConfig::load(dir.path()).unwrap();
        assert_eq!(config.runner.extra_env["LC_ALL"], "C");
        assert_eq!(config.runner.drain_timeout_ms, 2000);
        assert!(config.runner.env_allowlist.contains(&"PATH".to_string()));
        assert_eq!(config.helper_max_runtime(), Duration::from_secs(60));
        assert_eq!(config.helper.token_ttl_secs, 30);
    }

    #[test]
    fn save_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::load(dir.path()).unwrap();
        config.catalog_path = Some(PathBuf::from("/etc/caretaker/caps.yaml"));
        config.save().unwrap();

        let reloaded = EngineConfig::load(dir.path()).unwrap();
        assert_eq!(reloaded.catalog_path(), PathBuf::from("/etc/caretaker/caps.yaml"));
    }

    #[test]
    fn environment_is_allowlist_plus_extra() {
        let mut settings = RunnerSettings {
            env_allowlist: vec!["CARETAKER_SURELY_UNSET_VAR".into()],
            ..Default::default()
        };
        settings.extra_env.insert("LC_ALL".into(), "C".into());
        let env = settings.environment();
        assert_eq!(env.len(), 1);
        assert_eq!(env["LC_ALL"], "C");
    }
}
