use std::path::Path;

use async_trait::async_trait;
use sysinfo::{Disks, System};

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("probe unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Host facts the preflight checks read.
#[async_trait]
pub trait SystemProbe: Send + Sync {
    async fn path_exists(&self, path: &Path) -> bool;

    /// Directories are tested by creating and removing a probe file; files by
    /// opening them for append.
    async fn path_writable(&self, path: &Path) -> bool;

    async fn app_running(&self, app: &str) -> Result<bool, ProbeError>;

    /// Free bytes on the volume holding `path`.
    async fn available_space(&self, path: &Path) -> Result<u64, ProbeError>;

    async fn integrity_protection_enabled(&self) -> Result<bool, ProbeError>;
}

/// Probe backed by the real host: `sysinfo` for processes and disks,
/// `csrutil` for System Integrity Protection.
pub struct HostProbe;

impl HostProbe {
    fn process_matches(process: &sysinfo::Process, app: &str) -> bool {
        let name = process.name().to_string_lossy();
        if name.eq_ignore_ascii_case(app) {
            return true;
        }
        let bundle = format!("/{}.app/", app);
        process
            .exe()
            .is_some_and(|exe| exe.to_string_lossy().contains(&bundle))
    }
}

#[async_trait]
impl SystemProbe for HostProbe {
    async fn path_exists(&self, path: &Path) -> bool {
        tokio::fs::metadata(path).await.is_ok()
    }

    async fn path_writable(&self, path: &Path) -> bool {
        let Ok(meta) = tokio::fs::metadata(path).await else {
            return false;
        };
        if meta.is_dir() {
            let probe = path.join(format!(".caretaker-probe-{}", uuid::Uuid::new_v4()));
            if tokio::fs::write(&probe, b"").await.is_err() {
                return false;
            }
            let _ = tokio::fs::remove_file(&probe).await;
            true
        } else {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(path)
                .await
                .is_ok()
        }
    }

    async fn app_running(&self, app: &str) -> Result<bool, ProbeError> {
        let app = app.to_string();
        tokio::task::spawn_blocking(move || {
            let mut sys = System::new_all();
            sys.refresh_all();
            sys.processes()
                .values()
                .any(|process| HostProbe::process_matches(process, &app))
        })
        .await
        .map_err(|e| ProbeError::Unavailable(e.to_string()))
    }

    async fn available_space(&self, path: &Path) -> Result<u64, ProbeError> {
        let path = tokio::fs::canonicalize(path).await?;
        tokio::task::spawn_blocking(move || {
            let disks = Disks::new_with_refreshed_list();
            disks
                .list()
                .iter()
                .filter(|d| path.starts_with(d.mount_point()))
                .max_by_key(|d| d.mount_point().as_os_str().len())
                .map(|d| d.available_space())
                .ok_or_else(|| {
                    ProbeError::Unavailable(format!("no volume found for {}", path.display()))
                })
        })
        .await
        .map_err(|e| ProbeError::Unavailable(e.to_string()))?
    }

    async fn integrity_protection_enabled(&self) -> Result<bool, ProbeError> {
        let output = tokio::process::Command::new("/usr/bin/csrutil")
            .arg("status")
            .output()
            .await
            .map_err(|e| ProbeError::Unavailable(format!("csrutil: {}", e)))?;
        parse_csrutil(&String::from_utf8_lossy(&output.stdout))
    }
}

fn parse_csrutil(text: &str) -> Result<bool, ProbeError> {
    let text = text.to_ascii_lowercase();
    let status = text
        .split("status:")
        .nth(1)
        .ok_or_else(|| ProbeError::Unavailable("unrecognized csrutil output".into()))?;
    if status.trim_start().starts_with("enabled") {
        Ok(true)
    } else if status.trim_start().starts_with("disabled") {
        Ok(false)
    } else {
        Err(ProbeError::Unavailable("unrecognized csrutil output".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_csrutil_status() {
        assert!(parse_csrutil("System Integrity Protection status: enabled.\n").unwrap());
        assert!(!parse_csrutil("System Integrity Protection status: disabled.\n").unwrap());
        assert!(parse_csrutil("command not found").is_err());
    }

    #[tokio::test]
    async fn host_paths() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f.txt");
        std::fs::write(&file, "x").unwrap();

        let probe = HostProbe;
        assert!(probe.path_exists(dir.path()).await);
        assert!(probe.path_writable(dir.path()).await);
        assert!(probe.path_writable(&file).await);
        assert!(!probe.path_exists(&dir.path().join("missing")).await);
        assert!(!probe.path_writable(&dir.path().join("missing")).await);
        // The probe file is cleaned up
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
