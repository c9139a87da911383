use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use driverpilot_content::sanitize_component;
use driverpilot_core::UpdateCandidate;
use driverpilot_host_windows::driver_store::{export_driver, restore_drivers};
use driverpilot_host_windows::process::CommandRunner;
use tracing::{info, warn};

/// Exports the installed driver package before an update replaces it.
pub struct BackupManager {
    runner: Arc<dyn CommandRunner>,
    root: PathBuf,
    timeout: Duration,
    latest: Mutex<HashMap<String, PathBuf>>,
}

impl BackupManager {
    pub fn new(runner: Arc<dyn CommandRunner>, root: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            runner,
            root: root.into(),
            timeout,
            latest: Mutex::new(HashMap::new()),
        }
    }

    /// Export into `<root>/<manufacturer>/<device>`. Failure is logged and
    /// reported as `None`; it never blocks the install.
    pub fn backup(&self, candidate: &UpdateCandidate) -> Option<PathBuf> {
        let dir = self
            .root
            .join(sanitize_component(&candidate.manufacturer))
            .join(sanitize_component(&candidate.device_name));
        if let Err(err) = fs::create_dir_all(&dir) {
            warn!(device = %candidate.device_name, error = %err, "cannot create backup directory");
            return None;
        }

        let spec = export_driver(candidate.driver_package.as_deref(), &dir, self.timeout);
        match self.runner.run(&spec) {
            Ok(out) if out.success() => {
                info!(device = %candidate.device_name, path = %dir.display(), "driver backed up");
                self.latest
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .insert(candidate.device_id.clone(), dir.clone());
                Some(dir)
            }
            Ok(out) => {
                warn!(
                    device = %candidate.device_name,
                    exit_code = ?out.exit_code,
                    timed_out = out.timed_out,
                    "driver backup failed; continuing without it"
                );
                None
            }
            Err(err) => {
                warn!(device = %candidate.device_name, error = %err, "driver backup failed; continuing without it");
                None
            }
        }
    }

    pub fn latest_backup(&self, device_id: &str) -> Option<PathBuf> {
        self.latest
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(device_id)
            .cloned()
    }

    /// Reinstall the packages from the most recent backup of `device_id`.
    pub fn rollback(&self, device_id: &str) -> bool {
        let Some(dir) = self.latest_backup(device_id) else {
            warn!(device = device_id, "no backup recorded; cannot roll back");
            return false;
        };
        self.restore_from(device_id, &dir)
    }

    fn restore_from(&self, device_id: &str, dir: &Path) -> bool {
        match self.runner.run(&restore_drivers(dir, self.timeout)) {
            Ok(out) if out.success() => {
                info!(device = device_id, path = %dir.display(), "driver rolled back");
                true
            }
            Ok(out) => {
                warn!(device = device_id, exit_code = ?out.exit_code, "driver rollback failed");
                false
            }
            Err(err) => {
                warn!(device = device_id, error = %err, "driver rollback failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{candidate, FakeRunner};
    use driverpilot_host_windows::process::CommandOutput;

    #[test]
    fn exports_into_vendor_device_directory() {
        let root = tempfile::tempdir().unwrap();
        let runner = FakeRunner::new(|_| Ok(CommandOutput::exited(0)));
        let manager = BackupManager::new(runner.clone(), root.path(), Duration::from_secs(60));

        let mut item = candidate("PCI\\1", "https://x.invalid/a.exe");
        item.driver_package = Some("oem42.inf".to_string());
        let path = manager.backup(&item).unwrap();

        assert!(path.starts_with(root.path().join("NVIDIA")));
        assert!(path.is_dir());
        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].program, "pnputil");
        assert_eq!(calls[0].args[1], "oem42.inf");
        assert_eq!(calls[0].timeout, Duration::from_secs(60));
        assert_eq!(manager.latest_backup("PCI\\1"), Some(path));
    }

    #[test]
    fn failed_export_is_not_fatal() {
        let root = tempfile::tempdir().unwrap();
        let runner = FakeRunner::new(|_| Ok(CommandOutput::exited(5)));
        let manager = BackupManager::new(runner, root.path(), Duration::from_secs(60));
        assert_eq!(manager.backup(&candidate("PCI\\1", "https://x.invalid/a.exe")), None);
        assert!(!manager.rollback("PCI\\1"));
    }

    #[test]
    fn rollback_restores_latest_backup() {
        let root = tempfile::tempdir().unwrap();
        let runner = FakeRunner::new(|_| Ok(CommandOutput::exited(0)));
        let manager = BackupManager::new(runner.clone(), root.path(), Duration::from_secs(60));
        let dir = manager
            .backup(&candidate("PCI\\1", "https://x.invalid/a.exe"))
            .unwrap();

        assert!(manager.rollback("PCI\\1"));
        let calls = runner.calls();
        assert_eq!(calls[1].args[0], "/add-driver");
        assert!(calls[1].args[1].starts_with(&dir.display().to_string()));
    }
}
