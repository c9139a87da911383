//! Command lines for the OS driver store and the installer service.

use std::path::Path;
use std::time::Duration;

use crate::process::CommandSpec;

pub const PNPUTIL: &str = "pnputil";
pub const MSIEXEC: &str = "msiexec";

/// Stage and install an `.inf` package.
pub fn add_driver(inf: &Path, timeout: Duration) -> CommandSpec {
    CommandSpec::new(
        PNPUTIL,
        [
            "/add-driver".to_string(),
            inf.display().to_string(),
            "/install".to_string(),
        ],
        timeout,
    )
}

/// Export one published package, or every third-party package when
/// `package` is `None`, into `destination`.
pub fn export_driver(package: Option<&str>, destination: &Path, timeout: Duration) -> CommandSpec {
    CommandSpec::new(
        PNPUTIL,
        [
            "/export-driver".to_string(),
            package.unwrap_or("*").to_string(),
            destination.display().to_string(),
        ],
        timeout,
    )
}

/// Reinstall every package exported into `backup_dir`.
pub fn restore_drivers(backup_dir: &Path, timeout: Duration) -> CommandSpec {
    CommandSpec::new(
        PNPUTIL,
        [
            "/add-driver".to_string(),
            backup_dir.join("*.inf").display().to_string(),
            "/subdirs".to_string(),
            "/install".to_string(),
        ],
        timeout,
    )
}

pub fn msi_install(package: &Path, timeout: Duration) -> CommandSpec {
    CommandSpec::new(
        MSIEXEC,
        [
            "/i".to_string(),
            package.display().to_string(),
            "/quiet".to_string(),
            "/norestart".to_string(),
        ],
        timeout,
    )
}
