use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

/// Installable payload formats, keyed by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageKind {
    /// `.exe`
    SelfExtracting,
    /// `.msi`
    InstallerDatabase,
    /// `.inf`, `.cat`, `.sys`
    DriverInformation,
    /// `.zip`
    Archive,
}

impl PackageKind {
    pub fn from_extension(ext: &str) -> Option<PackageKind> {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "exe" => Some(PackageKind::SelfExtracting),
            "msi" => Some(PackageKind::InstallerDatabase),
            "inf" | "cat" | "sys" => Some(PackageKind::DriverInformation),
            "zip" => Some(PackageKind::Archive),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<PackageKind> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(PackageKind::from_extension)
    }
}

/// Lowercased extension with its leading dot, or an empty string.
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_default()
}

fn size_pattern() -> Option<&'static Regex> {
    static SIZE: OnceLock<Option<Regex>> = OnceLock::new();
    SIZE.get_or_init(|| Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*(KB|MB|GB)\b").ok())
        .as_ref()
}

/// Parse advisory sizes such as `"500 MB"`, `"1.5GB"` or `"About 2 GB"`
/// (1024-based); the first `<number> <unit>` in the text wins. A bare
/// number is bytes.
pub fn parse_size_string(value: &str) -> Option<u64> {
    let (number, multiplier) = match size_pattern().and_then(|re| re.captures(value)) {
        Some(caps) => {
            let multiplier = match caps[2].to_ascii_uppercase().as_str() {
                "GB" => 1024f64 * 1024.0 * 1024.0,
                "MB" => 1024f64 * 1024.0,
                _ => 1024f64,
            };
            (caps[1].parse::<f64>().ok()?, multiplier)
        }
        None => {
            let bare = value.trim();
            let bare = bare.strip_suffix(['B', 'b']).unwrap_or(bare);
            (bare.trim().parse::<f64>().ok()?, 1f64)
        }
    };
    if !number.is_finite() || number < 0.0 {
        return None;
    }
    Some((number * multiplier).round() as u64)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("payload {0} does not exist")]
    Missing(PathBuf),
    #[error("payload is {actual} bytes, expected about {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("unsupported package type {0:?}")]
    UnsupportedType(String),
}

/// Check a downloaded payload: it exists, its size is within 10% of the
/// advisory size when one parses, and its extension is installable.
pub fn verify_payload(path: &Path, expected_size: &str) -> Result<PackageKind, VerifyError> {
    let metadata = std::fs::metadata(path).map_err(|_| VerifyError::Missing(path.to_path_buf()))?;
    if !metadata.is_file() {
        return Err(VerifyError::Missing(path.to_path_buf()));
    }

    if let Some(expected) = parse_size_string(expected_size).filter(|&n| n > 0) {
        let actual = metadata.len();
        if actual.abs_diff(expected).saturating_mul(10) > expected {
            return Err(VerifyError::SizeMismatch { expected, actual });
        }
    }

    PackageKind::from_path(path).ok_or_else(|| VerifyError::UnsupportedType(extension_of(path)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sizes() {
        assert_eq!(parse_size_string("500 MB"), Some(500 * 1024 * 1024));
        assert_eq!(parse_size_string("1.5GB"), Some(1_610_612_736));
        assert_eq!(parse_size_string("12 kb"), Some(12 * 1024));
        assert_eq!(parse_size_string("42"), Some(42));
        assert_eq!(parse_size_string("512 B"), Some(512));
        assert_eq!(parse_size_string("About 500 MB"), Some(500 * 1024 * 1024));
        assert_eq!(parse_size_string("~2.5 gb (compressed)"), Some(2_684_354_560));
        assert_eq!(parse_size_string("Driver 3.1, 40 MB download"), Some(40 * 1024 * 1024));
        assert_eq!(parse_size_string("Unknown"), None);
        assert_eq!(parse_size_string(""), None);
    }

    #[test]
    fn kinds_by_extension() {
        assert_eq!(
            PackageKind::from_path(Path::new("a/B.EXE")),
            Some(PackageKind::SelfExtracting)
        );
        assert_eq!(
            PackageKind::from_path(Path::new("x.sys")),
            Some(PackageKind::DriverInformation)
        );
        assert_eq!(PackageKind::from_path(Path::new("x.cab")), None);
        assert_eq!(PackageKind::from_path(Path::new("noext")), None);
    }

    #[test]
    fn size_tolerance_is_ten_percent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("driver.exe");
        std::fs::write(&path, vec![0u8; 1000]).unwrap();

        assert_eq!(verify_payload(&path, "1050"), Ok(PackageKind::SelfExtracting));
        assert_eq!(verify_payload(&path, "1100"), Ok(PackageKind::SelfExtracting));
        assert_eq!(
            verify_payload(&path, "2 KB"),
            Err(VerifyError::SizeMismatch {
                expected: 2048,
                actual: 1000
            })
        );
        assert_eq!(
            verify_payload(&path, "approx. 2 KB"),
            Err(VerifyError::SizeMismatch {
                expected: 2048,
                actual: 1000
            })
        );
        // no usable advisory size
        assert_eq!(verify_payload(&path, "Unknown"), Ok(PackageKind::SelfExtracting));
    }

    #[test]
    fn rejects_missing_and_unknown_types() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            verify_payload(&dir.path().join("gone.exe"), ""),
            Err(VerifyError::Missing(_))
        ));

        let cab = dir.path().join("driver.cab");
        std::fs::write(&cab, b"MSCF").unwrap();
        assert_eq!(
            verify_payload(&cab, ""),
            Err(VerifyError::UnsupportedType(".cab".to_string()))
        );
    }
}
