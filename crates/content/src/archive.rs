use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;
use zip::ZipArchive;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("cannot open archive {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("not a readable zip archive: {0}")]
    Format(#[from] zip::result::ZipError),
    #[error("cannot prepare extraction directory: {0}")]
    Io(#[from] io::Error),
}

/// Files written by [`extract_archive`] plus one warning per entry that was
/// skipped.
#[derive(Debug, Clone, Default)]
pub struct ExtractedArchive {
    pub root: PathBuf,
    pub files: Vec<PathBuf>,
    pub warnings: Vec<String>,
}

impl ExtractedArchive {
    /// Extracted files with the given extension, in a stable order.
    pub fn files_with_extension(&self, ext: &str) -> Vec<PathBuf> {
        let mut matching: Vec<PathBuf> = self
            .files
            .iter()
            .filter(|path| {
                path.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e.eq_ignore_ascii_case(ext))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        matching.sort();
        matching
    }
}

/// Unpack a zip archive under `destination`.
///
/// Only an archive that cannot be opened at all is an error. Individual
/// entries that escape the destination, fail to decompress or fail their
/// checksum are skipped with a warning.
pub fn extract_archive(archive: &Path, destination: &Path) -> Result<ExtractedArchive, ArchiveError> {
    let file = File::open(archive).map_err(|source| ArchiveError::Open {
        path: archive.to_path_buf(),
        source,
    })?;
    let mut zip = ZipArchive::new(file)?;
    fs::create_dir_all(destination)?;

    let mut extracted = ExtractedArchive {
        root: destination.to_path_buf(),
        ..Default::default()
    };

    for index in 0..zip.len() {
        let mut entry = match zip.by_index(index) {
            Ok(entry) => entry,
            Err(err) => {
                extracted.push_warning(format!("entry #{index}: {err}"));
                continue;
            }
        };
        let name = entry.name().to_string();
        let Some(relative) = entry.enclosed_name() else {
            extracted.push_warning(format!("{name}: path escapes the extraction directory"));
            continue;
        };
        let target = destination.join(relative);

        if entry.is_dir() {
            if let Err(err) = fs::create_dir_all(&target) {
                extracted.push_warning(format!("{name}: {err}"));
            }
            continue;
        }

        match write_entry(&mut entry, &target) {
            Ok(()) => extracted.files.push(target),
            Err(err) => {
                let _ = fs::remove_file(&target);
                extracted.push_warning(format!("{name}: {err}"));
            }
        }
    }

    Ok(extracted)
}

impl ExtractedArchive {
    fn push_warning(&mut self, message: String) {
        warn!(%message, "archive entry skipped");
        self.warnings.push(message);
    }
}

fn write_entry<R: Read>(entry: &mut R, target: &Path) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = File::create(target)?;
    io::copy(entry, &mut out)?;
    Ok(())
}
