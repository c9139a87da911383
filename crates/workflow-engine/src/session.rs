use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::{Builder, TempDir};
use tracing::{debug, warn};

/// Session-scoped working directory for downloads, backups and archive
/// extraction. Removed when dropped, including while unwinding.
#[derive(Debug)]
pub struct StagingArea {
    dir: TempDir,
    downloads: PathBuf,
    backups: PathBuf,
    scratch: PathBuf,
}

impl StagingArea {
    pub fn create(root: Option<&Path>) -> Result<Self> {
        let mut builder = Builder::new();
        builder.prefix("driverpilot-");
        let dir = match root {
            Some(root) => {
                fs::create_dir_all(root)
                    .with_context(|| format!("creating staging root {}", root.display()))?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
        .context("creating staging directory")?;

        let downloads = dir.path().join("downloads");
        let backups = dir.path().join("backups");
        let scratch = dir.path().join("scratch");
        for sub in [&downloads, &backups, &scratch] {
            fs::create_dir_all(sub).with_context(|| format!("creating {}", sub.display()))?;
        }
        debug!(path = %dir.path().display(), "staging area created");
        Ok(Self {
            dir,
            downloads,
            backups,
            scratch,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn downloads(&self) -> &Path {
        &self.downloads
    }

    pub fn backups(&self) -> &Path {
        &self.backups
    }

    /// A fresh, empty extraction directory for one archive.
    pub fn scratch_dir(&self, name: &str) -> Result<PathBuf> {
        let base = self.scratch.join(name);
        let mut candidate = base.clone();
        let mut n = 1;
        while candidate.exists() {
            candidate = base.with_file_name(format!("{name}-{n}"));
            n += 1;
        }
        fs::create_dir_all(&candidate)
            .with_context(|| format!("creating {}", candidate.display()))?;
        Ok(candidate)
    }

    pub fn close(self) {
        let path = self.dir.path().to_path_buf();
        if let Err(err) = self.dir.close() {
            warn!(path = %path.display(), error = %err, "staging area cleanup failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removed_on_close_and_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let staging = StagingArea::create(Some(root.path())).unwrap();
        let path = staging.path().to_path_buf();
        assert!(staging.downloads().is_dir());
        assert!(staging.backups().is_dir());
        staging.close();
        assert!(!path.exists());

        let path = {
            let staging = StagingArea::create(Some(root.path())).unwrap();
            staging.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn scratch_dirs_do_not_collide() {
        let staging = StagingArea::create(None).unwrap();
        let a = staging.scratch_dir("pkg").unwrap();
        let b = staging.scratch_dir("pkg").unwrap();
        assert_ne!(a, b);
        assert!(a.is_dir() && b.is_dir());
    }
}
