use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SILENT_FLAGS: [&str; 8] = [
    "/S",
    "/SILENT",
    "/VERYSILENT",
    "/q",
    "/s",
    "-s",
    "--silent",
    "/quiet",
];

pub const DEFAULT_CHECKPOINT_DESCRIPTION: &str = "Driver Updater - Batch Installation";

/// What an archive payload needs for the item to count as installed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchivePolicy {
    /// Extraction completing is enough; inner failures become warnings.
    #[default]
    Lenient,
    /// Every inner package must install and no entry may be skipped.
    Strict,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Parent of the per-session staging directory; the system temp dir when unset.
    pub staging_root: Option<PathBuf>,
    pub install_timeout_secs: u64,
    pub interactive_timeout_secs: u64,
    pub backup_timeout_secs: u64,
    pub query_timeout_secs: u64,
    pub checkpoint_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub silent_flags: Vec<String>,
    pub checkpoint_description: String,
    pub archive_policy: ArchivePolicy,
    pub rollback_on_failure: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            staging_root: None,
            install_timeout_secs: 300,
            interactive_timeout_secs: 600,
            backup_timeout_secs: 60,
            query_timeout_secs: 120,
            checkpoint_timeout_secs: 120,
            download_timeout_secs: 120,
            silent_flags: DEFAULT_SILENT_FLAGS.iter().map(|f| f.to_string()).collect(),
            checkpoint_description: DEFAULT_CHECKPOINT_DESCRIPTION.to_string(),
            archive_policy: ArchivePolicy::Lenient,
            rollback_on_failure: false,
        }
    }
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&data).with_context(|| format!("loading config {}", path.display()))
    }

    pub fn from_toml_str(data: &str) -> Result<Self> {
        let mut config: EngineConfig = toml::from_str(data)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Trim flags, drop blanks and keep the first occurrence of each.
    pub fn normalize(&mut self) {
        let mut seen = Vec::<String>::new();
        for flag in self.silent_flags.drain(..) {
            let flag = flag.trim().to_string();
            if !flag.is_empty() && !seen.contains(&flag) {
                seen.push(flag);
            }
        }
        self.silent_flags = seen;
    }

    pub fn validate(&self) -> Result<()> {
        let timeouts = [
            ("install_timeout_secs", self.install_timeout_secs),
            ("interactive_timeout_secs", self.interactive_timeout_secs),
            ("backup_timeout_secs", self.backup_timeout_secs),
            ("query_timeout_secs", self.query_timeout_secs),
            ("checkpoint_timeout_secs", self.checkpoint_timeout_secs),
            ("download_timeout_secs", self.download_timeout_secs),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                bail!("{name} must be greater than zero");
            }
        }
        if self.silent_flags.is_empty() {
            bail!("silent_flags must name at least one flag");
        }
        Ok(())
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    pub fn interactive_timeout(&self) -> Duration {
        Duration::from_secs(self.interactive_timeout_secs)
    }

    pub fn backup_timeout(&self) -> Duration {
        Duration::from_secs(self.backup_timeout_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn checkpoint_timeout(&self) -> Duration {
        Duration::from_secs(self.checkpoint_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}
