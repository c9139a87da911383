use crate::model::UpdateCandidate;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallState {
    NotStarted,
    Downloaded,
    BackedUp,
    Installing,
    Succeeded,
    SucceededRebootPending,
    Failed,
}

impl InstallState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstallState::Succeeded | InstallState::SucceededRebootPending | InstallState::Failed
        )
    }
}

/// Why one update did not install. Every per-item failure maps to exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("missing download URL")]
    MissingDownloadUrl,
    #[error("manual installation required")]
    ManualInstallRequired,
    #[error("download failed: {0}")]
    DownloadFailed(String),
    #[error("download verification failed: {0}")]
    VerificationFailed(String),
    #[error("unsupported package type")]
    UnsupportedPackageType(String),
    #[error("installer exited with code {0}")]
    InstallerExitCode(i32),
    #[error("installer timed out")]
    Timeout,
    #[error("installer could not be started: {0}")]
    LaunchFailed(String),
    #[error("every silent flag and the unattended fallback failed")]
    CascadeExhausted,
    #[error("archive could not be extracted: {0}")]
    ArchiveExtraction(String),
    #[error("{failed} of {total} driver packages in the archive failed")]
    ArchiveMembersFailed { failed: usize, total: usize },
    #[error("OS update agent reported result {0}")]
    OsUpdateFailed(i32),
    #[error("staging area unavailable: {0}")]
    Staging(String),
}

/// One external process invocation made while installing an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub program: String,
    pub args: Vec<String>,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub stdout: String,
    pub stderr: String,
    pub launch_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallOutcome {
    pub candidate: UpdateCandidate,
    pub state: InstallState,
    pub succeeded: bool,
    pub reboot_required: bool,
    pub backup_path: Option<PathBuf>,
    pub failure_reason: Option<FailureReason>,
    /// Every state the item passed through, ending in `state`.
    pub history: Vec<InstallState>,
    pub attempts: Vec<AttemptRecord>,
    pub warnings: Vec<String>,
    pub payload_sha256: Option<String>,
    pub rolled_back: Option<bool>,
}

impl InstallOutcome {
    pub fn reached_backup(&self) -> bool {
        self.history.contains(&InstallState::BackedUp)
    }

    /// A failed item that got past backup with a usable backup can be rolled back.
    pub fn rollback_available(&self) -> bool {
        self.state == InstallState::Failed && self.reached_backup() && self.backup_path.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub total: usize,
    pub checkpoint_created: bool,
    pub cancelled: bool,
    pub outcomes: Vec<InstallOutcome>,
}

impl BatchSummary {
    pub fn reboot_required(&self) -> bool {
        self.outcomes.iter().any(|outcome| outcome.reboot_required)
    }
}
