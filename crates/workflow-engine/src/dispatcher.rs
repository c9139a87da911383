//! Per-item install state machine: download, verify, back up, then run the
//! strategy for the payload kind.

use std::path::Path;
use std::time::Duration;

use driverpilot_content::{
    extract_archive, parse_size_string, payload_file_name, sanitize_component, verify_payload,
    Downloader, PackageKind, VerifyError,
};
use driverpilot_core::{
    AttemptRecord, DownloadTarget, FailureReason, InstallOutcome, InstallState, UpdateCandidate,
};
use driverpilot_host_windows::driver_store::{add_driver, msi_install};
use driverpilot_host_windows::process::{
    CommandError, CommandOutput, CommandRunner, CommandSpec, InstallerExit,
};
use driverpilot_host_windows::space::free_space_bytes;
use driverpilot_host_windows::system::{os_update_command, OS_UPDATE_SUCCEEDED};
use tracing::{debug, info, warn};

use crate::backup::BackupManager;
use crate::config::{ArchivePolicy, EngineConfig};
use crate::session::StagingArea;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Installed {
    Clean,
    RebootPending,
}

type Step = Result<Installed, FailureReason>;

pub struct InstallDispatcher<'a> {
    config: &'a EngineConfig,
    runner: &'a dyn CommandRunner,
    downloader: &'a dyn Downloader,
    staging: &'a StagingArea,
    backups: &'a BackupManager,
}

impl<'a> InstallDispatcher<'a> {
    pub fn new(
        config: &'a EngineConfig,
        runner: &'a dyn CommandRunner,
        downloader: &'a dyn Downloader,
        staging: &'a StagingArea,
        backups: &'a BackupManager,
    ) -> Self {
        Self {
            config,
            runner,
            downloader,
            staging,
            backups,
        }
    }

    pub fn backups(&self) -> &BackupManager {
        self.backups
    }

    /// Drive one candidate to a terminal state. Never panics on installer
    /// behaviour; every failure ends up as a [`FailureReason`].
    pub fn install(&self, candidate: &UpdateCandidate) -> InstallOutcome {
        info!(
            device = %candidate.device_name,
            version = %candidate.new_version,
            "installing update"
        );
        let mut item = ItemRun::new(candidate);
        let result = match &candidate.download_url {
            DownloadTarget::Manual => Err(FailureReason::ManualInstallRequired),
            DownloadTarget::OsUpdate => self.install_os_update(&mut item),
            DownloadTarget::Url(url) if url.trim().is_empty() => {
                Err(FailureReason::MissingDownloadUrl)
            }
            DownloadTarget::Url(url) => self.install_payload(&mut item, url.trim()),
        };
        item.finish(result)
    }

    fn install_os_update(&self, item: &mut ItemRun) -> Step {
        self.back_up(item);
        item.advance(InstallState::Installing);
        let device = &item.outcome.candidate.device_name;
        let spec = os_update_command(device, self.config.install_timeout());
        let out = self
            .run(item, spec)
            .map_err(|err| FailureReason::LaunchFailed(err.to_string()))?;
        match InstallerExit::classify(&out) {
            InstallerExit::RebootRequired => Ok(Installed::RebootPending),
            InstallerExit::TimedOut => Err(FailureReason::Timeout),
            _ => match out.exit_code {
                Some(OS_UPDATE_SUCCEEDED) => Ok(Installed::Clean),
                Some(code) => Err(FailureReason::OsUpdateFailed(code)),
                None => Err(FailureReason::OsUpdateFailed(-1)),
            },
        }
    }

    fn install_payload(&self, item: &mut ItemRun, url: &str) -> Step {
        let candidate = &item.outcome.candidate;
        let file_name = payload_file_name(
            &candidate.manufacturer,
            &candidate.device_name,
            &candidate.new_version,
            url,
        );
        let destination = self.staging.downloads().join(file_name);
        self.check_free_space(item);

        let payload = self
            .downloader
            .fetch(url, &destination)
            .map_err(|err| FailureReason::DownloadFailed(err.to_string()))?;
        item.outcome.payload_sha256 = Some(payload.sha256.clone());

        let kind = verify_payload(&payload.path, &item.outcome.candidate.download_size).map_err(
            |err| match err {
                VerifyError::UnsupportedType(ext) => FailureReason::UnsupportedPackageType(ext),
                other => FailureReason::VerificationFailed(other.to_string()),
            },
        )?;
        item.advance(InstallState::Downloaded);
        debug!(path = %payload.path.display(), bytes = payload.bytes, ?kind, "payload verified");

        self.back_up(item);
        item.advance(InstallState::Installing);

        match kind {
            PackageKind::SelfExtracting => self.install_executable(item, &payload.path),
            PackageKind::InstallerDatabase => self.install_msi(item, &payload.path),
            PackageKind::DriverInformation => self.install_inf(item, &payload.path),
            PackageKind::Archive => self.install_archive(item, &payload.path),
        }
    }

    fn back_up(&self, item: &mut ItemRun) {
        match self.backups.backup(&item.outcome.candidate) {
            Some(path) => item.outcome.backup_path = Some(path),
            None => item.warn("driver backup failed; installing without a backup".to_string()),
        }
        item.advance(InstallState::BackedUp);
    }

    fn check_free_space(&self, item: &mut ItemRun) {
        let Some(needed) = parse_size_string(&item.outcome.candidate.download_size) else {
            return;
        };
        match free_space_bytes(self.staging.path()) {
            Ok(free) if free < needed => item.warn(format!(
                "staging volume has {free} bytes free, payload is about {needed} bytes"
            )),
            Ok(_) => {}
            Err(err) => debug!(error = %err, "free space probe unavailable"),
        }
    }

    /// Silent flags in order, then one unattended run without flags.
    fn install_executable(&self, item: &mut ItemRun, path: &Path) -> Step {
        let program = path.display().to_string();
        for flag in &self.config.silent_flags {
            let timeout = self.config.install_timeout();
            let spec = CommandSpec::new(program.clone(), [flag.clone()], timeout);
            match self.run(item, spec) {
                Ok(out) => match InstallerExit::classify(&out) {
                    InstallerExit::Success => return Ok(Installed::Clean),
                    InstallerExit::RebootRequired => return Ok(Installed::RebootPending),
                    other => debug!(flag = %flag, result = ?other, "silent flag did not install"),
                },
                Err(err) => debug!(flag = %flag, error = %err, "silent flag failed to launch"),
            }
        }

        info!(path = %program, "silent flags exhausted; running installer without flags");
        let timeout = self.config.interactive_timeout();
        let spec = CommandSpec::new(program, Vec::<String>::new(), timeout).with_window();
        match self.run(item, spec) {
            Ok(out) => match InstallerExit::classify(&out) {
                InstallerExit::Success => Ok(Installed::Clean),
                InstallerExit::RebootRequired => Ok(Installed::RebootPending),
                _ => Err(FailureReason::CascadeExhausted),
            },
            Err(_) => Err(FailureReason::CascadeExhausted),
        }
    }

    fn install_msi(&self, item: &mut ItemRun, path: &Path) -> Step {
        let out = self
            .run(item, msi_install(path, self.config.install_timeout()))
            .map_err(|err| FailureReason::LaunchFailed(err.to_string()))?;
        exit_step(&out)
    }

    fn install_inf(&self, item: &mut ItemRun, path: &Path) -> Step {
        let out = self
            .run(item, add_driver(path, self.config.install_timeout()))
            .map_err(|err| FailureReason::LaunchFailed(err.to_string()))?;
        match exit_step(&out)? {
            Installed::Clean => Ok(Installed::Clean),
            Installed::RebootPending => Err(FailureReason::InstallerExitCode(
                driverpilot_host_windows::process::EXIT_REBOOT_REQUIRED,
            )),
        }
    }

    fn install_archive(&self, item: &mut ItemRun, path: &Path) -> Step {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(sanitize_component)
            .unwrap_or_else(|| "archive".to_string());
        let scratch = self
            .staging
            .scratch_dir(&stem)
            .map_err(|err| FailureReason::Staging(format!("{err:#}")))?;
        let extracted = extract_archive(path, &scratch)
            .map_err(|err| FailureReason::ArchiveExtraction(err.to_string()))?;
        for skipped in &extracted.warnings {
            item.warn(format!("archive entry skipped: {skipped}"));
        }

        let infs = extracted.files_with_extension("inf");
        if infs.is_empty() {
            item.warn("archive contains no driver information files".to_string());
        }
        let mut failed = 0;
        for inf in &infs {
            let name = inf
                .strip_prefix(&scratch)
                .unwrap_or(inf)
                .display()
                .to_string();
            match self.run(item, add_driver(inf, self.config.install_timeout())) {
                Ok(out) if out.success() => debug!(inf = %name, "archive member installed"),
                Ok(out) => {
                    failed += 1;
                    item.warn(format!("{name}: {}", describe_exit(&out)));
                }
                Err(err) => {
                    failed += 1;
                    item.warn(format!("{name}: {err}"));
                }
            }
        }

        let skipped = extracted.warnings.len();
        match self.config.archive_policy {
            ArchivePolicy::Strict if failed + skipped > 0 => {
                Err(FailureReason::ArchiveMembersFailed {
                    failed: failed + skipped,
                    total: infs.len() + skipped,
                })
            }
            _ => Ok(Installed::Clean),
        }
    }

    fn run(&self, item: &mut ItemRun, spec: CommandSpec) -> Result<CommandOutput, CommandError> {
        debug!(command = %spec.display(), timeout_secs = spec.timeout.as_secs(), "running");
        let result = self.runner.run(&spec);
        item.record(&spec, &result);
        if let Ok(out) = &result {
            if out.timed_out {
                warn!(command = %spec.display(), "attempt timed out");
            }
        }
        result
    }
}

fn exit_step(out: &CommandOutput) -> Step {
    match InstallerExit::classify(out) {
        InstallerExit::Success => Ok(Installed::Clean),
        InstallerExit::RebootRequired => Ok(Installed::RebootPending),
        InstallerExit::Failure(code) => Err(FailureReason::InstallerExitCode(code)),
        InstallerExit::TimedOut => Err(FailureReason::Timeout),
        InstallerExit::Killed => Err(FailureReason::InstallerExitCode(-1)),
    }
}

fn describe_exit(out: &CommandOutput) -> String {
    match (out.timed_out, out.exit_code) {
        (true, _) => "timed out".to_string(),
        (false, Some(code)) => format!("exit code {code}"),
        (false, None) => "terminated".to_string(),
    }
}

/// Outcome under construction for one candidate.
struct ItemRun {
    outcome: InstallOutcome,
}

impl ItemRun {
    fn new(candidate: &UpdateCandidate) -> Self {
        Self {
            outcome: InstallOutcome {
                candidate: candidate.clone(),
                state: InstallState::NotStarted,
                succeeded: false,
                reboot_required: false,
                backup_path: None,
                failure_reason: None,
                history: vec![InstallState::NotStarted],
                attempts: Vec::new(),
                warnings: Vec::new(),
                payload_sha256: None,
                rolled_back: None,
            },
        }
    }

    fn advance(&mut self, state: InstallState) {
        debug!(device = %self.outcome.candidate.device_name, ?state, "install state");
        self.outcome.state = state;
        self.outcome.history.push(state);
    }

    fn warn(&mut self, message: String) {
        warn!(device = %self.outcome.candidate.device_name, %message);
        self.outcome.warnings.push(message);
    }

    fn record(&mut self, spec: &CommandSpec, result: &Result<CommandOutput, CommandError>) {
        let attempt = match result {
            Ok(out) => AttemptRecord {
                program: spec.program.clone(),
                args: spec.args.clone(),
                exit_code: out.exit_code,
                timed_out: out.timed_out,
                duration_ms: duration_ms(out.duration),
                stdout: out.stdout_str(),
                stderr: out.stderr_str(),
                launch_error: None,
            },
            Err(err) => AttemptRecord {
                program: spec.program.clone(),
                args: spec.args.clone(),
                exit_code: None,
                timed_out: false,
                duration_ms: 0,
                stdout: String::new(),
                stderr: String::new(),
                launch_error: Some(err.to_string()),
            },
        };
        self.outcome.attempts.push(attempt);
    }

    fn finish(mut self, result: Step) -> InstallOutcome {
        let device = self.outcome.candidate.device_name.clone();
        match result {
            Ok(installed) => {
                let reboot = installed == Installed::RebootPending;
                self.outcome.succeeded = true;
                self.outcome.reboot_required = reboot;
                self.advance(if reboot {
                    InstallState::SucceededRebootPending
                } else {
                    InstallState::Succeeded
                });
                info!(device = %device, reboot_required = reboot, "update installed");
            }
            Err(reason) => {
                warn!(device = %device, reason = %reason, "update failed");
                self.outcome.failure_reason = Some(reason);
                self.advance(InstallState::Failed);
            }
        }
        self.outcome
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
