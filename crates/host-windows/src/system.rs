//! PowerShell-driven host operations: restore points, the OS update agent
//! and the pending-reboot probe.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::process::{CommandRunner, CommandSpec};

pub const POWERSHELL: &str = "powershell";

/// Result code the update agent reports for a successful install.
pub const OS_UPDATE_SUCCEEDED: i32 = 2;

pub fn powershell(script: &str, timeout: Duration) -> CommandSpec {
    CommandSpec::new(
        POWERSHELL,
        [
            "-NoProfile",
            "-NonInteractive",
            "-ExecutionPolicy",
            "Bypass",
            "-Command",
            script,
        ],
        timeout,
    )
}

/// Single-quoted PowerShell literal.
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub fn checkpoint_command(description: &str, timeout: Duration) -> CommandSpec {
    let script = format!(
        "Checkpoint-Computer -Description {} -RestorePointType 'MODIFY_SETTINGS'",
        quote(description)
    );
    powershell(&script, timeout)
}

/// Create a system restore point. Callers treat failure as advisory.
pub fn create_checkpoint(
    runner: &dyn CommandRunner,
    description: &str,
    timeout: Duration,
) -> Result<()> {
    let out = runner
        .run(&checkpoint_command(description, timeout))
        .context("launching restore point creation")?;
    if out.success() {
        info!(description, "system restore point created");
        Ok(())
    } else if out.timed_out {
        Err(anyhow!("restore point creation timed out"))
    } else {
        Err(anyhow!(
            "restore point creation exited with {:?}: {}",
            out.exit_code,
            out.stderr_str().trim()
        ))
    }
}

const OS_UPDATE_TEMPLATE: &str = r#"
$ErrorActionPreference = "Stop";
$name = __DEVICE__;
$pattern = '*' + [WildcardPattern]::Escape($name) + '*';
$session = New-Object -ComObject Microsoft.Update.Session;
$searcher = $session.CreateUpdateSearcher();
$result = $searcher.Search("IsInstalled=0 and Type='Driver'");
foreach ($update in $result.Updates) {
  if ($update.Title -like $pattern) {
    $batch = New-Object -ComObject Microsoft.Update.UpdateColl;
    [void]$batch.Add($update);
    $downloader = $session.CreateUpdateDownloader();
    $downloader.Updates = $batch;
    [void]$downloader.Download();
    $installer = $session.CreateUpdateInstaller();
    $installer.Updates = $batch;
    $install = $installer.Install();
    if ($install.ResultCode -eq 2 -and $install.RebootRequired) { exit 3010 }
    exit $install.ResultCode
  }
}
exit 1
"#;

/// Search the OS update agent for a driver update whose title mentions
/// `device_name` and install it. The process exits with the agent's
/// result code, or 3010 when it succeeded but wants a reboot.
pub fn os_update_command(device_name: &str, timeout: Duration) -> CommandSpec {
    let script = OS_UPDATE_TEMPLATE.replace("__DEVICE__", &quote(device_name));
    powershell(&script, timeout)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingReboot {
    #[serde(rename = "WindowsUpdate")]
    pub windows_update: bool,
    #[serde(rename = "ComponentServicing")]
    pub component_servicing: bool,
    #[serde(rename = "FileRename")]
    pub file_rename: bool,
}

impl PendingReboot {
    pub fn any(&self) -> bool {
        self.windows_update || self.component_servicing || self.file_rename
    }
}

const PENDING_REBOOT_SCRIPT: &str = r#"
$wu = Test-Path 'HKLM:\SOFTWARE\Microsoft\Windows\CurrentVersion\WindowsUpdate\Auto Update\RebootRequired';
$cbs = Test-Path 'HKLM:\SOFTWARE\Microsoft\Windows\CurrentVersion\Component Based Servicing\RebootPending';
$pfr = $null -ne (Get-ItemProperty -Path 'HKLM:\SYSTEM\CurrentControlSet\Control\Session Manager' -Name PendingFileRenameOperations -ErrorAction SilentlyContinue);
[pscustomobject]@{ WindowsUpdate = $wu; ComponentServicing = $cbs; FileRename = $pfr } | ConvertTo-Json
"#;

pub fn pending_reboot(runner: &dyn CommandRunner, timeout: Duration) -> Result<PendingReboot> {
    let out = runner
        .run(&powershell(PENDING_REBOOT_SCRIPT, timeout))
        .context("launching pending reboot probe")?;
    if !out.success() {
        warn!(exit = ?out.exit_code, "pending reboot probe failed");
        return Err(anyhow!(
            "pending reboot probe exited with {:?}",
            out.exit_code
        ));
    }
    serde_json::from_str(out.stdout_str().trim()).context("parsing pending reboot probe output")
}
