//! Raw device and kernel-driver rows from the host's management interface.
//!
//! Queries are PowerShell CIM scripts piped through `ConvertTo-Json`. The
//! rows are returned unnormalized; cleaning them up is the collector's job.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::process::{CommandRunner, CommandSpec};
use crate::system::powershell;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PnpDeviceRow {
    pub name: Option<String>,
    #[serde(rename = "DeviceID")]
    pub device_id: Option<String>,
    pub status: Option<String>,
    pub manufacturer: Option<String>,
    #[serde(rename = "HardwareID")]
    pub hardware_id: Option<String>,
    pub driver_name: Option<String>,
    pub driver_version: Option<String>,
    /// `yyyyMMdd`, or a raw WMI datetime when the script could not format it.
    pub driver_date: Option<String>,
    pub driver_provider_name: Option<String>,
    pub inf_name: Option<String>,
    pub is_signed: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SystemDriverRow {
    pub name: Option<String>,
    pub path_name: Option<String>,
    pub state: Option<String>,
    pub file_version: Option<String>,
    pub file_date: Option<String>,
    /// Authenticode status name such as `Valid` or `NotSigned`.
    pub signature_status: Option<String>,
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("device query interface unavailable: {0}")]
    Unavailable(String),
    #[error("device query failed (exit {code:?}): {stderr}")]
    Failed { code: Option<i32>, stderr: String },
    #[error("device query timed out")]
    TimedOut,
    #[error("device query returned malformed JSON: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub trait DeviceQuery: Send + Sync {
    fn pnp_devices(&self) -> Result<Vec<PnpDeviceRow>, QueryError>;
    fn system_drivers(&self) -> Result<Vec<SystemDriverRow>, QueryError>;
    /// Drop whatever per-session state the query holds.
    fn release(&self) {}
}

const PROBE_SCRIPT: &str = "$PSVersionTable.PSVersion.Major";

const PNP_SCRIPT: &str = r#"
$ErrorActionPreference = "Stop";
$signed = @{};
Get-CimInstance Win32_PnPSignedDriver | ForEach-Object {
  if ($_.DeviceID) { $signed[$_.DeviceID] = $_ }
};
Get-CimInstance Win32_PnPEntity | Where-Object { $_.Name -and $_.DeviceID } | ForEach-Object {
  $d = $signed[$_.DeviceID];
  [pscustomobject]@{
    Name = $_.Name;
    DeviceID = $_.DeviceID;
    Status = $_.Status;
    Manufacturer = $_.Manufacturer;
    HardwareID = @($_.HardwareID)[0];
    DriverName = if ($d) { $d.DeviceName } else { $null };
    DriverVersion = if ($d) { $d.DriverVersion } else { $null };
    DriverDate = if ($d -and $d.DriverDate) { $d.DriverDate.ToString('yyyyMMdd') } else { $null };
    DriverProviderName = if ($d) { $d.DriverProviderName } else { $null };
    InfName = if ($d) { $d.InfName } else { $null };
    IsSigned = if ($d) { [bool]$d.IsSigned } else { $null }
  }
} | ConvertTo-Json -Depth 3
"#;

const SYSTEM_DRIVER_SCRIPT: &str = r#"
$ErrorActionPreference = "Stop";
Get-CimInstance Win32_SystemDriver | Where-Object { $_.Name -and $_.PathName } | ForEach-Object {
  $path = $_.PathName -replace '^\\\?\?\\', '';
  $path = $path -replace '^\\SystemRoot\\', ($env:SystemRoot + '\');
  $version = $null; $date = $null; $signature = $null;
  try {
    $item = Get-Item -LiteralPath $path -ErrorAction Stop;
    $version = $item.VersionInfo.FileVersion;
    $date = $item.LastWriteTime.ToString('yyyy-MM-dd')
  } catch { }
  try { $signature = [string](Get-AuthenticodeSignature -LiteralPath $path).Status } catch { }
  [pscustomobject]@{
    Name = $_.Name;
    PathName = $_.PathName;
    State = $_.State;
    FileVersion = $version;
    FileDate = $date;
    SignatureStatus = $signature
  }
} | ConvertTo-Json -Depth 3
"#;

#[derive(Debug, Clone, Copy)]
struct Session {
    opened_at: Instant,
}

/// CIM-backed [`DeviceQuery`]. The interpreter is probed once per session;
/// `release` forgets the probe so the next scan starts fresh.
pub struct PowerShellDeviceQuery {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
    session: Mutex<Option<Session>>,
}

impl PowerShellDeviceQuery {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self {
            runner,
            timeout,
            session: Mutex::new(None),
        }
    }

    fn ensure_session(&self) -> Result<(), QueryError> {
        let mut session = self.session.lock().unwrap_or_else(|p| p.into_inner());
        if session.is_some() {
            return Ok(());
        }
        let spec = powershell(PROBE_SCRIPT, self.timeout);
        let out = self
            .runner
            .run(&spec)
            .map_err(|e| QueryError::Unavailable(e.to_string()))?;
        if !out.success() {
            return Err(QueryError::Unavailable(format!(
                "PowerShell probe exited with {:?}",
                out.exit_code
            )));
        }
        debug!(version = %out.stdout_str().trim(), "device query session opened");
        *session = Some(Session {
            opened_at: Instant::now(),
        });
        Ok(())
    }

    fn run_script<T: DeserializeOwned>(&self, script: &str) -> Result<Vec<T>, QueryError> {
        self.ensure_session()?;
        let out = self
            .runner
            .run(&powershell(script, self.timeout))
            .map_err(|e| QueryError::Unavailable(e.to_string()))?;
        if out.timed_out {
            return Err(QueryError::TimedOut);
        }
        if !out.success() {
            return Err(QueryError::Failed {
                code: out.exit_code,
                stderr: out.stderr_str().trim().to_string(),
            });
        }
        Ok(parse_rows(&out.stdout_str())?)
    }
}

impl DeviceQuery for PowerShellDeviceQuery {
    fn pnp_devices(&self) -> Result<Vec<PnpDeviceRow>, QueryError> {
        self.run_script(PNP_SCRIPT)
    }

    fn system_drivers(&self) -> Result<Vec<SystemDriverRow>, QueryError> {
        self.run_script(SYSTEM_DRIVER_SCRIPT)
    }

    fn release(&self) {
        let mut session = self.session.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = session.take() {
            info!(
                held_ms = previous.opened_at.elapsed().as_millis() as u64,
                "device query session released"
            );
        }
    }
}

/// `ConvertTo-Json` emits a bare object for one row and nothing for zero.
pub fn parse_rows<T: DeserializeOwned>(raw: &str) -> Result<Vec<T>, serde_json::Error> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        Ok(Vec::new())
    } else if trimmed.starts_with('[') {
        serde_json::from_str(trimmed)
    } else {
        Ok(vec![serde_json::from_str(trimmed)?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{CommandError, CommandOutput};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedRunner {
        calls: AtomicUsize,
        reply: String,
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let script = spec.args.last().cloned().unwrap_or_default();
            if script.contains("PSVersionTable") {
                return Ok(CommandOutput::exited(0).with_stdout("5"));
            }
            Ok(CommandOutput::exited(0).with_stdout(self.reply.clone()))
        }
    }

    #[test]
    fn single_object_and_empty_output() {
        let one: Vec<SystemDriverRow> =
            parse_rows(r#"{"Name":"disk","PathName":"\\SystemRoot\\x.sys","State":"Running"}"#)
                .unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].name.as_deref(), Some("disk"));

        let none: Vec<SystemDriverRow> = parse_rows("  \r\n").unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn pnp_rows_use_wmi_field_names() {
        let rows: Vec<PnpDeviceRow> = parse_rows(
            r#"[{"Name":"NVIDIA GeForce RTX 3070","DeviceID":"PCI\\VEN_10DE&DEV_2484\\4&1","HardwareID":"PCI\\VEN_10DE&DEV_2484","DriverVersion":"31.0.15.3623","DriverDate":"20230515","InfName":"oem42.inf","IsSigned":true}]"#,
        )
        .unwrap();
        assert_eq!(rows[0].device_id.as_deref(), Some("PCI\\VEN_10DE&DEV_2484\\4&1"));
        assert_eq!(rows[0].inf_name.as_deref(), Some("oem42.inf"));
        assert_eq!(rows[0].is_signed, Some(true));
        assert_eq!(rows[0].status, None);
    }

    #[test]
    fn session_probe_runs_once_until_released() {
        let runner = Arc::new(ScriptedRunner {
            calls: AtomicUsize::new(0),
            reply: "[]".to_string(),
        });
        let query = PowerShellDeviceQuery::new(runner.clone(), Duration::from_secs(5));
        query.pnp_devices().unwrap();
        query.system_drivers().unwrap();
        assert_eq!(runner.calls.load(Ordering::SeqCst), 3);

        query.release();
        query.pnp_devices().unwrap();
        assert_eq!(runner.calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn garbage_output_is_malformed() {
        let runner = Arc::new(ScriptedRunner {
            calls: AtomicUsize::new(0),
            reply: "not json".to_string(),
        });
        let query = PowerShellDeviceQuery::new(runner, Duration::from_secs(5));
        assert!(matches!(query.pnp_devices(), Err(QueryError::Malformed(_))));
    }
}
