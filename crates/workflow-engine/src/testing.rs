//! In-memory stand-ins for the host, network and update sources.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use driverpilot_content::{sha256_file, DownloadError, DownloadedPayload, Downloader};
use driverpilot_core::{
    Category, DownloadTarget, DriverRecord, DriverSource, Priority, SignatureStatus,
    UpdateCandidate, UNKNOWN,
};
use driverpilot_host_windows::devices::{DeviceQuery, PnpDeviceRow, QueryError, SystemDriverRow};
use driverpilot_host_windows::process::{CommandError, CommandOutput, CommandRunner, CommandSpec};

use crate::resolver::{SourceError, UpdateSource};

type Reply = dyn Fn(&CommandSpec) -> Result<CommandOutput, CommandError> + Send + Sync;

pub struct FakeRunner {
    reply: Box<Reply>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl FakeRunner {
    pub fn new(
        reply: impl Fn(&CommandSpec) -> Result<CommandOutput, CommandError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            reply: Box::new(reply),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Every command succeeds with exit code 0.
    pub fn ok() -> Arc<Self> {
        Self::new(|_| Ok(CommandOutput::exited(0)))
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        self.calls.lock().unwrap().push(spec.clone());
        (self.reply)(spec)
    }
}

pub fn launch_error(spec: &CommandSpec) -> CommandError {
    CommandError::Spawn {
        program: spec.program.clone(),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
    }
}

pub struct FakeQuery {
    pnp: Result<Vec<PnpDeviceRow>, String>,
    system: Result<Vec<SystemDriverRow>, String>,
    releases: AtomicUsize,
}

impl FakeQuery {
    pub fn new(
        pnp: Result<Vec<PnpDeviceRow>, String>,
        system: Result<Vec<SystemDriverRow>, String>,
    ) -> Self {
        Self {
            pnp,
            system,
            releases: AtomicUsize::new(0),
        }
    }

    pub fn unavailable() -> Self {
        Self::new(Err("no shell".to_string()), Err("no shell".to_string()))
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl DeviceQuery for FakeQuery {
    fn pnp_devices(&self) -> Result<Vec<PnpDeviceRow>, QueryError> {
        self.pnp.clone().map_err(QueryError::Unavailable)
    }

    fn system_drivers(&self) -> Result<Vec<SystemDriverRow>, QueryError> {
        self.system.clone().map_err(QueryError::Unavailable)
    }

    fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Serves the same bytes for every URL, or fails every fetch.
pub struct FakeDownloader {
    body: Option<Vec<u8>>,
    fetched: Mutex<Vec<String>>,
}

impl FakeDownloader {
    pub fn serving(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: Some(body.into()),
            fetched: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            body: None,
            fetched: Mutex::new(Vec::new()),
        }
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

impl Downloader for FakeDownloader {
    fn fetch(&self, url: &str, destination: &Path) -> Result<DownloadedPayload, DownloadError> {
        self.fetched.lock().unwrap().push(url.to_string());
        let Some(body) = &self.body else {
            return Err(DownloadError::Http { status: 404 });
        };
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(destination, body)?;
        Ok(DownloadedPayload {
            path: destination.to_path_buf(),
            bytes: body.len() as u64,
            sha256: sha256_file(destination)?,
        })
    }
}

pub struct FailingSource;

impl UpdateSource for FailingSource {
    fn lookup(&self, _record: &DriverRecord) -> Result<Option<UpdateCandidate>, SourceError> {
        Err(SourceError::Unavailable("vendor site down".to_string()))
    }
}

/// Offers one fixed version for every record, newer or not.
pub struct FixedVersionSource(pub &'static str);

impl UpdateSource for FixedVersionSource {
    fn lookup(&self, record: &DriverRecord) -> Result<Option<UpdateCandidate>, SourceError> {
        Ok(Some(UpdateCandidate {
            device_id: record.device_id.clone(),
            device_name: record.device_name.clone(),
            current_version: record.version.clone(),
            new_version: self.0.to_string(),
            download_url: DownloadTarget::Url("https://dl.example.invalid/driver.exe".to_string()),
            download_size: UNKNOWN.to_string(),
            manufacturer: record.manufacturer.clone(),
            category: record.category,
            priority: Priority::for_device(&record.device_name),
            release_notes: None,
            driver_package: None,
        }))
    }
}

pub fn record(device_id: &str, device_name: &str, manufacturer: &str, version: &str) -> DriverRecord {
    DriverRecord {
        device_name: device_name.to_string(),
        driver_name: device_name.to_string(),
        file_path: r"C:\Windows\INF\oem7.inf".to_string(),
        version: version.to_string(),
        date: "2023-01-01".to_string(),
        status: "OK".to_string(),
        manufacturer: manufacturer.to_string(),
        device_id: device_id.to_string(),
        category: Category::classify(device_name, None),
        hardware_id: None,
        signature: SignatureStatus::Valid,
        source: DriverSource::Pnp,
    }
}

pub fn candidate(device_id: &str, url: &str) -> UpdateCandidate {
    UpdateCandidate {
        device_id: device_id.to_string(),
        device_name: "NVIDIA GeForce RTX 3070".to_string(),
        current_version: "1.0.0.0".to_string(),
        new_version: "1.0.1.0".to_string(),
        download_url: DownloadTarget::parse(url),
        download_size: UNKNOWN.to_string(),
        manufacturer: "NVIDIA".to_string(),
        category: Category::Graphics,
        priority: Priority::High,
        release_notes: None,
        driver_package: None,
    }
}
