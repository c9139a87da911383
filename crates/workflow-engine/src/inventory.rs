//! Read-only driver inventory built from the host device query.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use driverpilot_core::{
    Category, DriverRecord, DriverSource, HostInfo, InventorySnapshot, SignatureStatus, UNKNOWN,
};
use driverpilot_host_windows::devices::{DeviceQuery, PnpDeviceRow, SystemDriverRow};
use tracing::{debug, info, warn};

use crate::progress::{CancelToken, Progress, Stage};

const DEFAULT_SYSTEM_ROOT: &str = r"C:\Windows";
const SYSTEM_DRIVER_MANUFACTURER: &str = "Microsoft";

pub struct InventoryCollector {
    query: Arc<dyn DeviceQuery>,
    system_root: String,
}

impl InventoryCollector {
    pub fn new(query: Arc<dyn DeviceQuery>) -> Self {
        let system_root =
            std::env::var("SystemRoot").unwrap_or_else(|_| DEFAULT_SYSTEM_ROOT.to_string());
        Self::with_system_root(query, system_root)
    }

    pub fn with_system_root(query: Arc<dyn DeviceQuery>, system_root: impl Into<String>) -> Self {
        Self {
            query,
            system_root: system_root.into(),
        }
    }

    pub fn scan(&self) -> Vec<DriverRecord> {
        self.scan_with_progress(&mut |_| {}, &CancelToken::new())
    }

    /// Both sub-scans, deduplicated by `(device_id, file_path)` keeping the
    /// first record seen. The query session is released afterwards.
    ///
    /// Cancellation is checked before each sub-scan and between rows; what
    /// was collected up to that point is returned.
    pub fn scan_with_progress(
        &self,
        on_progress: &mut dyn FnMut(Progress),
        cancel: &CancelToken,
    ) -> Vec<DriverRecord> {
        let mut records = Vec::new();
        if !cancel.is_cancelled() {
            on_progress(Progress {
                stage: Stage::Scan,
                index: 1,
                total: 2,
                label: "plug-and-play devices".to_string(),
            });
            records.extend(self.scan_pnp(cancel));
        }
        if !cancel.is_cancelled() {
            on_progress(Progress {
                stage: Stage::Scan,
                index: 2,
                total: 2,
                label: "system drivers".to_string(),
            });
            records.extend(self.scan_system(cancel));
        }
        self.query.release();

        let records = dedupe(records);
        if cancel.is_cancelled() {
            info!(drivers = records.len(), "driver scan cancelled");
        } else {
            info!(drivers = records.len(), "driver scan complete");
        }
        records
    }

    pub fn scan_snapshot(&self, host: HostInfo) -> InventorySnapshot {
        InventorySnapshot::new(host, self.scan())
    }

    fn scan_pnp(&self, cancel: &CancelToken) -> Vec<DriverRecord> {
        match self.query.pnp_devices() {
            Ok(rows) => rows
                .into_iter()
                .take_while(|_| !cancel.is_cancelled())
                .filter_map(pnp_record)
                .collect(),
            Err(err) => {
                warn!(error = %err, "plug-and-play scan unavailable; continuing without it");
                Vec::new()
            }
        }
    }

    fn scan_system(&self, cancel: &CancelToken) -> Vec<DriverRecord> {
        match self.query.system_drivers() {
            Ok(rows) => rows
                .into_iter()
                .take_while(|_| !cancel.is_cancelled())
                .filter_map(|row| system_record(row, &self.system_root))
                .collect(),
            Err(err) => {
                warn!(error = %err, "system driver scan unavailable; continuing without it");
                Vec::new()
            }
        }
    }
}

pub fn dedupe(records: Vec<DriverRecord>) -> Vec<DriverRecord> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(records.len());
    for record in records {
        let key = (record.device_id.clone(), record.file_path.clone());
        if seen.insert(key) {
            out.push(record);
        } else {
            debug!(
                device = %record.device_id,
                path = %record.file_path,
                "duplicate record dropped"
            );
        }
    }
    out
}

/// Records grouped by category, every category present.
pub fn categorize(records: &[DriverRecord]) -> BTreeMap<Category, Vec<&DriverRecord>> {
    let mut groups: BTreeMap<Category, Vec<&DriverRecord>> =
        Category::ORDER.into_iter().map(|c| (c, Vec::new())).collect();
    for record in records {
        groups.entry(record.category).or_default().push(record);
    }
    groups
}

pub fn category_counts(records: &[DriverRecord]) -> BTreeMap<Category, usize> {
    categorize(records)
        .into_iter()
        .map(|(category, members)| (category, members.len()))
        .collect()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn or_unknown(value: Option<String>) -> String {
    non_empty(value).unwrap_or_else(|| UNKNOWN.to_string())
}

fn pnp_record(row: PnpDeviceRow) -> Option<DriverRecord> {
    let device_name = non_empty(row.name)?;
    let device_id = non_empty(row.device_id)?;
    let hardware_id = non_empty(row.hardware_id);
    let manufacturer = non_empty(row.manufacturer).or(non_empty(row.driver_provider_name));
    Some(DriverRecord {
        category: Category::classify(&device_name, hardware_id.as_deref()),
        driver_name: non_empty(row.driver_name).unwrap_or_else(|| device_name.clone()),
        file_path: or_unknown(row.inf_name),
        version: or_unknown(row.driver_version),
        date: normalize_date(row.driver_date.as_deref()),
        status: or_unknown(row.status),
        manufacturer: manufacturer.unwrap_or_else(|| UNKNOWN.to_string()),
        signature: SignatureStatus::from(row.is_signed),
        source: DriverSource::Pnp,
        device_name,
        device_id,
        hardware_id,
    })
}

fn system_record(row: SystemDriverRow, system_root: &str) -> Option<DriverRecord> {
    let name = non_empty(row.name)?;
    let file_path = non_empty(row.path_name)
        .map(|p| normalize_driver_path(&p, system_root))
        .unwrap_or_else(|| UNKNOWN.to_string());
    let signature = match non_empty(row.signature_status).as_deref() {
        Some("Valid") => SignatureStatus::Valid,
        Some(_) => SignatureStatus::Invalid,
        None => SignatureStatus::Unknown,
    };
    Some(DriverRecord {
        category: Category::classify(&name, None),
        device_id: format!("SYS_{name}"),
        driver_name: name.clone(),
        file_path,
        version: or_unknown(row.file_version),
        date: normalize_date(row.file_date.as_deref()),
        status: or_unknown(row.state),
        manufacturer: SYSTEM_DRIVER_MANUFACTURER.to_string(),
        hardware_id: None,
        signature,
        source: DriverSource::System,
        device_name: name,
    })
}

/// `20210301000000.000000-000` or `20210301` become `2021-03-01`; values
/// already in that shape pass through; blanks become "Unknown".
pub fn normalize_date(raw: Option<&str>) -> String {
    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
        return UNKNOWN.to_string();
    };
    let bytes = raw.as_bytes();
    if bytes.len() >= 8 && bytes[..8].iter().all(u8::is_ascii_digit) {
        return format!("{}-{}-{}", &raw[..4], &raw[4..6], &raw[6..8]);
    }
    if bytes.len() >= 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && bytes[..4].iter().all(u8::is_ascii_digit)
    {
        if let Some(day) = raw.get(..10) {
            return day.to_string();
        }
    }
    raw.to_string()
}

/// Resolve the kernel-style prefixes the service control manager reports.
pub fn normalize_driver_path(raw: &str, system_root: &str) -> String {
    let path = raw.trim().trim_matches('"');
    let path = path.strip_prefix(r"\??\").unwrap_or(path);
    let root = system_root.trim_end_matches('\\');

    if let Some(rest) = strip_prefix_ignore_case(path, r"\SystemRoot\") {
        return format!(r"{root}\{rest}");
    }
    if strip_prefix_ignore_case(path, r"System32\").is_some() {
        return format!(r"{root}\{path}");
    }
    path.to_string()
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &value[prefix.len()..])
}
