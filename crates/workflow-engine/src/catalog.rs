//! Local JSON update catalog backing the manufacturer strategies.
//!
//! ```json
//! { "entries": [ { "vendor": "nvidia", "device_match": "rtx 3070",
//!                  "version": "31.0.15.4601",
//!                  "download_url": "https://example.invalid/driver.exe",
//!                  "download_size": "650 MB" } ] }
//! ```

use std::path::Path;
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use driverpilot_core::{CandidateOffer, DownloadTarget, DriverRecord, UpdateCandidate};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::resolver::{SourceError, StrategyTable, UpdateSource, Vendor};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub vendor: Vendor,
    /// Case-insensitive substring of the device name.
    #[serde(default)]
    pub device_match: Option<String>,
    /// `VEN_xxxx&DEV_xxxx`, compared against the record's hardware id.
    #[serde(default)]
    pub pci_id: Option<String>,
    pub version: String,
    #[serde(default)]
    pub download_url: Option<DownloadTarget>,
    #[serde(default)]
    pub download_size: Option<String>,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub release_notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCatalog {
    #[serde(default)]
    pub entries: Vec<CatalogEntry>,
}

impl UpdateCatalog {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading catalog {}", path.display()))?;
        Self::from_json_str(&data).with_context(|| format!("parsing catalog {}", path.display()))
    }

    pub fn from_json_str(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }

    /// One catalog-backed source per vendor.
    pub fn into_strategies(self) -> StrategyTable {
        let catalog = Arc::new(self);
        Vendor::ORDER
            .into_iter()
            .fold(StrategyTable::new(), |table, vendor| {
                table.with(
                    vendor,
                    Arc::new(CatalogSource {
                        vendor,
                        catalog: catalog.clone(),
                    }),
                )
            })
    }
}

pub struct CatalogSource {
    vendor: Vendor,
    catalog: Arc<UpdateCatalog>,
}

impl CatalogSource {
    pub fn new(vendor: Vendor, catalog: Arc<UpdateCatalog>) -> Self {
        Self { vendor, catalog }
    }
}

impl UpdateSource for CatalogSource {
    fn lookup(&self, record: &DriverRecord) -> Result<Option<UpdateCandidate>, SourceError> {
        if !vendor_accepts(self.vendor, record) {
            return Ok(None);
        }
        let device = record.device_name.to_lowercase();
        let pci = record
            .hardware_id
            .as_deref()
            .and_then(parse_pci_id)
            .or_else(|| parse_pci_id(&record.device_id));

        let entry = self
            .catalog
            .entries
            .iter()
            .filter(|entry| entry.vendor == self.vendor)
            .find(|entry| entry_matches(entry, &device, pci.as_deref()));
        let Some(entry) = entry else {
            return Ok(None);
        };
        if entry.version.trim().is_empty() {
            return Err(SourceError::Invalid(format!(
                "catalog entry for {:?} has no version",
                self.vendor
            )));
        }

        let download_url = entry.download_url.clone().unwrap_or(match self.vendor {
            Vendor::Microsoft => DownloadTarget::OsUpdate,
            Vendor::Generic => DownloadTarget::Manual,
            _ => DownloadTarget::Url(String::new()),
        });
        let offer = CandidateOffer {
            new_version: entry.version.trim().to_string(),
            download_url,
            download_size: entry
                .download_size
                .clone()
                .unwrap_or_else(|| driverpilot_core::UNKNOWN.to_string()),
            manufacturer: entry
                .manufacturer
                .clone()
                .unwrap_or_else(|| record.manufacturer.clone()),
            release_notes: entry.release_notes.clone(),
        };
        Ok(UpdateCandidate::from_offer(record, offer))
    }
}

fn entry_matches(entry: &CatalogEntry, device: &str, pci: Option<&str>) -> bool {
    let by_name = entry
        .device_match
        .as_deref()
        .map(|m| !m.trim().is_empty() && device.contains(&m.trim().to_lowercase()))
        .unwrap_or(false);
    let by_pci = match (entry.pci_id.as_deref(), pci) {
        (Some(wanted), Some(actual)) => wanted.trim().eq_ignore_ascii_case(actual),
        _ => false,
    };
    by_name || by_pci
}

fn vendor_accepts(vendor: Vendor, record: &DriverRecord) -> bool {
    let device = record.device_name.to_lowercase();
    match vendor {
        Vendor::Nvidia => {
            ["nvidia", "geforce", "quadro"]
                .iter()
                .any(|kw| device.contains(kw))
                && nvidia_series(&device).is_some()
        }
        Vendor::Amd => ["amd", "radeon", "ati"].iter().any(|kw| device.contains(kw)),
        Vendor::Intel => device.contains("intel"),
        Vendor::Realtek => device.contains("realtek"),
        Vendor::Microsoft | Vendor::Generic => true,
    }
}

// (family prefix, pattern); a `None` family means the captures carry it.
fn series_patterns() -> &'static [(Option<&'static str>, Regex)] {
    static PATTERNS: OnceLock<Vec<(Option<&'static str>, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (None, r"geforce\s+(rtx|gtx)\s+(\d+)"),
            (Some("quadro"), r"quadro\s+(\w+)"),
            (Some("tesla"), r"tesla\s+(\w+)"),
        ]
        .into_iter()
        .filter_map(|(family, p)| Regex::new(p).ok().map(|re| (family, re)))
        .collect()
    })
}

/// GPU series such as `rtx 3070` or `quadro p2000` from a lowercased name.
pub fn nvidia_series(device: &str) -> Option<String> {
    series_patterns().iter().find_map(|(family, re)| {
        let caps = re.captures(device)?;
        let model = caps
            .iter()
            .skip(1)
            .flatten()
            .map(|m| m.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        Some(match family {
            Some(family) => format!("{family} {model}"),
            None => model,
        })
    })
}

/// `VEN_10DE&DEV_2484` from a PCI hardware or instance id.
pub fn parse_pci_id(hardware_id: &str) -> Option<String> {
    static PCI: OnceLock<Option<Regex>> = OnceLock::new();
    let re = PCI
        .get_or_init(|| Regex::new(r"(?i)VEN_([0-9A-F]{4})&DEV_([0-9A-F]{4})").ok())
        .as_ref()?;
    let caps = re.captures(hardware_id)?;
    Some(format!(
        "VEN_{}&DEV_{}",
        caps[1].to_ascii_uppercase(),
        caps[2].to_ascii_uppercase()
    ))
}
