use crate::version::is_newer;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const UNKNOWN: &str = "Unknown";

/// Sentinel download value: the OS update agent installs this candidate.
pub const OS_UPDATE_SENTINEL: &str = "windows_update";
/// Sentinel download value: no automatic installation path exists.
pub const MANUAL_SENTINEL: &str = "generic_update";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Category {
    Graphics,
    Audio,
    Network,
    Storage,
    Input,
    System,
    Other,
}

impl Category {
    /// Classification order; the first category whose keywords match wins.
    pub const ORDER: [Category; 7] = [
        Category::Graphics,
        Category::Audio,
        Category::Network,
        Category::Storage,
        Category::Input,
        Category::System,
        Category::Other,
    ];

    pub fn keywords(self) -> &'static [&'static str] {
        match self {
            Category::Graphics => &[
                "display", "graphics", "video", "nvidia", "amd", "intel hd", "radeon",
            ],
            Category::Audio => &[
                "audio", "sound", "speaker", "microphone", "realtek", "hdmi audio",
            ],
            Category::Network => &[
                "network", "ethernet", "wifi", "wireless", "bluetooth", "lan",
            ],
            Category::Storage => &[
                "storage", "disk", "ssd", "hdd", "sata", "nvme", "usb mass",
            ],
            Category::Input => &["keyboard", "mouse", "hid", "input", "touchpad"],
            Category::System => &[
                "system", "chipset", "acpi", "pci", "usb root", "processor",
            ],
            Category::Other => &[],
        }
    }

    pub fn classify(device_name: &str, hardware_id: Option<&str>) -> Category {
        let name = device_name.to_lowercase();
        let hwid = hardware_id.unwrap_or_default().to_lowercase();
        Category::ORDER
            .into_iter()
            .find(|category| {
                category
                    .keywords()
                    .iter()
                    .any(|kw| name.contains(kw) || hwid.contains(kw))
            })
            .unwrap_or(Category::Other)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Graphics => "Graphics",
            Category::Audio => "Audio",
            Category::Network => "Network",
            Category::Storage => "Storage",
            Category::Input => "Input",
            Category::System => "System",
            Category::Other => "Other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    const HIGH: [&'static str; 4] = ["graphics", "display", "security", "chipset"];
    const MEDIUM: [&'static str; 4] = ["audio", "network", "ethernet", "wifi"];

    pub fn for_device(device_name: &str) -> Priority {
        let name = device_name.to_lowercase();
        if Self::HIGH.iter().any(|kw| name.contains(kw)) {
            Priority::High
        } else if Self::MEDIUM.iter().any(|kw| name.contains(kw)) {
            Priority::Medium
        } else {
            Priority::Low
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureStatus {
    Valid,
    Invalid,
    Unknown,
}

impl From<Option<bool>> for SignatureStatus {
    fn from(value: Option<bool>) -> Self {
        match value {
            Some(true) => SignatureStatus::Valid,
            Some(false) => SignatureStatus::Invalid,
            None => SignatureStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverSource {
    Pnp,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverRecord {
    pub device_name: String,
    pub driver_name: String,
    pub file_path: String,
    pub version: String,
    pub date: String,
    pub status: String,
    pub manufacturer: String,
    pub device_id: String,
    pub category: Category,
    pub hardware_id: Option<String>,
    pub signature: SignatureStatus,
    pub source: DriverSource,
}

impl DriverRecord {
    pub fn dedup_key(&self) -> (&str, &str) {
        (&self.device_id, &self.file_path)
    }

    /// Published driver package name (`oemNN.inf`) when the record points at one.
    pub fn driver_package(&self) -> Option<&str> {
        let name = self
            .file_path
            .rsplit(&['\\', '/'][..])
            .next()
            .unwrap_or_default();
        let is_inf = name
            .rsplit_once('.')
            .map(|(_, ext)| ext.eq_ignore_ascii_case("inf"))
            .unwrap_or(false);
        is_inf.then_some(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DownloadTarget {
    Url(String),
    OsUpdate,
    Manual,
}

impl DownloadTarget {
    pub fn parse(value: &str) -> DownloadTarget {
        match value.trim() {
            OS_UPDATE_SENTINEL => DownloadTarget::OsUpdate,
            MANUAL_SENTINEL => DownloadTarget::Manual,
            other => DownloadTarget::Url(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            DownloadTarget::Url(url) => url,
            DownloadTarget::OsUpdate => OS_UPDATE_SENTINEL,
            DownloadTarget::Manual => MANUAL_SENTINEL,
        }
    }
}

impl From<String> for DownloadTarget {
    fn from(value: String) -> Self {
        DownloadTarget::parse(&value)
    }
}

impl From<DownloadTarget> for String {
    fn from(value: DownloadTarget) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCandidate {
    pub device_id: String,
    pub device_name: String,
    pub current_version: String,
    pub new_version: String,
    pub download_url: DownloadTarget,
    pub download_size: String,
    pub manufacturer: String,
    pub category: Category,
    pub priority: Priority,
    pub release_notes: Option<String>,
    pub driver_package: Option<String>,
}

/// Fields a strategy supplies; the rest is copied from the driver record.
#[derive(Debug, Clone)]
pub struct CandidateOffer {
    pub new_version: String,
    pub download_url: DownloadTarget,
    pub download_size: String,
    pub manufacturer: String,
    pub release_notes: Option<String>,
}

impl UpdateCandidate {
    /// Returns `None` unless the offered version is strictly newer than the installed one.
    pub fn from_offer(record: &DriverRecord, offer: CandidateOffer) -> Option<UpdateCandidate> {
        if !is_newer(&offer.new_version, &record.version) {
            return None;
        }
        Some(UpdateCandidate {
            device_id: record.device_id.clone(),
            device_name: record.device_name.clone(),
            current_version: record.version.clone(),
            new_version: offer.new_version,
            download_url: offer.download_url,
            download_size: offer.download_size,
            manufacturer: offer.manufacturer,
            category: record.category,
            priority: Priority::for_device(&record.device_name),
            release_notes: offer.release_notes,
            driver_package: record.driver_package().map(str::to_string),
        })
    }

    pub fn is_valid(&self) -> bool {
        is_newer(&self.new_version, &self.current_version)
    }
}
