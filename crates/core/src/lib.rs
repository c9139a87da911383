pub mod model;
pub mod outcome;
pub mod version;

pub use model::{
    CandidateOffer, Category, DownloadTarget, DriverRecord, DriverSource, Priority,
    SignatureStatus, UpdateCandidate, MANUAL_SENTINEL, OS_UPDATE_SENTINEL, UNKNOWN,
};
pub use outcome::{AttemptRecord, BatchSummary, FailureReason, InstallOutcome, InstallState};

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

pub const INVENTORY_SCHEMA_VERSION: &str = "1.0.0";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct InventorySnapshot {
    pub snapshot_id: Uuid,
    pub schema_version: String,
    pub host: HostInfo,
    pub drivers: Vec<DriverRecord>,
    pub generated_at_utc: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HostInfo {
    pub os: String,
    pub os_version: String,
    pub machine: String,
}

impl InventorySnapshot {
    pub fn new(host: HostInfo, drivers: Vec<DriverRecord>) -> Self {
        Self {
            snapshot_id: Uuid::new_v4(),
            schema_version: INVENTORY_SCHEMA_VERSION.to_string(),
            host,
            drivers,
            generated_at_utc: now_utc_rfc3339(),
        }
    }
}

pub fn now_utc_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
