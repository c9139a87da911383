use anyhow::Result;
use driverpilot_core::{
    now_utc_rfc3339, BatchSummary, Category, DriverRecord, HostInfo, InventorySnapshot,
    INVENTORY_SCHEMA_VERSION,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct ReportPaths {
    pub run_id: String,
    pub root: PathBuf,
    /// `inventory.json` or `outcomes.json`, depending on the report.
    pub payload_json: PathBuf,
    pub run_json: PathBuf,
}

#[derive(Debug, Serialize)]
struct RunMetadata<'a> {
    run_id: &'a str,
    kind: &'a str,
    created_at_utc: String,
    inventory_schema_version: &'a str,
    meta: Option<Value>,
}

#[derive(Debug, Serialize)]
struct InventoryReport<'a> {
    snapshot_id: String,
    scan_date: &'a str,
    host: &'a HostInfo,
    total_drivers: usize,
    categories: &'a BTreeMap<Category, usize>,
    drivers: &'a [DriverRecord],
}

#[derive(Debug, Serialize)]
struct BatchReport<'a> {
    succeeded: usize,
    total: usize,
    checkpoint_created: bool,
    cancelled: bool,
    reboot_required: bool,
    outcomes: &'a [driverpilot_core::InstallOutcome],
}

pub fn create_scan_report(
    base: impl AsRef<Path>,
    snapshot: &InventorySnapshot,
    categories: &BTreeMap<Category, usize>,
    meta: Option<Value>,
) -> Result<ReportPaths> {
    let report = InventoryReport {
        snapshot_id: snapshot.snapshot_id.to_string(),
        scan_date: &snapshot.generated_at_utc,
        host: &snapshot.host,
        total_drivers: snapshot.drivers.len(),
        categories,
        drivers: &snapshot.drivers,
    };
    write_bundle(base.as_ref(), "scan", "inventory.json", &report, meta)
}

pub fn create_install_report(
    base: impl AsRef<Path>,
    summary: &BatchSummary,
    meta: Option<Value>,
) -> Result<ReportPaths> {
    let report = BatchReport {
        succeeded: summary.succeeded,
        total: summary.total,
        checkpoint_created: summary.checkpoint_created,
        cancelled: summary.cancelled,
        reboot_required: summary.reboot_required(),
        outcomes: &summary.outcomes,
    };
    write_bundle(base.as_ref(), "install", "outcomes.json", &report, meta)
}

fn write_bundle<T: Serialize>(
    base: &Path,
    kind: &str,
    file_name: &str,
    payload: &T,
    meta: Option<Value>,
) -> Result<ReportPaths> {
    let run_id = Uuid::new_v4().to_string();
    let root = base.join("reports").join(&run_id);
    std::fs::create_dir_all(&root)?;

    let payload_json = root.join(file_name);
    let run_json = root.join("run.json");

    std::fs::write(&payload_json, serde_json::to_string_pretty(payload)?)?;

    let run_meta = RunMetadata {
        run_id: &run_id,
        kind,
        created_at_utc: now_utc_rfc3339(),
        inventory_schema_version: INVENTORY_SCHEMA_VERSION,
        meta,
    };
    std::fs::write(&run_json, serde_json::to_string_pretty(&run_meta)?)?;

    Ok(ReportPaths {
        run_id,
        root,
        payload_json,
        run_json,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> HostInfo {
        HostInfo {
            os: "windows".to_string(),
            os_version: "10.0.19045".to_string(),
            machine: "BENCH-01".to_string(),
        }
    }

    #[test]
    fn scan_report_lands_under_reports_run_id() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = InventorySnapshot::new(host(), Vec::new());
        let mut categories = BTreeMap::new();
        categories.insert(Category::Graphics, 0usize);

        let paths = create_scan_report(dir.path(), &snapshot, &categories, None).unwrap();
        assert_eq!(paths.root, dir.path().join("reports").join(&paths.run_id));

        let written: Value =
            serde_json::from_str(&std::fs::read_to_string(&paths.payload_json).unwrap()).unwrap();
        assert_eq!(written["total_drivers"], 0);
        assert_eq!(written["categories"]["Graphics"], 0);
        assert_eq!(written["host"]["machine"], "BENCH-01");

        let run: Value =
            serde_json::from_str(&std::fs::read_to_string(&paths.run_json).unwrap()).unwrap();
        assert_eq!(run["kind"], "scan");
    }

    #[test]
    fn install_report_records_totals() {
        let dir = tempfile::tempdir().unwrap();
        let summary = BatchSummary {
            succeeded: 0,
            total: 0,
            checkpoint_created: false,
            cancelled: true,
            outcomes: Vec::new(),
        };
        let paths =
            create_install_report(dir.path(), &summary, Some(serde_json::json!({"dry": true})))
                .unwrap();
        let written: Value =
            serde_json::from_str(&std::fs::read_to_string(&paths.payload_json).unwrap()).unwrap();
        assert_eq!(written["cancelled"], true);
        assert_eq!(written["reboot_required"], false);
        assert!(paths.payload_json.ends_with("outcomes.json"));
    }
}
