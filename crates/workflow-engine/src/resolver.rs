//! Manufacturer strategy selection and the resolution pass over an inventory.

use std::collections::HashMap;
use std::sync::Arc;

use driverpilot_core::version::is_newer;
use driverpilot_core::{DriverRecord, UpdateCandidate};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::progress::{CancelToken, Progress, Stage};

/// Strategy keys, in the order they are tried against a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    Nvidia,
    Amd,
    Intel,
    Realtek,
    Microsoft,
    Generic,
}

impl Vendor {
    pub const ORDER: [Vendor; 6] = [
        Vendor::Nvidia,
        Vendor::Amd,
        Vendor::Intel,
        Vendor::Realtek,
        Vendor::Microsoft,
        Vendor::Generic,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Vendor::Nvidia => "nvidia",
            Vendor::Amd => "amd",
            Vendor::Intel => "intel",
            Vendor::Realtek => "realtek",
            Vendor::Microsoft => "microsoft",
            Vendor::Generic => "generic",
        }
    }

    /// First key contained in the manufacturer or device name; `Generic` otherwise.
    pub fn select(record: &DriverRecord) -> Vendor {
        let manufacturer = record.manufacturer.to_lowercase();
        let device = record.device_name.to_lowercase();
        Vendor::ORDER
            .into_iter()
            .find(|vendor| manufacturer.contains(vendor.key()) || device.contains(vendor.key()))
            .unwrap_or(Vendor::Generic)
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("update source unavailable: {0}")]
    Unavailable(String),
    #[error("update source returned unusable data: {0}")]
    Invalid(String),
}

/// The body of one manufacturer strategy. Must not touch the local system.
pub trait UpdateSource: Send + Sync {
    fn lookup(&self, record: &DriverRecord) -> Result<Option<UpdateCandidate>, SourceError>;
}

/// Strategy per vendor. A vendor without a source never yields candidates.
#[derive(Clone, Default)]
pub struct StrategyTable {
    sources: HashMap<Vendor, Arc<dyn UpdateSource>>,
}

impl StrategyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, vendor: Vendor, source: Arc<dyn UpdateSource>) -> Self {
        self.sources.insert(vendor, source);
        self
    }

    pub fn source(&self, vendor: Vendor) -> Option<&Arc<dyn UpdateSource>> {
        self.sources.get(&vendor)
    }
}

pub struct UpdateResolver {
    strategies: StrategyTable,
}

impl UpdateResolver {
    pub fn new(strategies: StrategyTable) -> Self {
        Self { strategies }
    }

    pub fn resolve(&self, record: &DriverRecord) -> Option<UpdateCandidate> {
        let vendor = Vendor::select(record);
        let source = self.strategies.source(vendor)?;
        match source.lookup(record) {
            // Judged against the installed version, not whatever the source
            // put in `current_version`.
            Ok(Some(candidate))
                if candidate.device_id == record.device_id
                    && is_newer(&candidate.new_version, &record.version) =>
            {
                Some(candidate)
            }
            Ok(Some(candidate)) => {
                debug!(
                    device = %record.device_name,
                    offered = %candidate.new_version,
                    current = %record.version,
                    "discarding candidate that is not newer"
                );
                None
            }
            Ok(None) => None,
            Err(err) => {
                warn!(
                    device = %record.device_name,
                    strategy = vendor.key(),
                    error = %err,
                    "update lookup failed"
                );
                None
            }
        }
    }

    /// Records are evaluated in order; `on_progress` runs before each one.
    /// Cancellation stops before the next record and keeps what was found.
    pub fn resolve_all(
        &self,
        records: &[DriverRecord],
        on_progress: &mut dyn FnMut(Progress),
        cancel: &CancelToken,
    ) -> Vec<UpdateCandidate> {
        let total = records.len();
        let mut candidates = Vec::new();
        for (idx, record) in records.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(checked = idx, total, "update check cancelled");
                break;
            }
            on_progress(Progress {
                stage: Stage::Resolve,
                index: idx + 1,
                total,
                label: record.device_name.clone(),
            });
            if let Some(candidate) = self.resolve(record) {
                info!(
                    device = %candidate.device_name,
                    current = %candidate.current_version,
                    new = %candidate.new_version,
                    "update available"
                );
                candidates.push(candidate);
            }
        }
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{candidate, record, FailingSource, FixedVersionSource};

    #[test]
    fn vendor_selection_follows_fixed_order() {
        let mut rec = record("PCI\\1", "NVIDIA GeForce RTX 3070", "NVIDIA", "1.0");
        assert_eq!(Vendor::select(&rec), Vendor::Nvidia);
        rec.manufacturer = "Advanced Micro Devices".to_string();
        rec.device_name = "AMD Radeon RX 6800".to_string();
        assert_eq!(Vendor::select(&rec), Vendor::Amd);
        rec.manufacturer = "Realtek".to_string();
        rec.device_name = "Realtek Audio (Intel SST)".to_string();
        assert_eq!(Vendor::select(&rec), Vendor::Intel);
        rec.manufacturer = "Microsoft".to_string();
        rec.device_name = "Volume".to_string();
        assert_eq!(Vendor::select(&rec), Vendor::Microsoft);
        rec.manufacturer = "Logitech".to_string();
        rec.device_name = "USB Receiver".to_string();
        assert_eq!(Vendor::select(&rec), Vendor::Generic);
    }

    #[test]
    fn newer_version_is_emitted_unchanged_is_not() {
        let rec = record("PCI\\VEN_10DE&DEV_2484", "NVIDIA GeForce RTX 3070", "NVIDIA", "1.0.0.0");

        let newer = UpdateResolver::new(
            StrategyTable::new().with(Vendor::Nvidia, Arc::new(FixedVersionSource("1.0.1.0"))),
        );
        let found = newer.resolve(&rec).unwrap();
        assert_eq!(found.new_version, "1.0.1.0");
        assert!(driverpilot_core::version::is_newer(
            &found.new_version,
            &found.current_version
        ));

        let same = UpdateResolver::new(
            StrategyTable::new().with(Vendor::Nvidia, Arc::new(FixedVersionSource("1.0.0.0"))),
        );
        assert!(same.resolve(&rec).is_none());
    }

    /// Hands back a prebuilt candidate whatever the record says.
    struct PrebuiltSource;

    impl UpdateSource for PrebuiltSource {
        fn lookup(&self, record: &DriverRecord) -> Result<Option<UpdateCandidate>, SourceError> {
            Ok(Some(candidate(&record.device_id, "https://dl.example.invalid/a.inf")))
        }
    }

    #[test]
    fn candidate_must_beat_the_installed_version() {
        let resolver = UpdateResolver::new(
            StrategyTable::new().with(Vendor::Nvidia, Arc::new(PrebuiltSource)),
        );
        // offers 1.0.1.0 and claims 1.0.0.0 is installed
        let older = record("PCI\\1", "NVIDIA GeForce RTX 3070", "NVIDIA", "1.0.0.0");
        assert!(resolver.resolve(&older).is_some());

        let installed_is_newer = record("PCI\\1", "NVIDIA GeForce RTX 3070", "NVIDIA", "2.0.0.0");
        assert!(resolver.resolve(&installed_is_newer).is_none());
    }

    #[test]
    fn failing_strategy_does_not_stop_the_pass() {
        let records = vec![
            record("PCI\\1", "NVIDIA GeForce GTX 1080", "NVIDIA", "1.0"),
            record("PCI\\2", "Intel Wi-Fi 6 AX201", "Intel", "1.0"),
        ];
        let resolver = UpdateResolver::new(
            StrategyTable::new()
                .with(Vendor::Nvidia, Arc::new(FailingSource))
                .with(Vendor::Intel, Arc::new(FixedVersionSource("2.0"))),
        );
        let mut seen = Vec::new();
        let found = resolver.resolve_all(
            &records,
            &mut |p| seen.push((p.index, p.total, p.label)),
            &CancelToken::new(),
        );
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].device_id, "PCI\\2");
        assert_eq!(
            seen,
            vec![
                (1, 2, "NVIDIA GeForce GTX 1080".to_string()),
                (2, 2, "Intel Wi-Fi 6 AX201".to_string())
            ]
        );
    }

    #[test]
    fn cancelled_pass_checks_nothing_more() {
        let records = vec![record("PCI\\1", "Intel GPU", "Intel", "1.0")];
        let resolver = UpdateResolver::new(
            StrategyTable::new().with(Vendor::Intel, Arc::new(FixedVersionSource("2.0"))),
        );
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut calls = 0;
        assert!(resolver
            .resolve_all(&records, &mut |_| calls += 1, &cancel)
            .is_empty());
        assert_eq!(calls, 0);
    }

    #[test]
    fn vendor_without_source_yields_nothing() {
        let rec = record("PCI\\1", "Realtek Audio", "Realtek", "1.0");
        assert!(UpdateResolver::new(StrategyTable::new()).resolve(&rec).is_none());
    }
}
