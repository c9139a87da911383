//! Background workers for the three long-running operations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use driverpilot_content::Downloader;
use driverpilot_core::{BatchSummary, DriverRecord, UpdateCandidate};
use driverpilot_host_windows::devices::DeviceQuery;
use driverpilot_host_windows::process::CommandRunner;
use driverpilot_safety::{can_install, SafetyContext, SafetyDecision};
use thiserror::Error;
use tracing::{info, warn};

use crate::backup::BackupManager;
use crate::batch::BatchOrchestrator;
use crate::config::EngineConfig;
use crate::dispatcher::InstallDispatcher;
use crate::inventory::InventoryCollector;
use crate::progress::{CancelToken, Progress, Stage};
use crate::resolver::{StrategyTable, UpdateResolver};
use crate::session::StagingArea;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("a {0} is already running")]
    Busy(Stage),
    #[error("{0}")]
    Denied(String),
    #[error("worker thread panicked")]
    WorkerPanicked,
    #[error(transparent)]
    Setup(#[from] anyhow::Error),
}

/// Host capabilities shared by every operation.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<EngineConfig>,
    pub runner: Arc<dyn CommandRunner>,
    pub query: Arc<dyn DeviceQuery>,
    pub downloader: Arc<dyn Downloader>,
    pub strategies: StrategyTable,
}

pub struct OperationHandle<T> {
    cancel: CancelToken,
    handle: JoinHandle<T>,
}

impl<T> OperationHandle<T> {
    /// Stops the operation before its next item.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> Result<T, EngineError> {
        self.handle.join().map_err(|_| EngineError::WorkerPanicked)
    }
}

struct BusyGuard(Arc<AtomicBool>);

impl BusyGuard {
    fn acquire(flag: &Arc<AtomicBool>, stage: Stage) -> Result<Self, EngineError> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| EngineError::Busy(stage))?;
        Ok(Self(flag.clone()))
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// At most one scan, one resolution pass and one install batch at a time;
/// a second start of the same operation is rejected, not queued.
pub struct Engine {
    services: Services,
    scanning: Arc<AtomicBool>,
    resolving: Arc<AtomicBool>,
    installing: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(services: Services) -> Self {
        Self {
            services,
            scanning: Arc::new(AtomicBool::new(false)),
            resolving: Arc::new(AtomicBool::new(false)),
            installing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_busy(&self, stage: Stage) -> bool {
        match stage {
            Stage::Scan => &self.scanning,
            Stage::Resolve => &self.resolving,
            Stage::Install => &self.installing,
        }
        .load(Ordering::SeqCst)
    }

    pub fn start_scan<F>(
        &self,
        mut on_progress: F,
    ) -> Result<OperationHandle<Vec<DriverRecord>>, EngineError>
    where
        F: FnMut(Progress) + Send + 'static,
    {
        let guard = BusyGuard::acquire(&self.scanning, Stage::Scan)?;
        let query = self.services.query.clone();
        spawn(Stage::Scan, move |cancel| {
            let _guard = guard;
            InventoryCollector::new(query).scan_with_progress(&mut on_progress, &cancel)
        })
    }

    pub fn start_resolve<F>(
        &self,
        records: Vec<DriverRecord>,
        mut on_progress: F,
    ) -> Result<OperationHandle<Vec<UpdateCandidate>>, EngineError>
    where
        F: FnMut(Progress) + Send + 'static,
    {
        let guard = BusyGuard::acquire(&self.resolving, Stage::Resolve)?;
        let resolver = UpdateResolver::new(self.services.strategies.clone());
        spawn(Stage::Resolve, move |cancel| {
            let _guard = guard;
            resolver.resolve_all(&records, &mut on_progress, &cancel)
        })
    }

    /// The safety gate and staging setup run on the caller's thread so a
    /// refusal is reported before anything is spawned.
    pub fn start_install<F>(
        &self,
        candidates: Vec<UpdateCandidate>,
        safety: &SafetyContext,
        mut on_progress: F,
    ) -> Result<OperationHandle<InstallSession>, EngineError>
    where
        F: FnMut(Progress) + Send + 'static,
    {
        if let SafetyDecision::Deny(reason) = can_install(safety, candidates.len()) {
            return Err(EngineError::Denied(reason));
        }
        let guard = BusyGuard::acquire(&self.installing, Stage::Install)?;
        let services = self.services.clone();
        let staging = StagingArea::create(services.config.staging_root.as_deref())?;

        spawn(Stage::Install, move |cancel| {
            let _guard = guard;
            let config = services.config.as_ref();
            let backups = BackupManager::new(
                services.runner.clone(),
                staging.backups(),
                config.backup_timeout(),
            );
            let summary = {
                let dispatcher = InstallDispatcher::new(
                    config,
                    services.runner.as_ref(),
                    services.downloader.as_ref(),
                    &staging,
                    &backups,
                );
                BatchOrchestrator::new(config, services.runner.as_ref(), dispatcher).run(
                    &candidates,
                    &mut on_progress,
                    &cancel,
                )
            };
            InstallSession {
                summary,
                backups,
                staging,
            }
        })
    }
}

/// A finished install batch that still owns its staging area, so failed
/// items can be rolled back from their backups. The staging area is removed
/// by `close` or when the session is dropped.
pub struct InstallSession {
    summary: BatchSummary,
    backups: BackupManager,
    staging: StagingArea,
}

impl InstallSession {
    pub fn summary(&self) -> &BatchSummary {
        &self.summary
    }

    /// Restores the backup taken for `device_id` in this batch. Only items
    /// whose outcome offers a rollback are eligible; the result is recorded
    /// on that outcome.
    pub fn rollback(&mut self, device_id: &str) -> bool {
        let Some(outcome) = self
            .summary
            .outcomes
            .iter_mut()
            .find(|o| o.candidate.device_id == device_id && o.rollback_available())
        else {
            warn!(device = device_id, "no rollback available for device");
            return false;
        };
        let restored = self.backups.rollback(device_id);
        outcome.rolled_back = Some(restored);
        restored
    }

    /// Removes the staging area and returns the summary. Backup paths are
    /// cleared since they no longer exist.
    pub fn close(self) -> BatchSummary {
        let InstallSession {
            mut summary,
            backups,
            staging,
        } = self;
        drop(backups);
        staging.close();
        for outcome in &mut summary.outcomes {
            outcome.backup_path = None;
        }
        summary
    }
}

fn spawn<T, F>(stage: Stage, work: F) -> Result<OperationHandle<T>, EngineError>
where
    T: Send + 'static,
    F: FnOnce(CancelToken) -> T + Send + 'static,
{
    let cancel = CancelToken::new();
    let token = cancel.clone();
    let handle = thread::Builder::new()
        .name(format!("driverpilot-{stage}"))
        .spawn(move || work(token))
        .map_err(|err| EngineError::Setup(anyhow::Error::new(err).context("spawning worker")))?;
    info!(%stage, "worker started");
    Ok(OperationHandle { cancel, handle })
}
