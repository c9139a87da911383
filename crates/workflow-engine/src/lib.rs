pub mod backup;
pub mod batch;
pub mod catalog;
pub mod config;
pub mod dispatcher;
pub mod inventory;
pub mod progress;
pub mod resolver;
pub mod session;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use anyhow::{Context, Result};
use driverpilot_content::HttpDownloader;
use driverpilot_host_windows::devices::PowerShellDeviceQuery;
use driverpilot_host_windows::process::{CommandRunner, SystemCommandRunner};

pub use backup::BackupManager;
pub use batch::BatchOrchestrator;
pub use catalog::{CatalogEntry, CatalogSource, UpdateCatalog};
pub use config::{ArchivePolicy, EngineConfig};
pub use dispatcher::InstallDispatcher;
pub use inventory::{categorize, category_counts, InventoryCollector};
pub use progress::{CancelToken, Progress, Stage};
pub use resolver::{SourceError, StrategyTable, UpdateResolver, UpdateSource, Vendor};
pub use session::StagingArea;
pub use worker::{Engine, EngineError, InstallSession, OperationHandle, Services};

impl Services {
    /// Real processes, the PowerShell device query and HTTP downloads.
    pub fn system(config: EngineConfig, strategies: StrategyTable) -> Result<Self> {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner);
        let query = Arc::new(PowerShellDeviceQuery::new(
            runner.clone(),
            config.query_timeout(),
        ));
        let downloader =
            HttpDownloader::new(config.download_timeout()).context("building HTTP client")?;
        Ok(Self {
            config: Arc::new(config),
            runner,
            query,
            downloader: Arc::new(downloader),
            strategies,
        })
    }
}
