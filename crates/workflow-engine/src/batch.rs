use driverpilot_core::{BatchSummary, UpdateCandidate};
use driverpilot_host_windows::process::CommandRunner;
use driverpilot_host_windows::system::create_checkpoint;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::dispatcher::InstallDispatcher;
use crate::progress::{CancelToken, Progress, Stage};

/// Runs a selection of updates one after another behind a single restore point.
pub struct BatchOrchestrator<'a> {
    config: &'a EngineConfig,
    runner: &'a dyn CommandRunner,
    dispatcher: InstallDispatcher<'a>,
}

impl<'a> BatchOrchestrator<'a> {
    pub fn new(
        config: &'a EngineConfig,
        runner: &'a dyn CommandRunner,
        dispatcher: InstallDispatcher<'a>,
    ) -> Self {
        Self {
            config,
            runner,
            dispatcher,
        }
    }

    /// Items run in the given order and every one reaches a terminal state
    /// before the next starts. Cancellation is honoured between items.
    pub fn run(
        &self,
        candidates: &[UpdateCandidate],
        on_progress: &mut dyn FnMut(Progress),
        cancel: &CancelToken,
    ) -> BatchSummary {
        let total = candidates.len();
        let checkpoint_created = if cancel.is_cancelled() || candidates.is_empty() {
            false
        } else {
            match create_checkpoint(
                self.runner,
                &self.config.checkpoint_description,
                self.config.checkpoint_timeout(),
            ) {
                Ok(()) => true,
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "restore point not created; continuing");
                    false
                }
            }
        };

        let mut outcomes = Vec::with_capacity(total);
        let mut cancelled = false;
        for (idx, candidate) in candidates.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(done = idx, total, "install batch cancelled");
                cancelled = true;
                break;
            }
            on_progress(Progress {
                stage: Stage::Install,
                index: idx + 1,
                total,
                label: candidate.device_name.clone(),
            });

            let mut outcome = self.dispatcher.install(candidate);
            if self.config.rollback_on_failure && outcome.rollback_available() {
                outcome.rolled_back = Some(self.dispatcher.backups().rollback(&candidate.device_id));
            }
            outcomes.push(outcome);
        }

        let succeeded = outcomes.iter().filter(|o| o.succeeded).count();
        info!(succeeded, total, checkpoint_created, cancelled, "install batch finished");
        BatchSummary {
            succeeded,
            total,
            checkpoint_created,
            cancelled,
            outcomes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupManager;
    use crate::session::StagingArea;
    use crate::testing::{candidate, FakeDownloader, FakeRunner};
    use driverpilot_core::InstallState;
    use driverpilot_host_windows::process::{CommandOutput, CommandSpec};
    use std::sync::Arc;
    use std::time::Duration;

    fn is_checkpoint(spec: &CommandSpec) -> bool {
        spec.program == "powershell" && spec.args.iter().any(|a| a.contains("Checkpoint-Computer"))
    }

    fn run_batch(
        config: &EngineConfig,
        runner: Arc<FakeRunner>,
        items: &[UpdateCandidate],
        cancel: &CancelToken,
    ) -> (BatchSummary, Vec<Progress>) {
        let staging = StagingArea::create(None).unwrap();
        let backups = BackupManager::new(runner.clone(), staging.backups(), Duration::from_secs(60));
        let downloader = FakeDownloader::serving(b"[Version]".to_vec());
        let dispatcher =
            InstallDispatcher::new(config, runner.as_ref(), &downloader, &staging, &backups);
        let mut seen = Vec::new();
        let summary = BatchOrchestrator::new(config, runner.as_ref(), dispatcher).run(
            items,
            &mut |p| seen.push(p),
            cancel,
        );
        (summary, seen)
    }

    fn mixed_batch() -> Vec<UpdateCandidate> {
        vec![
            candidate("PCI\\A", "https://dl.example.invalid/a.inf"),
            candidate("PCI\\B", "generic_update"),
            candidate("PCI\\C", "https://dl.example.invalid/c.inf"),
        ]
    }

    #[test]
    fn outcomes_follow_selection_order() {
        let runner = FakeRunner::ok();
        let (summary, seen) = run_batch(
            &EngineConfig::default(),
            runner.clone(),
            &mixed_batch(),
            &CancelToken::new(),
        );
        assert_eq!((summary.succeeded, summary.total), (2, 3));
        assert!(summary.checkpoint_created);
        assert!(!summary.cancelled);
        let ids: Vec<_> = summary
            .outcomes
            .iter()
            .map(|o| o.candidate.device_id.as_str())
            .collect();
        assert_eq!(ids, ["PCI\\A", "PCI\\B", "PCI\\C"]);
        assert_eq!(summary.outcomes[1].state, InstallState::Failed);
        assert_eq!(seen.iter().map(|p| p.index).collect::<Vec<_>>(), [1, 2, 3]);
        assert!(is_checkpoint(&runner.calls()[0]));
        assert_eq!(runner.calls().iter().filter(|c| is_checkpoint(c)).count(), 1);
    }

    #[test]
    fn checkpoint_failure_does_not_abort() {
        let runner = FakeRunner::new(|spec| {
            Ok(if is_checkpoint(spec) {
                CommandOutput::exited(1)
            } else {
                CommandOutput::exited(0)
            })
        });
        let (summary, _) = run_batch(
            &EngineConfig::default(),
            runner,
            &mixed_batch(),
            &CancelToken::new(),
        );
        assert!(!summary.checkpoint_created);
        assert_eq!(summary.succeeded, 2);
    }

    #[test]
    fn cancelled_before_start_installs_nothing() {
        let runner = FakeRunner::ok();
        let cancel = CancelToken::new();
        cancel.cancel();
        let (summary, seen) =
            run_batch(&EngineConfig::default(), runner.clone(), &mixed_batch(), &cancel);
        assert!(summary.cancelled);
        assert!(summary.outcomes.is_empty());
        assert_eq!(summary.total, 3);
        assert!(seen.is_empty());
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn failed_item_is_rolled_back_when_enabled() {
        let runner = FakeRunner::new(|spec| {
            let installing_payload = spec.args.first().is_some_and(|a| a == "/add-driver")
                && !spec.args.iter().any(|a| a == "/subdirs");
            Ok(if installing_payload {
                CommandOutput::exited(1)
            } else {
                CommandOutput::exited(0)
            })
        });
        let config = EngineConfig {
            rollback_on_failure: true,
            ..EngineConfig::default()
        };
        let items = [candidate("PCI\\A", "https://dl.example.invalid/a.inf")];
        let (summary, _) = run_batch(&config, runner.clone(), &items, &CancelToken::new());
        assert_eq!(summary.outcomes[0].rolled_back, Some(true));
        assert!(runner
            .calls()
            .iter()
            .any(|c| c.args.iter().any(|a| a == "/subdirs")));

        let (summary, _) = run_batch(&EngineConfig::default(), runner, &items, &CancelToken::new());
        assert_eq!(summary.outcomes[0].rolled_back, None);
    }
}
