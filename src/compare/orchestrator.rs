//! Drives every pair through validation and dispatch under a bounded pool.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::dispatcher::{WorkerDispatcher, WorkerLauncher, panic_message};
use super::types::{CompareConfig, PairOutcome, TestPair, WorkerJob};
use super::validator::{PairValidator, Validation};
use crate::config::CompareSettings;
use crate::report::{RecordId, Report, Reporter};
use crate::stub::{FailureStubWriter, PlaceholderStubWriter};

/// Run-level failures; pair-level problems never surface here
#[derive(Debug, thiserror::Error)]
pub enum CompareError {
    #[error("the comparison pool failed: {0}")]
    Pool(String),
}

/// State shared by every pair task of a run
struct RunContext<L> {
    dispatcher: Arc<WorkerDispatcher<L>>,
    stub_writer: Arc<dyn FailureStubWriter>,
    project_path: PathBuf,
    output_options: serde_json::Value,
    force_diff_png: bool,
    scenario_counts: HashMap<(String, String), usize>,
}

/// Compares a whole [`CompareConfig`] and produces its [`Report`]
pub struct Orchestrator<L> {
    settings: CompareSettings,
    dispatcher: Arc<WorkerDispatcher<L>>,
    stub_writer: Arc<dyn FailureStubWriter>,
}

impl<L: WorkerLauncher> Orchestrator<L> {
    pub fn new(settings: CompareSettings, launcher: L) -> Self {
        let dispatcher = WorkerDispatcher::new(launcher, settings.compare_timeout);
        Self {
            settings,
            dispatcher: Arc::new(dispatcher),
            stub_writer: Arc::new(PlaceholderStubWriter::new()),
        }
    }

    /// Replace the placeholder writer used for missing references
    pub fn with_stub_writer(mut self, stub_writer: Arc<dyn FailureStubWriter>) -> Self {
        self.stub_writer = stub_writer;
        self
    }

    pub fn settings(&self) -> &CompareSettings {
        &self.settings
    }

    pub fn dispatcher(&self) -> &WorkerDispatcher<L> {
        &self.dispatcher
    }

    /// Process every pair and return the finished report.
    ///
    /// Pairs start in input order, at most `effective_limit()` at a time, and
    /// may finish in any order. Every pair gets exactly one terminal record.
    pub async fn run(&self, config: CompareConfig) -> Result<Report, CompareError> {
        match self.run_pool(config).await {
            Ok(report) => Ok(report),
            Err(e) => {
                log::error!("The comparison failed with error: {}", e);
                Err(e)
            }
        }
    }

    async fn run_pool(&self, config: CompareConfig) -> Result<Report, CompareError> {
        let limit = self.settings.effective_limit();
        let reporter = Reporter::new(self.settings.test_suite_name.clone(), self.settings.id.clone());
        let ctx = Arc::new(RunContext {
            dispatcher: Arc::clone(&self.dispatcher),
            stub_writer: Arc::clone(&self.stub_writer),
            project_path: self.settings.project_path.clone(),
            output_options: self.settings.output_options.clone(),
            force_diff_png: self.settings.force_diff_png,
            scenario_counts: config.scenario_counts(),
        });

        log::debug!("comparing {} pairs, {} at a time", config.len(), limit);

        let pool = Arc::new(Semaphore::new(limit));
        let mut tasks: JoinSet<(RecordId, PairOutcome)> = JoinSet::new();

        for pair in config.test_pairs {
            let permit = Arc::clone(&pool)
                .acquire_owned()
                .await
                .map_err(|e| CompareError::Pool(e.to_string()))?;

            let record = reporter.add_test(&pair);
            let ctx = Arc::clone(&ctx);
            tasks.spawn(async move {
                let label = format!("{} {}", pair.label, pair.file_name);
                // The pair runs in its own task so a panic is contained to it
                let outcome = match tokio::spawn(async move { compare_pair(ctx, pair).await }).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        let message = if e.is_panic() {
                            format!("comparison task panicked: {}", panic_message(e.into_panic()))
                        } else {
                            format!("comparison task did not finish: {e}")
                        };
                        log::error!("{}: {}", label, message);
                        PairOutcome::failed(message)
                    }
                };
                drop(permit);
                (record, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (record, outcome) = joined.map_err(|e| CompareError::Pool(e.to_string()))?;
            reporter.finish(record, outcome);
        }

        Ok(reporter.into_report())
    }
}

impl<L> RunContext<L> {
    fn validate(&self, pair: &TestPair) -> Validation {
        PairValidator::new(
            &self.project_path,
            self.force_diff_png,
            &self.scenario_counts,
            self.stub_writer.as_ref(),
        )
        .validate(pair)
    }
}

/// Validate one pair and, if it is sound, compare it in a worker.
///
/// Validation touches the filesystem and may render a stub, so it runs on the
/// blocking pool. Dispatch failures are recorded as the pair's error and force
/// a fail status.
async fn compare_pair<L: WorkerLauncher>(ctx: Arc<RunContext<L>>, pair: TestPair) -> PairOutcome {
    let validation = {
        let ctx = Arc::clone(&ctx);
        let pair = pair.clone();
        tokio::task::spawn_blocking(move || ctx.validate(&pair)).await
    };
    let validation = match validation {
        Ok(validation) => validation,
        Err(e) => {
            let message = if e.is_panic() {
                format!("validation panicked: {}", panic_message(e.into_panic()))
            } else {
                format!("validation did not finish: {e}")
            };
            log::error!("{} {}: {}", pair.label, pair.file_name, message);
            return PairOutcome::failed(message);
        }
    };

    let (reference_path, test_path) = match validation {
        Validation::Proceed {
            reference_path,
            test_path,
        } => (reference_path, test_path),
        Validation::Fail(err) => {
            log::error!("{} {}: {}", pair.label, pair.file_name, err);
            return PairOutcome::failed(err.to_string());
        }
    };

    let job = WorkerJob {
        reference_path,
        test_path,
        output_settings: ctx.output_options.clone(),
        pair,
        force_diff_png: ctx.force_diff_png,
    };

    match ctx.dispatcher.dispatch(job).await {
        Ok(outcome) => outcome,
        Err(e) => {
            log::error!("{}", e);
            PairOutcome::failed(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::dispatcher::TaskLauncher;
    use crate::compare::types::{DiffStats, TestStatus, WorkerReply};
    use crate::stub::StubError;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Mutex, mpsc};
    use std::time::Duration;

    fn settings(dir: &std::path::Path) -> CompareSettings {
        CompareSettings::defaults()
            .project_path(dir)
            .async_compare_limit(2)
            .id("unit")
    }

    #[tokio::test]
    async fn test_empty_config_gives_empty_report() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(settings(dir.path()), TaskLauncher::pixel_diff());

        let report = orchestrator.run(CompareConfig::default()).await.unwrap();
        assert!(report.tests.is_empty());
        assert_eq!(report.id, "unit");
    }

    #[tokio::test]
    async fn test_huge_limit_still_runs() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(
            settings(dir.path()).async_compare_limit(usize::MAX),
            TaskLauncher::pixel_diff(),
        );

        let config = CompareConfig::new(vec![TestPair::new("home", "phone", "r.png", "t.png")]);
        let report = orchestrator.run(config).await.unwrap();
        assert_eq!(report.tests.len(), 1);
        assert_eq!(report.tests[0].status, TestStatus::Fail);
    }

    #[tokio::test]
    async fn test_job_error_forces_fail() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("r.png"), b"x").unwrap();
        std::fs::write(dir.path().join("t.png"), b"x").unwrap();

        let launcher = TaskLauncher::new(|_job| Err("native decoder fault".to_string()));
        let orchestrator = Orchestrator::new(settings(dir.path()), launcher);
        let config = CompareConfig::new(vec![TestPair::new("home", "phone", "r.png", "t.png")]);

        let report = orchestrator.run(config).await.unwrap();
        assert_eq!(report.tests[0].status, TestStatus::Fail);
        assert!(report.tests[0].error.as_deref().unwrap().contains("native decoder fault"));
    }

    #[tokio::test]
    async fn test_pending_reply_forces_fail() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("r.png"), b"x").unwrap();
        std::fs::write(dir.path().join("t.png"), b"x").unwrap();

        let launcher = TaskLauncher::new(|_job| {
            Ok(serde_json::from_str(r#"{"status":"pending","diff":{}}"#).unwrap())
        });
        let orchestrator = Orchestrator::new(settings(dir.path()), launcher);
        let config = CompareConfig::new(vec![TestPair::new("home", "phone", "r.png", "t.png")]);

        let report = orchestrator.run(config).await.unwrap();
        assert_eq!(report.tests[0].status, TestStatus::Fail);
        assert!(report.tests[0].error.as_deref().unwrap().contains("without a final status"));
        assert_eq!(report.failed(), 1);
    }

    /// Blocks inside the stub write until another pair's job has started
    struct WaitingStubWriter {
        started: Mutex<mpsc::Receiver<()>>,
        saw_other_pair: AtomicBool,
    }

    impl FailureStubWriter for WaitingStubWriter {
        fn store_failed_stub(&self, test_path: &Path, _force_diff_png: bool) -> Result<PathBuf, StubError> {
            let started = self.started.lock().unwrap().recv_timeout(Duration::from_secs(5));
            self.saw_other_pair.store(started.is_ok(), Ordering::SeqCst);
            Ok(test_path.to_path_buf())
        }
    }

    #[tokio::test]
    async fn test_slow_validation_does_not_stall_other_pairs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a_t.png"), b"x").unwrap();
        std::fs::write(dir.path().join("b_r.png"), b"x").unwrap();
        std::fs::write(dir.path().join("b_t.png"), b"x").unwrap();

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let launcher = TaskLauncher::new(move |_job| {
            let _ = tx.lock().unwrap().send(());
            Ok(WorkerReply {
                status: TestStatus::Pass,
                diff: DiffStats::default(),
                diff_image: None,
            })
        });
        let stub = Arc::new(WaitingStubWriter {
            started: Mutex::new(rx),
            saw_other_pair: AtomicBool::new(false),
        });
        let orchestrator = Orchestrator::new(settings(dir.path()), launcher)
            .with_stub_writer(Arc::clone(&stub) as Arc<dyn FailureStubWriter>);
        let config = CompareConfig::new(vec![
            TestPair::new("a", "phone", "a_r.png", "a_t.png"),
            TestPair::new("b", "phone", "b_r.png", "b_t.png"),
        ]);

        let report = orchestrator.run(config).await.unwrap();
        assert!(stub.saw_other_pair.load(Ordering::SeqCst));
        assert_eq!(report.tests[0].status, TestStatus::Fail);
        assert_eq!(report.tests[1].status, TestStatus::Pass);
    }

    #[tokio::test]
    async fn test_records_follow_input_order() {
        let dir = tempfile::tempdir().unwrap();
        let labels = ["a", "b", "c", "d"];
        for label in labels {
            std::fs::write(dir.path().join(format!("{label}_r.png")), b"x").unwrap();
            std::fs::write(dir.path().join(format!("{label}_t.png")), b"x").unwrap();
        }

        let launcher = TaskLauncher::new(|job| {
            // Earlier pairs take longer so completion order is reversed
            let delay = match job.pair.label.as_str() {
                "a" => 60,
                "b" => 40,
                _ => 5,
            };
            std::thread::sleep(std::time::Duration::from_millis(delay));
            Ok(WorkerReply {
                status: TestStatus::Pass,
                diff: DiffStats::default(),
                diff_image: None,
            })
        });
        let orchestrator = Orchestrator::new(settings(dir.path()), launcher);
        let config = CompareConfig::new(
            labels
                .iter()
                .map(|l| TestPair::new(*l, "phone", format!("{l}_r.png"), format!("{l}_t.png")))
                .collect(),
        );

        let report = orchestrator.run(config).await.unwrap();
        let order: Vec<_> = report.tests.iter().map(|t| t.label.as_str()).collect();
        assert_eq!(order, labels);
        assert!(report.all_passed());
    }
}
