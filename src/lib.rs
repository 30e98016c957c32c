//! Visual Regress - parallel screenshot comparison for visual regression runs.
//!
//! This crate provides:
//! - Pair validation (missing images, upstream capture failures, cardinality)
//! - One isolated worker per comparison with a wall-clock timeout
//! - A bounded pool that runs every pair and keeps input order in the report
//! - Pixel diffing with diff images for failed pairs
//!
//! # Example
//!
//! ```rust,no_run
//! use visual_regress::{CompareConfig, CompareSettings, Orchestrator, ProcessLauncher};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CompareConfig::load("backstop_data/compare_config.json")?;
//! let settings = CompareSettings::from_env().async_compare_limit(4);
//! let orchestrator = Orchestrator::new(settings, ProcessLauncher::current_exe()?);
//! let report = orchestrator.run(config).await?;
//! println!("{} passed, {} failed", report.passed(), report.failed());
//! # Ok(())
//! # }
//! ```

pub mod canvas;
pub mod compare;
pub mod config;
pub mod diff;
pub mod report;
pub mod stub;
pub mod worker;

// Re-export orchestration types
pub use compare::{
    CompareConfig, CompareError, DispatchError, Orchestrator, PairOutcome, ProcessLauncher, TaskLauncher, TestPair,
    TestStatus, WorkerDispatcher, WorkerLauncher, WorkerUnit,
};

// Re-export settings and reporting
pub use config::CompareSettings;
pub use report::{Report, Reporter, TestRecord};

// Re-export diff and stub helpers
pub use canvas::Canvas;
pub use diff::{DiffOptions, DiffResult, diff_images};
pub use stub::{FailureStubWriter, PlaceholderStubWriter, failed_diff_path};
