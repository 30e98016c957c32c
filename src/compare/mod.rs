//! Comparison orchestration: validate each pair, compare it in an isolated
//! worker, and collect one record per pair.

pub mod dispatcher;
pub mod orchestrator;
pub mod types;
pub mod validator;

pub use dispatcher::{DispatchError, ProcessLauncher, TaskLauncher, WorkerDispatcher, WorkerLauncher, WorkerUnit};
pub use orchestrator::{CompareError, Orchestrator};
pub use types::{CompareConfig, DiffStats, PairOutcome, TestPair, TestStatus, WorkerJob, WorkerReply};
pub use validator::{PairValidator, Validation, ValidationError};
