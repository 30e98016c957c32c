//! Types for comparison run results.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;

use crate::compare::types::{DiffStats, PairOutcome, TestPair, TestStatus};

/// Result of one pair's comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRecord {
    /// Scenario label
    pub label: String,

    pub viewport_label: String,

    pub file_name: String,

    /// Reference path as given in the pair
    pub reference: String,

    /// Test path as given in the pair
    pub test: String,

    pub mis_match_threshold: f64,

    pub status: TestStatus,

    /// Human-readable reason for a failure that did not come from the diff
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<DiffStats>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_image: Option<PathBuf>,
}

impl TestRecord {
    fn pending(pair: &TestPair) -> Self {
        Self {
            label: pair.label.clone(),
            viewport_label: pair.viewport_label.clone(),
            file_name: pair.file_name.clone(),
            reference: pair.reference.clone(),
            test: pair.test.clone(),
            mis_match_threshold: pair.mis_match_threshold,
            status: TestStatus::Pending,
            error: None,
            diff: None,
            diff_image: None,
        }
    }

    pub fn passed(&self) -> bool {
        self.status == TestStatus::Pass
    }
}

/// Handle to a record registered with [`Reporter::add_test`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId(usize);

/// Collects records from concurrently running comparisons.
///
/// Records are append-only and each one is finished exactly once.
#[derive(Debug)]
pub struct Reporter {
    test_suite_name: String,
    id: String,
    tests: Mutex<Vec<TestRecord>>,
}

impl Reporter {
    pub fn new(test_suite_name: impl Into<String>, id: Option<String>) -> Self {
        Self {
            test_suite_name: test_suite_name.into(),
            id: id.unwrap_or_else(generate_run_id),
            tests: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn records(&self) -> MutexGuard<'_, Vec<TestRecord>> {
        // Records stay consistent even if a holder panicked: every write is a single push or assignment
        self.tests.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a pending record for a pair that is starting
    pub fn add_test(&self, pair: &TestPair) -> RecordId {
        let mut tests = self.records();
        tests.push(TestRecord::pending(pair));
        RecordId(tests.len() - 1)
    }

    /// Fix a record's terminal outcome. Returns false if it was already finished.
    pub fn finish(&self, id: RecordId, outcome: PairOutcome) -> bool {
        let mut tests = self.records();
        let Some(record) = tests.get_mut(id.0) else {
            log::warn!("finish called for unknown record {:?}", id);
            return false;
        };
        if record.status != TestStatus::Pending {
            log::warn!("record for {} {} already finished", record.label, record.file_name);
            return false;
        }
        record.status = outcome.status;
        record.error = outcome.error;
        record.diff = outcome.diff;
        record.diff_image = outcome.diff_image;
        true
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hand out the finished suite
    pub fn into_report(self) -> Report {
        let tests = self
            .tests
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Report {
            test_suite_name: self.test_suite_name,
            id: self.id,
            tests,
        }
    }
}

/// A finished run: suite name, run id, one record per pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub test_suite_name: String,
    pub id: String,
    pub tests: Vec<TestRecord>,
}

impl Report {
    pub fn passed(&self) -> usize {
        self.tests.iter().filter(|t| t.passed()).count()
    }

    pub fn failed(&self) -> usize {
        self.tests.len() - self.passed()
    }

    pub fn all_passed(&self) -> bool {
        self.failed() == 0
    }

    /// Write the report as pretty JSON, creating parent directories
    pub fn write_json(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Generate a run id from the current time
fn generate_run_id() -> String {
    format!("run_{}_{}", Utc::now().format("%Y%m%d_%H%M%S"), std::process::id())
}
