//! Pre-flight checks that decide whether a pair is worth a worker.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::types::TestPair;
use crate::stub::FailureStubWriter;

/// Why a pair failed before reaching the worker
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    /// The capture step did not produce one of the images
    #[error("{msg}: {error}. See scenario – {label} ({viewport_label})")]
    UpstreamCapture {
        msg: String,
        error: String,
        label: String,
        viewport_label: String,
    },

    #[error("Reference file not found {}", .0.display())]
    MissingReference(PathBuf),

    #[error("Test file not found {}", .0.display())]
    MissingTest(PathBuf),

    #[error(
        "Expect {expected} images for scenario \"{label} ({viewport_label})\", but actually {actual} images were found."
    )]
    CardinalityMismatch {
        expected: usize,
        actual: usize,
        label: String,
        viewport_label: String,
    },
}

/// Result of validating one pair
#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    /// Both images exist; hand them to the worker
    Proceed {
        reference_path: PathBuf,
        test_path: PathBuf,
    },
    Fail(ValidationError),
}

/// Checks a pair's paths and declared cardinality against the whole run
pub struct PairValidator<'a> {
    project_path: &'a Path,
    force_diff_png: bool,
    scenario_counts: &'a HashMap<(String, String), usize>,
    stub_writer: &'a dyn FailureStubWriter,
}

impl<'a> PairValidator<'a> {
    pub fn new(
        project_path: &'a Path,
        force_diff_png: bool,
        scenario_counts: &'a HashMap<(String, String), usize>,
        stub_writer: &'a dyn FailureStubWriter,
    ) -> Self {
        Self {
            project_path,
            force_diff_png,
            scenario_counts,
            stub_writer,
        }
    }

    /// Run the checks in order, stopping at the first failure
    pub fn validate(&self, pair: &TestPair) -> Validation {
        let (Some(reference_path), Some(test_path)) = (
            resolve(self.project_path, &pair.reference),
            resolve(self.project_path, &pair.test),
        ) else {
            return Validation::Fail(ValidationError::UpstreamCapture {
                msg: pair.msg.clone().unwrap_or_else(|| "Capture failed".to_string()),
                error: pair.error.clone().unwrap_or_else(|| "no image produced".to_string()),
                label: pair.label.clone(),
                viewport_label: pair.viewport_label.clone(),
            });
        };

        if !reference_path.exists() {
            // A stub failure must not mask the missing reference
            if let Err(e) = self
                .stub_writer
                .store_failed_stub(&test_path, self.force_diff_png)
            {
                log::warn!("could not store failed diff stub for {}: {}", pair.file_name, e);
            }
            return Validation::Fail(ValidationError::MissingReference(reference_path));
        }

        if !test_path.exists() {
            return Validation::Fail(ValidationError::MissingTest(test_path));
        }

        // Zero means no expectation was declared
        if let Some(expected) = pair.expect.filter(|&e| e > 0) {
            let (label, viewport) = pair.scenario_key();
            let actual = self
                .scenario_counts
                .get(&(label.to_string(), viewport.to_string()))
                .copied()
                .unwrap_or(0);
            if actual != expected {
                return Validation::Fail(ValidationError::CardinalityMismatch {
                    expected,
                    actual,
                    label: pair.label.clone(),
                    viewport_label: pair.viewport_label.clone(),
                });
            }
        }

        Validation::Proceed {
            reference_path,
            test_path,
        }
    }
}

/// Resolve a raw pair path against the project path; empty means "not produced"
fn resolve(project_path: &Path, raw: &str) -> Option<PathBuf> {
    if raw.trim().is_empty() {
        None
    } else {
        Some(project_path.join(raw))
    }
}
