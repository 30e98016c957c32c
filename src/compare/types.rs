use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// One reference/test screenshot comparison, scoped to a scenario and viewport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TestPair {
    /// Scenario label
    pub label: String,

    /// Viewport label
    pub viewport_label: String,

    /// Reference image path, relative to the project path (empty if capture failed)
    pub reference: String,

    /// Test image path, relative to the project path (empty if capture failed)
    pub test: String,

    /// File name used in log lines and diff artifact names
    pub file_name: String,

    /// Accepted mismatch, in percent
    pub mis_match_threshold: f64,

    /// Fail when the two images differ in size
    pub require_same_dimensions: bool,

    /// Expected number of pairs sharing this label and viewport
    #[serde(rename = "expect", alias = "expectCount", skip_serializing_if = "Option::is_none")]
    pub expect: Option<usize>,

    /// Message left by the capture step when it could not produce an image
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,

    /// Error left by the capture step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Default for TestPair {
    fn default() -> Self {
        Self {
            label: String::new(),
            viewport_label: String::new(),
            reference: String::new(),
            test: String::new(),
            file_name: String::new(),
            mis_match_threshold: 0.1,
            require_same_dimensions: true,
            expect: None,
            msg: None,
            error: None,
        }
    }
}

impl TestPair {
    /// Create a pair with the default threshold and dimension policy
    pub fn new(
        label: impl Into<String>,
        viewport_label: impl Into<String>,
        reference: impl Into<String>,
        test: impl Into<String>,
    ) -> Self {
        let test = test.into();
        let file_name = Path::new(&test)
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        Self {
            label: label.into(),
            viewport_label: viewport_label.into(),
            reference: reference.into(),
            test,
            file_name,
            ..Default::default()
        }
    }

    pub fn threshold(mut self, percent: f64) -> Self {
        self.mis_match_threshold = percent;
        self
    }

    pub fn expect(mut self, count: usize) -> Self {
        self.expect = Some(count);
        self
    }

    pub fn require_same_dimensions(mut self, required: bool) -> Self {
        self.require_same_dimensions = required;
        self
    }

    /// Key used for cardinality checks
    pub fn scenario_key(&self) -> (&str, &str) {
        (&self.label, &self.viewport_label)
    }
}

/// The ordered list of pairs for one run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareConfig {
    pub test_pairs: Vec<TestPair>,
}

/// On-disk layouts accepted by [`CompareConfig::load`]
#[derive(Deserialize)]
#[serde(untagged)]
enum CompareConfigFile {
    Wrapped {
        #[serde(rename = "compareConfig")]
        compare_config: CompareConfig,
    },
    Bare(CompareConfig),
}

impl CompareConfig {
    pub fn new(test_pairs: Vec<TestPair>) -> Self {
        Self { test_pairs }
    }

    /// Load a config file, either `{"testPairs": [...]}` or wrapped in `{"compareConfig": ...}`
    pub fn load(path: impl AsRef<Path>) -> Result<Self, serde_json::Error> {
        let data = fs::read(path.as_ref()).map_err(serde_json::Error::io)?;
        Self::from_slice(&data)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, serde_json::Error> {
        Ok(match serde_json::from_slice::<CompareConfigFile>(data)? {
            CompareConfigFile::Wrapped { compare_config } => compare_config,
            CompareConfigFile::Bare(config) => config,
        })
    }

    /// Number of pairs per (label, viewport label)
    pub fn scenario_counts(&self) -> HashMap<(String, String), usize> {
        let mut counts = HashMap::new();
        for pair in &self.test_pairs {
            *counts
                .entry((pair.label.clone(), pair.viewport_label.clone()))
                .or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.test_pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.test_pairs.is_empty()
    }
}

/// Verdict of one comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    /// Registered, not finished yet
    Pending,
    Pass,
    Fail,
}

/// Width/height difference between test and reference, in pixels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionDifference {
    pub width: i64,
    pub height: i64,
}

/// Statistics reported by the pixel diff
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiffStats {
    /// Mismatch rounded to two decimals
    pub mis_match_percentage: f64,
    pub raw_mis_match_percentage: f64,
    pub require_same_dimensions: bool,
    pub is_same_dimensions: bool,
    pub dimension_difference: DimensionDifference,
    /// Milliseconds spent diffing
    pub analysis_time: u64,
}

/// Message sent to a worker unit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerJob {
    pub reference_path: PathBuf,
    pub test_path: PathBuf,
    /// Diff output options, passed through untouched
    pub output_settings: serde_json::Value,
    pub pair: TestPair,
    pub force_diff_png: bool,
}

/// The single message a worker unit replies with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerReply {
    pub status: TestStatus,
    pub diff: DiffStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_image: Option<PathBuf>,
}

/// Terminal result of processing one pair
#[derive(Debug, Clone, PartialEq)]
pub struct PairOutcome {
    pub status: TestStatus,
    pub error: Option<String>,
    pub diff: Option<DiffStats>,
    pub diff_image: Option<PathBuf>,
}

impl PairOutcome {
    /// A pair that failed before or during dispatch
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: TestStatus::Fail,
            error: Some(message.into()),
            diff: None,
            diff_image: None,
        }
    }

    /// Copy a worker reply; the diff image is kept only for failures
    pub fn from_reply(reply: WorkerReply) -> Self {
        let diff_image = match reply.status {
            TestStatus::Fail => reply.diff_image,
            _ => None,
        };
        Self {
            status: reply.status,
            error: None,
            diff: Some(reply.diff),
            diff_image,
        }
    }
}
