//! Configuration management with environment variable support.
//!
//! Settings for a comparison run come from three layers, lowest first:
//! - Hardcoded defaults (pool size 20, 60 second worker timeout)
//! - Environment variables
//! - Builder calls (the CLI maps its flags onto these)
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `VISUAL_REGRESS_PROJECT_PATH` | Base for resolving relative image paths | `.` |
//! | `VISUAL_REGRESS_COMPARE_LIMIT` | Maximum pairs compared concurrently | `20` |
//! | `VISUAL_REGRESS_COMPARE_TIMEOUT` | Worker timeout in seconds | `60` |
//! | `VISUAL_REGRESS_FORCE_DIFF_PNG` | Always write diff images as PNG | `false` |
//! | `VISUAL_REGRESS_SUITE_NAME` | Test suite name used in the report | `visual-regress` |
//! | `VISUAL_REGRESS_WORKER_BIN` | Program launched for each comparison | current executable |
//!
//! # Example
//!
//! ```bash
//! export VISUAL_REGRESS_COMPARE_LIMIT=4
//! export VISUAL_REGRESS_COMPARE_TIMEOUT=120
//! visual-regress compare --config backstop_data/compare_config.json
//! ```

use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use tokio::sync::Semaphore;

// ============================================================================
// Default Values
// ============================================================================

/// Default number of pairs compared at the same time
pub const DEFAULT_COMPARE_LIMIT: usize = 20;

/// Default worker timeout (seconds)
pub const DEFAULT_COMPARE_TIMEOUT: u64 = 60;

/// Default base directory for relative image paths
pub const DEFAULT_PROJECT_PATH: &str = ".";

/// Default test suite name
pub const DEFAULT_SUITE_NAME: &str = "visual-regress";

/// Subcommand that puts the binary into worker mode
pub const WORKER_SUBCOMMAND: &str = "worker";

// ============================================================================
// Environment Variable Names
// ============================================================================

/// Environment variable for the project path
pub const ENV_PROJECT_PATH: &str = "VISUAL_REGRESS_PROJECT_PATH";

/// Environment variable for the concurrency limit
pub const ENV_COMPARE_LIMIT: &str = "VISUAL_REGRESS_COMPARE_LIMIT";

/// Environment variable for the worker timeout
pub const ENV_COMPARE_TIMEOUT: &str = "VISUAL_REGRESS_COMPARE_TIMEOUT";

/// Environment variable for forcing PNG diff output
pub const ENV_FORCE_DIFF_PNG: &str = "VISUAL_REGRESS_FORCE_DIFF_PNG";

/// Environment variable for the report suite name
pub const ENV_SUITE_NAME: &str = "VISUAL_REGRESS_SUITE_NAME";

/// Environment variable overriding the worker program
pub const ENV_WORKER_BIN: &str = "VISUAL_REGRESS_WORKER_BIN";

// ============================================================================
// Configuration Getters (with caching)
// ============================================================================

static CONFIG: OnceLock<CompareSettings> = OnceLock::new();

/// Get the global settings (initialized from environment on first access)
pub fn get() -> &'static CompareSettings {
    CONFIG.get_or_init(CompareSettings::from_env)
}

/// Settings for one comparison run
#[derive(Debug, Clone)]
pub struct CompareSettings {
    /// Base directory that relative reference/test paths are resolved against
    pub project_path: PathBuf,
    /// Maximum number of pairs in flight; 0 falls back to the default
    pub async_compare_limit: usize,
    /// Wall-clock limit for one worker unit
    pub compare_timeout: Duration,
    /// Options handed to the pixel diff untouched
    pub output_options: serde_json::Value,
    /// Write diff artifacts as PNG regardless of the test image format
    pub force_diff_png: bool,
    /// Name of the suite in the report
    pub test_suite_name: String,
    /// Run identifier; generated when absent
    pub id: Option<String>,
    /// Program launched per comparison (None = the running executable)
    pub worker_program: Option<PathBuf>,
}

impl CompareSettings {
    /// Create settings from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::defaults();
        Self {
            project_path: env::var(ENV_PROJECT_PATH)
                .map(PathBuf::from)
                .unwrap_or(defaults.project_path),
            async_compare_limit: env::var(ENV_COMPARE_LIMIT)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.async_compare_limit),
            compare_timeout: env::var(ENV_COMPARE_TIMEOUT)
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.compare_timeout),
            force_diff_png: env::var(ENV_FORCE_DIFF_PNG)
                .ok()
                .and_then(|s| parse_bool(&s))
                .unwrap_or(defaults.force_diff_png),
            test_suite_name: env::var(ENV_SUITE_NAME).unwrap_or(defaults.test_suite_name),
            worker_program: env::var(ENV_WORKER_BIN).ok().map(PathBuf::from),
            ..defaults
        }
    }

    /// Create settings with all defaults (ignoring environment)
    pub fn defaults() -> Self {
        Self {
            project_path: PathBuf::from(DEFAULT_PROJECT_PATH),
            async_compare_limit: DEFAULT_COMPARE_LIMIT,
            compare_timeout: Duration::from_secs(DEFAULT_COMPARE_TIMEOUT),
            output_options: serde_json::Value::Object(serde_json::Map::new()),
            force_diff_png: false,
            test_suite_name: DEFAULT_SUITE_NAME.to_string(),
            id: None,
            worker_program: None,
        }
    }

    pub fn project_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.project_path = path.into();
        self
    }

    pub fn async_compare_limit(mut self, limit: usize) -> Self {
        self.async_compare_limit = limit;
        self
    }

    pub fn compare_timeout(mut self, timeout: Duration) -> Self {
        self.compare_timeout = timeout;
        self
    }

    pub fn output_options(mut self, options: serde_json::Value) -> Self {
        self.output_options = options;
        self
    }

    pub fn force_diff_png(mut self, force: bool) -> Self {
        self.force_diff_png = force;
        self
    }

    pub fn test_suite_name(mut self, name: impl Into<String>) -> Self {
        self.test_suite_name = name.into();
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    /// Pool size actually used: a zero limit means "use the default", and
    /// the result never exceeds what a semaphore can hold
    pub fn effective_limit(&self) -> usize {
        if self.async_compare_limit == 0 {
            DEFAULT_COMPARE_LIMIT
        } else {
            self.async_compare_limit.min(Semaphore::MAX_PERMITS)
        }
    }
}

impl Default for CompareSettings {
    fn default() -> Self {
        Self::from_env()
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Parse a boolean flag value ("1", "true", "yes", "on" and their negatives)
fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
