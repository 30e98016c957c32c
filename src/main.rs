use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use visual_regress::config::{
    ENV_COMPARE_LIMIT, ENV_COMPARE_TIMEOUT, ENV_PROJECT_PATH, ENV_SUITE_NAME, ENV_WORKER_BIN,
};
use visual_regress::{CompareConfig, CompareSettings, Orchestrator, ProcessLauncher, Report, TestStatus, worker};

/// Visual Regress - parallel screenshot comparison
#[derive(Parser, Debug)]
#[command(
    name = "visual-regress",
    about = "Compare reference and test screenshots in isolated workers",
    after_help = "ENVIRONMENT VARIABLES:\n\
        VISUAL_REGRESS_PROJECT_PATH     Base for relative image paths\n\
        VISUAL_REGRESS_COMPARE_LIMIT    Maximum concurrent comparisons\n\
        VISUAL_REGRESS_COMPARE_TIMEOUT  Worker timeout in seconds\n\
        VISUAL_REGRESS_FORCE_DIFF_PNG   Always write diff images as PNG\n\
        VISUAL_REGRESS_SUITE_NAME       Suite name in the report\n\
        VISUAL_REGRESS_WORKER_BIN       Program launched per comparison\n\
        RUST_LOG                        Log filter (default: info)"
)]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compare every pair in a compare config and report the results
    Compare {
        /// Path to the compare config JSON (testPairs)
        #[arg(short, long)]
        config: PathBuf,

        /// Base directory for relative reference/test paths
        #[arg(short, long, env = ENV_PROJECT_PATH)]
        project_path: Option<PathBuf>,

        /// Maximum number of comparisons running at once (0 = default of 20)
        #[arg(short, long, env = ENV_COMPARE_LIMIT)]
        limit: Option<usize>,

        /// Seconds a worker may run before it is killed
        #[arg(short, long, env = ENV_COMPARE_TIMEOUT)]
        timeout: Option<u64>,

        /// Write diff images as PNG whatever the test image format
        #[arg(long)]
        force_diff_png: bool,

        /// Suite name recorded in the report
        #[arg(long, env = ENV_SUITE_NAME)]
        suite_name: Option<String>,

        /// Run identifier (default: generated from the current time)
        #[arg(long)]
        id: Option<String>,

        /// Diff output options as JSON, e.g. {"errorColor": {"red": 255, "green": 0, "blue": 0}}
        #[arg(long)]
        output_options: Option<String>,

        /// Program launched for each comparison (default: this executable in worker mode)
        #[arg(long, env = ENV_WORKER_BIN)]
        worker_bin: Option<PathBuf>,

        /// Write the report as JSON to this file
        #[arg(short, long)]
        report: Option<PathBuf>,

        /// Print the report as JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// Compare one pair read from stdin (used by the orchestrator)
    #[command(hide = true)]
    Worker,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    match args.command {
        Some(Commands::Compare {
            config,
            project_path,
            limit,
            timeout,
            force_diff_png,
            suite_name,
            id,
            output_options,
            worker_bin,
            report,
            json,
        }) => {
            let compare_config = CompareConfig::load(&config)
                .with_context(|| format!("failed to read compare config {}", config.display()))?;

            let mut settings = visual_regress::config::get().clone();
            if let Some(path) = project_path {
                settings = settings.project_path(path);
            }
            if let Some(limit) = limit {
                settings = settings.async_compare_limit(limit);
            }
            if let Some(secs) = timeout {
                settings = settings.compare_timeout(Duration::from_secs(secs));
            }
            if force_diff_png {
                settings = settings.force_diff_png(true);
            }
            if let Some(name) = suite_name {
                settings = settings.test_suite_name(name);
            }
            if let Some(id) = id {
                settings = settings.id(id);
            }
            if let Some(raw) = output_options {
                let options = serde_json::from_str(&raw).context("--output-options is not valid JSON")?;
                settings = settings.output_options(options);
            }
            if let Some(program) = worker_bin {
                settings = settings.worker_program(program);
            }

            let result = run_compare(settings, compare_config)?;

            if let Some(ref path) = report {
                result
                    .write_json(path)
                    .with_context(|| format!("failed to write report {}", path.display()))?;
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_summary(&result);
                if let Some(path) = report {
                    println!("\nReport: {}", path.display());
                }
            }

            if !result.all_passed() {
                std::process::exit(1);
            }
        }

        Some(Commands::Worker) => {
            if let Err(e) = worker::run_stdio() {
                eprintln!("worker failed: {}", e);
                std::process::exit(1);
            }
        }

        None => {
            println!("Visual Regress - parallel screenshot comparison");
            println!();
            println!("Usage: visual-regress <COMMAND>");
            println!();
            println!("Commands:");
            println!("  compare  Compare every pair in a compare config");
            println!();
            println!("Run with --help for more information.");
        }
    }

    Ok(())
}

fn run_compare(settings: CompareSettings, compare_config: CompareConfig) -> anyhow::Result<Report> {
    let launcher = match settings.worker_program {
        // A custom worker is expected to speak the protocol directly
        Some(ref program) => ProcessLauncher::new(program),
        None => ProcessLauncher::current_exe().context("could not locate the running executable")?,
    };

    let runtime = tokio::runtime::Runtime::new().context("failed to start the async runtime")?;
    let orchestrator = Orchestrator::new(settings, launcher);
    let report = runtime.block_on(orchestrator.run(compare_config))?;
    Ok(report)
}

fn print_summary(report: &Report) {
    println!("Suite {} ({})", report.test_suite_name, report.id);
    for test in &report.tests {
        let mark = match test.status {
            TestStatus::Pass => "pass",
            TestStatus::Fail => "FAIL",
            TestStatus::Pending => "pending",
        };
        println!("  [{}] {} ({}) {}", mark, test.label, test.viewport_label, test.file_name);
        if let Some(ref error) = test.error {
            println!("      {}", error);
        } else if let Some(ref diff) = test.diff {
            if test.status == TestStatus::Fail {
                println!(
                    "      mismatch {}% over threshold {}%",
                    diff.mis_match_percentage, test.mis_match_threshold
                );
            }
        }
        if let Some(ref image) = test.diff_image {
            println!("      diff: {}", image.display());
        }
    }
    println!();
    println!("{} passed, {} failed", report.passed(), report.failed());
}
