//! Worker mode: the code that runs inside an isolated comparison unit.
//!
//! Protocol: one JSON [`WorkerJob`] line on stdin, one JSON [`WorkerReply`]
//! line on stdout. Errors go to stderr with a non-zero exit, which the
//! dispatcher reports as a crash.

use std::io::{BufRead, Write};
use std::path::PathBuf;

use crate::compare::types::{TestStatus, WorkerJob, WorkerReply};
use crate::diff::{self, DiffError, DiffOptions};
use crate::stub::failed_diff_path;

/// Errors raised while handling a job
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("no job received on stdin")]
    NoJob,

    #[error("invalid job: {0}")]
    Job(#[from] serde_json::Error),

    #[error(transparent)]
    Diff(#[from] DiffError),

    #[error("test path has no file name: {0}")]
    NoFileName(PathBuf),

    #[error("failed to write diff image {path}: {source}")]
    WriteDiff {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Compare the job's images and classify the result.
///
/// The pair passes when the dimension policy holds and the raw mismatch is
/// within its threshold. Failures write the diff image beside the test image.
pub fn handle_job(job: &WorkerJob) -> Result<WorkerReply, WorkerError> {
    let options = DiffOptions::from_value(&job.output_settings)?;
    let mut result = diff::diff_files(&job.reference_path, &job.test_path, &options)?;

    let require_same_dimensions = job.pair.require_same_dimensions;
    result.stats.require_same_dimensions = require_same_dimensions;

    let dimensions_ok = !require_same_dimensions || result.stats.is_same_dimensions;
    if dimensions_ok && result.stats.raw_mis_match_percentage <= job.pair.mis_match_threshold {
        return Ok(WorkerReply {
            status: TestStatus::Pass,
            diff: result.stats,
            diff_image: None,
        });
    }

    let diff_path = failed_diff_path(&job.test_path, job.force_diff_png)
        .ok_or_else(|| WorkerError::NoFileName(job.test_path.clone()))?;
    result
        .image
        .save(&diff_path)
        .map_err(|source| WorkerError::WriteDiff {
            path: diff_path.clone(),
            source,
        })?;

    Ok(WorkerReply {
        status: TestStatus::Fail,
        diff: result.stats,
        diff_image: Some(diff_path),
    })
}

/// Read one job from `input`, handle it, and write one reply line to `output`
pub fn serve<R: BufRead, W: Write>(mut input: R, mut output: W) -> Result<(), WorkerError> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Err(WorkerError::NoJob);
    }
    let job: WorkerJob = serde_json::from_str(line.trim_end())?;
    log::debug!("worker comparing {}", job.reference_path.display());

    let reply = handle_job(&job)?;
    serde_json::to_writer(&mut output, &reply)?;
    output.write_all(b"\n")?;
    output.flush()?;
    Ok(())
}

/// Entry point for the `worker` subcommand
pub fn run_stdio() -> Result<(), WorkerError> {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    serve(stdin.lock(), stdout.lock())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::Canvas;
    use crate::compare::types::TestPair;
    use std::path::Path;

    fn write_images(dir: &Path, changed_px: u32) -> (PathBuf, PathBuf) {
        let reference = dir.join("ref.png");
        let test = dir.join("test.png");
        Canvas::with_color(10, 10, [0, 0, 0]).save(&reference).unwrap();
        let mut canvas = Canvas::with_color(10, 10, [0, 0, 0]);
        canvas.draw_rect(0, 0, changed_px, 1, [255, 255, 255]);
        canvas.save(&test).unwrap();
        (reference, test)
    }

    fn job(reference: PathBuf, test: PathBuf, threshold: f64) -> WorkerJob {
        WorkerJob {
            reference_path: reference,
            test_path: test,
            output_settings: serde_json::json!({}),
            pair: TestPair::new("home", "phone", "ref.png", "test.png").threshold(threshold),
            force_diff_png: false,
        }
    }

    #[test]
    fn test_within_threshold_passes() {
        let dir = tempfile::tempdir().unwrap();
        let (reference, test) = write_images(dir.path(), 5);

        let reply = handle_job(&job(reference, test, 5.0)).unwrap();
        assert_eq!(reply.status, TestStatus::Pass);
        assert_eq!(reply.diff.mis_match_percentage, 5.0);
        assert!(reply.diff_image.is_none());
        assert!(!dir.path().join("failed_diff_test.png").exists());
    }

    #[test]
    fn test_over_threshold_writes_diff_image() {
        let dir = tempfile::tempdir().unwrap();
        let (reference, test) = write_images(dir.path(), 10);

        let reply = handle_job(&job(reference, test, 5.0)).unwrap();
        assert_eq!(reply.status, TestStatus::Fail);
        assert_eq!(reply.diff.mis_match_percentage, 10.0);

        let diff_image = reply.diff_image.unwrap();
        assert_eq!(diff_image, dir.path().join("failed_diff_test.png"));
        assert!(diff_image.exists());
    }

    #[test]
    fn test_dimension_policy() {
        let dir = tempfile::tempdir().unwrap();
        let reference = dir.path().join("ref.png");
        let test = dir.path().join("test.png");
        Canvas::new(10, 10).save(&reference).unwrap();
        Canvas::new(10, 11).save(&test).unwrap();

        let mut strict = job(reference.clone(), test.clone(), 100.0);
        strict.pair.require_same_dimensions = true;
        let reply = handle_job(&strict).unwrap();
        assert_eq!(reply.status, TestStatus::Fail);
        assert!(reply.diff.require_same_dimensions);
        assert!(!reply.diff.is_same_dimensions);

        let mut lenient = job(reference, test, 100.0);
        lenient.pair.require_same_dimensions = false;
        assert_eq!(handle_job(&lenient).unwrap().status, TestStatus::Pass);
    }

    #[test]
    fn test_missing_image_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = handle_job(&job(dir.path().join("nope.png"), dir.path().join("nope2.png"), 0.1))
            .unwrap_err();
        assert!(matches!(err, WorkerError::Diff(DiffError::Open { .. })));
    }

    #[test]
    fn test_serve_round_trip_over_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let (reference, test) = write_images(dir.path(), 0);
        let mut input = serde_json::to_vec(&job(reference, test, 0.1)).unwrap();
        input.push(b'\n');

        let mut output = Vec::new();
        serve(input.as_slice(), &mut output).unwrap();

        let reply: WorkerReply = serde_json::from_slice(&output).unwrap();
        assert_eq!(reply.status, TestStatus::Pass);
        assert!(output.ends_with(b"\n"));
    }

    #[test]
    fn test_serve_empty_input() {
        let mut output = Vec::new();
        let err = serve(&b""[..], &mut output).unwrap_err();
        assert!(matches!(err, WorkerError::NoJob));
        assert!(output.is_empty());
    }
}
