//! Runs one comparison inside a freshly launched worker unit.
//!
//! A unit is launched per pair and never reused. The dispatcher sends one job,
//! waits for one reply under a wall-clock timeout, and kills the unit whichever
//! way the exchange ends. Two launchers are provided:
//! - [`ProcessLauncher`] spawns a child process (the binary in worker mode)
//! - [`TaskLauncher`] runs the job on a blocking task, containing panics

use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::types::{PairOutcome, TestPair, TestStatus, WorkerJob, WorkerReply};
use crate::config::WORKER_SUBCOMMAND;

/// Cap on stderr kept from a crashed worker
const MAX_STDERR_BYTES: usize = 4096;

/// Errors from running a comparison in a worker unit
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("failed to launch worker: {0}")]
    Launch(#[source] std::io::Error),

    #[error("worker hung or was killed unexpectedly after {timeout:?}, reference path is [{}]", .reference_path.display())]
    Timeout {
        reference_path: PathBuf,
        timeout: Duration,
    },

    #[error("worker exited before replying: {0}")]
    WorkerCrash(String),

    #[error("invalid worker message: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("worker replied without a final status ({0:?})")]
    UnfinishedReply(TestStatus),

    #[error("worker I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Creates isolated units, one per comparison
pub trait WorkerLauncher: Send + Sync + 'static {
    type Unit: WorkerUnit;

    fn launch(&self) -> Result<Self::Unit, DispatchError>;
}

/// A running unit that accepts one job and produces one reply
pub trait WorkerUnit: Send + 'static {
    fn send(&mut self, job: WorkerJob) -> impl Future<Output = Result<(), DispatchError>> + Send;

    fn recv(&mut self) -> impl Future<Output = Result<WorkerReply, DispatchError>> + Send;

    /// Forcibly stop the unit; must be safe to call after it has exited
    fn kill(&mut self) -> impl Future<Output = ()> + Send;
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Sends a job to a new unit and turns its reply into a [`PairOutcome`]
#[derive(Debug)]
pub struct WorkerDispatcher<L> {
    launcher: L,
    timeout: Duration,
}

impl<L: WorkerLauncher> WorkerDispatcher<L> {
    pub fn new(launcher: L, timeout: Duration) -> Self {
        Self { launcher, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Compare one pair. The first of {reply, timeout} decides the result.
    pub async fn dispatch(&self, job: WorkerJob) -> Result<PairOutcome, DispatchError> {
        let reference_path = job.reference_path.clone();
        let pair = job.pair.clone();

        let mut unit = self.launcher.launch()?;
        let exchanged = tokio::time::timeout(self.timeout, exchange(&mut unit, job)).await;
        // Units are single-use, so they are killed on every path
        unit.kill().await;

        match exchanged {
            Ok(Ok(reply)) if reply.status == TestStatus::Pending => {
                Err(DispatchError::UnfinishedReply(reply.status))
            }
            Ok(Ok(reply)) => {
                log_reply(&pair, &reply);
                Ok(PairOutcome::from_reply(reply))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DispatchError::Timeout {
                reference_path,
                timeout: self.timeout,
            }),
        }
    }
}

async fn exchange<U: WorkerUnit>(unit: &mut U, job: WorkerJob) -> Result<WorkerReply, DispatchError> {
    unit.send(job).await?;
    unit.recv().await
}

fn log_reply(pair: &TestPair, reply: &WorkerReply) {
    if reply.status == TestStatus::Fail {
        log::error!(
            "ERROR {{ requireSameDimensions: {}, size: {}, content: {}%, threshold: {}% }}: {} {}",
            reply.diff.require_same_dimensions,
            if reply.diff.is_same_dimensions { "ok" } else { "isDifferent" },
            reply.diff.mis_match_percentage,
            pair.mis_match_threshold,
            pair.label,
            pair.file_name
        );
    } else {
        log::info!("OK: {} {}", pair.label, pair.file_name);
    }
}

// ============================================================================
// Process units
// ============================================================================

/// Launches a child process per comparison, speaking JSON lines over stdio
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// The running executable in worker mode
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?).arg(WORKER_SUBCOMMAND))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl WorkerLauncher for ProcessLauncher {
    type Unit = ProcessUnit;

    fn launch(&self) -> Result<ProcessUnit, DispatchError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(DispatchError::Launch)?;

        let missing = |stream: &str| DispatchError::Launch(std::io::Error::other(format!("worker {stream} not captured")));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        // Drained as it arrives so a chatty worker never blocks on a full pipe
        let stderr = child.stderr.take().map(|stderr| tokio::spawn(drain_stderr(stderr)));

        log::debug!("launched worker pid {:?}", child.id());
        Ok(ProcessUnit {
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
            stderr,
        })
    }
}

/// A worker child process
#[derive(Debug)]
pub struct ProcessUnit {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    stderr: Option<JoinHandle<String>>,
}

impl ProcessUnit {
    /// Describe why the worker went away without replying
    async fn crash_detail(&mut self) -> String {
        let captured = match self.stderr.take() {
            Some(stderr) => stderr.await.unwrap_or_default(),
            None => String::new(),
        };
        let status = match self.child.wait().await {
            Ok(status) => status.to_string(),
            Err(e) => format!("unknown status ({e})"),
        };
        let captured = captured.trim();
        if captured.is_empty() {
            status
        } else {
            format!("{status}: {captured}")
        }
    }
}

impl WorkerUnit for ProcessUnit {
    async fn send(&mut self, job: WorkerJob) -> Result<(), DispatchError> {
        let mut line = serde_json::to_vec(&job)?;
        line.push(b'\n');

        let Some(mut stdin) = self.stdin.take() else {
            return Err(DispatchError::WorkerCrash("job already sent".to_string()));
        };
        if let Err(e) = stdin.write_all(&line).await {
            // A broken pipe means the worker is gone; report why
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                return Err(DispatchError::WorkerCrash(self.crash_detail().await));
            }
            return Err(e.into());
        }
        stdin.flush().await?;
        // Dropping stdin closes the pipe: one job per unit
        Ok(())
    }

    async fn recv(&mut self) -> Result<WorkerReply, DispatchError> {
        let mut line = String::new();
        let read = self.stdout.read_line(&mut line).await?;
        if read == 0 {
            return Err(DispatchError::WorkerCrash(self.crash_detail().await));
        }
        Ok(serde_json::from_str(line.trim_end())?)
    }

    async fn kill(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            if let Err(e) = self.child.kill().await {
                log::warn!("failed to kill worker pid {:?}: {}", self.child.id(), e);
            }
        }
        if let Some(stderr) = self.stderr.take() {
            stderr.abort();
        }
    }
}

/// Read stderr to EOF, keeping the first `MAX_STDERR_BYTES`
async fn drain_stderr(mut stderr: ChildStderr) -> String {
    let mut kept = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = MAX_STDERR_BYTES.saturating_sub(kept.len());
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    String::from_utf8_lossy(&kept).into_owned()
}

// ============================================================================
// Task units
// ============================================================================

type JobFn = dyn Fn(WorkerJob) -> Result<WorkerReply, String> + Send + Sync;

/// Runs each job on tokio's blocking pool.
///
/// Panics inside the job are contained and reported as crashes. A killed task
/// cannot be interrupted mid-diff, but its reply is discarded.
#[derive(Clone)]
pub struct TaskLauncher {
    job: Arc<JobFn>,
}

impl TaskLauncher {
    pub fn new<F>(job: F) -> Self
    where
        F: Fn(WorkerJob) -> Result<WorkerReply, String> + Send + Sync + 'static,
    {
        Self { job: Arc::new(job) }
    }

    /// Use the built-in pixel diff
    pub fn pixel_diff() -> Self {
        Self::new(|job| crate::worker::handle_job(&job).map_err(|e| e.to_string()))
    }
}

impl std::fmt::Debug for TaskLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskLauncher").finish_non_exhaustive()
    }
}

impl WorkerLauncher for TaskLauncher {
    type Unit = TaskUnit;

    fn launch(&self) -> Result<TaskUnit, DispatchError> {
        Ok(TaskUnit {
            job: Arc::clone(&self.job),
            handle: None,
            reply: None,
        })
    }
}

/// A job running on the blocking pool
pub struct TaskUnit {
    job: Arc<JobFn>,
    handle: Option<JoinHandle<()>>,
    reply: Option<oneshot::Receiver<Result<WorkerReply, String>>>,
}

impl WorkerUnit for TaskUnit {
    async fn send(&mut self, job: WorkerJob) -> Result<(), DispatchError> {
        if self.handle.is_some() {
            return Err(DispatchError::WorkerCrash("job already sent".to_string()));
        }
        let (tx, rx) = oneshot::channel();
        let run = Arc::clone(&self.job);
        self.handle = Some(tokio::task::spawn_blocking(move || {
            let _ = tx.send(run(job));
        }));
        self.reply = Some(rx);
        Ok(())
    }

    async fn recv(&mut self) -> Result<WorkerReply, DispatchError> {
        let Some(rx) = self.reply.take() else {
            return Err(DispatchError::WorkerCrash("no job was sent".to_string()));
        };
        match rx.await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(message)) => Err(DispatchError::WorkerCrash(message)),
            // The sender was dropped without a reply: the job panicked
            Err(_) => {
                let detail = match self.handle.take() {
                    Some(handle) => match handle.await {
                        Err(e) if e.is_panic() => panic_message(e.into_panic()),
                        Err(e) => e.to_string(),
                        Ok(()) => "job ended without a reply".to_string(),
                    },
                    None => "job ended without a reply".to_string(),
                };
                Err(DispatchError::WorkerCrash(detail))
            }
        }
    }

    async fn kill(&mut self) {
        self.reply = None;
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

pub(crate) fn panic_message(panic: Box<dyn std::any::Any + Send + 'static>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::types::DiffStats;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn job(pair: TestPair) -> WorkerJob {
        WorkerJob {
            reference_path: PathBuf::from("/refs/a.png"),
            test_path: PathBuf::from("/tests/a.png"),
            output_settings: serde_json::Value::Null,
            pair,
            force_diff_png: false,
        }
    }

    fn reply(status: TestStatus, percent: f64) -> WorkerReply {
        WorkerReply {
            status,
            diff: DiffStats {
                mis_match_percentage: percent,
                raw_mis_match_percentage: percent,
                is_same_dimensions: true,
                require_same_dimensions: true,
                ..Default::default()
            },
            diff_image: Some(PathBuf::from("/tests/failed_diff_a.png")),
        }
    }

    /// Scripted unit for exercising the dispatcher
    #[derive(Clone, Copy)]
    enum Script {
        Reply(TestStatus),
        Hang,
        Crash,
    }

    struct ScriptedLauncher {
        script: Script,
        kills: Arc<AtomicUsize>,
    }

    struct ScriptedUnit {
        script: Script,
        kills: Arc<AtomicUsize>,
    }

    impl WorkerLauncher for ScriptedLauncher {
        type Unit = ScriptedUnit;

        fn launch(&self) -> Result<ScriptedUnit, DispatchError> {
            Ok(ScriptedUnit {
                script: self.script,
                kills: Arc::clone(&self.kills),
            })
        }
    }

    impl WorkerUnit for ScriptedUnit {
        async fn send(&mut self, _job: WorkerJob) -> Result<(), DispatchError> {
            Ok(())
        }

        async fn recv(&mut self) -> Result<WorkerReply, DispatchError> {
            match self.script {
                Script::Reply(status) => Ok(reply(status, 3.5)),
                Script::Hang => std::future::pending().await,
                Script::Crash => Err(DispatchError::WorkerCrash("exit status: 101".to_string())),
            }
        }

        async fn kill(&mut self) {
            self.kills.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn dispatcher(script: Script) -> (WorkerDispatcher<ScriptedLauncher>, Arc<AtomicUsize>) {
        let kills = Arc::new(AtomicUsize::new(0));
        let launcher = ScriptedLauncher {
            script,
            kills: Arc::clone(&kills),
        };
        (WorkerDispatcher::new(launcher, Duration::from_secs(60)), kills)
    }

    #[tokio::test]
    async fn test_pass_reply_kills_unit_and_drops_diff_image() {
        let (dispatcher, kills) = dispatcher(Script::Reply(TestStatus::Pass));
        let outcome = dispatcher
            .dispatch(job(TestPair::new("home", "phone", "a.png", "a.png")))
            .await
            .unwrap();

        assert_eq!(outcome.status, TestStatus::Pass);
        assert_eq!(outcome.diff.unwrap().mis_match_percentage, 3.5);
        assert!(outcome.diff_image.is_none());
        assert_eq!(kills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fail_reply_keeps_diff_image() {
        let (dispatcher, kills) = dispatcher(Script::Reply(TestStatus::Fail));
        let outcome = dispatcher
            .dispatch(job(TestPair::new("home", "phone", "a.png", "a.png")))
            .await
            .unwrap();

        assert_eq!(outcome.status, TestStatus::Fail);
        assert_eq!(outcome.diff_image, Some(PathBuf::from("/tests/failed_diff_a.png")));
        assert!(outcome.error.is_none());
        assert_eq!(kills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hang_times_out_after_limit() {
        let (dispatcher, kills) = dispatcher(Script::Hang);
        let started = tokio::time::Instant::now();

        let err = dispatcher
            .dispatch(job(TestPair::new("home", "phone", "a.png", "a.png")))
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Timeout { .. }));
        assert!(err.to_string().contains("reference path is [/refs/a.png]"));
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert_eq!(kills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_crash_is_reported_and_unit_killed() {
        let (dispatcher, kills) = dispatcher(Script::Crash);
        let err = dispatcher
            .dispatch(job(TestPair::new("home", "phone", "a.png", "a.png")))
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::WorkerCrash(_)));
        assert_eq!(kills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pending_reply_is_rejected() {
        let (dispatcher, kills) = dispatcher(Script::Reply(TestStatus::Pending));
        let err = dispatcher
            .dispatch(job(TestPair::new("home", "phone", "a.png", "a.png")))
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::UnfinishedReply(TestStatus::Pending)));
        assert!(err.to_string().contains("without a final status"));
        assert_eq!(kills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_task_launcher_contains_panics() {
        let launcher = TaskLauncher::new(|_job| panic!("decoder blew up"));
        let dispatcher = WorkerDispatcher::new(launcher, Duration::from_secs(5));

        let err = dispatcher
            .dispatch(job(TestPair::new("home", "phone", "a.png", "a.png")))
            .await
            .unwrap_err();

        match err {
            DispatchError::WorkerCrash(message) => assert!(message.contains("decoder blew up")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_task_launcher_reply() {
        let launcher = TaskLauncher::new(|_job| Ok(reply(TestStatus::Pass, 0.0)));
        let dispatcher = WorkerDispatcher::new(launcher, Duration::from_secs(5));

        let outcome = dispatcher
            .dispatch(job(TestPair::new("home", "phone", "a.png", "a.png")))
            .await
            .unwrap();
        assert_eq!(outcome.status, TestStatus::Pass);
    }

    #[tokio::test]
    async fn test_process_launch_failure() {
        let launcher = ProcessLauncher::new("/nonexistent/visual-regress-worker");
        let dispatcher = WorkerDispatcher::new(launcher, Duration::from_secs(5));

        let err = dispatcher
            .dispatch(job(TestPair::new("home", "phone", "a.png", "a.png")))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Launch(_)));
    }
}
