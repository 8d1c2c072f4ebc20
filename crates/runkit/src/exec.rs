//! Process supervisor
//!
//! Executes a parsed [`Pipeline`] as a graph of real OS processes: one
//! process per stage, stage i's stdout wired to stage i+1's stdin, each
//! stage in its own process group so that a timeout or cancellation can
//! reclaim the whole tree, grandchildren included.
//!
//! Two independent timeout policies are enforced by an interval-sampling
//! monitor: an overall wall-clock cap measured from spawn, and an idle cap
//! that re-arms whenever new output bytes arrive. Whichever elapses first
//! terminates the run and tags the result; the other is never reported.
//! Termination escalates from SIGTERM to SIGKILL after a short grace
//! period for processes that ignore the polite request.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command as ProcessCommand};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::parser::{Command, Pipeline, Redirect, RedirectOp, RedirectTarget};

// Process supervision is unix-only: pipes, process groups and signal
// escalation have no portable equivalent.
use std::os::fd::OwnedFd;
use std::os::unix::process::ExitStatusExt;

/// Sampling interval for the output-activity monitor.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long a process group gets between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_millis(500);

/// Two independently optional timeout durations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TimeoutPolicy {
    /// Hard wall-clock cap from process start.
    pub overall: Option<Duration>,
    /// Maximum allowed silence; re-armed whenever output arrives.
    pub idle: Option<Duration>,
}

impl TimeoutPolicy {
    pub fn none() -> Self {
        Self::default()
    }
}

/// Which timeout policy, if any, terminated an execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum TimeoutKind {
    #[default]
    None,
    Overall,
    Idle,
}

/// The structured outcome of one pipeline execution.
///
/// Every diagnostic field a caller could want is captured here by value;
/// no live process handle escapes the supervisor.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessResult {
    /// The rendered command line, for diagnostics.
    pub command: String,
    /// Per-stage exit codes in stage order (killed stages report
    /// 128 + signal, following shell convention).
    pub stage_codes: Vec<i32>,
    /// Effective exit code after pipefail reduction.
    pub exit_code: i32,
    /// True when the supervisor forcibly terminated the process graph.
    pub killed: bool,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timeout: TimeoutKind,
}

impl ProcessResult {
    /// Whether the pipeline completed on its own with effective code zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.timeout == TimeoutKind::None && !self.killed
    }

    /// Stdout and stderr as one combined, deterministic view: stdout
    /// first, then stderr in stage order.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            return self.stdout.clone();
        }
        let mut out = self.stdout.clone();
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&self.stderr);
        out
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Timestamp of the most recent output activity, shared between the
/// stream readers and the monitor loop.
struct ActivityClock(Mutex<Instant>);

impl ActivityClock {
    fn new() -> Arc<Self> {
        Arc::new(Self(Mutex::new(Instant::now())))
    }

    fn touch(&self) {
        *lock(&self.0) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        lock(&self.0).elapsed()
    }
}

type SharedBuf = Arc<Mutex<Vec<u8>>>;

/// Where a stage's stdout or stderr is routed after redirections.
enum OutRoute {
    /// Captured into a buffer owned by the supervisor.
    Capture,
    /// An opened file target.
    File(std::fs::File),
    /// Piped to the next stage (stdout of non-final stages only).
    NextStage,
    /// Cross-routed onto the sibling stream (`2>&1` / `1>&2`).
    Sibling,
}

/// Captured buffers and cross-routing flags for one spawned stage.
#[derive(Default)]
struct StageCapture {
    stdout: Option<SharedBuf>,
    stderr: Option<SharedBuf>,
    /// `2>&1` while stdout is captured: fold stderr after stdout.
    stderr_joins_stdout: bool,
    /// `1>&2`: this stage's stdout belongs to the stderr view.
    stdout_joins_stderr: bool,
}

/// Supervises the execution of pipelines under one timeout policy.
#[derive(Clone)]
pub struct Supervisor {
    policy: TimeoutPolicy,
    cancel: Option<watch::Receiver<bool>>,
}

impl Supervisor {
    pub fn new(policy: TimeoutPolicy) -> Self {
        Self {
            policy,
            cancel: None,
        }
    }

    /// Attach a cancellation signal; `true` on the channel aborts the
    /// execution, kills every process group and yields `Error::Cancelled`.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Execute `pipeline` with `cwd` as the working directory of every
    /// stage and the base for redirection targets.
    pub async fn run(&self, pipeline: &Pipeline, cwd: &Path) -> Result<ProcessResult> {
        let start = Instant::now();
        let clock = ActivityClock::new();
        let stage_count = pipeline.stages.len();

        let mut children: Vec<Child> = Vec::with_capacity(stage_count);
        let mut readers: Vec<JoinHandle<()>> = Vec::new();
        let mut captures: Vec<StageCapture> = Vec::with_capacity(stage_count);

        if let Err(e) = spawn_stages(
            pipeline,
            cwd,
            &clock,
            &mut children,
            &mut readers,
            &mut captures,
        ) {
            abort_spawned(&mut children).await;
            for reader in readers {
                reader.abort();
            }
            return Err(e);
        }

        // Supervision: interval-sampled reaping with deadline checks. The
        // readers drain the pipes continuously so no stage can block on a
        // full pipe while the monitor waits.
        let mut statuses: Vec<Option<std::process::ExitStatus>> = vec![None; stage_count];
        let timeout = match self
            .monitor(&mut children, &mut statuses, &clock, start)
            .await
        {
            Ok(kind) => kind,
            Err(e) => {
                for reader in readers {
                    reader.abort();
                }
                return Err(e);
            }
        };

        for reader in readers {
            let _ = reader.await;
        }

        let stage_codes: Vec<i32> = statuses
            .iter()
            .map(|status| status.map(status_code).unwrap_or(-1))
            .collect();
        let exit_code = pipeline.effective_code(&stage_codes);
        let (stdout, stderr) = collect_output(captures);

        let result = ProcessResult {
            command: pipeline.render(),
            stage_codes,
            exit_code,
            killed: timeout != TimeoutKind::None,
            stdout,
            stderr,
            duration: start.elapsed(),
            timeout,
        };
        debug!(
            command = %result.command,
            exit_code = result.exit_code,
            timeout = ?result.timeout,
            elapsed_ms = result.duration.as_millis() as u64,
            "pipeline finished"
        );
        Ok(result)
    }

    /// Reap stages on a sampling interval until they all exit, a timeout
    /// deadline passes, or cancellation arrives.
    async fn monitor(
        &self,
        children: &mut [Child],
        statuses: &mut [Option<std::process::ExitStatus>],
        clock: &ActivityClock,
        start: Instant,
    ) -> Result<TimeoutKind> {
        let overall_deadline = self.policy.overall.map(|limit| start + limit);
        let (_standby_tx, standby_rx) = watch::channel(false);
        let mut cancel = self.cancel.clone().unwrap_or(standby_rx);
        let mut cancel_open = true;
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            reap(children, statuses);
            if statuses.iter().all(Option::is_some) {
                return Ok(TimeoutKind::None);
            }
            if *cancel.borrow() {
                self.terminate(children, statuses).await;
                return Err(Error::Cancelled);
            }
            if let Some(deadline) = overall_deadline {
                if Instant::now() >= deadline {
                    warn!("overall timeout reached, terminating pipeline");
                    self.terminate(children, statuses).await;
                    return Ok(TimeoutKind::Overall);
                }
            }
            if let Some(idle_limit) = self.policy.idle {
                if clock.idle_for() >= idle_limit {
                    warn!("idle timeout reached, terminating pipeline");
                    self.terminate(children, statuses).await;
                    return Ok(TimeoutKind::Idle);
                }
            }
            tokio::select! {
                _ = ticker.tick() => {}
                changed = cancel.changed(), if cancel_open => {
                    if changed.is_err() {
                        // Sender dropped; fall back to pure polling.
                        cancel_open = false;
                    }
                }
            }
        }
    }

    /// SIGTERM every live stage's process group, give them a grace
    /// period, then SIGKILL whatever remains and reap everything.
    async fn terminate(
        &self,
        children: &mut [Child],
        statuses: &mut [Option<std::process::ExitStatus>],
    ) {
        signal_groups(children, statuses, false);
        let deadline = Instant::now() + KILL_GRACE;
        while Instant::now() < deadline {
            reap(children, statuses);
            if statuses.iter().all(Option::is_some) {
                return;
            }
            tokio::time::sleep(POLL_INTERVAL / 2).await;
        }
        signal_groups(children, statuses, true);
        for (child, status) in children.iter_mut().zip(statuses.iter_mut()) {
            if status.is_none() {
                if let Ok(exit) = child.wait().await {
                    *status = Some(exit);
                }
            }
        }
    }
}

/// Spawn every stage with its stdio wired up, filling `children`,
/// `readers` and `captures` in stage order.
fn spawn_stages(
    pipeline: &Pipeline,
    cwd: &Path,
    clock: &Arc<ActivityClock>,
    children: &mut Vec<Child>,
    readers: &mut Vec<JoinHandle<()>>,
    captures: &mut Vec<StageCapture>,
) -> Result<()> {
    let stage_count = pipeline.stages.len();
    let mut prev_pipe: Option<OwnedFd> = None;

    for (index, stage) in pipeline.stages.iter().enumerate() {
        if stage.argv.is_empty() {
            return Err(Error::Syntax("empty pipeline stage".into()));
        }
        let last = index + 1 == stage_count;
        let (stdin, stdout_route, stderr_route) =
            plan_stage_io(stage, pipeline, index, last, cwd, prev_pipe.take())?;

        let mut command = ProcessCommand::new(&stage.argv[0]);
        command
            .args(&stage.argv[1..])
            .envs(&stage.env)
            .current_dir(cwd)
            .stdin(stdin)
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut capture = StageCapture::default();
        let mut capture_stdout = false;
        let mut capture_stderr = false;
        let mut next_pipe = None;

        match (stdout_route, stderr_route) {
            // `2>&1` onto a real descriptor: duplicate it for stderr.
            (OutRoute::File(out), OutRoute::Sibling) => {
                let dup = out.try_clone().map_err(|e| Error::io(cwd, e))?;
                command.stdout(Stdio::from(out));
                command.stderr(Stdio::from(dup));
            }
            (OutRoute::NextStage, OutRoute::Sibling) => {
                let (read_end, write_end) = os_pipe()?;
                let dup = write_end.try_clone().map_err(|e| Error::io(cwd, e))?;
                command.stdout(Stdio::from(write_end));
                command.stderr(Stdio::from(dup));
                next_pipe = Some(read_end);
            }
            // `2>&1` onto a captured stdout: capture both, fold later.
            (OutRoute::Capture, OutRoute::Sibling) => {
                command.stdout(Stdio::piped());
                command.stderr(Stdio::piped());
                capture_stdout = true;
                capture_stderr = true;
                capture.stderr_joins_stdout = true;
            }
            // `1>&2` onto a file.
            (OutRoute::Sibling, OutRoute::File(err)) => {
                let dup = err.try_clone().map_err(|e| Error::io(cwd, e))?;
                command.stderr(Stdio::from(err));
                command.stdout(Stdio::from(dup));
            }
            // `1>&2` onto captured stderr.
            (OutRoute::Sibling, OutRoute::Capture) => {
                command.stdout(Stdio::piped());
                command.stderr(Stdio::piped());
                capture_stdout = true;
                capture_stderr = true;
                capture.stdout_joins_stderr = true;
            }
            (stdout_route, stderr_route) => {
                match stdout_route {
                    OutRoute::File(file) => {
                        command.stdout(Stdio::from(file));
                    }
                    OutRoute::NextStage => {
                        let (read_end, write_end) = os_pipe()?;
                        command.stdout(Stdio::from(write_end));
                        next_pipe = Some(read_end);
                    }
                    OutRoute::Capture => {
                        command.stdout(Stdio::piped());
                        capture_stdout = true;
                    }
                    OutRoute::Sibling => unreachable!("circular dup rejected during planning"),
                }
                match stderr_route {
                    OutRoute::File(file) => {
                        command.stderr(Stdio::from(file));
                    }
                    OutRoute::Capture => {
                        command.stderr(Stdio::piped());
                        capture_stderr = true;
                    }
                    OutRoute::Sibling | OutRoute::NextStage => {
                        unreachable!("stderr routes only to files, capture, or its sibling")
                    }
                }
            }
        }

        trace!(stage = index, argv = ?stage.argv, "spawning stage");
        let mut child = command.spawn().map_err(|e| Error::Spawn {
            command: stage.argv[0].clone(),
            source: e,
        })?;

        if capture_stdout {
            let buf: SharedBuf = Arc::default();
            if let Some(stream) = child.stdout.take() {
                readers.push(spawn_reader(stream, Arc::clone(&buf), Arc::clone(clock)));
            }
            capture.stdout = Some(buf);
        }
        if capture_stderr {
            let buf: SharedBuf = Arc::default();
            if let Some(stream) = child.stderr.take() {
                readers.push(spawn_reader(stream, Arc::clone(&buf), Arc::clone(clock)));
            }
            capture.stderr = Some(buf);
        }

        children.push(child);
        captures.push(capture);
        prev_pipe = next_pipe;
    }
    Ok(())
}

/// Resolve stdin and the stdout/stderr routes for one stage, applying the
/// stage's redirections plus the pipeline-scoped trailing redirections on
/// the boundary stages. Later redirections of the same descriptor win,
/// matching shell behavior.
fn plan_stage_io(
    stage: &Command,
    pipeline: &Pipeline,
    index: usize,
    last: bool,
    cwd: &Path,
    prev_pipe: Option<OwnedFd>,
) -> Result<(Stdio, OutRoute, OutRoute)> {
    let mut stdin = match prev_pipe {
        Some(fd) => Stdio::from(fd),
        None => Stdio::null(),
    };
    let mut stdout = if last {
        OutRoute::Capture
    } else {
        OutRoute::NextStage
    };
    let mut stderr = OutRoute::Capture;

    let pipeline_scoped = pipeline.redirects.iter().filter(|r| {
        if r.op == RedirectOp::In {
            index == 0
        } else {
            last
        }
    });
    for redirect in stage.redirects.iter().chain(pipeline_scoped) {
        match (redirect.op, redirect.source_fd(), &redirect.target) {
            (RedirectOp::In, 0, RedirectTarget::Path(path)) => {
                let resolved = cwd.join(path);
                let file =
                    std::fs::File::open(&resolved).map_err(|e| Error::io(resolved.clone(), e))?;
                stdin = Stdio::from(file);
            }
            (RedirectOp::Out | RedirectOp::Append, fd @ (1 | 2), RedirectTarget::Path(path)) => {
                let resolved = cwd.join(path);
                let mut options = std::fs::OpenOptions::new();
                options.create(true).write(true);
                if redirect.op == RedirectOp::Append {
                    options.append(true);
                } else {
                    options.truncate(true);
                }
                let file = options
                    .open(&resolved)
                    .map_err(|e| Error::io(resolved.clone(), e))?;
                if fd == 1 {
                    stdout = OutRoute::File(file);
                } else {
                    stderr = OutRoute::File(file);
                }
            }
            (RedirectOp::DupOut, 2, RedirectTarget::Fd(1)) => {
                stderr = OutRoute::Sibling;
            }
            (RedirectOp::DupOut, 1, RedirectTarget::Fd(2)) => {
                stdout = OutRoute::Sibling;
            }
            _ => {
                return Err(Error::UnsupportedRedirect(describe_redirect(redirect)));
            }
        }
    }
    if matches!(stdout, OutRoute::Sibling) && matches!(stderr, OutRoute::Sibling) {
        return Err(Error::UnsupportedRedirect(
            "circular '1>&2' combined with '2>&1'".into(),
        ));
    }
    Ok((stdin, stdout, stderr))
}

fn describe_redirect(redirect: &Redirect) -> String {
    let target = match &redirect.target {
        RedirectTarget::Path(path) => path.clone(),
        RedirectTarget::Fd(fd) => format!("&{fd}"),
    };
    format!("fd {} {:?} {target}", redirect.source_fd(), redirect.op)
}

/// Create an OS pipe for wiring adjacent stages.
fn os_pipe() -> Result<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe().map_err(|e| Error::io("<pipe>", std::io::Error::from(e)))
}

fn reap(children: &mut [Child], statuses: &mut [Option<std::process::ExitStatus>]) {
    for (child, status) in children.iter_mut().zip(statuses.iter_mut()) {
        if status.is_none() {
            if let Ok(Some(exit)) = child.try_wait() {
                *status = Some(exit);
            }
        }
    }
}

/// Kill a partially spawned pipeline after a setup failure.
async fn abort_spawned(children: &mut [Child]) {
    let mut statuses = vec![None; children.len()];
    signal_groups(children, &statuses, true);
    for (child, status) in children.iter_mut().zip(statuses.iter_mut()) {
        if let Ok(exit) = child.wait().await {
            *status = Some(exit);
        }
    }
}

/// Signal every still-running stage's process group. Each stage is its own
/// group leader, so the group id equals the stage pid.
fn signal_groups(
    children: &[Child],
    statuses: &[Option<std::process::ExitStatus>],
    force: bool,
) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;
    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    for (child, status) in children.iter().zip(statuses.iter()) {
        if status.is_none() {
            if let Some(pid) = child.id() {
                let _ = killpg(Pid::from_raw(pid as i32), signal);
            }
        }
    }
}

fn status_code(status: std::process::ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

fn spawn_reader<R>(mut stream: R, buf: SharedBuf, clock: Arc<ActivityClock>) -> JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 4096];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(len) => {
                    lock(&buf).extend_from_slice(&chunk[..len]);
                    clock.touch();
                }
            }
        }
    })
}

/// Assemble the captured buffers into deterministic stdout/stderr views:
/// stdout is the final stage's output, stderr concatenates per-stage
/// buffers in stage order, and cross-routed streams are folded into their
/// destination.
fn collect_output(captures: Vec<StageCapture>) -> (String, String) {
    let take = |buf: Option<SharedBuf>| -> Vec<u8> {
        buf.map(|b| std::mem::take(&mut *lock(&b))).unwrap_or_default()
    };

    let stage_count = captures.len();
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    for (index, capture) in captures.into_iter().enumerate() {
        let last = index + 1 == stage_count;
        let own_stdout = take(capture.stdout);
        let own_stderr = take(capture.stderr);
        if capture.stdout_joins_stderr {
            stderr.extend_from_slice(&own_stderr);
            stderr.extend_from_slice(&own_stdout);
            continue;
        }
        if last {
            stdout.extend_from_slice(&own_stdout);
        }
        if capture.stderr_joins_stdout {
            stdout.extend_from_slice(&own_stderr);
        } else {
            stderr.extend_from_slice(&own_stderr);
        }
    }
    (
        String::from_utf8_lossy(&stdout).into_owned(),
        String::from_utf8_lossy(&stderr).into_owned(),
    )
}
