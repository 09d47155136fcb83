//! Subprocess execution (platform-agnostic).
//! Runs external programs, captures their output and hands results back
//! on a background thread so the caller's loop never blocks.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::platform::CommandRunner;

const WAIT_POLL: Duration = Duration::from_millis(20);

/// Captured result of one program run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// True iff the process exited with status 0.
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Runs `work` on a new thread and passes its result to `continuation`
/// on that same thread.
pub fn run_async<T, W, C>(work: W, continuation: C)
where
    T: Send + 'static,
    W: FnOnce() -> T + Send + 'static,
    C: FnOnce(T) + Send + 'static,
{
    thread::spawn(move || continuation(work()));
}

/// Runs real processes via `std::process::Command`.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    env_path: Option<String>,
    timeout: Option<Duration>,
}

impl SystemRunner {
    pub fn new(env_path: Option<String>, timeout: Option<Duration>) -> Self {
        Self { env_path, timeout }
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> CommandOutput {
        debug!("Running: {} {:?}", program, args);

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(path) = &self.env_path {
            debug!("Using PATH: {path}");
            cmd.env("PATH", path);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to start {}: {}", program, e);
                return CommandOutput::failed(format!("failed to start {program}: {e}"));
            }
        };

        let stdout = child.stdout.take().map(drain_pipe);
        let stderr = child.stderr.take().map(drain_pipe);

        let status = match self.timeout {
            Some(timeout) => wait_with_deadline(child, timeout),
            None => child.wait().map(Some),
        };

        match status {
            Ok(Some(status)) => CommandOutput {
                success: status.success(),
                stdout: join_pipe(stdout),
                stderr: join_pipe(stderr),
            },
            Ok(None) => {
                // Deadline passed. Grandchildren may still hold the
                // pipes open, so the readers are left to finish on their own.
                let secs = self.timeout.map(|t| t.as_secs_f32()).unwrap_or_default();
                warn!("{} timed out after {:.1}s", program, secs);
                CommandOutput::failed(format!("{program} timed out after {secs:.1}s"))
            }
            Err(e) => {
                warn!("Failed waiting for {}: {}", program, e);
                CommandOutput::failed(format!("failed waiting for {program}: {e}"))
            }
        }
    }
}

fn drain_pipe<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Err(e) = pipe.read_to_end(&mut buf) {
            debug!("Failed reading child output: {}", e);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_pipe(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

/// The parts of a child process the deadline wait needs.
trait Waitable: Send + 'static {
    fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>>;
    fn kill(&mut self) -> std::io::Result<()>;
    fn wait(&mut self) -> std::io::Result<ExitStatus>;
}

impl Waitable for Child {
    fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        Child::try_wait(self)
    }

    fn kill(&mut self) -> std::io::Result<()> {
        Child::kill(self)
    }

    fn wait(&mut self) -> std::io::Result<ExitStatus> {
        Child::wait(self)
    }
}

/// Waits for `child` until `timeout` elapses. Returns `Ok(None)` once the
/// deadline passes, without waiting for the child to exit: a child running
/// under another uid (pkexec) cannot be killed from here and is reaped on
/// a detached thread instead.
fn wait_with_deadline<W: Waitable>(mut child: W, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            if let Err(e) = child.kill() {
                warn!("Failed to kill overrunning process: {}", e);
            }
            thread::spawn(move || {
                let _ = child.wait();
            });
            return Ok(None);
        }
        thread::sleep(WAIT_POLL);
    }
}
