//! Bounded execution of external programs.
//!
//! Every installer, `pnputil` call and PowerShell query goes through a
//! [`CommandRunner`] so the orchestration code can be driven by a scripted
//! runner in tests.

use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_REBOOT_REQUIRED: i32 = 3010;

/// Output beyond this many bytes per stream is dropped from the front.
pub const MAX_CAPTURED_OUTPUT: usize = 64 * 1024;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    /// Allow the child to open a visible window.
    pub show_window: bool,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            timeout,
            show_window: false,
        }
    }

    pub fn with_window(mut self) -> Self {
        self.show_window = true;
        self
    }

    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process timed out or was terminated without a code.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn exited(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            ..Default::default()
        }
    }

    pub fn timeout() -> Self {
        Self {
            timed_out: true,
            ..Default::default()
        }
    }

    pub fn with_stdout(mut self, stdout: impl Into<Vec<u8>>) -> Self {
        self.stdout = stdout.into();
        self
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(EXIT_SUCCESS)
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

pub trait CommandRunner: Send + Sync {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError>;
}

/// How an installer's exit status is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallerExit {
    Success,
    RebootRequired,
    Failure(i32),
    TimedOut,
    /// Terminated without an exit code.
    Killed,
}

impl InstallerExit {
    pub fn classify(output: &CommandOutput) -> InstallerExit {
        if output.timed_out {
            return InstallerExit::TimedOut;
        }
        match output.exit_code {
            Some(EXIT_SUCCESS) => InstallerExit::Success,
            Some(EXIT_REBOOT_REQUIRED) => InstallerExit::RebootRequired,
            Some(code) => InstallerExit::Failure(code),
            None => InstallerExit::Killed,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, InstallerExit::Success | InstallerExit::RebootRequired)
    }
}

/// Runs real processes, killing any that outlive their timeout.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        hide_console(&mut command, spec.show_window);

        debug!(command = %spec.display(), timeout_secs = spec.timeout.as_secs(), "spawning");
        let start = Instant::now();
        let mut child = command.spawn().map_err(|source| CommandError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        let stdout_rx = spawn_reader(child.stdout.take());
        let stderr_rx = spawn_reader(child.stderr.take());
        let deadline = start + spec.timeout;

        let mut timed_out = false;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) if Instant::now() >= deadline => {
                    timed_out = true;
                    warn!(command = %spec.display(), "timed out; killing");
                    let _ = child.kill();
                    break child.wait().ok();
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(source) => {
                    let _ = child.kill();
                    return Err(CommandError::Wait {
                        program: spec.program.clone(),
                        source,
                    });
                }
            }
        };

        let exit_code = if timed_out {
            None
        } else {
            status.and_then(|s| s.code())
        };

        Ok(CommandOutput {
            exit_code,
            timed_out,
            stdout: collect(stdout_rx),
            stderr: collect(stderr_rx),
            duration: start.elapsed(),
        })
    }
}

#[cfg(windows)]
fn hide_console(command: &mut Command, show_window: bool) {
    use std::os::windows::process::CommandExt;
    if !show_window {
        command.creation_flags(CREATE_NO_WINDOW);
    }
}

#[cfg(not(windows))]
fn hide_console(_command: &mut Command, _show_window: bool) {}

fn spawn_reader<R: Read + Send + 'static>(stream: Option<R>) -> Option<Receiver<Vec<u8>>> {
    let mut stream = stream?;
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut captured = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    captured.extend_from_slice(&chunk[..n]);
                    if captured.len() > MAX_CAPTURED_OUTPUT {
                        let excess = captured.len() - MAX_CAPTURED_OUTPUT;
                        captured.drain(..excess);
                    }
                }
            }
        }
        let _ = tx.send(captured);
    });
    Some(rx)
}

// A killed installer can leave grandchildren holding the pipe open, so the
// reader is not awaited forever.
fn collect(rx: Option<Receiver<Vec<u8>>>) -> Vec<u8> {
    rx.and_then(|rx| rx.recv_timeout(DRAIN_GRACE).ok())
        .unwrap_or_default()
}
