//! Blocking external command execution.
//!
//! Recovery work leans on external tools; this module runs them
//! synchronously, captures their output, and journals every invocation.
//! The caller blocks until the child exits; with no deadline configured
//! that can be forever, exactly like running the command by hand. A deadline
//! turns a hung child into a [`RecoveryError::Timeout`] after a SIGTERM and,
//! failing that, a kill.

use std::io::Read;
use std::process::{Child, Command, Output, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{RecoveryError, Result};
use crate::journal::Journal;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Captured result of a finished command.
#[derive(Debug)]
pub struct CommandOutput {
    /// Exit code, or `None` if the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the process exited with code 0.
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Runs external commands and journals each invocation.
pub struct Executor {
    journal: Arc<Journal>,
    timeout: Option<Duration>,
}

impl Executor {
    /// An executor with no execution deadline.
    pub fn new(journal: Arc<Journal>) -> Self {
        Self {
            journal,
            timeout: None,
        }
    }

    /// Sets a deadline applied to every command this executor runs.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The journal this executor records to.
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Runs `line` through `sh -c`, returning captured stdout on success.
    ///
    /// A non-zero exit becomes [`RecoveryError::CommandFailed`] carrying the
    /// exit code and captured stderr.
    pub fn shell(&self, line: &str) -> Result<String> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(line);
        self.run(cmd, line)
    }

    /// Runs `program` with `args` directly, without a shell.
    pub fn invoke(&self, program: &str, args: &[&str]) -> Result<String> {
        let mut display = program.to_string();
        for arg in args {
            display.push(' ');
            display.push_str(arg);
        }
        let mut cmd = Command::new(program);
        cmd.args(args);
        self.run(cmd, &display)
    }

    /// Like [`Executor::shell`] but reports the exit status instead of
    /// failing on it.
    ///
    /// Building block for probes whose non-zero exit is an answer rather
    /// than an error; see [`crate::net`].
    pub fn capture_shell(&self, line: &str) -> Result<CommandOutput> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(line);
        self.capture(cmd, line)
    }

    fn run(&self, cmd: Command, display: &str) -> Result<String> {
        let out = self.capture(cmd, display)?;
        if out.success() {
            self.journal.info(format!(
                "executed `{display}` ({} bytes of output)",
                out.stdout.len()
            ));
            Ok(out.stdout)
        } else {
            let err = RecoveryError::CommandFailed {
                command: display.to_string(),
                code: out.status,
                stderr: out.stderr,
            };
            self.journal.error(err.to_string());
            Err(err)
        }
    }

    fn capture(&self, mut cmd: Command, display: &str) -> Result<CommandOutput> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let err = RecoveryError::io(format!("spawning `{display}`"), e);
                self.journal.error(err.to_string());
                return Err(err);
            }
        };

        let output = match self.timeout {
            None => child
                .wait_with_output()
                .map_err(|e| RecoveryError::io(format!("waiting for `{display}`"), e))?,
            Some(limit) => {
                // A child that fills a pipe blocks until someone reads it,
                // so both pipes are drained on threads while the deadline
                // loop polls. On timeout the handles are dropped, not
                // joined; a grandchild holding the pipe open would stall
                // the join indefinitely.
                let stdout = child.stdout.take().map(drain);
                let stderr = child.stderr.take().map(drain);

                let start = Instant::now();
                let status = loop {
                    let done = child
                        .try_wait()
                        .map_err(|e| RecoveryError::io(format!("waiting for `{display}`"), e))?;
                    if let Some(status) = done {
                        break status;
                    }
                    if start.elapsed() > limit {
                        terminate(&mut child);
                        let err = RecoveryError::Timeout {
                            command: display.to_string(),
                            timeout: limit,
                        };
                        self.journal.error(err.to_string());
                        return Err(err);
                    }
                    thread::sleep(POLL_INTERVAL);
                };

                Output {
                    status,
                    stdout: stdout.map(gather).unwrap_or_default(),
                    stderr: stderr.map(gather).unwrap_or_default(),
                }
            }
        };

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Reads a pipe to EOF on its own thread.
fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn gather(reader: thread::JoinHandle<Vec<u8>>) -> Vec<u8> {
    reader.join().unwrap_or_default()
}

/// Best-effort terminate, then kill.
#[cfg(unix)]
fn terminate(child: &mut Child) {
    use nix::sys::signal::{Signal::SIGTERM, kill};
    use nix::unistd::Pid;

    let _ = kill(Pid::from_raw(child.id() as i32), SIGTERM);
    thread::sleep(Duration::from_millis(200));
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}
