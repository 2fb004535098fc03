//! The failure taxonomy shared by every recovery operation.
//!
//! Each variant identifies a distinct failure class so that callers can react
//! programmatically instead of parsing message strings. The retry wrapper in
//! [`crate::retry`] relies on [`RecoveryError::is_retryable`] to tell
//! transient failures (a busy device, a flaky command) apart from permanent
//! ones (a missing file, an unknown image format), which it never re-runs.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type used throughout the library.
pub type Result<T, E = RecoveryError> = std::result::Result<T, E>;

/// Failures a recovery operation can surface.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// A path the operation depends on does not exist.
    #[error("path not found: {}", .0.display())]
    PathNotFound(PathBuf),

    /// An external command ran but did not exit successfully.
    #[error("command `{command}` failed with {}{}", exit_label(.code), stderr_excerpt(.stderr))]
    CommandFailed {
        /// The command line as it was launched.
        command: String,
        /// Exit code, or `None` if the process was killed by a signal.
        code: Option<i32>,
        /// Captured standard error, possibly empty.
        stderr: String,
    },

    /// An external command exceeded its execution deadline and was killed.
    #[error("command `{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    /// The flasher does not recognise the image's file extension.
    #[error("unsupported image format {0:?}")]
    UnsupportedFormat(String),

    /// Every configured flash method was attempted once and all of them failed.
    #[error("all flash methods failed for {}", .0.display())]
    MethodsExhausted(PathBuf),

    /// Torrent-to-ISO conversion was required but is unavailable or failed.
    #[error("torrent conversion failed: {0}")]
    Conversion(String),

    /// Block-device discovery could not complete.
    #[error("device discovery failed: {0}")]
    Discovery(String),

    /// The retry wrapper ran out of attempts.
    #[error("failed after {attempts} attempts")]
    RetryExhausted { attempts: u32 },

    /// The user interrupted the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// An underlying I/O failure, with the context it happened in.
    #[error("{context}: {source}")]
    Io {
        context: String,
        source: io::Error,
    },
}

impl RecoveryError {
    /// Wraps an [`io::Error`] with a short description of what was being done.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether another attempt at the same operation could plausibly succeed.
    ///
    /// Command failures, timeouts, I/O errors and an exhausted method chain
    /// are treated as transient; everything else is permanent. `Cancelled` is
    /// deliberately permanent so a Ctrl-C is honoured on the spot.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CommandFailed { .. }
                | Self::Timeout { .. }
                | Self::MethodsExhausted(_)
                | Self::Io { .. }
        )
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("exit code {c}"),
        None => "a signal".to_string(),
    }
}

fn stderr_excerpt(stderr: &str) -> String {
    match stderr.lines().find(|l| !l.trim().is_empty()) {
        Some(line) => format!(": {}", line.trim()),
        None => String::new(),
    }
}
