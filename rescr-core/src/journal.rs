//! Append-only event journal.
//!
//! Every recovery operation writes one line per event to a journal file so
//! that a session can be reconstructed after the fact. The journal is an
//! explicitly constructed instance handed to each component rather than a
//! process-global logger; it lives for the lifetime of the process and is
//! closed when dropped.
//!
//! Records are written through to the file as they happen, so the journal
//! survives a flash that wedges the machine. Write failures are swallowed:
//! an unwritable journal must never block recovery work.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Local;

use crate::error::{RecoveryError, Result};

#[derive(Clone, Copy)]
enum Level {
    Info,
    Warn,
    Error,
}

impl Level {
    fn tag(self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

/// An append-only, timestamped event log.
pub struct Journal {
    path: PathBuf,
    sink: Mutex<File>,
}

impl Journal {
    /// Opens the journal at `path` in append mode, creating it if necessary.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| RecoveryError::io(format!("opening journal {}", path.display()), e))?;
        Ok(Self {
            path,
            sink: Mutex::new(file),
        })
    }

    /// Where this journal writes to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records an informational event.
    pub fn info(&self, message: impl AsRef<str>) {
        self.record(Level::Info, message.as_ref());
    }

    /// Records a warning.
    pub fn warn(&self, message: impl AsRef<str>) {
        self.record(Level::Warn, message.as_ref());
    }

    /// Records an error.
    pub fn error(&self, message: impl AsRef<str>) {
        self.record(Level::Error, message.as_ref());
    }

    fn record(&self, level: Level, message: &str) {
        let ts = Local::now().format("%Y-%m-%d %H:%M:%S");
        if let Ok(mut sink) = self.sink.lock() {
            let _ = writeln!(sink, "[{ts}] {:<5} {message}", level.tag());
        }
    }
}
