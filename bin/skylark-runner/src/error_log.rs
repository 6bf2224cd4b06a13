//! Process-wide error log for failures that have no job record to land in.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use tracing::warn;

/// Append-only sink at `<state>/error.log`, one per process.
///
/// Each entry is `[<UTC timestamp>] <message>` followed by a blank line. The
/// file is opened once, when the sink is built. If that fails, the next
/// append tries again and otherwise only logs a warning.
#[derive(Debug)]
pub struct ErrorLog {
    path: PathBuf,
    out: Mutex<Option<BufWriter<File>>>,
}

impl ErrorLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let out = match open(&path) {
            Ok(file) => Some(BufWriter::new(file)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot open the error log");
                None
            }
        };
        Self {
            path,
            out: Mutex::new(out),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, message: &str) {
        let mut out = match self.out.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if out.is_none() {
            match open(&self.path) {
                Ok(file) => *out = Some(BufWriter::new(file)),
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "cannot open the error log");
                    return;
                }
            }
        }
        let Some(out) = out.as_mut() else {
            return;
        };
        let stamp = Utc::now().format("%Y-%m-%d %H:%M:%S%.3f UTC");
        if let Err(e) = write!(out, "[{stamp}] {message}\n\n").and_then(|()| out.flush()) {
            warn!(error = %e, "failed to write the error log");
        }
    }
}

impl Drop for ErrorLog {
    fn drop(&mut self) {
        if let Ok(Some(out)) = self.out.get_mut() {
            let _ = out.flush();
        }
    }
}

fn open(path: &Path) -> io::Result<File> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}
