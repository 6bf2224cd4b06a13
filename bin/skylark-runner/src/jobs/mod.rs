//! Job routines, one module per job kind.

pub mod archive;
pub mod copy;
pub mod fetch;
pub mod ftp;
pub mod merge;
pub mod transcode;

use std::fmt;
use std::path::PathBuf;

use skylark_core::Context;
use skylark_fetch::Fetcher;

use crate::config::RunnerConfig;

/// Everything a routine needs besides its own record.
#[derive(Debug, Clone)]
pub struct Services {
    pub ctx: Context,
    pub fetcher: Fetcher,
    /// Transcoder executable.
    pub ffmpeg: PathBuf,
}

impl Services {
    pub fn new(ctx: Context, config: &RunnerConfig) -> anyhow::Result<Self> {
        Ok(Self {
            ctx,
            fetcher: Fetcher::new(config.slow_hosts.clone())?,
            ffmpeg: config.ffmpeg.clone(),
        })
    }
}

/// One entry an external tool could not process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFailure {
    pub entry: String,
    pub message: String,
}

/// Every failure one tool run produced, surfaced as a single error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolFailure {
    pub tool: &'static str,
    pub failures: Vec<EntryFailure>,
}

impl ToolFailure {
    pub fn new(tool: &'static str) -> Self {
        Self {
            tool,
            failures: Vec::new(),
        }
    }

    pub fn push(&mut self, entry: impl Into<String>, message: impl fmt::Display) {
        self.failures.push(EntryFailure {
            entry: entry.into(),
            message: message.to_string(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// `Err(self)` when anything was recorded.
    pub fn into_result(self) -> Result<(), ToolFailure> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for ToolFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed on {} entr", self.tool, self.failures.len())?;
        f.write_str(if self.failures.len() == 1 { "y" } else { "ies" })?;
        for failure in &self.failures {
            write!(f, "\n  {}: {}", failure.entry, failure.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ToolFailure {}
