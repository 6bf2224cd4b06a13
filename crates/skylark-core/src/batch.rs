//! Dependency-ordered batch scheduling for audio/video merges.
//!
//! Candidates are enumerated once from the content tree. The scheduler then
//! polls the readiness protocol, executing each candidate as soon as both of
//! its inputs are ready and dropping it from the pending list. Files that
//! appear after enumeration are never picked up by the same run.

use std::future::Future;
use std::time::Duration;

use regex::{Regex, RegexBuilder};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{CoreError, Result};
use crate::paths::PathResolver;
use crate::readiness::Readiness;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeCandidate {
    pub video: String,
    pub audio: String,
    pub output: String,
}

/// Video matcher plus audio/output templates in priority order.
///
/// Templates use `$1` / `${name}` references to the video pattern's groups.
/// A reference takes every following letter, digit and `_`, so `$1_x` names a
/// group `1_x`; write `${1}_x` instead. Unknown groups are rejected up front.
#[derive(Debug, Clone)]
pub struct MergePatterns {
    video: Regex,
    audio: Vec<String>,
    output: Vec<String>,
}

impl MergePatterns {
    pub fn new(video: &str, audio: Vec<String>, output: Vec<String>) -> Result<Self> {
        let video = RegexBuilder::new(video)
            .case_insensitive(true)
            .build()
            .map_err(|source| CoreError::Pattern {
                pattern: video.to_owned(),
                source,
            })?;
        for template in audio.iter().chain(&output) {
            let unknown = template_groups(template).into_iter().find(|g| !has_group(&video, g));
            if let Some(group) = unknown {
                return Err(CoreError::Template {
                    template: template.clone(),
                    group: group.to_owned(),
                });
            }
        }
        Ok(Self {
            video,
            audio,
            output,
        })
    }

    /// Build the candidate for one relative path, if it is a video with an
    /// existing audio counterpart and a free output slot.
    pub fn candidate(&self, rel: &str, exists: impl Fn(&str) -> bool) -> Option<MergeCandidate> {
        let caps = self.video.captures(rel)?;
        let expand = |template: &String| {
            let mut out = String::new();
            caps.expand(template, &mut out);
            out
        };
        let audio = self.audio.iter().map(&expand).find(|p| exists(p))?;
        let output = self.output.iter().map(&expand).find(|p| !exists(p))?;
        Some(MergeCandidate {
            video: rel.to_owned(),
            audio,
            output,
        })
    }
}

/// Group references in an expansion template, read the way
/// [`regex::Captures::expand`] reads them.
fn template_groups(template: &str) -> Vec<&str> {
    let mut groups = Vec::new();
    let mut rest = template;
    while let Some(at) = rest.find('$') {
        rest = &rest[at + 1..];
        if let Some(after) = rest.strip_prefix('$') {
            rest = after;
            continue;
        }
        if let Some(braced) = rest.strip_prefix('{') {
            if let Some(end) = braced.find('}') {
                groups.push(&braced[..end]);
                rest = &braced[end + 1..];
            }
            continue;
        }
        let end = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        if end > 0 {
            groups.push(&rest[..end]);
        }
        rest = &rest[end..];
    }
    groups
}

fn has_group(re: &Regex, group: &str) -> bool {
    match group.parse::<usize>() {
        Ok(index) => index < re.captures_len(),
        Err(_) => re.capture_names().flatten().any(|name| name == group),
    }
}

/// Walk `root` once and collect merge candidates in name order.
pub fn enumerate_candidates(
    paths: &PathResolver,
    root: &str,
    patterns: &MergePatterns,
) -> Result<Vec<MergeCandidate>> {
    let base = paths.resolve_content(root)?;
    let exists = |rel: &str| {
        paths
            .resolve_content(rel)
            .map(|p| p.is_file())
            .unwrap_or(false)
    };

    let mut candidates = Vec::new();
    for entry in WalkDir::new(&base).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(&base).to_path_buf();
            CoreError::Io {
                path,
                source: e.into(),
            }
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(rel) = paths.content_relative(entry.path()) else {
            continue;
        };
        if let Some(candidate) = patterns.candidate(&rel, &exists) {
            debug!(video = %candidate.video, audio = %candidate.audio, output = %candidate.output, "merge candidate");
            candidates.push(candidate);
        }
    }
    Ok(candidates)
}

#[derive(Debug, Clone)]
pub struct BatchScheduler {
    readiness: Readiness,
    rescan_interval: Duration,
    delete_sources: bool,
}

impl BatchScheduler {
    pub fn new(readiness: Readiness, rescan_interval: Duration) -> Self {
        Self {
            readiness,
            rescan_interval,
            delete_sources: false,
        }
    }

    /// Delete both inputs (bytes and sidecars) after a successful merge.
    pub fn delete_sources(mut self, yes: bool) -> Self {
        self.delete_sources = yes;
        self
    }

    /// Drive `pending` to completion, returning how many candidates ran.
    ///
    /// A candidate is retired the moment it is handed to `merge`, whatever
    /// the outcome. Inputs are only deleted when `merge` succeeds. Loops
    /// forever while any input stays unready.
    pub async fn run<F, Fut>(&self, mut pending: Vec<MergeCandidate>, mut merge: F) -> usize
    where
        F: FnMut(MergeCandidate) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let mut executed = 0;
        info!(candidates = pending.len(), "batch merge scheduling started");
        while !pending.is_empty() {
            let mut i = 0;
            while i < pending.len() {
                let c = &pending[i];
                if !self.readiness.is_ready(&c.video) || !self.readiness.is_ready(&c.audio) {
                    i += 1;
                    continue;
                }
                let candidate = pending.remove(i);
                executed += 1;
                match merge(candidate.clone()).await {
                    Ok(()) if self.delete_sources => {
                        for input in [&candidate.video, &candidate.audio] {
                            if let Err(e) = self.readiness.discard(input) {
                                warn!(path = %input, error = %e, "failed to delete merge source");
                            }
                        }
                    }
                    Ok(()) => {}
                    Err(e) => {
                        warn!(output = %candidate.output, error = %e, "merge failed; sources kept");
                    }
                }
            }
            if pending.is_empty() {
                break;
            }
            tokio::time::sleep(self.rescan_interval).await;
        }
        info!(executed, "batch merge scheduling finished");
        executed
    }
}
