//! Mapping of logical relative paths onto the content and state roots.
//!
//! Every user-visible path is relative and `/`-separated. The content root
//! holds the bytes, the state root mirrors its directory tree and holds one
//! `<path>.data` sidecar per content file plus one `<id>.task` record per job.
//! `%` and `#` are reserved for the sidecar naming scheme and are rejected.

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use crate::config::EngineConfig;
use crate::error::{CoreError, Result};

const RESERVED: &[char] = &['%', '#'];
const SIDECAR_SUFFIX: &str = ".data";
const RECORD_SUFFIX: &str = ".task";
const ERROR_LOG: &str = "error.log";

#[derive(Debug, Clone)]
pub struct PathResolver {
    content_root: PathBuf,
    state_root: PathBuf,
}

impl PathResolver {
    pub fn new(content_root: impl Into<PathBuf>, state_root: impl Into<PathBuf>) -> Self {
        Self {
            content_root: content_root.into(),
            state_root: state_root.into(),
        }
    }

    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self::new(cfg.content_root.clone(), cfg.state_root.clone())
    }

    pub fn content_root(&self) -> &Path {
        &self.content_root
    }

    pub fn state_root(&self) -> &Path {
        &self.state_root
    }

    /// Absolute location of the bytes for `rel`.
    pub fn resolve_content(&self, rel: &str) -> Result<PathBuf> {
        join_checked(&self.content_root, rel)
    }

    /// Location of `rel` inside the state tree (directories mirror content).
    pub fn resolve_state(&self, rel: &str) -> Result<PathBuf> {
        join_checked(&self.state_root, rel)
    }

    /// Sidecar file tracking the readiness of content path `rel`.
    pub fn sidecar_path(&self, rel: &str) -> Result<PathBuf> {
        self.suffixed(rel, SIDECAR_SUFFIX)
    }

    /// Record file of job `id`.
    pub fn record_path(&self, id: &str) -> Result<PathBuf> {
        self.suffixed(id, RECORD_SUFFIX)
    }

    pub fn error_log_path(&self) -> PathBuf {
        self.state_root.join(ERROR_LOG)
    }

    /// Inverse of [`resolve_content`](Self::resolve_content) for paths found
    /// by walking the content tree.
    pub fn content_relative(&self, absolute: &Path) -> Option<String> {
        let rest = absolute.strip_prefix(&self.content_root).ok()?;
        let parts: Vec<_> = rest
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }

    fn suffixed(&self, rel: &str, suffix: &str) -> Result<PathBuf> {
        if segments(rel)?.is_empty() {
            return Err(CoreError::InvalidPath {
                path: rel.to_owned(),
            });
        }
        let mut raw: OsString = self.resolve_state(rel)?.into_os_string();
        raw.push(suffix);
        Ok(PathBuf::from(raw))
    }
}

/// Reject reserved characters, absolute paths and parent traversal.
pub fn validate(rel: &str) -> Result<()> {
    segments(rel).map(|_| ())
}

/// Join two relative paths with `/`, treating an empty base as the root.
pub fn join(base: &str, name: &str) -> String {
    let base = base.trim_end_matches(['/', '\\']);
    let name = name.trim_start_matches(['/', '\\']);
    match (base.is_empty(), name.is_empty()) {
        (true, _) => name.to_owned(),
        (false, true) => base.to_owned(),
        (false, false) => format!("{base}/{name}"),
    }
}

/// Last segment of a relative path.
pub fn file_name(rel: &str) -> &str {
    let trimmed = rel.trim_end_matches(['/', '\\']);
    trimmed
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(trimmed)
}

/// Everything before the last segment, or `""` for top-level paths.
pub fn parent(rel: &str) -> &str {
    let trimmed = rel.trim_end_matches(['/', '\\']);
    match trimmed.rfind(['/', '\\']) {
        Some(i) => &trimmed[..i],
        None => "",
    }
}

fn segments(rel: &str) -> Result<Vec<&str>> {
    let invalid = || CoreError::InvalidPath {
        path: rel.to_owned(),
    };
    if rel.contains(RESERVED) || rel.starts_with(['/', '\\']) {
        return Err(invalid());
    }
    let mut out = Vec::new();
    for seg in rel.split(['/', '\\']) {
        match seg {
            "" | "." => continue,
            ".." => return Err(invalid()),
            _ => {}
        }
        // Drive prefixes and roots only show up on absolute inputs.
        if Path::new(seg)
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(invalid());
        }
        out.push(seg);
    }
    Ok(out)
}

fn join_checked(root: &Path, rel: &str) -> Result<PathBuf> {
    let mut path = root.to_path_buf();
    for seg in segments(rel)? {
        path.push(seg);
    }
    Ok(path)
}
