//! File-readiness protocol.
//!
//! Producers and consumers may be unrelated worker processes, so the sidecar
//! file next to each content path is the only rendezvous point. A producer
//! writes an `inprogress` sidecar naming itself before the first byte and
//! replaces it with a `ready` sidecar once the bytes are durable. Consumers
//! poll. A ready sidecar is never reverted.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::atomic;
use crate::config::EngineConfig;
use crate::error::{CoreError, Result};
use crate::paths::PathResolver;
use crate::record::JobKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state")]
pub enum Sidecar {
    #[serde(rename = "inprogress")]
    InProgress {
        #[serde(rename = "type")]
        kind: JobKind,
        id: String,
        pid: u32,
    },
    #[serde(rename = "ready")]
    Ready {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime: Option<String>,
    },
}

/// The job currently producing a content path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Producer {
    pub kind: JobKind,
    pub id: String,
    pub pid: u32,
}

#[derive(Debug, Clone)]
pub struct Readiness {
    paths: PathResolver,
    poll_interval: Duration,
    wait_timeout: Option<Duration>,
}

impl Readiness {
    pub fn new(paths: PathResolver, cfg: &EngineConfig) -> Self {
        Self {
            paths,
            poll_interval: cfg.poll_interval,
            wait_timeout: cfg.wait_timeout,
        }
    }

    pub fn paths(&self) -> &PathResolver {
        &self.paths
    }

    /// Current sidecar of `rel`, `None` when no job has touched it.
    pub fn read(&self, rel: &str) -> Result<Option<Sidecar>> {
        atomic::read_json(&self.paths.sidecar_path(rel)?)
    }

    /// Non-blocking check. Absent, in-progress and unreadable sidecars all
    /// count as not ready.
    pub fn is_ready(&self, rel: &str) -> bool {
        match self.read(rel) {
            Ok(Some(Sidecar::Ready { .. })) => true,
            Ok(_) => false,
            Err(e) => {
                debug!(path = %rel, error = %e, "sidecar unreadable; treating as not ready");
                false
            }
        }
    }

    /// Claim `rel` before writing its bytes.
    pub fn mark_in_progress(&self, rel: &str, producer: &Producer) -> Result<()> {
        let path = self.paths.sidecar_path(rel)?;
        if let Some(Sidecar::Ready { .. }) = atomic::read_json::<Sidecar>(&path)? {
            return Err(CoreError::AlreadyReady {
                path: rel.to_owned(),
            });
        }
        atomic::write_json(
            &path,
            &Sidecar::InProgress {
                kind: producer.kind,
                id: producer.id.clone(),
                pid: producer.pid,
            },
        )
    }

    /// Publish `rel` as complete. Only the producer that claimed it may do so.
    pub fn mark_ready(&self, rel: &str, producer: &Producer, mime: Option<&str>) -> Result<()> {
        let path = self.paths.sidecar_path(rel)?;
        match atomic::read_json::<Sidecar>(&path)? {
            Some(Sidecar::InProgress { id, pid, .. }) if id == producer.id && pid == producer.pid => {}
            Some(Sidecar::Ready { .. }) => {
                return Err(CoreError::AlreadyReady {
                    path: rel.to_owned(),
                });
            }
            Some(Sidecar::InProgress { id, pid, .. }) => {
                return Err(CoreError::NotOwner {
                    path: rel.to_owned(),
                    owner: id,
                    pid,
                });
            }
            None => {
                return Err(CoreError::NotOwner {
                    path: rel.to_owned(),
                    owner: String::new(),
                    pid: 0,
                });
            }
        }
        atomic::write_json(
            &path,
            &Sidecar::Ready {
                mime: mime.map(str::to_owned),
            },
        )
    }

    /// Block until `rel` is ready, polling at the configured interval.
    ///
    /// Without a configured timeout this never gives up: a producer that dies
    /// mid-write stalls every consumer waiting on it.
    pub async fn wait_until_ready(&self, rel: &str) -> Result<()> {
        self.paths.sidecar_path(rel)?;
        let started = tokio::time::Instant::now();
        let mut logged = false;
        loop {
            if self.is_ready(rel) {
                return Ok(());
            }
            if let Some(limit) = self.wait_timeout {
                if started.elapsed() >= limit {
                    return Err(CoreError::WaitTimeout {
                        path: rel.to_owned(),
                    });
                }
            }
            if !logged {
                debug!(path = %rel, "waiting for content to become ready");
                logged = true;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Wait for every path in order.
    pub async fn wait_all(&self, rels: &[String]) -> Result<()> {
        for rel in rels {
            self.wait_until_ready(rel).await?;
        }
        Ok(())
    }

    /// Delete a content file together with its sidecar.
    pub fn discard(&self, rel: &str) -> Result<()> {
        for path in [self.paths.resolve_content(rel)?, self.paths.sidecar_path(rel)?] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CoreError::io(path, e)),
            }
        }
        Ok(())
    }
}

/// Expand declared sources to the leaf files they contain.
///
/// Readiness is tracked per file, so a directory source stands for every file
/// below it. Results keep source order, with directory contents sorted by name.
pub fn expand_leaves(paths: &PathResolver, sources: &[String]) -> Result<Vec<String>> {
    let mut leaves = Vec::new();
    for source in sources {
        let root = paths.resolve_content(source)?;
        if !root.is_dir() {
            leaves.push(source.clone());
            continue;
        }
        for entry in WalkDir::new(&root).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(&root).to_path_buf();
                CoreError::io(path, e.into())
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            match paths.content_relative(entry.path()) {
                Some(rel) => leaves.push(rel),
                None => warn!(path = %entry.path().display(), "leaf outside content root skipped"),
            }
        }
    }
    Ok(leaves)
}
