//! Persisted job records.
//!
//! One JSON document per job id under the state root (`<id>.task`). The front
//! end creates records for most job kinds and polls them for progress; the
//! worker that executes the job is the only writer while it runs.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::atomic;
use crate::error::{CoreError, Result};
use crate::paths::PathResolver;

/// Closed set of job kinds the worker knows how to run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum JobKind {
    OfflineDownload,
    Compress,
    Decompress,
    Convert,
    CrossAppCopy,
    FtpUpload,
    BatchMergeVa,
}

/// Lifecycle state of a record. `Created` records have not been picked up by
/// a worker yet; `Finished` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobStatus {
    Created,
    Running,
    Finished,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Error)
    }
}

/// Progress counters of one execution.
///
/// Processed counters only move forward: the API exposes increments and
/// high-water-mark updates, never a way to lower a value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    #[serde(default)]
    processed_file_length: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file_length: Option<u64>,
    #[serde(default)]
    processed_file_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file_count: Option<u64>,
    #[serde(default)]
    processed_source_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source_count: Option<u64>,
    #[serde(default)]
    processed_duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    current_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    current_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mime: Option<String>,
}

impl Progress {
    pub fn processed_file_length(&self) -> u64 {
        self.processed_file_length
    }

    pub fn file_length(&self) -> Option<u64> {
        self.file_length
    }

    pub fn processed_file_count(&self) -> u64 {
        self.processed_file_count
    }

    pub fn file_count(&self) -> Option<u64> {
        self.file_count
    }

    pub fn processed_source_count(&self) -> u64 {
        self.processed_source_count
    }

    pub fn source_count(&self) -> Option<u64> {
        self.source_count
    }

    pub fn processed_duration_ms(&self) -> u64 {
        self.processed_duration_ms
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.duration_ms
    }

    pub fn current_file(&self) -> Option<&str> {
        self.current_file.as_deref()
    }

    pub fn current_source(&self) -> Option<&str> {
        self.current_source.as_deref()
    }

    pub fn mime(&self) -> Option<&str> {
        self.mime.as_deref()
    }

    pub fn add_bytes(&mut self, n: u64) {
        self.processed_file_length = self.processed_file_length.saturating_add(n);
    }

    /// Raise the processed byte count to `total` if it is higher.
    pub fn raise_bytes(&mut self, total: u64) {
        self.processed_file_length = self.processed_file_length.max(total);
    }

    pub fn add_files(&mut self, n: u64) {
        self.processed_file_count = self.processed_file_count.saturating_add(n);
    }

    pub fn add_sources(&mut self, n: u64) {
        self.processed_source_count = self.processed_source_count.saturating_add(n);
    }

    pub fn raise_duration_ms(&mut self, ms: u64) {
        self.processed_duration_ms = self.processed_duration_ms.max(ms);
    }

    pub fn set_file_length(&mut self, total: Option<u64>) {
        self.file_length = total;
    }

    pub fn set_file_count(&mut self, total: Option<u64>) {
        self.file_count = total;
    }

    pub fn set_source_count(&mut self, total: Option<u64>) {
        self.source_count = total;
    }

    pub fn set_duration_ms(&mut self, total: Option<u64>) {
        self.duration_ms = total;
    }

    pub fn set_current_file(&mut self, rel: Option<String>) {
        self.current_file = rel;
    }

    pub fn set_current_source(&mut self, rel: Option<String>) {
        self.current_source = rel;
    }

    pub fn set_mime(&mut self, mime: Option<String>) {
        self.mime = mime;
    }
}

/// Per-entry tally for tools that report "entry N started" but not
/// "entry N finished": an entry's size and count are committed when the next
/// entry starts, or when the tool returns.
#[derive(Debug, Default)]
pub struct EntryTally {
    pending_bytes: u64,
    pending_items: u64,
    per_source: bool,
}

impl EntryTally {
    /// Entries count towards the processed file count (extraction).
    pub fn files() -> Self {
        Self::default()
    }

    /// Entries count towards the processed source count (compression).
    pub fn sources() -> Self {
        Self {
            per_source: true,
            ..Self::default()
        }
    }

    /// Commit the previous entry and hold `size` for the one starting now.
    pub fn begin(&mut self, progress: &mut Progress, size: u64) {
        self.commit(progress);
        self.pending_bytes = size;
        self.pending_items = 1;
    }

    /// Drop the held entry without crediting it.
    pub fn abandon(&mut self) {
        self.pending_bytes = 0;
        self.pending_items = 0;
    }

    pub fn commit(&mut self, progress: &mut Progress) {
        progress.add_bytes(std::mem::take(&mut self.pending_bytes));
        let items = std::mem::take(&mut self.pending_items);
        if self.per_source {
            progress.add_sources(items);
        } else {
            progress.add_files(items);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    #[serde(rename = "type")]
    pub kind: JobKind,
    pub id: String,
    #[serde(default)]
    pub pid: Option<u32>,
    pub state: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub progress: Progress,
}

impl JobRecord {
    /// A fresh, not yet persisted record.
    pub fn new(kind: JobKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            pid: None,
            state: JobStatus::Created,
            error_message: None,
            params: serde_json::Value::Object(Default::default()),
            progress: Progress::default(),
        }
    }

    pub fn with_params<T: Serialize>(kind: JobKind, id: impl Into<String>, params: &T) -> Result<Self> {
        let mut record = Self::new(kind, id);
        record.set_params(params)?;
        Ok(record)
    }

    pub fn try_load(paths: &PathResolver, id: &str) -> Result<Option<Self>> {
        atomic::read_json(&paths.record_path(id)?)
    }

    pub fn load(paths: &PathResolver, id: &str) -> Result<Self> {
        Self::try_load(paths, id)?.ok_or_else(|| CoreError::RecordNotFound { id: id.to_owned() })
    }

    /// Replace the record file with the current snapshot.
    pub fn save(&self, paths: &PathResolver) -> Result<()> {
        atomic::write_json(&paths.record_path(&self.id)?, self)
    }

    pub fn params<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.params.clone()).map_err(|source| CoreError::InvalidParams {
            id: self.id.clone(),
            source,
        })
    }

    pub fn set_params<T: Serialize>(&mut self, params: &T) -> Result<()> {
        self.params = serde_json::to_value(params).map_err(|source| CoreError::InvalidParams {
            id: self.id.clone(),
            source,
        })?;
        Ok(())
    }

    /// `running` on disk but the owning process is gone: the worker crashed
    /// or was killed mid-job.
    pub fn is_orphaned(&self) -> bool {
        self.state == JobStatus::Running && !self.pid.is_some_and(process_alive)
    }
}

/// Whether a process with this id currently exists on the host.
pub fn process_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn kind_tags_are_kebab_case_and_case_insensitive() {
        assert_eq!(JobKind::BatchMergeVa.as_ref(), "batch-merge-va");
        assert_eq!(JobKind::from_str("CROSS-APP-COPY").unwrap(), JobKind::CrossAppCopy);
        assert!(JobKind::from_str("rm-rf").is_err());
    }

    #[test]
    fn progress_never_moves_backwards() {
        let mut p = Progress::default();
        p.raise_bytes(100);
        p.raise_bytes(40);
        assert_eq!(p.processed_file_length(), 100);
        p.add_bytes(5);
        assert_eq!(p.processed_file_length(), 105);
        p.raise_duration_ms(2_000);
        p.raise_duration_ms(1_000);
        assert_eq!(p.processed_duration_ms(), 2_000);
    }

    #[test]
    fn tally_commits_previous_entry_on_begin() {
        let mut p = Progress::default();
        let mut tally = EntryTally::files();
        tally.begin(&mut p, 10);
        assert_eq!((p.processed_file_length(), p.processed_file_count()), (0, 0));
        tally.begin(&mut p, 20);
        assert_eq!((p.processed_file_length(), p.processed_file_count()), (10, 1));
        tally.commit(&mut p);
        tally.commit(&mut p);
        assert_eq!((p.processed_file_length(), p.processed_file_count()), (30, 2));
    }

    #[test]
    fn abandoned_entry_is_not_credited() {
        let mut p = Progress::default();
        let mut tally = EntryTally::files();
        tally.begin(&mut p, 10);
        tally.abandon();
        tally.begin(&mut p, 3);
        tally.commit(&mut p);
        assert_eq!((p.processed_file_length(), p.processed_file_count()), (3, 1));
    }

    #[test]
    fn source_tally_counts_sources() {
        let mut p = Progress::default();
        let mut tally = EntryTally::sources();
        tally.begin(&mut p, 4);
        tally.commit(&mut p);
        assert_eq!(p.processed_source_count(), 1);
        assert_eq!(p.processed_file_count(), 0);
        assert_eq!(p.processed_file_length(), 4);
    }

    #[test]
    fn save_and_load_preserve_params_and_progress() {
        let dir = tempfile::tempdir().unwrap();
        let paths = PathResolver::new(dir.path().join("Files"), dir.path().join("Data"));

        let mut record = JobRecord::with_params(
            JobKind::Compress,
            "out/a.zip",
            &serde_json::json!({ "sources": ["in"], "baseFolder": "" }),
        )
        .unwrap();
        record.progress.set_current_source(Some("in/x".into()));
        record.progress.add_bytes(7);
        record.save(&paths).unwrap();

        let on_disk = std::fs::read_to_string(dir.path().join("Data/out/a.zip.task")).unwrap();
        let raw: serde_json::Value = serde_json::from_str(&on_disk).unwrap();
        assert_eq!(raw["type"], "compress");
        assert_eq!(raw["state"], "created");
        assert_eq!(raw["progress"]["currentSource"], "in/x");

        let loaded = JobRecord::load(&paths, "out/a.zip").unwrap();
        assert_eq!(loaded.progress, record.progress);
        assert_eq!(loaded.params["sources"][0], "in");
    }

    #[test]
    fn missing_record_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let paths = PathResolver::new(dir.path().join("Files"), dir.path().join("Data"));
        assert!(matches!(
            JobRecord::load(&paths, "nope"),
            Err(CoreError::RecordNotFound { .. })
        ));
    }

    #[test]
    fn running_record_of_this_process_is_not_orphaned() {
        let mut record = JobRecord::new(JobKind::Convert, "x.mp4");
        record.state = JobStatus::Running;
        record.pid = Some(std::process::id());
        assert!(!record.is_orphaned());
        record.pid = None;
        assert!(record.is_orphaned());
    }
}
