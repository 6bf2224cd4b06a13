//! Uniform execution contract for every job kind.
//!
//! [`execute`] claims the record (pid + `running`), runs the kind-specific
//! [`JobRoutine`], and always leaves a terminal state on disk: `finished`, or
//! `error` with the failure chain in `errorMessage`. Routines report progress
//! through [`Job`], which owns the record and flushes it on
//! [`checkpoint`](Job::checkpoint).

use std::any::Any;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::error::{CoreError, Result};
use crate::paths::PathResolver;
use crate::readiness::{Producer, Readiness};
use crate::record::{JobKind, JobRecord, JobStatus, Progress, process_alive};

/// Shared handles every job needs: configuration, roots and the readiness
/// protocol.
#[derive(Debug, Clone)]
pub struct Context {
    pub config: EngineConfig,
    pub paths: PathResolver,
    pub readiness: Readiness,
}

impl Context {
    pub fn new(config: EngineConfig) -> Self {
        let paths = PathResolver::from_config(&config);
        let readiness = Readiness::new(paths.clone(), &config);
        Self {
            config,
            paths,
            readiness,
        }
    }
}

/// What to clear from the progress block once a job has finished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FinishPolicy {
    #[default]
    Keep,
    /// Many sources into one artifact: no source is "current" any more.
    ClearCurrentSource,
    /// One source into many files: no file is "current" any more.
    ClearCurrentFile,
}

#[async_trait]
pub trait JobRoutine: Send {
    fn finish_policy(&self) -> FinishPolicy {
        FinishPolicy::Keep
    }

    async fn run(&mut self, job: &mut Job) -> anyhow::Result<()>;
}

/// A record plus the context to persist it and drive readiness for it.
#[derive(Debug)]
pub struct Job {
    ctx: Context,
    record: JobRecord,
}

impl Job {
    /// Load a record the front end created.
    pub fn load(ctx: Context, id: &str, expected: JobKind) -> Result<Self> {
        let record = JobRecord::load(&ctx.paths, id)?;
        if record.kind != expected {
            return Err(CoreError::KindMismatch {
                id: id.to_owned(),
                expected: expected.to_string(),
                actual: record.kind.to_string(),
            });
        }
        Ok(Self { ctx, record })
    }

    /// Start a record in this process. Refuses to shadow a record whose
    /// owner is still running, or a terminal record whose content is already
    /// published.
    pub fn create<T: Serialize>(ctx: Context, kind: JobKind, id: &str, params: &T) -> Result<Self> {
        if let Some(existing) = JobRecord::try_load(&ctx.paths, id)? {
            let live = existing.state == JobStatus::Running && existing.pid.is_some_and(process_alive);
            let published = existing.state.is_terminal() && ctx.readiness.is_ready(id);
            if live || published {
                return Err(CoreError::AlreadyClaimed {
                    id: id.to_owned(),
                    state: existing.state.to_string(),
                    pid: existing.pid,
                });
            }
        }
        let record = JobRecord::with_params(kind, id, params)?;
        Ok(Self { ctx, record })
    }

    pub fn ctx(&self) -> &Context {
        &self.ctx
    }

    pub fn record(&self) -> &JobRecord {
        &self.record
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn kind(&self) -> JobKind {
        self.record.kind
    }

    pub fn progress(&self) -> &Progress {
        &self.record.progress
    }

    pub fn progress_mut(&mut self) -> &mut Progress {
        &mut self.record.progress
    }

    pub fn params<T: DeserializeOwned>(&self) -> Result<T> {
        self.record.params()
    }

    pub fn set_params<T: Serialize>(&mut self, params: &T) -> Result<()> {
        self.record.set_params(params)
    }

    /// Record a failure without aborting the routine. The job ends in
    /// `error` even if the routine returns `Ok`.
    pub fn set_error_message(&mut self, message: impl Into<String>) {
        self.record.error_message = Some(message.into());
    }

    /// Persist the current snapshot.
    pub fn checkpoint(&self) -> Result<()> {
        self.record.save(&self.ctx.paths)
    }

    pub fn producer(&self) -> Producer {
        Producer {
            kind: self.record.kind,
            id: self.record.id.clone(),
            pid: self.record.pid.unwrap_or_else(std::process::id),
        }
    }

    /// Claim a content path this job is about to write and make it current.
    pub fn start_file(&mut self, rel: &str) -> Result<()> {
        self.ctx.readiness.mark_in_progress(rel, &self.producer())?;
        self.record.progress.set_current_file(Some(rel.to_owned()));
        self.checkpoint()
    }

    /// Publish a content path this job has finished writing.
    pub fn finish_file(&mut self, rel: &str, mime: Option<&str>) -> Result<()> {
        self.ctx.readiness.mark_ready(rel, &self.producer(), mime)?;
        self.checkpoint()
    }

    pub fn into_record(self) -> JobRecord {
        self.record
    }
}

/// Run `routine` against `job` and persist the terminal state.
///
/// Routine failures never escape: they end up in the record and the returned
/// status is [`JobStatus::Error`]. `Err` is returned only when the record
/// cannot be claimed or persisted at all.
pub async fn execute<R>(job: &mut Job, routine: &mut R) -> Result<JobStatus>
where
    R: JobRoutine + ?Sized,
{
    if job.record.state != JobStatus::Created {
        return Err(CoreError::AlreadyClaimed {
            id: job.record.id.clone(),
            state: job.record.state.to_string(),
            pid: job.record.pid,
        });
    }

    job.record.pid = Some(std::process::id());
    job.record.state = JobStatus::Running;
    job.record.error_message = None;
    job.checkpoint()?;
    info!(job_id = %job.record.id, kind = %job.record.kind, "job started");

    let outcome = match AssertUnwindSafe(routine.run(job)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(payload) => Err(anyhow::anyhow!("job panicked: {}", panic_message(payload.as_ref()))),
    };

    match outcome {
        Ok(()) if job.record.error_message.is_none() => {
            match routine.finish_policy() {
                FinishPolicy::Keep => {}
                FinishPolicy::ClearCurrentSource => job.record.progress.set_current_source(None),
                FinishPolicy::ClearCurrentFile => job.record.progress.set_current_file(None),
            }
            job.record.state = JobStatus::Finished;
            info!(job_id = %job.record.id, "job finished");
        }
        Ok(()) => {
            job.record.state = JobStatus::Error;
            warn!(job_id = %job.record.id, "job finished with recorded failures");
        }
        Err(e) => {
            let mut message = format!("{e:#}");
            if message.trim().is_empty() {
                message = "unknown error".to_owned();
            }
            warn!(job_id = %job.record.id, error = %message, "job failed");
            job.record.error_message = Some(message);
            job.record.state = JobStatus::Error;
        }
    }

    if let Err(e) = job.checkpoint() {
        error!(job_id = %job.record.id, error = %e, "failed to persist terminal job state");
        return Err(e);
    }
    Ok(job.record.state)
}

/// Text of a caught panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn ctx(dir: &tempfile::TempDir) -> Context {
        Context::new(EngineConfig::rooted_at(dir.path()))
    }

    struct Counting {
        steps: u64,
        observed: Vec<u64>,
    }

    #[async_trait]
    impl JobRoutine for Counting {
        fn finish_policy(&self) -> FinishPolicy {
            FinishPolicy::ClearCurrentSource
        }

        async fn run(&mut self, job: &mut Job) -> anyhow::Result<()> {
            for i in 0..self.steps {
                job.progress_mut().set_current_source(Some(format!("src/{i}")));
                job.progress_mut().add_bytes(10);
                job.checkpoint()?;
                let on_disk = JobRecord::load(&job.ctx().paths, job.id())?;
                self.observed.push(on_disk.progress.processed_file_length());
            }
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl JobRoutine for Failing {
        async fn run(&mut self, job: &mut Job) -> anyhow::Result<()> {
            job.progress_mut().add_bytes(1);
            job.checkpoint()?;
            Err(anyhow::anyhow!("disk on fire").context("writing output"))
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn success_finishes_and_clears_current_source() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = Job::create(ctx(&dir), JobKind::Compress, "out.zip", &serde_json::json!({}))
            .unwrap();
        let mut routine = Counting {
            steps: 3,
            observed: Vec::new(),
        };

        let status = execute(&mut job, &mut routine).await.unwrap();
        assert_eq!(status, JobStatus::Finished);
        assert!(routine.observed.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(routine.observed, vec![10, 20, 30]);

        let on_disk = JobRecord::load(&ctx(&dir).paths, "out.zip").unwrap();
        assert_eq!(on_disk.state, JobStatus::Finished);
        assert_eq!(on_disk.pid, Some(std::process::id()));
        assert_eq!(on_disk.progress.current_source(), None);
        assert!(logs_contain("job finished"));
    }

    #[tokio::test]
    async fn failure_is_persisted_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = Job::create(ctx(&dir), JobKind::Convert, "x.mp4", &serde_json::json!({}))
            .unwrap();

        let status = execute(&mut job, &mut Failing).await.unwrap();
        assert_eq!(status, JobStatus::Error);

        let on_disk = JobRecord::load(&ctx(&dir).paths, "x.mp4").unwrap();
        assert_eq!(on_disk.state, JobStatus::Error);
        assert_eq!(on_disk.pid, Some(std::process::id()));
        let message = on_disk.error_message.unwrap();
        assert!(message.contains("writing output"));
        assert!(message.contains("disk on fire"));
        assert_eq!(on_disk.progress.processed_file_length(), 1);
    }

    #[tokio::test]
    async fn claimed_records_are_never_re_executed() {
        let dir = tempfile::tempdir().unwrap();
        let mut record = JobRecord::new(JobKind::Compress, "old.zip");
        record.state = JobStatus::Finished;
        record.pid = Some(1);
        record.save(&ctx(&dir).paths).unwrap();

        let mut job = Job::load(ctx(&dir), "old.zip", JobKind::Compress).unwrap();
        let err = execute(&mut job, &mut Failing).await.unwrap_err();
        assert!(matches!(err, CoreError::AlreadyClaimed { .. }));

        let on_disk = JobRecord::load(&ctx(&dir).paths, "old.zip").unwrap();
        assert_eq!(on_disk.state, JobStatus::Finished);
        assert_eq!(on_disk.pid, Some(1));
    }

    #[test]
    fn live_owner_blocks_a_second_writer() {
        let dir = tempfile::tempdir().unwrap();
        let mut record = JobRecord::new(JobKind::OfflineDownload, "file.iso");
        record.state = JobStatus::Running;
        record.pid = Some(std::process::id());
        record.save(&ctx(&dir).paths).unwrap();

        let err = Job::create(
            ctx(&dir),
            JobKind::OfflineDownload,
            "file.iso",
            &serde_json::json!({}),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::AlreadyClaimed { .. }));
    }

    #[tokio::test]
    async fn panicking_routine_still_ends_in_error() {
        struct Panicking;

        #[async_trait]
        impl JobRoutine for Panicking {
            async fn run(&mut self, job: &mut Job) -> anyhow::Result<()> {
                job.progress_mut().add_bytes(5);
                job.checkpoint()?;
                let empty: Vec<u64> = Vec::new();
                let at = job.progress().processed_file_length() as usize;
                let _ = empty[at];
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let mut job = Job::create(ctx(&dir), JobKind::Convert, "p.mp4", &serde_json::json!({}))
            .unwrap();
        assert_eq!(execute(&mut job, &mut Panicking).await.unwrap(), JobStatus::Error);

        let on_disk = JobRecord::load(&ctx(&dir).paths, "p.mp4").unwrap();
        assert_eq!(on_disk.state, JobStatus::Error);
        assert_eq!(on_disk.pid, Some(std::process::id()));
        let message = on_disk.error_message.unwrap();
        assert!(message.starts_with("job panicked: "));
        assert!(message.contains("index out of bounds"));
        assert_eq!(on_disk.progress.processed_file_length(), 5);
    }

    #[test]
    fn panic_payloads_are_rendered() {
        assert_eq!(panic_message(&"boom"), "boom");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&7u8), "unknown panic");
    }

    #[test]
    fn published_terminal_record_is_not_recreated() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(&dir);
        let mut record = JobRecord::new(JobKind::OfflineDownload, "inbox/a.pdf");
        record.state = JobStatus::Finished;
        record.pid = Some(1);
        record.save(&ctx.paths).unwrap();

        // Content not published yet: a failed earlier attempt may be retried.
        assert!(
            Job::create(ctx.clone(), JobKind::OfflineDownload, "inbox/a.pdf", &serde_json::json!({}))
                .is_ok()
        );

        let producer = Producer {
            kind: JobKind::OfflineDownload,
            id: "inbox/a.pdf".into(),
            pid: 1,
        };
        ctx.readiness.mark_in_progress("inbox/a.pdf", &producer).unwrap();
        ctx.readiness.mark_ready("inbox/a.pdf", &producer, None).unwrap();

        let err = Job::create(
            ctx.clone(),
            JobKind::OfflineDownload,
            "inbox/a.pdf",
            &serde_json::json!({}),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::AlreadyClaimed { .. }));
        let on_disk = JobRecord::load(&ctx.paths, "inbox/a.pdf").unwrap();
        assert_eq!(on_disk.state, JobStatus::Finished);
        assert_eq!(on_disk.pid, Some(1));
    }

    #[test]
    fn load_checks_the_kind() {
        let dir = tempfile::tempdir().unwrap();
        JobRecord::new(JobKind::Compress, "a.zip")
            .save(&ctx(&dir).paths)
            .unwrap();
        assert!(matches!(
            Job::load(ctx(&dir), "a.zip", JobKind::Decompress),
            Err(CoreError::KindMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn recorded_error_message_prevents_finish() {
        struct Partial;

        #[async_trait]
        impl JobRoutine for Partial {
            async fn run(&mut self, job: &mut Job) -> anyhow::Result<()> {
                job.set_error_message("one subtree failed");
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let mut job = Job::create(ctx(&dir), JobKind::CrossAppCopy, "dst", &serde_json::json!({}))
            .unwrap();
        assert_eq!(execute(&mut job, &mut Partial).await.unwrap(), JobStatus::Error);
        assert_eq!(
            job.record().error_message.as_deref(),
            Some("one subtree failed")
        );
    }

    #[test]
    fn file_production_goes_through_the_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = Job::create(ctx(&dir), JobKind::Decompress, "a.zip", &serde_json::json!({}))
            .unwrap();
        job.start_file("out/readme.txt").unwrap();
        assert!(!job.ctx().readiness.is_ready("out/readme.txt"));
        assert_eq!(job.progress().current_file(), Some("out/readme.txt"));

        job.finish_file("out/readme.txt", Some("text/plain")).unwrap();
        assert!(job.ctx().readiness.is_ready("out/readme.txt"));
    }
}
