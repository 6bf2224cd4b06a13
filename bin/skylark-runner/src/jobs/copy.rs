//! Copy a file or a directory tree from another instance of the front end.

use std::fmt;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use skylark_core::{FinishPolicy, Job, JobRoutine, paths};
use skylark_fetch::{AppClient, EntryKind, RemoteEntry, RemoteFile};
use tracing::{debug, info, warn};

use super::Services;
use super::fetch::offline_download;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyParams {
    pub domain: String,
    pub source: String,
    pub target: String,
}

/// The host files are copied from.
#[async_trait]
pub trait RemoteHost: Send + Sync {
    async fn details(&self, source: &str) -> anyhow::Result<RemoteFile>;

    async fn list(&self, source: &str) -> anyhow::Result<Vec<RemoteEntry>>;

    /// Fetch `source` into the content directory `target`. Returns the
    /// content path written.
    async fn download(&self, source: &str, target: &str, mime: Option<&str>) -> anyhow::Result<String>;
}

/// [`RemoteHost`] over the front end's HTTP API, with every download run as a
/// nested offline download.
pub struct HttpRemote {
    services: Services,
    api: AppClient,
}

impl HttpRemote {
    pub fn new(services: Services, domain: &str) -> anyhow::Result<Self> {
        let api = AppClient::new(services.fetcher.client().clone(), domain)?;
        Ok(Self { services, api })
    }
}

#[async_trait]
impl RemoteHost for HttpRemote {
    async fn details(&self, source: &str) -> anyhow::Result<RemoteFile> {
        Ok(self.api.details(source).await?)
    }

    async fn list(&self, source: &str) -> anyhow::Result<Vec<RemoteEntry>> {
        Ok(self.api.list(source).await?)
    }

    async fn download(&self, source: &str, target: &str, mime: Option<&str>) -> anyhow::Result<String> {
        let url = self.api.download_url(source);
        let outcome = offline_download(&self.services, &url, target, mime, true).await?;
        Ok(outcome.path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyFailure {
    /// Destination directory the failed copy was heading to.
    pub target: String,
    pub message: String,
}

/// Failures collected across a whole tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyFailures(Vec<CopyFailure>);

impl CopyFailures {
    pub fn push(&mut self, target: &str, error: &anyhow::Error) {
        self.0.push(CopyFailure {
            target: target.to_owned(),
            message: format!("{error:#}"),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for CopyFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "failed to copy /{}: {}", failure.target, failure.message)?;
        }
        Ok(())
    }
}

type Connect = Box<dyn Fn(&str) -> anyhow::Result<Arc<dyn RemoteHost>> + Send + Sync>;

/// Copy the record's `source` from the host at `domain` into `target`.
pub struct CrossAppCopy {
    connect: Connect,
}

impl CrossAppCopy {
    /// `connect` maps the record's `domain` to a host.
    pub fn new(
        connect: impl Fn(&str) -> anyhow::Result<Arc<dyn RemoteHost>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            connect: Box::new(connect),
        }
    }

    pub fn over_http(services: Services) -> Self {
        Self::new(move |domain| {
            let host: Arc<dyn RemoteHost> = Arc::new(HttpRemote::new(services.clone(), domain)?);
            Ok(host)
        })
    }

    /// Always copy from `host`, whatever the record's domain.
    pub fn with_host(host: impl RemoteHost + 'static) -> Self {
        let host: Arc<dyn RemoteHost> = Arc::new(host);
        Self::new(move |_| Ok(Arc::clone(&host)))
    }
}

#[async_trait]
impl JobRoutine for CrossAppCopy {
    fn finish_policy(&self) -> FinishPolicy {
        FinishPolicy::ClearCurrentFile
    }

    async fn run(&mut self, job: &mut Job) -> anyhow::Result<()> {
        let params: CopyParams = job.params()?;
        // Re-persist only the copy arguments; the front end may attach a password.
        job.set_params(&params)?;
        job.checkpoint()?;
        let host = (self.connect)(&params.domain)?;

        let mut failures = CopyFailures::default();
        if let Err(e) = copy_file(host.as_ref(), job, &params.source, &params.target).await {
            debug!(source = %params.source, error = %e, "not a single file, listing instead");
            copy_directory(
                host.as_ref(),
                job,
                params.source.clone(),
                params.target.clone(),
                &mut failures,
            )
            .await;
        }

        if !failures.is_empty() {
            job.set_error_message(failures.to_string());
            warn!(job_id = %job.id(), failures = failures.len(), "copy finished with failures");
        } else {
            info!(job_id = %job.id(), files = job.progress().processed_file_count(), "copy complete");
        }
        Ok(())
    }
}

async fn copy_file(host: &dyn RemoteHost, job: &mut Job, source: &str, target: &str) -> anyhow::Result<()> {
    let target_file = paths::join(target, paths::file_name(source));
    job.progress_mut().set_current_file(Some(target_file));
    let details = host.details(source).await?;
    job.checkpoint()?;

    let dir = job.ctx().paths.resolve_content(target)?;
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let written = host.download(source, target, details.mime.as_deref()).await?;
    debug!(source, path = %written, "file copied");

    job.progress_mut().add_files(1);
    job.progress_mut().add_bytes(details.size.unwrap_or_default());
    job.checkpoint()?;
    Ok(())
}

fn copy_directory<'a>(
    host: &'a dyn RemoteHost,
    job: &'a mut Job,
    source: String,
    target: String,
    failures: &'a mut CopyFailures,
) -> BoxFuture<'a, ()> {
    async move {
        job.progress_mut()
            .set_current_file(Some(paths::join(&target, paths::file_name(&source))));
        if let Err(e) = walk(host, job, &source, &target, failures).await {
            warn!(source = %source, target = %target, error = %e, "directory copy failed");
            failures.push(&target, &e);
        }
    }
    .boxed()
}

async fn walk(
    host: &dyn RemoteHost,
    job: &mut Job,
    source: &str,
    target: &str,
    failures: &mut CopyFailures,
) -> anyhow::Result<()> {
    job.checkpoint()?;
    let entries = host.list(source).await?;
    for entry in entries {
        let child = paths::join(source, &entry.name);
        match entry.kind {
            EntryKind::Directory => {
                let dir = paths::join(target, &entry.name);
                make_dirs(job, &dir)?;
                copy_directory(host, job, child, dir, failures).await;
            }
            EntryKind::File => {
                if let Err(e) = copy_file(host, job, &child, target).await {
                    warn!(source = %child, error = %e, "file copy failed");
                    failures.push(target, &e);
                }
            }
        }
    }
    Ok(())
}

fn make_dirs(job: &Job, rel: &str) -> anyhow::Result<()> {
    let paths = &job.ctx().paths;
    for dir in [paths.resolve_content(rel)?, paths.resolve_state(rel)?] {
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::jobs::fetch::tests::{ok, serve};
    use crate::jobs::testing::Fixture;
    use skylark_core::{Context, JobKind, JobStatus, Producer, Sidecar, execute};

    /// In-memory host: `files` by remote path, `dirs` listing by remote path.
    struct FakeHost {
        ctx: Context,
        files: HashMap<&'static str, (&'static str, &'static str)>,
        dirs: HashMap<&'static str, Vec<RemoteEntry>>,
        broken: Vec<&'static str>,
        downloads: Mutex<Vec<String>>,
    }

    fn entry(kind: EntryKind, name: &str) -> RemoteEntry {
        RemoteEntry {
            kind,
            name: name.to_owned(),
        }
    }

    #[async_trait]
    impl RemoteHost for FakeHost {
        async fn details(&self, source: &str) -> anyhow::Result<RemoteFile> {
            let (body, mime) = self
                .files
                .get(source)
                .with_context(|| format!("{source} is not a file"))?;
            Ok(RemoteFile {
                mime: Some((*mime).to_owned()),
                size: Some(body.len() as u64),
            })
        }

        async fn list(&self, source: &str) -> anyhow::Result<Vec<RemoteEntry>> {
            self.dirs
                .get(source)
                .cloned()
                .with_context(|| format!("{source} not found"))
        }

        async fn download(&self, source: &str, target: &str, mime: Option<&str>) -> anyhow::Result<String> {
            if self.broken.iter().any(|b| *b == source) {
                anyhow::bail!("connection reset");
            }
            let (body, _) = self.files[source];
            let rel = paths::join(target, paths::file_name(source));
            std::fs::write(self.ctx.paths.resolve_content(&rel)?, body)?;
            let producer = Producer {
                kind: JobKind::OfflineDownload,
                id: rel.clone(),
                pid: std::process::id(),
            };
            self.ctx.readiness.mark_in_progress(&rel, &producer)?;
            self.ctx.readiness.mark_ready(&rel, &producer, mime)?;
            self.downloads.lock().unwrap().push(rel.clone());
            Ok(rel)
        }
    }

    fn host(fx: &Fixture) -> FakeHost {
        FakeHost {
            ctx: fx.ctx(),
            files: HashMap::from([
                ("movie.mkv", ("matroska", "video/x-matroska")),
                ("album/cover.jpg", ("jpeg", "image/jpeg")),
                ("album/disc1/01.flac", ("flac-bytes", "audio/flac")),
                ("album/disc1/02.flac", ("never", "audio/flac")),
            ]),
            dirs: HashMap::from([
                (
                    "album",
                    vec![
                        entry(EntryKind::Directory, "disc1"),
                        entry(EntryKind::File, "cover.jpg"),
                    ],
                ),
                (
                    "album/disc1",
                    vec![entry(EntryKind::File, "01.flac"), entry(EntryKind::File, "02.flac")],
                ),
            ]),
            broken: Vec::new(),
            downloads: Mutex::new(Vec::new()),
        }
    }

    fn params(source: &str, target: &str) -> serde_json::Value {
        serde_json::json!({
            "domain": "files.example",
            "source": source,
            "target": target,
            "password": "hunter2",
        })
    }

    #[tokio::test]
    async fn single_file_is_copied_with_its_mime() {
        let fx = Fixture::new();
        fx.create_record(JobKind::CrossAppCopy, "copy-1", params("movie.mkv", "dest"));
        let mut job = Job::load(fx.ctx(), "copy-1", JobKind::CrossAppCopy).unwrap();

        let status = execute(&mut job, &mut CrossAppCopy::with_host(host(&fx))).await.unwrap();
        assert_eq!(status, JobStatus::Finished);

        let record = fx.record("copy-1");
        assert_eq!(record.progress.processed_file_count(), 1);
        assert_eq!(record.progress.processed_file_length(), 8);
        assert_eq!(record.progress.current_file(), None);
        assert!(record.params.get("password").is_none());
        assert_eq!(fx.read("dest/movie.mkv"), b"matroska");
        assert_eq!(
            fx.services.ctx.readiness.read("dest/movie.mkv").unwrap(),
            Some(Sidecar::Ready {
                mime: Some("video/x-matroska".into())
            })
        );
    }

    #[tokio::test]
    async fn directory_falls_back_to_listing_and_keeps_going_after_failures() {
        let fx = Fixture::new();
        let mut fake = host(&fx);
        fake.broken.push("album/disc1/02.flac");
        fx.create_record(JobKind::CrossAppCopy, "copy-2", params("album", "dest"));
        let mut job = Job::load(fx.ctx(), "copy-2", JobKind::CrossAppCopy).unwrap();

        let mut routine = CrossAppCopy::with_host(fake);
        let status = execute(&mut job, &mut routine).await.unwrap();
        assert_eq!(status, JobStatus::Error);

        assert_eq!(fx.read("dest/disc1/01.flac"), b"flac-bytes");
        assert_eq!(fx.read("dest/cover.jpg"), b"jpeg");
        assert!(fx.services.ctx.paths.resolve_state("dest/disc1").unwrap().is_dir());

        let record = fx.record("copy-2");
        assert_eq!(record.progress.processed_file_count(), 2);
        let message = record.error_message.unwrap();
        assert_eq!(message.lines().count(), 1);
        assert!(message.starts_with("failed to copy /dest/disc1: connection reset"));
    }

    #[tokio::test]
    async fn missing_source_is_reported_once() {
        let fx = Fixture::new();
        fx.create_record(JobKind::CrossAppCopy, "copy-3", params("nowhere", "dest"));
        let mut job = Job::load(fx.ctx(), "copy-3", JobKind::CrossAppCopy).unwrap();

        let status = execute(&mut job, &mut CrossAppCopy::with_host(host(&fx))).await.unwrap();
        assert_eq!(status, JobStatus::Error);
        assert_eq!(
            fx.record("copy-3").error_message.unwrap(),
            "failed to copy /dest: nowhere not found"
        );
    }

    #[tokio::test]
    async fn http_host_falls_back_when_details_is_not_ok() {
        let fx = Fixture::new();
        let (base, seen) = serve(vec![
            ok("application/json", r#"{"status":"error","message":"is a directory"}"#),
            ok(
                "application/json",
                r#"{"status":"ok","entries":[{"kind":"file","name":"a.txt"}]}"#,
            ),
            ok(
                "application/json",
                r#"{"status":"ok","file":{"mime":"text/plain","size":5}}"#,
            ),
            ok("text/plain", "hello"),
        ])
        .await;
        fx.create_record(
            JobKind::CrossAppCopy,
            "copy-4",
            serde_json::json!({ "domain": base, "source": "docs", "target": "" }),
        );
        let mut job = Job::load(fx.ctx(), "copy-4", JobKind::CrossAppCopy).unwrap();

        let mut routine = CrossAppCopy::over_http(fx.services.clone());
        let status = execute(&mut job, &mut routine).await.unwrap();
        assert_eq!(status, JobStatus::Finished);
        assert_eq!(fx.read("a.txt"), b"hello");
        assert_eq!(fx.record("a.txt").state, JobStatus::Finished);

        let seen = seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                "GET /Api/Details/docs HTTP/1.1",
                "GET /Api/List/docs HTTP/1.1",
                "GET /Api/Details/docs/a.txt HTTP/1.1",
                "GET /Download/docs/a.txt HTTP/1.1",
            ]
        );
    }

    #[tokio::test]
    async fn unusable_domain_is_recorded() {
        let fx = Fixture::new();
        fx.create_record(
            JobKind::CrossAppCopy,
            "copy-5",
            serde_json::json!({ "domain": " ", "source": "a", "target": "" }),
        );
        let mut job = Job::load(fx.ctx(), "copy-5", JobKind::CrossAppCopy).unwrap();
        let status = execute(&mut job, &mut CrossAppCopy::over_http(fx.services.clone()))
            .await
            .unwrap();
        assert_eq!(status, JobStatus::Error);
        assert!(fx.record("copy-5").error_message.unwrap().contains("empty domain"));
    }

    #[test]
    fn failures_render_one_line_each() {
        let mut failures = CopyFailures::default();
        failures.push("a", &anyhow::anyhow!("boom"));
        failures.push("a/b", &anyhow::anyhow!("gone").context("listing"));
        assert_eq!(
            failures.to_string(),
            "failed to copy /a: boom\nfailed to copy /a/b: listing: gone"
        );
    }
}
