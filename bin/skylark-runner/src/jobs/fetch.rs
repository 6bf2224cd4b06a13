//! Offline download: stream one remote resource into the content root.
//!
//! The record is only created once the response headers have arrived, since
//! the final path depends on the resolved file name. Failures before that
//! point have no record to land in and propagate to the caller.

use anyhow::Context as _;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use skylark_core::{Job, JobKind, JobRoutine, JobStatus, execute, mime, paths};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::Services;

/// Progress is persisted at most once per this many bytes.
const CHECKPOINT_BYTES: u64 = 1 << 20;

/// Carries no useful extension.
const GENERIC_MIME: &str = "application/octet-stream";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadParams {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    /// Content path the bytes were written to (also the record id).
    pub path: String,
    pub status: JobStatus,
}

/// Download `url` to `path`, or into `path/<resolved name>` when `path` is an
/// existing directory.
///
/// `upstream_mime` overrides whatever the server reports. When `nested`, a
/// failure recorded in the download's own record is also returned as `Err`.
pub async fn offline_download(
    services: &Services,
    url: &str,
    path: &str,
    upstream_mime: Option<&str>,
    nested: bool,
) -> anyhow::Result<DownloadOutcome> {
    paths::validate(path)?;
    let ctx = &services.ctx;

    let resource = services
        .fetcher
        .open(url)
        .await
        .with_context(|| format!("requesting {url}"))?;

    let mime = upstream_mime
        .and_then(mime::essence)
        .or_else(|| resource.content_type.clone())
        .or_else(|| mime::from_path(&resource.file_name));

    let mut target = path.to_owned();
    if ctx.paths.resolve_content(path)?.is_dir() {
        let mut name = resource.file_name.clone();
        if let Some(mime) = mime.as_deref().filter(|m| *m != GENERIC_MIME) {
            if let Some(ext) = mime::extensions(mime).first() {
                if !mime::has_extension_for(&name, mime) {
                    name = format!("{name}.{ext}");
                }
            }
        }
        target = paths::join(path, &name);
    }
    paths::validate(&target)?;
    debug!(url, path = %target, mime = ?mime, "download target resolved");

    let mut job = Job::create(
        ctx.clone(),
        JobKind::OfflineDownload,
        &target,
        &DownloadParams {
            url: url.to_owned(),
        },
    )?;
    job.progress_mut().set_file_length(resource.length);
    job.progress_mut().set_mime(mime.clone());

    let mut routine = StreamToDisk {
        response: Some(resource.into_response()),
        mime,
    };
    let status = execute(&mut job, &mut routine).await?;
    if nested && status == JobStatus::Error {
        let message = job
            .record()
            .error_message
            .clone()
            .unwrap_or_else(|| "download failed".to_owned());
        anyhow::bail!(message);
    }
    Ok(DownloadOutcome {
        path: target,
        status,
    })
}

struct StreamToDisk {
    response: Option<reqwest::Response>,
    mime: Option<String>,
}

#[async_trait]
impl JobRoutine for StreamToDisk {
    async fn run(&mut self, job: &mut Job) -> anyhow::Result<()> {
        let response = self
            .response
            .take()
            .context("download response already consumed")?;
        let rel = job.id().to_owned();
        job.start_file(&rel)?;

        let dest = job.ctx().paths.resolve_content(&rel)?;
        if let Some(dir) = dest.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        let mut file = tokio::fs::File::create(&dest)
            .await
            .with_context(|| format!("creating {}", dest.display()))?;

        let mut stream = response.bytes_stream();
        let mut unsaved = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("reading response body")?;
            file.write_all(&chunk).await?;
            let n = chunk.len() as u64;
            job.progress_mut().add_bytes(n);
            unsaved += n;
            if unsaved >= CHECKPOINT_BYTES {
                unsaved = 0;
                job.checkpoint()?;
            }
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        job.finish_file(&rel, self.mime.as_deref())?;
        info!(path = %rel, bytes = job.progress().processed_file_length(), "download complete");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::jobs::testing::Fixture;
    use skylark_core::Sidecar;
    use std::sync::{Arc, Mutex};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Serves the canned responses in order, one per connection.
    pub(crate) async fn serve(responses: Vec<String>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&seen);
        tokio::spawn(async move {
            for response in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    head.extend_from_slice(&buf[..n]);
                }
                let first = String::from_utf8_lossy(&head)
                    .lines()
                    .next()
                    .unwrap_or_default()
                    .to_owned();
                captured.lock().unwrap().push(first);
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
            }
        });
        (base, seen)
    }

    pub(crate) fn ok(content_type: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    #[tokio::test]
    async fn downloads_into_a_directory_with_resolved_name() {
        let fx = Fixture::new();
        std::fs::create_dir_all(fx.content("inbox")).unwrap();
        let (base, _) = serve(vec![ok("application/pdf", "%PDF-1.7")]).await;

        let outcome = offline_download(
            &fx.services,
            &format!("{base}/papers/report?session=1"),
            "inbox",
            None,
            false,
        )
        .await
        .unwrap();

        assert_eq!(outcome.path, "inbox/report.pdf");
        assert_eq!(outcome.status, JobStatus::Finished);
        assert_eq!(fx.read("inbox/report.pdf"), b"%PDF-1.7");

        let record = fx.record("inbox/report.pdf");
        assert_eq!(record.state, JobStatus::Finished);
        assert_eq!(record.progress.file_length(), Some(8));
        assert_eq!(record.progress.processed_file_length(), 8);
        assert_eq!(record.params["url"], format!("{base}/papers/report?session=1"));
        assert_eq!(
            fx.services.ctx.readiness.read("inbox/report.pdf").unwrap(),
            Some(Sidecar::Ready {
                mime: Some("application/pdf".into())
            })
        );
    }

    #[tokio::test]
    async fn explicit_file_path_is_kept_and_upstream_mime_wins() {
        let fx = Fixture::new();
        let (base, _) = serve(vec![ok("application/octet-stream", "frames")]).await;

        let outcome = offline_download(
            &fx.services,
            &format!("{base}/Download/clip"),
            "media/clip.bin",
            Some("video/mp4"),
            true,
        )
        .await
        .unwrap();

        assert_eq!(outcome.path, "media/clip.bin");
        assert_eq!(
            fx.services.ctx.readiness.read("media/clip.bin").unwrap(),
            Some(Sidecar::Ready {
                mime: Some("video/mp4".into())
            })
        );
    }

    #[tokio::test]
    async fn repeated_download_leaves_the_finished_record_alone() {
        let fx = Fixture::new();
        std::fs::create_dir_all(fx.content("inbox")).unwrap();
        let (base, _) = serve(vec![
            ok("application/pdf", "%PDF-1.7"),
            ok("application/pdf", "%PDF-2.0"),
        ])
        .await;
        let url = format!("{base}/papers/report");

        let first = offline_download(&fx.services, &url, "inbox", None, false)
            .await
            .unwrap();
        assert_eq!(first.status, JobStatus::Finished);

        let err = offline_download(&fx.services, &url, "inbox", None, false)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<skylark_core::CoreError>(),
            Some(skylark_core::CoreError::AlreadyClaimed { .. })
        ));

        let record = fx.record("inbox/report.pdf");
        assert_eq!(record.state, JobStatus::Finished);
        assert_eq!(record.error_message, None);
        assert_eq!(fx.read("inbox/report.pdf"), b"%PDF-1.7");
        assert!(fx.services.ctx.readiness.is_ready("inbox/report.pdf"));
    }

    #[tokio::test]
    async fn reserved_characters_fail_before_any_request() {
        let fx = Fixture::new();
        let err = offline_download(&fx.services, "http://127.0.0.1:9/x", "bad%name", None, false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid path"));
    }

    #[tokio::test]
    async fn request_failure_has_no_record() {
        let fx = Fixture::new();
        let (base, _) = serve(vec![
            "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                .to_owned(),
        ])
        .await;
        assert!(
            offline_download(&fx.services, &format!("{base}/f"), "f", None, false)
                .await
                .is_err()
        );
        assert!(
            skylark_core::JobRecord::try_load(&fx.services.ctx.paths, "f")
                .unwrap()
                .is_none()
        );
    }
}
