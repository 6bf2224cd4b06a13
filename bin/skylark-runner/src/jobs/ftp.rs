//! Upload content files to an FTP server.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{Read, Write};

use anyhow::{Context as _, bail};
use async_trait::async_trait;
use percent_encoding::percent_decode_str;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use skylark_core::{FinishPolicy, Job, JobRoutine, expand_leaves};
use suppaftp::types::FileType;
use suppaftp::{FtpStream, Mode};
use tracing::{debug, info, warn};

use super::archive::entry_name;

const CHUNK: usize = 1 << 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FtpParams {
    pub url: String,
    pub sources: Vec<String>,
    #[serde(default)]
    pub base_folder: String,
}

/// Server, account and remote base directory parsed from an `ftp://` URL.
#[derive(Clone, PartialEq, Eq)]
pub struct FtpTarget {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Absolute remote directory, `/` when the URL has no path.
    pub base: String,
    display: String,
}

impl FtpTarget {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let mut url = Url::parse(raw.trim())
            .with_context(|| format!("invalid FTP url {:?}", redact_userinfo(raw)))?;
        if url.scheme() != "ftp" {
            bail!("unsupported scheme {:?}, expected ftp", url.scheme());
        }
        let host = url
            .host_str()
            .with_context(|| format!("FTP url has no host: {:?}", redact_userinfo(raw)))?
            .to_owned();
        let port = url.port_or_known_default().unwrap_or(21);
        let decode = |s: &str| percent_decode_str(s).decode_utf8_lossy().into_owned();
        let user = Some(url.username()).filter(|u| !u.is_empty()).map(decode);
        let password = url.password().map(decode);
        let base = format!("/{}", decode(url.path()).trim_matches('/'));

        // Both setters only fail on URLs that cannot carry credentials.
        let _ = url.set_username("");
        let _ = url.set_password(None);
        Ok(Self {
            host,
            port,
            user,
            password,
            base,
            display: url.to_string(),
        })
    }

    /// The URL without credentials.
    pub fn display_url(&self) -> &str {
        &self.display
    }

    fn remote_path(&self, rel: &str) -> String {
        if self.base == "/" {
            format!("/{rel}")
        } else {
            format!("{}/{rel}", self.base)
        }
    }
}

/// `raw` with any `user:password@` prefix of the authority removed. Works on
/// strings that do not parse as URLs.
fn redact_userinfo(raw: &str) -> String {
    let (scheme, rest) = match raw.split_once("://") {
        Some((scheme, rest)) => (Some(scheme), rest),
        None => (None, raw),
    };
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let (authority, tail) = rest.split_at(end);
    let Some(at) = authority.rfind('@') else {
        return raw.to_owned();
    };
    let host = &authority[at + 1..];
    match scheme {
        Some(scheme) => format!("{scheme}://{host}{tail}"),
        None => format!("{host}{tail}"),
    }
}

impl std::fmt::Debug for FtpTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpTarget")
            .field("url", &self.display)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// An open FTP session.
pub trait FtpSink {
    fn make_dir(&mut self, path: &str) -> anyhow::Result<()>;

    /// Store `reader` at `path`, reporting each chunk written.
    fn upload(
        &mut self,
        path: &str,
        reader: &mut dyn Read,
        progress: &mut dyn FnMut(u64) -> anyhow::Result<()>,
    ) -> anyhow::Result<()>;

    fn quit(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

pub trait FtpConnect: Send {
    fn connect(&mut self, target: &FtpTarget) -> anyhow::Result<Box<dyn FtpSink>>;
}

/// Passive-mode binary sessions over `suppaftp`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SuppaFtp;

impl FtpConnect for SuppaFtp {
    fn connect(&mut self, target: &FtpTarget) -> anyhow::Result<Box<dyn FtpSink>> {
        let mut stream = FtpStream::connect((target.host.as_str(), target.port))
            .with_context(|| format!("connecting to {}:{}", target.host, target.port))?;
        let user = target.user.as_deref().unwrap_or("anonymous");
        let password = target.password.as_deref().unwrap_or("anonymous@");
        stream.login(user, password).context("FTP login")?;
        stream.transfer_type(FileType::Binary)?;
        stream.set_mode(Mode::Passive);
        Ok(Box::new(SuppaSession(stream)))
    }
}

struct SuppaSession(FtpStream);

impl FtpSink for SuppaSession {
    fn make_dir(&mut self, path: &str) -> anyhow::Result<()> {
        Ok(self.0.mkdir(path)?)
    }

    fn upload(
        &mut self,
        path: &str,
        reader: &mut dyn Read,
        progress: &mut dyn FnMut(u64) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        let mut data = self.0.put_with_stream(path)?;
        copy_chunked(reader, &mut data, progress)?;
        self.0.finalize_put_stream(data)?;
        Ok(())
    }

    fn quit(&mut self) -> anyhow::Result<()> {
        Ok(self.0.quit()?)
    }
}

/// Copy in [`CHUNK`]-sized pieces, calling `progress` after each write.
pub fn copy_chunked(
    reader: &mut dyn Read,
    writer: &mut dyn Write,
    progress: &mut dyn FnMut(u64) -> anyhow::Result<()>,
) -> anyhow::Result<u64> {
    let mut buf = vec![0u8; CHUNK];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
        total += n as u64;
        progress(n as u64)?;
    }
    writer.flush()?;
    Ok(total)
}

/// Upload the record's sources under the URL's base directory.
pub struct FtpUpload {
    connector: Box<dyn FtpConnect>,
    target: Option<FtpTarget>,
}

impl FtpUpload {
    pub fn new(connector: impl FtpConnect + 'static) -> Self {
        Self {
            connector: Box::new(connector),
            target: None,
        }
    }

    /// Keep the credentials in memory and leave only the stripped URL in
    /// the record. Call before [`execute`](skylark_core::execute) so the
    /// claiming save already persists the stripped form.
    pub fn strip_credentials(&mut self, job: &mut Job) -> anyhow::Result<()> {
        let mut params: FtpParams = job.params()?;
        match FtpTarget::parse(&params.url) {
            Ok(target) => {
                params.url = target.display_url().to_owned();
                job.set_params(&params)?;
                self.target = Some(target);
                Ok(())
            }
            Err(e) => {
                params.url = redact_userinfo(&params.url);
                job.set_params(&params)?;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl JobRoutine for FtpUpload {
    fn finish_policy(&self) -> FinishPolicy {
        FinishPolicy::ClearCurrentSource
    }

    async fn run(&mut self, job: &mut Job) -> anyhow::Result<()> {
        let params: FtpParams = job.params()?;
        let target = match self.target.take() {
            Some(target) => target,
            None => FtpTarget::parse(&params.url)?,
        };

        let ctx = job.ctx().clone();
        let leaves = expand_leaves(&ctx.paths, &params.sources)?;
        let mut total = 0u64;
        for leaf in &leaves {
            total += fs::metadata(ctx.paths.resolve_content(leaf)?)
                .with_context(|| format!("reading size of {leaf}"))?
                .len();
        }
        job.progress_mut().set_source_count(Some(leaves.len() as u64));
        job.progress_mut().set_file_length(Some(total));
        job.checkpoint()?;
        ctx.readiness.wait_all(&leaves).await?;

        let connector = &mut self.connector;
        tokio::task::block_in_place(|| {
            upload_all(job, connector.as_mut(), &target, &leaves, &params.base_folder)
        })?;
        info!(url = %target.display_url(), files = leaves.len(), bytes = total, "upload complete");
        Ok(())
    }
}

fn upload_all(
    job: &mut Job,
    connector: &mut dyn FtpConnect,
    target: &FtpTarget,
    leaves: &[String],
    base_folder: &str,
) -> anyhow::Result<()> {
    let mut sink = connector.connect(target)?;
    let mut created: HashSet<String> = HashSet::from([target.base.clone()]);

    for leaf in leaves {
        job.progress_mut().set_current_source(Some(leaf.clone()));
        job.checkpoint()?;

        let rel = entry_name(leaf, base_folder)
            .with_context(|| format!("{leaf} is not inside base folder {base_folder:?}"))?;
        let remote = target.remote_path(&rel);
        ensure_parents(sink.as_mut(), &mut created, &remote);

        let source = job.ctx().paths.resolve_content(leaf)?;
        let mut file = File::open(&source).with_context(|| format!("opening {}", source.display()))?;
        debug!(source = %leaf, remote = %remote, "uploading");
        sink.upload(&remote, &mut file, &mut |n| {
            job.progress_mut().add_bytes(n);
            Ok(job.checkpoint()?)
        })
        .with_context(|| format!("uploading {leaf} to {remote}"))?;

        job.progress_mut().add_sources(1);
        job.checkpoint()?;
    }

    if let Err(e) = sink.quit() {
        warn!(error = %e, "FTP session did not close cleanly");
    }
    Ok(())
}

/// Create every missing ancestor of `remote` once per run. Failures are
/// logged only; the directory usually exists already.
fn ensure_parents(sink: &mut dyn FtpSink, created: &mut HashSet<String>, remote: &str) {
    let Some((parent, _)) = remote.rsplit_once('/') else {
        return;
    };
    let mut dir = String::new();
    for segment in parent.split('/').filter(|s| !s.is_empty()) {
        dir.push('/');
        dir.push_str(segment);
        if created.contains(&dir) {
            continue;
        }
        if let Err(e) = sink.make_dir(&dir) {
            debug!(dir = %dir, error = %e, "mkdir failed");
        }
        created.insert(dir.clone());
    }
}
