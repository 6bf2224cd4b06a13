//! Media transcoding through an external ffmpeg process.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::LazyLock;

use anyhow::Context as _;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use skylark_core::{Job, JobRoutine, mime};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::ToolFailure;

/// Total media length, printed once per input.
static DURATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Duration:\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("duration pattern")
});

/// Periodic status line: `size=    1024kB time=00:00:41.20 bitrate=...`.
static PROGRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"size=\s*(\d+)\s*(?:kB|KiB) time=\s*(\S+)\s*bitrate=").expect("progress pattern")
});

/// Diagnostic lines kept for the failure message.
const TAIL_LINES: usize = 12;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertParams {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_codec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_codec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle_codec: Option<String>,
    /// Extra arguments, whitespace separated, inserted before the output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// Transcode the record's `source` (plus optional separate audio) into `<id>`.
#[derive(Debug, Clone)]
pub struct Transcode {
    ffmpeg: PathBuf,
}

impl Transcode {
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }
}

#[async_trait]
impl JobRoutine for Transcode {
    async fn run(&mut self, job: &mut Job) -> anyhow::Result<()> {
        let params: ConvertParams = job.params()?;
        let output = job.id().to_owned();
        let args = build_args(job, &params, &output)?;
        job.start_file(&output)?;

        debug!(ffmpeg = %self.ffmpeg.display(), ?args, "spawning transcoder");
        let mut child = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {}", self.ffmpeg.display()))?;
        let stderr = child
            .stderr
            .take()
            .context("transcoder stderr was not captured")?;

        let mut tail = VecDeque::with_capacity(TAIL_LINES);
        let mut lines = DiagnosticLines::new(stderr);
        while let Some(line) = lines.next_line().await? {
            if apply_line(job, &line) {
                job.checkpoint()?;
                continue;
            }
            if tail.len() == TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }

        let status = child.wait().await?;
        if !status.success() {
            let tail: Vec<String> = tail.into_iter().collect();
            let mut failure = ToolFailure::new("ffmpeg");
            failure.push(output.clone(), format!("{status}\n{}", tail.join("\n")));
            warn!(output = %output, %status, "transcoder exited with failure");
            return Err(failure.into());
        }

        job.finish_file(&output, mime::from_path(&output).as_deref())?;
        info!(output = %output, "transcode complete");
        Ok(())
    }
}

fn build_args(job: &Job, params: &ConvertParams, output: &str) -> anyhow::Result<Vec<OsString>> {
    let paths = &job.ctx().paths;
    let mut args: Vec<OsString> = vec!["-i".into(), paths.resolve_content(&params.source)?.into()];
    if let Some(audio) = params.audio_path.as_deref().filter(|a| !a.trim().is_empty()) {
        args.push("-i".into());
        args.push(paths.resolve_content(audio)?.into());
        args.extend(["-map", "0:v", "-map", "1:a"].map(OsString::from));
    }
    let options = [
        ("-s", &params.size),
        ("-vcodec", &params.video_codec),
        ("-acodec", &params.audio_codec),
        ("-scodec", &params.subtitle_codec),
    ];
    for (flag, value) in options {
        if let Some(value) = value.as_deref().filter(|v| !v.trim().is_empty()) {
            args.push(flag.into());
            args.push(value.trim().into());
        }
    }
    if let Some(extra) = &params.arguments {
        args.extend(extra.split_whitespace().map(OsString::from));
    }
    args.push(paths.resolve_content(output)?.into());
    args.push("-y".into());
    Ok(args)
}

/// Update progress from one diagnostic line. Returns whether it parsed.
fn apply_line(job: &mut Job, line: &str) -> bool {
    if let Some(caps) = DURATION.captures(line) {
        if let Some(ms) = hms_to_ms(&caps[1], &caps[2], &caps[3]) {
            // One line per input; the longest one bounds the output.
            let total = job.progress().duration_ms().map_or(ms, |d| d.max(ms));
            job.progress_mut().set_duration_ms(Some(total));
            return true;
        }
    }
    let Some(caps) = PROGRESS.captures(line) else {
        return false;
    };
    let (Ok(kib), Some(ms)) = (caps[1].parse::<u64>(), parse_timestamp(&caps[2])) else {
        return false;
    };
    job.progress_mut().raise_bytes(kib << 10);
    job.progress_mut().raise_duration_ms(ms);
    true
}

fn parse_timestamp(raw: &str) -> Option<u64> {
    let mut parts = raw.trim().splitn(3, ':');
    let (h, m, s) = (parts.next()?, parts.next()?, parts.next()?);
    hms_to_ms(h, m, s)
}

fn hms_to_ms(h: &str, m: &str, s: &str) -> Option<u64> {
    let h: u64 = h.parse().ok()?;
    let m: u64 = m.parse().ok()?;
    let s: f64 = s.parse().ok()?;
    if !s.is_finite() || s < 0.0 {
        return None;
    }
    let frac = s * 1000.0;
    if frac >= u64::MAX as f64 {
        return None;
    }
    h.checked_mul(3600)?
        .checked_add(m.checked_mul(60)?)?
        .checked_mul(1000)?
        .checked_add(frac.round() as u64)
}

/// Splits a diagnostic stream on `\n` and `\r`; ffmpeg rewrites its status
/// line in place with bare carriage returns.
struct DiagnosticLines<R> {
    reader: R,
    pending: Vec<u8>,
    buf: Box<[u8]>,
    done: bool,
}

impl<R: AsyncRead + Unpin> DiagnosticLines<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            pending: Vec::new(),
            buf: vec![0; 4096].into_boxed_slice(),
            done: false,
        }
    }

    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        loop {
            if let Some(pos) = self.pending.iter().position(|b| matches!(b, b'\n' | b'\r')) {
                let line: Vec<u8> = self.pending.drain(..=pos).collect();
                let text = String::from_utf8_lossy(&line[..pos]).trim().to_owned();
                if text.is_empty() {
                    continue;
                }
                return Ok(Some(text));
            }
            if self.done {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                let text = String::from_utf8_lossy(&std::mem::take(&mut self.pending))
                    .trim()
                    .to_owned();
                return Ok((!text.is_empty()).then_some(text));
            }
            let n = self.reader.read(&mut self.buf).await?;
            if n == 0 {
                self.done = true;
            } else {
                self.pending.extend_from_slice(&self.buf[..n]);
            }
        }
    }
}
