//! Archive compression and extraction.
//!
//! Both directions run the codec synchronously on the worker thread
//! (`block_in_place`) so each entry can update the record before the next one
//! starts. Per-entry failures do not stop the run; they are collected and the
//! job fails with one [`ToolFailure`] listing all of them.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path};

use anyhow::{Context as _, bail};
use async_trait::async_trait;
use flate2::Compression;
use flate2::read::{GzDecoder, MultiGzDecoder};
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use sevenz_rust2::{ArchiveEntry, ArchiveReader, Password};
use skylark_core::{EntryTally, FinishPolicy, Job, JobRoutine, expand_leaves, mime, paths};
use strum::EnumString;
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::ToolFailure;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressParams {
    pub sources: Vec<String>,
    #[serde(default)]
    pub base_folder: String,
    #[serde(default)]
    pub compression_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecompressParams {
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum CompressionLevel {
    None,
    Fast,
    Low,
    #[default]
    Normal,
    High,
    Ultra,
}

impl CompressionLevel {
    /// Absent means `normal`; anything unrecognized is an error.
    pub fn parse(raw: Option<&str>) -> anyhow::Result<Self> {
        match raw.map(str::trim).filter(|s| !s.is_empty()) {
            None => Ok(Self::default()),
            Some(s) => s
                .parse()
                .map_err(|_| anyhow::anyhow!("unknown compression level {s:?}")),
        }
    }

    fn deflate_level(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Fast => 1,
            Self::Low => 3,
            Self::Normal => 6,
            Self::High => 8,
            Self::Ultra => 9,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    Tar,
    TarGz,
    /// A single gzip stream holding one unnamed file.
    Gz,
    SevenZip,
}

impl ArchiveFormat {
    pub fn detect(rel: &str) -> anyhow::Result<Self> {
        let name = paths::file_name(rel).to_ascii_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Ok(Self::TarGz)
        } else if name.ends_with(".tar") {
            Ok(Self::Tar)
        } else if name.ends_with(".zip") {
            Ok(Self::Zip)
        } else if name.ends_with(".gz") {
            Ok(Self::Gz)
        } else if name.ends_with(".7z") {
            Ok(Self::SevenZip)
        } else {
            bail!("unrecognized archive format: {rel}")
        }
    }
}

/// Build `<id>` from the record's sources.
#[derive(Debug, Default)]
pub struct Compress;

#[async_trait]
impl JobRoutine for Compress {
    fn finish_policy(&self) -> FinishPolicy {
        FinishPolicy::ClearCurrentSource
    }

    async fn run(&mut self, job: &mut Job) -> anyhow::Result<()> {
        let params: CompressParams = job.params()?;
        let archive = job.id().to_owned();
        let format = ArchiveFormat::detect(&archive)?;
        if format == ArchiveFormat::Gz {
            bail!("cannot compress several sources into a bare gzip stream: {archive}");
        }
        let level = CompressionLevel::parse(params.compression_level.as_deref())?;

        let ctx = job.ctx().clone();
        let leaves = expand_leaves(&ctx.paths, &params.sources)?;
        ctx.readiness.wait_all(&leaves).await?;

        let mut total = 0u64;
        for leaf in &leaves {
            let path = ctx.paths.resolve_content(leaf)?;
            total += fs::metadata(&path)
                .with_context(|| format!("reading size of {leaf}"))?
                .len();
        }
        job.progress_mut().set_file_length(Some(total));
        job.progress_mut().set_source_count(Some(leaves.len() as u64));
        job.start_file(&archive)?;

        tokio::task::block_in_place(|| {
            write_archive(job, format, level, &leaves, &params.base_folder)
        })?;

        job.finish_file(&archive, mime::from_path(&archive).as_deref())?;
        info!(archive = %archive, entries = leaves.len(), bytes = total, "archive written");
        Ok(())
    }
}

/// Unpack the record's `source` archive under `target`.
#[derive(Debug, Default)]
pub struct Extract;

#[async_trait]
impl JobRoutine for Extract {
    fn finish_policy(&self) -> FinishPolicy {
        FinishPolicy::ClearCurrentFile
    }

    async fn run(&mut self, job: &mut Job) -> anyhow::Result<()> {
        let params: DecompressParams = job.params()?;
        let ctx = job.ctx().clone();
        let target = params.target.trim_matches(['/', '\\']).to_owned();
        make_dirs(job, &target)?;

        let format = ArchiveFormat::detect(&params.source)?;
        let archive = ctx.paths.resolve_content(&params.source)?;
        let mut failures = ToolFailure::new("extract");

        tokio::task::block_in_place(|| -> anyhow::Result<()> {
            match format {
                ArchiveFormat::Zip => extract_zip(job, &archive, &target, &mut failures),
                ArchiveFormat::Tar => {
                    extract_tar(job, || File::open(&archive), &target, &mut failures)
                }
                ArchiveFormat::TarGz => extract_tar(
                    job,
                    || File::open(&archive).map(MultiGzDecoder::new),
                    &target,
                    &mut failures,
                ),
                ArchiveFormat::Gz => {
                    let name = gz_stem(&params.source);
                    extract_gz(job, &archive, &paths::join(&target, &name), &mut failures)
                }
                ArchiveFormat::SevenZip => extract_7z(job, &archive, &target, &mut failures),
            }
        })?;

        job.checkpoint()?;
        failures.into_result()?;
        info!(source = %params.source, target = %target, files = job.progress().processed_file_count(), "archive extracted");
        Ok(())
    }
}

// ── compression ──────────────────────────────────────────────────────────────

enum ArchiveWriter {
    Zip(ZipWriter<File>, SimpleFileOptions),
    Tar(tar::Builder<File>),
    TarGz(tar::Builder<GzEncoder<File>>),
    /// LZMA2 with the codec's default settings.
    SevenZip(sevenz_rust2::ArchiveWriter<File>),
}

impl ArchiveWriter {
    fn new(format: ArchiveFormat, file: File, level: CompressionLevel) -> anyhow::Result<Self> {
        Ok(match format {
            ArchiveFormat::Zip => {
                let options = match level {
                    CompressionLevel::None => {
                        SimpleFileOptions::default().compression_method(CompressionMethod::Stored)
                    }
                    _ => SimpleFileOptions::default()
                        .compression_method(CompressionMethod::Deflated)
                        .compression_level(Some(i64::from(level.deflate_level()))),
                };
                ArchiveWriter::Zip(ZipWriter::new(file), options)
            }
            ArchiveFormat::Tar => ArchiveWriter::Tar(tar::Builder::new(file)),
            ArchiveFormat::TarGz => ArchiveWriter::TarGz(tar::Builder::new(GzEncoder::new(
                file,
                Compression::new(level.deflate_level()),
            ))),
            ArchiveFormat::SevenZip => {
                ArchiveWriter::SevenZip(sevenz_rust2::ArchiveWriter::new(file)?)
            }
            ArchiveFormat::Gz => bail!("gzip output holds a single stream"),
        })
    }

    fn add(&mut self, source: &Path, name: &str, size: u64) -> anyhow::Result<()> {
        match self {
            ArchiveWriter::Zip(zip, options) => {
                let options = options.large_file(size >= u64::from(u32::MAX));
                zip.start_file(name, options)?;
                let mut input = File::open(source)?;
                io::copy(&mut input, zip)?;
            }
            ArchiveWriter::Tar(builder) => builder.append_path_with_name(source, name)?,
            ArchiveWriter::TarGz(builder) => builder.append_path_with_name(source, name)?,
            ArchiveWriter::SevenZip(writer) => {
                let entry = ArchiveEntry::from_path(source, name.to_owned());
                writer.push_archive_entry(entry, Some(File::open(source)?))?;
            }
        }
        Ok(())
    }

    fn finish(self) -> anyhow::Result<()> {
        match self {
            ArchiveWriter::Zip(zip, _) => zip.finish()?.sync_all()?,
            ArchiveWriter::Tar(builder) => builder.into_inner()?.sync_all()?,
            ArchiveWriter::TarGz(builder) => builder.into_inner()?.finish()?.sync_all()?,
            ArchiveWriter::SevenZip(writer) => writer.finish()?.sync_all()?,
        }
        Ok(())
    }
}

fn write_archive(
    job: &mut Job,
    format: ArchiveFormat,
    level: CompressionLevel,
    leaves: &[String],
    base_folder: &str,
) -> anyhow::Result<()> {
    let dest = job.ctx().paths.resolve_content(job.id())?;
    if let Some(dir) = dest.parent() {
        fs::create_dir_all(dir)?;
    }
    let file = File::create(&dest).with_context(|| format!("creating {}", dest.display()))?;
    let mut writer = ArchiveWriter::new(format, file, level)?;
    let mut tally = EntryTally::sources();
    let mut failures = ToolFailure::new("compress");

    for leaf in leaves {
        let source = job.ctx().paths.resolve_content(leaf)?;
        let size = fs::metadata(&source).map(|m| m.len()).unwrap_or(0);
        tally.begin(job.progress_mut(), size);
        job.progress_mut().set_current_source(Some(leaf.clone()));
        job.checkpoint()?;

        let Some(name) = entry_name(leaf, base_folder) else {
            failures.push(leaf.as_str(), format!("not inside base folder {base_folder:?}"));
            continue;
        };
        debug!(entry = %name, size, "adding archive entry");
        if let Err(e) = writer.add(&source, &name, size) {
            failures.push(leaf.as_str(), format!("{e:#}"));
        }
    }
    tally.commit(job.progress_mut());
    writer.finish()?;
    job.checkpoint()?;
    Ok(failures.into_result()?)
}

/// Entry name of `leaf` inside the archive, relative to `base_folder`.
pub(super) fn entry_name(leaf: &str, base_folder: &str) -> Option<String> {
    let leaf = leaf.replace('\\', "/");
    let base = base_folder.replace('\\', "/");
    let base = base.trim_matches('/');
    let name = if base.is_empty() {
        leaf.trim_start_matches('/')
    } else {
        leaf.strip_prefix(base)?.strip_prefix('/')?
    };
    (!name.is_empty()).then(|| name.to_owned())
}

// ── extraction ───────────────────────────────────────────────────────────────

fn extract_zip(
    job: &mut Job,
    archive: &Path,
    target: &str,
    failures: &mut ToolFailure,
) -> anyhow::Result<()> {
    let file = File::open(archive).with_context(|| format!("opening {}", archive.display()))?;
    let mut zip = ZipArchive::new(file)?;

    let (mut count, mut total) = (0u64, 0u64);
    for i in 0..zip.len() {
        let entry = zip.by_index_raw(i)?;
        if !entry.is_dir() {
            count += 1;
            total += entry.size();
        }
    }
    set_totals(job, Some(count), Some(total))?;

    let mut tally = EntryTally::files();
    for i in 0..zip.len() {
        let mut entry = match zip.by_index(i) {
            Ok(entry) => entry,
            Err(e) => {
                failures.push(format!("entry #{i}"), e);
                continue;
            }
        };
        let name = entry.name().to_owned();
        let Some(rel) = entry.enclosed_name().as_deref().and_then(relative) else {
            failures.push(name, "unsafe entry name");
            continue;
        };
        let rel = paths::join(target, &rel);
        if entry.is_dir() {
            if let Err(e) = make_dirs(job, &rel) {
                failures.push(rel, format!("{e:#}"));
            }
            continue;
        }
        let size = entry.size();
        if let Err(e) = extract_entry(job, &mut tally, &rel, size, &mut entry) {
            failures.push(rel, format!("{e:#}"));
        }
    }
    tally.commit(job.progress_mut());
    Ok(())
}

fn extract_tar<R, F>(
    job: &mut Job,
    open: F,
    target: &str,
    failures: &mut ToolFailure,
) -> anyhow::Result<()>
where
    R: Read,
    F: Fn() -> io::Result<R>,
{
    // First pass only reads headers for the totals.
    let (mut count, mut total) = (0u64, 0u64);
    let mut scan = tar::Archive::new(open()?);
    for entry in scan.entries()? {
        let entry = entry?;
        if entry.header().entry_type().is_file() {
            count += 1;
            total += entry.size();
        }
    }
    set_totals(job, Some(count), Some(total))?;

    let mut tally = EntryTally::files();
    let mut archive = tar::Archive::new(open()?);
    for entry in archive.entries()? {
        let mut entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                // The stream is unusable past a corrupt header.
                failures.push("archive", e);
                break;
            }
        };
        let raw = entry.path().map(|p| p.into_owned());
        let Some(rel) = raw.as_deref().ok().and_then(relative) else {
            let name = raw.map(|p| p.display().to_string()).unwrap_or_default();
            failures.push(name, "unsafe entry name");
            continue;
        };
        let rel = paths::join(target, &rel);
        let kind = entry.header().entry_type();
        if kind.is_dir() {
            if let Err(e) = make_dirs(job, &rel) {
                failures.push(rel, format!("{e:#}"));
            }
            continue;
        }
        if !kind.is_file() {
            debug!(entry = %rel, "skipping non-regular tar entry");
            continue;
        }
        let size = entry.size();
        if let Err(e) = extract_entry(job, &mut tally, &rel, size, &mut entry) {
            failures.push(rel, format!("{e:#}"));
        }
    }
    tally.commit(job.progress_mut());
    Ok(())
}

fn extract_gz(
    job: &mut Job,
    archive: &Path,
    rel: &str,
    failures: &mut ToolFailure,
) -> anyhow::Result<()> {
    set_totals(job, Some(1), None)?;
    let file = File::open(archive).with_context(|| format!("opening {}", archive.display()))?;
    let mut decoder = GzDecoder::new(file);
    let mut tally = EntryTally::files();
    match extract_entry(job, &mut tally, rel, 0, &mut decoder) {
        Ok(written) => job.progress_mut().add_bytes(written),
        Err(e) => failures.push(rel, format!("{e:#}")),
    }
    tally.commit(job.progress_mut());
    Ok(())
}

fn extract_7z(
    job: &mut Job,
    archive: &Path,
    target: &str,
    failures: &mut ToolFailure,
) -> anyhow::Result<()> {
    let mut reader = ArchiveReader::open(archive, Password::empty())
        .with_context(|| format!("opening {}", archive.display()))?;

    let (mut count, mut total) = (0u64, 0u64);
    for entry in reader.archive().files.iter().filter(|e| !e.is_directory()) {
        count += 1;
        total += entry.size();
    }
    set_totals(job, Some(count), Some(total))?;

    let mut tally = EntryTally::files();
    reader.for_each_entries(|entry, data| {
        let name = entry.name().replace('\\', "/");
        let Some(rel) = relative(Path::new(&name)) else {
            failures.push(name, "unsafe entry name");
            io::copy(data, &mut io::sink())?;
            return Ok(true);
        };
        let rel = paths::join(target, &rel);
        if entry.is_directory() {
            if let Err(e) = make_dirs(job, &rel) {
                failures.push(rel, format!("{e:#}"));
            }
            return Ok(true);
        }
        if let Err(e) = extract_entry(job, &mut tally, &rel, entry.size(), data) {
            failures.push(rel, format!("{e:#}"));
            io::copy(data, &mut io::sink())?;
        }
        Ok(true)
    })?;
    tally.commit(job.progress_mut());
    Ok(())
}

/// Write one entry to `rel`, moving its sidecar through in-progress to ready.
fn extract_entry(
    job: &mut Job,
    tally: &mut EntryTally,
    rel: &str,
    size: u64,
    reader: &mut dyn Read,
) -> anyhow::Result<u64> {
    paths::validate(rel)?;
    job.start_file(rel)?;
    tally.begin(job.progress_mut(), size);
    match write_entry(job, rel, reader) {
        Ok(written) => Ok(written),
        Err(e) => {
            tally.abandon();
            Err(e)
        }
    }
}

fn write_entry(job: &mut Job, rel: &str, reader: &mut dyn Read) -> anyhow::Result<u64> {
    let dest = job.ctx().paths.resolve_content(rel)?;
    if let Some(dir) = dest.parent() {
        fs::create_dir_all(dir)?;
    }
    let mut out = File::create(&dest)?;
    let written = io::copy(reader, &mut out)?;
    out.flush()?;
    out.sync_all()?;

    job.finish_file(rel, mime::from_path(rel).as_deref())?;
    Ok(written)
}

fn set_totals(job: &mut Job, files: Option<u64>, bytes: Option<u64>) -> anyhow::Result<()> {
    job.progress_mut().set_file_count(files);
    job.progress_mut().set_file_length(bytes);
    Ok(job.checkpoint()?)
}

/// Create `rel` as a directory in both roots.
fn make_dirs(job: &Job, rel: &str) -> anyhow::Result<()> {
    let paths = &job.ctx().paths;
    for dir in [paths.resolve_content(rel)?, paths.resolve_state(rel)?] {
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    Ok(())
}

/// `/`-joined form of an archive entry path, `None` unless every component
/// is a plain name.
fn relative(path: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?.to_owned()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!parts.is_empty()).then(|| parts.join("/"))
}

fn gz_stem(source: &str) -> String {
    let name = paths::file_name(source);
    let cut = name.len().saturating_sub(3);
    let stem = match name.get(cut..) {
        Some(ext) if ext.eq_ignore_ascii_case(".gz") => &name[..cut],
        _ => name,
    };
    if stem.is_empty() { name.to_owned() } else { stem.to_owned() }
}
