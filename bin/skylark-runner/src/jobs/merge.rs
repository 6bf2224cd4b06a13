//! Batch audio/video merge: pair up video and audio files under a folder and
//! remux each pair once both halves are ready.

use skylark_core::{
    BatchScheduler, Job, JobKind, JobStatus, MergeCandidate, MergePatterns, enumerate_candidates,
    execute,
};
use tracing::info;

use super::Services;
use super::transcode::{ConvertParams, Transcode};
use crate::descriptor::BatchMergeArgs;

/// Run every candidate under `args.path`; returns how many were executed.
pub async fn batch_merge(services: &Services, args: BatchMergeArgs) -> anyhow::Result<usize> {
    let patterns = MergePatterns::new(&args.video_pattern, args.audio_patterns, args.output_patterns)?;
    let ctx = &services.ctx;
    let pending = enumerate_candidates(&ctx.paths, &args.path, &patterns)?;
    info!(path = %args.path, candidates = pending.len(), "batch merge enumerated");

    let scheduler = BatchScheduler::new(ctx.readiness.clone(), ctx.config.rescan_interval)
        .delete_sources(args.delete_sources);
    Ok(scheduler
        .run(pending, |candidate| merge_one(services, candidate))
        .await)
}

async fn merge_one(services: &Services, candidate: MergeCandidate) -> anyhow::Result<()> {
    let params = ConvertParams {
        source: candidate.video,
        audio_path: Some(candidate.audio),
        video_codec: Some("copy".to_owned()),
        audio_codec: Some("copy".to_owned()),
        ..ConvertParams::default()
    };
    let mut job = Job::create(services.ctx.clone(), JobKind::Convert, &candidate.output, &params)?;
    let status = execute(&mut job, &mut Transcode::new(&services.ffmpeg)).await?;
    if status == JobStatus::Error {
        let message = job.record().error_message.clone().unwrap_or_default();
        anyhow::bail!("merging into {} failed: {message}", candidate.output);
    }
    Ok(())
}
