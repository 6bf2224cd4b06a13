//! Route one decoded descriptor to its job routine.

use skylark_core::{Job, JobKind, JobRoutine, JobStatus, execute};
use tracing::{info, warn};

use crate::descriptor::JobDescriptor;
use crate::jobs::Services;
use crate::jobs::archive::{Compress, Extract};
use crate::jobs::copy::CrossAppCopy;
use crate::jobs::fetch::offline_download;
use crate::jobs::ftp::{FtpUpload, SuppaFtp};
use crate::jobs::merge::batch_merge;
use crate::jobs::transcode::Transcode;

/// Run the job `descriptor` names to completion.
///
/// Routine failures land in the job's record. `Err` means the job could not
/// be started or its record could not be written.
pub async fn dispatch(services: &Services, descriptor: JobDescriptor) -> anyhow::Result<()> {
    let kind = descriptor.kind();
    info!(%kind, "dispatching job");
    match descriptor {
        JobDescriptor::OfflineDownload { url, path } => {
            let outcome = offline_download(services, &url, &path, None, false).await?;
            info!(path = %outcome.path, status = %outcome.status, "download ended");
        }
        JobDescriptor::Compress { id } => {
            run_record(services, &id, kind, &mut Compress).await?;
        }
        JobDescriptor::Decompress { id } => {
            run_record(services, &id, kind, &mut Extract).await?;
        }
        JobDescriptor::Convert { id } => {
            run_record(services, &id, kind, &mut Transcode::new(&services.ffmpeg)).await?;
        }
        JobDescriptor::CrossAppCopy { id } => {
            let mut routine = CrossAppCopy::over_http(services.clone());
            run_record(services, &id, kind, &mut routine).await?;
        }
        JobDescriptor::FtpUpload { id } => {
            let mut job = Job::load(services.ctx.clone(), &id, kind)?;
            let mut upload = FtpUpload::new(SuppaFtp);
            if let Err(e) = upload.strip_credentials(&mut job) {
                // The routine parses the URL again and records the failure.
                warn!(job_id = %id, error = %e, "could not read the FTP url");
            }
            finish(&id, execute(&mut job, &mut upload).await?);
        }
        JobDescriptor::BatchMergeVa(args) => {
            let executed = batch_merge(services, args).await?;
            info!(executed, "batch merge ended");
        }
    }
    Ok(())
}

async fn run_record<R: JobRoutine>(
    services: &Services,
    id: &str,
    kind: JobKind,
    routine: &mut R,
) -> anyhow::Result<()> {
    let mut job = Job::load(services.ctx.clone(), id, kind)?;
    finish(id, execute(&mut job, routine).await?);
    Ok(())
}

fn finish(id: &str, status: JobStatus) {
    info!(job_id = %id, %status, "job ended");
}
