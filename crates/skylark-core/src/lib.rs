//! Job engine shared by every Skylark worker kind: path mapping, persisted
//! job records, the file-readiness protocol, the job lifecycle and the batch
//! merge scheduler.

mod atomic;
pub mod batch;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod mime;
pub mod paths;
pub mod readiness;
pub mod record;

pub use batch::{BatchScheduler, MergeCandidate, MergePatterns, enumerate_candidates};
pub use config::EngineConfig;
pub use error::{CoreError, Result};
pub use lifecycle::{Context, FinishPolicy, Job, JobRoutine, execute, panic_message};
pub use paths::PathResolver;
pub use readiness::{Producer, Readiness, Sidecar, expand_leaves};
pub use record::{EntryTally, JobKind, JobRecord, JobStatus, Progress, process_alive};
