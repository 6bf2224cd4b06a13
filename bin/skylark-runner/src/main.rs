//! skylark-runner – runs one background file job and exits.
//!
//! Startup order:
//! 1. Parse the command line and configuration from environment variables.
//! 2. Initialise tracing (stderr, or a daily rolling file when detached).
//! 3. Read and decode the job descriptor (argument or stdin).
//! 4. Dispatch it; failures with no record (panics included) go to
//!    `<state>/error.log`, which is opened before the descriptor is read.
//!
//! The exit code is 0 for every job run, whatever happened to the job. The
//! front end learns the outcome from the job record.

mod config;
mod descriptor;
mod dispatch;
mod error_log;
mod jobs;

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use futures::FutureExt;
use skylark_core::{Context, JobRecord, panic_message};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use crate::config::RunnerConfig;
use crate::descriptor::{DescriptorError, JobDescriptor};
use crate::error_log::ErrorLog;
use crate::jobs::Services;

#[derive(Parser, Debug)]
#[command(name = "skylark-runner", version)]
#[command(about = "Run one background file job described by an encoded descriptor")]
struct Cli {
    /// Root holding file contents (overrides SKYLARK_CONTENT_ROOT).
    #[arg(long, global = true, value_name = "DIR")]
    content_root: Option<PathBuf>,

    /// Root holding job records and sidecars (overrides SKYLARK_STATE_ROOT).
    #[arg(long, global = true, value_name = "DIR")]
    state_root: Option<PathBuf>,

    /// Encoded job descriptor. Read from the first line of stdin when absent.
    #[arg(long)]
    descriptor: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a job record and whether its owning process is gone.
    Status { id: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cli = Cli::parse();
    let mut cfg = RunnerConfig::from_env();
    if let Some(root) = cli.content_root {
        cfg.engine.content_root = root;
    }
    if let Some(root) = cli.state_root {
        cfg.engine.state_root = root;
    }

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    let _guard = init_tracing(&cfg);
    info!(version = env!("CARGO_PKG_VERSION"), "skylark-runner starting");

    let ctx = Context::new(cfg.engine.clone());
    match cli.command {
        Some(Command::Status { id }) => print_status(&ctx, &id),
        None => {
            let errors = ErrorLog::new(ctx.paths.error_log_path());
            run_job(&cfg, ctx, cli.descriptor, &errors).await;
            ExitCode::SUCCESS
        }
    }
}

/// Build the subscriber. The returned guard flushes the file writer on drop
/// and must live until the process exits.
fn init_tracing(cfg: &RunnerConfig) -> Option<WorkerGuard> {
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: SKYLARK_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    let (writer, guard) = match &cfg.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "skylark-runner.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(writer), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_ansi(cfg.log_dir.is_none())
        .with_writer(writer);

    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
    guard
}

async fn run_job(
    cfg: &RunnerConfig,
    ctx: Context,
    descriptor: Option<String>,
    errors: &ErrorLog,
) {
    let report = |message: String| {
        error!(error = %message, log = %errors.path().display(), "job dispatch failed");
        errors.append(&message);
    };

    let line = match descriptor {
        Some(line) => line,
        None => match read_descriptor_line().await {
            Ok(line) => line,
            Err(e) => return report(format!("reading descriptor from stdin: {e}")),
        },
    };

    let descriptor = match JobDescriptor::decode(&line) {
        Ok(descriptor) => descriptor,
        Err(DescriptorError::UnknownKind(kind)) => {
            eprintln!("skylark-runner: unrecognized job kind {kind:?}, nothing to do");
            return;
        }
        Err(e) => return report(e.to_string()),
    };

    let services = match Services::new(ctx, cfg) {
        Ok(services) => services,
        Err(e) => return report(format!("{e:#}")),
    };
    match AssertUnwindSafe(dispatch::dispatch(&services, descriptor))
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => {}
        Ok(Err(e)) => report(format!("{e:#}")),
        Err(payload) => report(format!(
            "job dispatch panicked: {}",
            panic_message(payload.as_ref())
        )),
    }
}

async fn read_descriptor_line() -> std::io::Result<String> {
    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    Ok(line)
}

fn print_status(ctx: &Context, id: &str) -> ExitCode {
    let record = match JobRecord::load(&ctx.paths, id) {
        Ok(record) => record,
        Err(e) => {
            eprintln!("skylark-runner: {e}");
            return ExitCode::FAILURE;
        }
    };
    let report = serde_json::json!({
        "orphaned": record.is_orphaned(),
        "record": record,
    });
    match serde_json::to_string_pretty(&report) {
        Ok(text) => {
            println!("{text}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("skylark-runner: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use skylark_core::EngineConfig;
    use skylark_fetch::SlowHostPolicy;

    struct Worker {
        _dir: tempfile::TempDir,
        cfg: RunnerConfig,
        ctx: Context,
        errors: ErrorLog,
    }

    impl Worker {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let cfg = RunnerConfig {
                engine: EngineConfig::rooted_at(dir.path()),
                log_level: "info".into(),
                log_json: false,
                log_dir: None,
                ffmpeg: "ffmpeg".into(),
                slow_hosts: SlowHostPolicy::disabled(),
            };
            let ctx = Context::new(cfg.engine.clone());
            let errors = ErrorLog::new(ctx.paths.error_log_path());
            Self {
                _dir: dir,
                cfg,
                ctx,
                errors,
            }
        }

        async fn run(&self, line: &str) {
            run_job(&self.cfg, self.ctx.clone(), Some(line.to_owned()), &self.errors).await;
        }

        fn log(&self) -> String {
            std::fs::read_to_string(self.ctx.paths.error_log_path()).unwrap()
        }
    }

    fn encode(text: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(text)
    }

    #[tokio::test]
    async fn dispatch_failure_is_appended_to_the_error_log() {
        let worker = Worker::new();
        worker.run(&encode("compress\nghost.zip")).await;

        let log = worker.log();
        assert!(log.starts_with('['));
        assert!(log.contains("job record not found: ghost.zip"));
        assert!(log.ends_with("\n\n"));
    }

    #[tokio::test]
    async fn unknown_kind_is_a_quiet_no_op() {
        let worker = Worker::new();
        worker.run(&encode("defragment\nC:")).await;

        assert_eq!(worker.log(), "");
        let state: Vec<_> = std::fs::read_dir(worker.ctx.paths.error_log_path().parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(state, vec!["error.log"]);
    }

    #[tokio::test]
    async fn malformed_descriptor_is_logged() {
        let worker = Worker::new();
        worker.run("!!definitely-not-base64!!").await;
        assert!(worker.log().contains("descriptor is not valid base64"));
    }
}
