//! Runner configuration, loaded from environment variables at startup.

use std::path::PathBuf;
use std::time::Duration;

use skylark_core::EngineConfig;
use skylark_fetch::SlowHostPolicy;

/// Runtime configuration for one worker process.
///
/// Every field has a default so the worker runs when the front end spawns it
/// with an empty environment.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Roots, polling and rescan intervals shared with the engine.
    pub engine: EngineConfig,

    /// `tracing` filter string, e.g. `"info"` or `"debug,reqwest=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Directory for daily rolling log files. `None` logs to stderr.
    pub log_dir: Option<PathBuf>,

    /// Transcoder executable.
    pub ffmpeg: PathBuf,

    pub slow_hosts: SlowHostPolicy,
}

impl RunnerConfig {
    /// Build [`RunnerConfig`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let slow_hosts = SlowHostPolicy::new(
            env_or("SKYLARK_SLOW_HOSTS", "http://goo.im")
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_owned)
                .collect(),
            Duration::from_secs(parse_env("SKYLARK_SLOW_HOST_DELAY_SECS", 15)),
        );
        Self {
            engine: EngineConfig::from_env(),
            log_level: env_or("SKYLARK_LOG", "info"),
            log_json: std::env::var("SKYLARK_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            log_dir: std::env::var_os("SKYLARK_LOG_DIR").map(PathBuf::from),
            ffmpeg: std::env::var_os("SKYLARK_FFMPEG")
                .map(PathBuf::from)
                .unwrap_or_else(ffmpeg_sidecar::paths::ffmpeg_path),
            slow_hosts,
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
