//! Engine configuration, loaded from environment variables at startup.

use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration for the job engine.
///
/// Every field has a default so a worker launched by the front end with an
/// empty environment still finds its roots relative to the working directory.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root holding the actual file bytes (default: `"Files"`).
    pub content_root: PathBuf,

    /// Root holding sidecars, job records and the error log (default: `"Data"`).
    pub state_root: PathBuf,

    /// Interval between sidecar polls while waiting for readiness.
    pub poll_interval: Duration,

    /// Upper bound on a single readiness wait. `None` waits forever.
    pub wait_timeout: Option<Duration>,

    /// Sleep between two passes of the batch merge scheduler.
    pub rescan_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            content_root: PathBuf::from("Files"),
            state_root: PathBuf::from("Data"),
            poll_interval: Duration::from_secs(1),
            wait_timeout: None,
            rescan_interval: Duration::from_secs(1),
        }
    }
}

impl EngineConfig {
    /// Build [`EngineConfig`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            content_root: std::env::var_os("SKYLARK_CONTENT_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.content_root),
            state_root: std::env::var_os("SKYLARK_STATE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.state_root),
            poll_interval: Duration::from_millis(parse_env("SKYLARK_POLL_MS", 1000)),
            wait_timeout: std::env::var("SKYLARK_WAIT_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis),
            rescan_interval: Duration::from_millis(parse_env("SKYLARK_RESCAN_MS", 1000)),
        }
    }

    /// Configuration rooted at `root/Files` and `root/Data` with near-zero
    /// polling, for tests and tooling.
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            content_root: root.join("Files"),
            state_root: root.join("Data"),
            poll_interval: Duration::from_millis(5),
            wait_timeout: None,
            rescan_interval: Duration::from_millis(5),
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
