use std::time::Duration;

/// Hosts that answer with an HTML interstitial before serving the file.
///
/// A request to one of these prefixes that comes back as `text/html` is
/// retried exactly once after `delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlowHostPolicy {
    prefixes: Vec<String>,
    delay: Duration,
}

impl Default for SlowHostPolicy {
    fn default() -> Self {
        Self::new(vec!["http://goo.im".to_owned()], Duration::from_secs(15))
    }
}

impl SlowHostPolicy {
    pub fn new(prefixes: Vec<String>, delay: Duration) -> Self {
        Self { prefixes, delay }
    }

    /// A policy that never retries.
    pub fn disabled() -> Self {
        Self::new(Vec::new(), Duration::ZERO)
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn covers(&self, url: &str) -> bool {
        let url = url.to_ascii_lowercase();
        self.prefixes
            .iter()
            .any(|p| !p.is_empty() && url.starts_with(&p.to_ascii_lowercase()))
    }

    /// Whether the first response for `url` should be thrown away and retried.
    pub fn should_retry(&self, url: &str, content_type: Option<&str>) -> bool {
        let is_html = content_type
            .and_then(|ct| ct.split(';').next())
            .is_some_and(|essence| essence.trim().eq_ignore_ascii_case("text/html"));
        is_html && self.covers(url)
    }
}
