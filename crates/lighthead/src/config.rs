//! Process-wide engine configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Environment variable naming the Chrome/Chromium executable
pub const ENV_CHROME: &str = "LIGHTHEAD_CHROME";
/// Environment variable toggling headless mode (`true`/`false`)
pub const ENV_HEADLESS: &str = "LIGHTHEAD_HEADLESS";
/// Environment variable pointing at a running DevTools endpoint
pub const ENV_REMOTE_URL: &str = "LIGHTHEAD_REMOTE_URL";
/// Environment variable overriding the navigation budget in seconds
pub const ENV_NAV_TIMEOUT_SECS: &str = "LIGHTHEAD_NAV_TIMEOUT_SECS";

/// Browser engine settings and per-phase time budgets
///
/// Built once per process and shared by every scrape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Browser executable; discovered from well-known locations when unset
    pub chrome_path: Option<PathBuf>,
    /// Run without a visible window
    pub headless: bool,
    /// Attach to `http://host:port` instead of launching a browser
    pub remote_url: Option<String>,
    /// Extra command-line switches for launched browsers
    pub extra_args: Vec<String>,
    /// Navigation budget; exceeding it fails the scrape
    pub navigation_timeout_ms: u64,
    /// Network-idle grace period; exceeding it is tolerated
    pub network_idle_timeout_ms: u64,
    /// How long to wait for a download after an aborted navigation
    pub aborted_download_wait_ms: u64,
    /// How long to wait for a download after a PDF-like navigation commits
    pub pdf_download_wait_ms: u64,
    /// Lower bound of the stealth pause
    pub stealth_pause_min_ms: u64,
    /// Upper bound of the stealth pause
    pub stealth_pause_max_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chrome_path: None,
            headless: true,
            remote_url: None,
            extra_args: Vec::new(),
            navigation_timeout_ms: 60_000,
            network_idle_timeout_ms: 10_000,
            aborted_download_wait_ms: 3_000,
            pdf_download_wait_ms: 1_000,
            stealth_pause_min_ms: 1_000,
            stealth_pause_max_ms: 3_000,
        }
    }
}

impl EngineConfig {
    /// Apply `LIGHTHEAD_*` environment overrides
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(path) = lookup(ENV_CHROME).filter(|v| !v.is_empty()) {
            self.chrome_path = Some(PathBuf::from(path));
        }

        if let Some(value) = lookup(ENV_HEADLESS) {
            match value.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.headless = true,
                "false" | "0" | "no" => self.headless = false,
                other => warn!("Ignoring {}={:?}", ENV_HEADLESS, other),
            }
        }

        if let Some(url) = lookup(ENV_REMOTE_URL).filter(|v| !v.is_empty()) {
            self.remote_url = Some(url);
        }

        if let Some(value) = lookup(ENV_NAV_TIMEOUT_SECS) {
            match value.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => self.navigation_timeout_ms = secs * 1_000,
                _ => warn!("Ignoring {}={:?}", ENV_NAV_TIMEOUT_SECS, value),
            }
        }

        self
    }

    /// Navigation budget
    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }

    /// Network-idle grace period
    pub fn network_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.network_idle_timeout_ms)
    }

    /// Download wait after an aborted navigation
    pub fn aborted_download_wait(&self) -> Duration {
        Duration::from_millis(self.aborted_download_wait_ms)
    }

    /// Download wait after a PDF-like navigation commits
    pub fn pdf_download_wait(&self) -> Duration {
        Duration::from_millis(self.pdf_download_wait_ms)
    }

    /// Stealth pause bounds, ordered
    pub fn stealth_pause_range(&self) -> (Duration, Duration) {
        let lo = self.stealth_pause_min_ms.min(self.stealth_pause_max_ms);
        let hi = self.stealth_pause_min_ms.max(self.stealth_pause_max_ms);
        (Duration::from_millis(lo), Duration::from_millis(hi))
    }

    /// Zero every wait; useful for tests and scripted engines
    pub fn without_delays(mut self) -> Self {
        self.aborted_download_wait_ms = 0;
        self.pdf_download_wait_ms = 0;
        self.stealth_pause_min_ms = 0;
        self.stealth_pause_max_ms = 0;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.headless);
        assert!(config.chrome_path.is_none());
        assert_eq!(config.navigation_timeout(), Duration::from_secs(60));
        assert_eq!(config.network_idle_timeout(), Duration::from_secs(10));
        assert_eq!(config.aborted_download_wait(), Duration::from_secs(3));
        assert_eq!(config.pdf_download_wait(), Duration::from_secs(1));
        assert_eq!(
            config.stealth_pause_range(),
            (Duration::from_secs(1), Duration::from_secs(3))
        );
    }

    #[test]
    fn test_env_overrides() {
        let config = EngineConfig::default().with_overrides(env(&[
            (ENV_CHROME, "/opt/chrome/chrome"),
            (ENV_HEADLESS, "false"),
            (ENV_REMOTE_URL, "http://127.0.0.1:9222"),
            (ENV_NAV_TIMEOUT_SECS, "5"),
        ]));
        assert_eq!(config.chrome_path, Some(PathBuf::from("/opt/chrome/chrome")));
        assert!(!config.headless);
        assert_eq!(config.remote_url.as_deref(), Some("http://127.0.0.1:9222"));
        assert_eq!(config.navigation_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_overrides_ignored() {
        let config = EngineConfig::default().with_overrides(env(&[
            (ENV_HEADLESS, "maybe"),
            (ENV_NAV_TIMEOUT_SECS, "soon"),
            (ENV_REMOTE_URL, ""),
        ]));
        assert!(config.headless);
        assert!(config.remote_url.is_none());
        assert_eq!(config.navigation_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"headless": false, "stealth_pause_min_ms": 5000}"#).unwrap();
        assert!(!config.headless);
        assert_eq!(config.navigation_timeout_ms, 60_000);
        // Bounds are reordered when inverted
        assert_eq!(
            config.stealth_pause_range(),
            (Duration::from_millis(3000), Duration::from_millis(5000))
        );
    }

    #[test]
    fn test_without_delays() {
        let config = EngineConfig::default().without_delays();
        assert_eq!(config.pdf_download_wait(), Duration::ZERO);
        assert_eq!(config.stealth_pause_range(), (Duration::ZERO, Duration::ZERO));
        assert_eq!(config.navigation_timeout(), Duration::from_secs(60));
    }
}
