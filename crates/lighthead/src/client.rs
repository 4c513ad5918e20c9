//! Entry points for one-off scrapes
//!
//! These build a Chromium-backed [`Scraper`] per call. For repeated scrapes,
//! or to use another engine, construct a [`Scraper`] directly.

use crate::browser::ChromiumEngine;
use crate::config::EngineConfig;
use crate::error::ScrapeError;
use crate::scrape::Scraper;
use crate::types::{ScrapeOptions, ScrapeRequest, ScrapeResult};

/// Scrape a URL with a local Chrome/Chromium
///
/// Engine settings come from [`EngineConfig::default`] plus `LIGHTHEAD_*`
/// environment overrides. The URL is validated before any browser starts.
pub async fn scrape(url: &str, options: ScrapeOptions) -> Result<ScrapeResult, ScrapeError> {
    scrape_with_config(url, options, EngineConfig::default().with_env_overrides()).await
}

/// Scrape a URL with explicit engine settings
pub async fn scrape_with_config(
    url: &str,
    options: ScrapeOptions,
    config: EngineConfig,
) -> Result<ScrapeResult, ScrapeError> {
    if url.trim().is_empty() {
        return Err(ScrapeError::MissingUrl);
    }
    let request = ScrapeRequest::new(url)?.with_options(options);
    let scraper = Scraper::new(ChromiumEngine::new(config.clone()), config);
    scraper.scrape(&request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scrape_empty_url() {
        let result = scrape("", ScrapeOptions::default()).await;
        assert!(matches!(result, Err(ScrapeError::MissingUrl)));
    }

    #[tokio::test]
    async fn test_scrape_invalid_scheme() {
        let result = scrape("ftp://example.com", ScrapeOptions::default()).await;
        assert!(matches!(result, Err(ScrapeError::UnsupportedProtocol)));
    }

    #[tokio::test]
    async fn test_scrape_unparseable_url() {
        let result = scrape("not a url", ScrapeOptions::default()).await;
        assert!(matches!(result, Err(ScrapeError::InvalidUrl)));
    }
}
