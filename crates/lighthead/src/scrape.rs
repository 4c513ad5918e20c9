//! Fetch orchestrator
//!
//! Drives one browser session per request through launch, cookie seeding,
//! navigation, settling, and classification, and always tears the session
//! down before returning.

use crate::browser::{
    BrowserEngine, BrowserSession, Download, Interaction, NavigationOutcome, SessionProfile,
};
use crate::config::EngineConfig;
use crate::convert::to_markdown;
use crate::cookies::{load_cookies, save_cookies};
use crate::error::{NavigationError, ScrapeError};
use crate::extension::{content_type_for_filename, resolve_extension};
use crate::types::{
    BinaryResult, HtmlResult, RedirectRecord, ResponseMetadata, ScrapeRequest, ScrapeResult,
};
use rand::Rng;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Content type assumed for downloads that carry no better hint
pub const DOWNLOAD_CONTENT_TYPE: &str = "application/pdf";

/// Phase trace: INFO for verbose requests, DEBUG otherwise
macro_rules! phase {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            info!($($arg)+);
        } else {
            debug!($($arg)+);
        }
    };
}

/// Runs scrapes against a browser engine
///
/// Cheap to clone; every call to [`scrape`](Scraper::scrape) gets its own
/// isolated session.
#[derive(Clone)]
pub struct Scraper {
    engine: Arc<dyn BrowserEngine>,
    config: EngineConfig,
}

impl std::fmt::Debug for Scraper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scraper")
            .field("engine", &self.engine.name())
            .field("config", &self.config)
            .finish()
    }
}

impl Scraper {
    pub fn new(engine: impl BrowserEngine + 'static, config: EngineConfig) -> Self {
        Self::with_shared_engine(Arc::new(engine), config)
    }

    /// Build from an engine shared with other components
    pub fn with_shared_engine(engine: Arc<dyn BrowserEngine>, config: EngineConfig) -> Self {
        Self { engine, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Fetch `request` and classify the result
    ///
    /// The browser session is closed on every path. If the returned future
    /// is dropped early, the session is released by its `Drop`.
    pub async fn scrape(&self, request: &ScrapeRequest) -> Result<ScrapeResult, ScrapeError> {
        let verbose = request.options().verbose;
        let profile = SessionProfile::new(request.options().stealth);

        phase!(
            verbose,
            "Launching {} browser (stealth={})",
            self.engine.name(),
            profile.stealth
        );
        let mut session = self.engine.launch(&profile).await?;

        let result = self.drive(session.as_mut(), request).await;

        phase!(verbose, "Closing browser session");
        session.close().await;

        match &result {
            Ok(r) => phase!(verbose, "Scrape of {} finished as {}", request.url(), r.kind()),
            Err(e) => phase!(verbose, "Scrape of {} failed: {}", request.url(), e),
        }
        result
    }

    async fn drive(
        &self,
        session: &mut dyn BrowserSession,
        request: &ScrapeRequest,
    ) -> Result<ScrapeResult, ScrapeError> {
        let options = request.options();
        let verbose = options.verbose;
        let url = request.url();
        let pdf_like = request.looks_like_pdf();

        if let Some(path) = &options.cookie_file {
            seed_cookies(session, path, verbose).await;
        }

        let mut downloads = session.take_downloads();

        phase!(verbose, "Navigating to {}", url);
        let budget = self.config.navigation_timeout();
        let navigation = match tokio::time::timeout(budget, session.navigate(url)).await {
            Ok(nav) => nav?,
            Err(_) => {
                return Err(NavigationError::Timeout {
                    url: url.to_string(),
                    secs: budget.as_secs(),
                }
                .into())
            }
        };

        let redirect_chain: Vec<RedirectRecord> = navigation
            .redirects
            .iter()
            .filter(|hop| hop.response.is_redirect())
            .map(|hop| RedirectRecord::from_response(hop.url.clone(), &hop.response))
            .collect();
        for (i, hop) in redirect_chain.iter().enumerate() {
            phase!(
                verbose,
                "Redirect {}: {} {} -> {}",
                i + 1,
                hop.status,
                hop.from,
                hop.to
            );
        }
        if redirect_chain.len() > options.max_redirects as usize {
            warn!(
                "{} redirects observed, above the requested maximum of {}",
                redirect_chain.len(),
                options.max_redirects
            );
        }

        let (final_url, response) = match navigation.outcome {
            NavigationOutcome::Committed {
                final_url,
                response,
            } => (final_url, response),
            NavigationOutcome::Aborted { reason } => {
                phase!(verbose, "Navigation aborted ({}), waiting for a download", reason);
                let download = next_download(&mut downloads, self.config.aborted_download_wait())
                    .await
                    .filter(|d| !d.bytes.is_empty());
                let Some(download) = download else {
                    return Err(NavigationError::Aborted {
                        url: url.to_string(),
                        reason,
                    }
                    .into());
                };

                let result =
                    downloaded_result(download, url.as_str(), url.as_str(), redirect_chain, None);
                phase!(verbose, "Download captured after aborted navigation");
                self.persist_cookies(session, request).await;
                return Ok(result);
            }
        };

        phase!(
            verbose,
            "Response {} {} from {}",
            response.status,
            response.status_text,
            final_url
        );

        if pdf_like {
            phase!(verbose, "PDF-like URL, skipping network idle wait");
        } else if options.follow_redirects {
            self.settle(session, verbose).await;
        }

        if options.stealth {
            self.humanize(session, verbose).await;
        }

        let download = if pdf_like {
            next_download(&mut downloads, self.config.pdf_download_wait()).await
        } else {
            downloads.as_mut().and_then(|rx| rx.try_recv().ok())
        };
        let download = match download {
            Some(d) if d.bytes.is_empty() => {
                debug!("Ignoring empty download from {}", d.url);
                None
            }
            other => other,
        };

        let result = if let Some(download) = download {
            phase!(verbose, "Download captured, treating result as binary");
            downloaded_result(
                download,
                url.as_str(),
                &final_url,
                redirect_chain,
                Some(response),
            )
        } else {
            let content_type = response.content_type().to_string();
            phase!(verbose, "Content-Type: {}", content_type);
            if content_type.contains("text/html") {
                self.html_result(session, request, final_url, redirect_chain, response)
                    .await?
            } else {
                self.binary_result(session, request, final_url, redirect_chain, response)
                    .await?
            }
        };

        self.persist_cookies(session, request).await;
        Ok(result)
    }

    /// Wait for network idle; overrunning the grace period is tolerated
    async fn settle(&self, session: &mut dyn BrowserSession, verbose: bool) {
        let grace = self.config.network_idle_timeout();
        phase!(verbose, "Waiting up to {:?} for network idle", grace);
        match tokio::time::timeout(grace, session.wait_for_network_idle()).await {
            Ok(Ok(())) => phase!(verbose, "Network idle"),
            Ok(Err(e)) => warn!("Network idle wait failed, continuing: {}", e),
            Err(_) => phase!(verbose, "Network still busy after {:?}, continuing", grace),
        }
    }

    async fn humanize(&self, session: &mut dyn BrowserSession, verbose: bool) {
        let (lo, hi) = self.config.stealth_pause_range();
        let pause = random_pause(lo, hi);
        phase!(verbose, "Pausing {:?} before interacting", pause);
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }

        if let Err(e) = session.simulate_interaction(Interaction::random()).await {
            debug!("Synthetic interaction failed: {}", e);
        }
    }

    async fn html_result(
        &self,
        session: &mut dyn BrowserSession,
        request: &ScrapeRequest,
        final_url: String,
        redirect_chain: Vec<RedirectRecord>,
        response: ResponseMetadata,
    ) -> Result<ScrapeResult, ScrapeError> {
        let verbose = request.options().verbose;
        let budget = self.config.navigation_timeout();

        let content = bounded(budget, "reading page content", session.page_content()).await?;
        let transport = match bounded(budget, "reading document body", session.document_body()).await
        {
            Ok(body) => body.filter(|b| !b.is_empty()),
            Err(e) => {
                debug!("Transport body unavailable: {}", e);
                None
            }
        };
        let html = match transport {
            Some(body) => String::from_utf8_lossy(&body).into_owned(),
            None => {
                phase!(verbose, "Using live DOM markup");
                content.markup
            }
        };

        let markdown = to_markdown(&html, Some(&final_url));
        phase!(
            verbose,
            "HTML {} chars, text {} chars, markdown {} chars",
            html.len(),
            content.text.len(),
            markdown.len()
        );

        Ok(ScrapeResult::Html(HtmlResult {
            html,
            text: content.text,
            markdown,
            url: request.url().to_string(),
            final_url,
            redirect_chain,
            response,
        }))
    }

    async fn binary_result(
        &self,
        session: &mut dyn BrowserSession,
        request: &ScrapeRequest,
        final_url: String,
        redirect_chain: Vec<RedirectRecord>,
        response: ResponseMetadata,
    ) -> Result<ScrapeResult, ScrapeError> {
        let budget = self.config.navigation_timeout();
        let buffer = bounded(budget, "reading response body", session.document_body())
            .await?
            .ok_or_else(|| ScrapeError::Browser("response body unavailable".to_string()))?;

        let content_type = response.content_type().to_string();
        let filename = timestamped_filename(&resolve_extension(
            request.url().as_str(),
            &content_type,
        ));
        phase!(
            request.options().verbose,
            "Binary {} bytes, filename {}",
            buffer.len(),
            filename
        );

        Ok(ScrapeResult::Binary(BinaryResult {
            buffer,
            filename,
            content_type,
            url: request.url().to_string(),
            final_url,
            redirect_chain,
            response,
        }))
    }

    async fn persist_cookies(&self, session: &mut dyn BrowserSession, request: &ScrapeRequest) {
        let Some(path) = &request.options().cookie_file else {
            return;
        };
        match session.cookies().await {
            Ok(cookies) => match save_cookies(path, &cookies) {
                Ok(()) => phase!(
                    request.options().verbose,
                    "Saved {} cookies to {}",
                    cookies.len(),
                    path.display()
                ),
                Err(e) => warn!("Failed to save cookies: {}", e),
            },
            Err(e) => warn!("Failed to read cookies: {}", e),
        }
    }
}

async fn seed_cookies(session: &mut dyn BrowserSession, path: &Path, verbose: bool) {
    match load_cookies(path) {
        Ok(cookies) if cookies.is_empty() => {}
        Ok(cookies) => match session.set_cookies(&cookies).await {
            Ok(()) => phase!(
                verbose,
                "Loaded {} cookies from {}",
                cookies.len(),
                path.display()
            ),
            Err(e) => warn!("Failed to seed cookies: {}", e),
        },
        Err(e) => warn!("Failed to load cookies: {}", e),
    }
}

async fn next_download(
    downloads: &mut Option<mpsc::Receiver<Download>>,
    wait: Duration,
) -> Option<Download> {
    let rx = downloads.as_mut()?;
    if let Ok(download) = rx.try_recv() {
        return Some(download);
    }
    tokio::time::timeout(wait, rx.recv()).await.ok().flatten()
}

async fn bounded<T>(
    budget: Duration,
    what: &str,
    fut: impl Future<Output = Result<T, ScrapeError>>,
) -> Result<T, ScrapeError> {
    tokio::time::timeout(budget, fut)
        .await
        .map_err(|_| ScrapeError::Browser(format!("timed out {}", what)))?
}

fn random_pause(lo: Duration, hi: Duration) -> Duration {
    if hi <= lo {
        return lo;
    }
    let ms = rand::thread_rng().gen_range(lo.as_millis()..=hi.as_millis());
    Duration::from_millis(u64::try_from(ms).unwrap_or(u64::MAX))
}

fn timestamped_filename(extension: &str) -> String {
    format!(
        "download_{}{}",
        chrono::Utc::now().timestamp_millis(),
        extension
    )
}

/// Binary result for a file the browser downloaded
///
/// Without a real response, one is synthesized with status 200 and a
/// content type matching the filename.
fn downloaded_result(
    download: Download,
    url: &str,
    final_url: &str,
    redirect_chain: Vec<RedirectRecord>,
    response: Option<ResponseMetadata>,
) -> ScrapeResult {
    let source = if download.url.is_empty() {
        url
    } else {
        download.url.as_str()
    };
    let filename = match download.suggested_filename {
        Some(name) if !name.is_empty() => name,
        _ => timestamped_filename(&resolve_extension(source, DOWNLOAD_CONTENT_TYPE)),
    };
    let content_type = content_type_for_filename(&filename)
        .unwrap_or(DOWNLOAD_CONTENT_TYPE)
        .to_string();
    let response = response.unwrap_or_else(|| {
        ResponseMetadata::new(200, "OK", [("content-type", content_type.clone())])
    });

    ScrapeResult::Binary(BinaryResult {
        buffer: download.bytes,
        filename,
        content_type,
        url: url.to_string(),
        final_url: final_url.to_string(),
        redirect_chain,
        response,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{InMemoryEngine, ScriptedPage};
    use crate::types::ScrapeOptions;
    use bytes::Bytes;

    fn scraper(engine: &InMemoryEngine) -> Scraper {
        Scraper::new(engine.clone(), EngineConfig::default().without_delays())
    }

    fn request(url: &str) -> ScrapeRequest {
        ScrapeRequest::new(url).unwrap()
    }

    #[tokio::test]
    async fn test_html_page() {
        let engine = InMemoryEngine::new().with_page(
            "https://example.com/",
            ScriptedPage::html("<h1>Hello</h1><p>See <a href=\"/more\">more</a></p>"),
        );
        let result = scraper(&engine)
            .scrape(&request("https://example.com/"))
            .await
            .unwrap();

        let ScrapeResult::Html(html) = result else {
            panic!("expected html");
        };
        assert_eq!(
            html.markdown,
            "# Hello\n\nSee [more](https://example.com/more)"
        );
        assert_eq!(html.final_url, "https://example.com/");
        assert_eq!(html.response.status, 200);
        assert!(html.redirect_chain.is_empty());
        assert_eq!(engine.log().closed(), 1);
        assert!(engine.log().all_released());
    }

    #[tokio::test]
    async fn test_transport_body_preferred_over_live_dom() {
        let engine = InMemoryEngine::new().with_page(
            "https://example.com/",
            ScriptedPage::html("<p>Original</p>").live_markup("<p>Mutated</p>"),
        );
        let ScrapeResult::Html(html) = scraper(&engine)
            .scrape(&request("https://example.com/"))
            .await
            .unwrap()
        else {
            panic!("expected html");
        };
        assert_eq!(html.markdown, "Original");
        assert_eq!(html.text, "Mutated");
    }

    #[tokio::test]
    async fn test_live_dom_fallback() {
        let engine = InMemoryEngine::new().with_page(
            "https://example.com/",
            ScriptedPage::html("<p>Original</p>")
                .live_markup("<p>Mutated</p>")
                .without_transport_body(),
        );
        let ScrapeResult::Html(html) = scraper(&engine)
            .scrape(&request("https://example.com/"))
            .await
            .unwrap()
        else {
            panic!("expected html");
        };
        assert_eq!(html.html, "<p>Mutated</p>");
        assert_eq!(html.markdown, "Mutated");
    }

    #[tokio::test]
    async fn test_binary_filename_from_content_type() {
        let engine = InMemoryEngine::new().with_page(
            "https://example.com/photo",
            ScriptedPage::binary("image/png", &b"\x89PNG"[..]),
        );
        let ScrapeResult::Binary(bin) = scraper(&engine)
            .scrape(&request("https://example.com/photo"))
            .await
            .unwrap()
        else {
            panic!("expected binary");
        };
        assert!(bin.filename.starts_with("download_"));
        assert!(bin.filename.ends_with(".png"));
        assert_eq!(bin.content_type, "image/png");
        assert_eq!(bin.buffer.len(), 4);
    }

    #[tokio::test]
    async fn test_download_wins_over_content_type() {
        let engine = InMemoryEngine::new().with_page(
            "https://example.com/report",
            ScriptedPage::html("<p>Preparing download</p>")
                .download(Some("report.zip"), &b"PK\x03\x04"[..]),
        );
        let ScrapeResult::Binary(bin) = scraper(&engine)
            .scrape(&request("https://example.com/report"))
            .await
            .unwrap()
        else {
            panic!("expected binary");
        };
        assert_eq!(bin.filename, "report.zip");
        assert_eq!(bin.content_type, "application/zip");
        // Real response kept when the navigation committed
        assert_eq!(bin.response.content_type(), "text/html; charset=utf-8");
    }

    #[tokio::test]
    async fn test_no_idle_wait_without_follow_redirects() {
        let engine = InMemoryEngine::new()
            .with_page("https://example.com/", ScriptedPage::html("<p>x</p>"));
        let req = request("https://example.com/")
            .with_options(ScrapeOptions::default().follow_redirects(false));
        scraper(&engine).scrape(&req).await.unwrap();
        assert_eq!(engine.log().idle_waits(), 0);
    }

    #[tokio::test]
    async fn test_stealth_interaction() {
        let engine = InMemoryEngine::new()
            .with_page("https://example.com/", ScriptedPage::html("<p>x</p>"));
        let scraper = scraper(&engine);

        scraper.scrape(&request("https://example.com/")).await.unwrap();
        assert_eq!(engine.log().interactions(), 1);

        let plain = request("https://example.com/")
            .with_options(ScrapeOptions::default().stealth(false));
        scraper.scrape(&plain).await.unwrap();
        assert_eq!(engine.log().interactions(), 1);

        let profiles = engine.log().profiles();
        assert!(profiles[0].stealth);
        assert!(!profiles[1].stealth);
    }

    #[tokio::test]
    async fn test_failed_navigation_closes_session() {
        let engine = InMemoryEngine::new().with_page(
            "https://example.com/",
            ScriptedPage::failing("net::ERR_CONNECTION_REFUSED"),
        );
        let err = scraper(&engine)
            .scrape(&request("https://example.com/"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ERR_CONNECTION_REFUSED"));
        assert_eq!(engine.log().closed(), 1);
        assert!(engine.log().all_released());
    }

    #[test]
    fn test_downloaded_result_synthesizes_response() {
        let download = Download {
            url: "https://example.com/get?id=1".to_string(),
            suggested_filename: None,
            bytes: Bytes::from_static(b"%PDF-1.7"),
        };
        let ScrapeResult::Binary(bin) = downloaded_result(
            download,
            "https://example.com/get?id=1",
            "https://example.com/get?id=1",
            Vec::new(),
            None,
        ) else {
            panic!("expected binary");
        };
        assert!(bin.filename.starts_with("download_"));
        assert!(bin.filename.ends_with(".pdf"));
        assert_eq!(bin.content_type, "application/pdf");
        assert_eq!(bin.response.status, 200);
        assert_eq!(bin.response.content_type(), "application/pdf");
    }

    #[test]
    fn test_random_pause_bounds() {
        let lo = Duration::from_millis(1_000);
        let hi = Duration::from_millis(3_000);
        for _ in 0..50 {
            let pause = random_pause(lo, hi);
            assert!(pause >= lo && pause <= hi);
        }
        assert_eq!(random_pause(Duration::ZERO, Duration::ZERO), Duration::ZERO);
        assert_eq!(random_pause(hi, lo), hi);
    }
}
