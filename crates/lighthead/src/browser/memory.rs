//! Scripted in-memory browser
//!
//! Serves canned responses by URL without starting a browser. Every session
//! reports to a shared [`SessionLog`] so callers can check what the
//! orchestrator did: which profiles were launched, which cookies were seeded,
//! and whether every session was torn down.

use super::{
    BrowserEngine, BrowserSession, Download, HopResponse, Interaction, Navigation,
    NavigationOutcome, PageContent, SessionProfile,
};
use crate::convert::visible_text;
use crate::cookies::StoredCookie;
use crate::error::{NavigationError, ScrapeError};
use crate::types::ResponseMetadata;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

/// Canned behavior for one URL
#[derive(Debug, Clone)]
pub struct ScriptedPage {
    redirects: Vec<HopResponse>,
    status: u16,
    status_text: String,
    headers: Vec<(String, String)>,
    body: Bytes,
    final_url: Option<String>,
    live_markup: Option<String>,
    serve_transport_body: bool,
    download: Option<Download>,
    abort_reason: Option<String>,
    failure: Option<String>,
    hang: bool,
    never_idle: bool,
    set_cookies: Vec<StoredCookie>,
}

impl ScriptedPage {
    fn new(content_type: &str, body: Bytes) -> Self {
        Self {
            redirects: Vec::new(),
            status: 200,
            status_text: "OK".to_string(),
            headers: vec![("content-type".to_string(), content_type.to_string())],
            body,
            final_url: None,
            live_markup: None,
            serve_transport_body: true,
            download: None,
            abort_reason: None,
            failure: None,
            hang: false,
            never_idle: false,
            set_cookies: Vec::new(),
        }
    }

    /// `text/html` document
    pub fn html(body: &str) -> Self {
        Self::new("text/html; charset=utf-8", Bytes::from(body.to_string()))
    }

    /// Document with an arbitrary content type
    pub fn binary(content_type: &str, body: impl Into<Bytes>) -> Self {
        Self::new(content_type, body.into())
    }

    /// Navigation that the browser abandons (`net::ERR_ABORTED`)
    pub fn aborted() -> Self {
        let mut page = Self::new("", Bytes::new());
        page.headers.clear();
        page.abort_reason = Some("net::ERR_ABORTED".to_string());
        page
    }

    /// Navigation that fails outright with `reason`
    pub fn failing(reason: &str) -> Self {
        let mut page = Self::new("", Bytes::new());
        page.failure = Some(reason.to_string());
        page
    }

    /// Final response status
    pub fn status(mut self, status: u16, status_text: &str) -> Self {
        self.status = status;
        self.status_text = status_text.to_string();
        self
    }

    /// Extra header on the final response
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Redirect hop observed before the final response
    ///
    /// `location` of `None` models a redirect without a `Location` header.
    pub fn redirect(mut self, from: &str, status: u16, location: Option<&str>) -> Self {
        let headers: Vec<(&str, &str)> = location.map(|l| ("Location", l)).into_iter().collect();
        self.redirects.push(HopResponse {
            url: from.to_string(),
            response: ResponseMetadata::new(status, "Redirect", headers),
        });
        self
    }

    /// URL the navigation ends on
    pub fn final_url(mut self, url: &str) -> Self {
        self.final_url = Some(url.to_string());
        self
    }

    /// DOM markup after scripts ran, when it differs from the body
    pub fn live_markup(mut self, markup: &str) -> Self {
        self.live_markup = Some(markup.to_string());
        self
    }

    /// Make the transport body unavailable
    pub fn without_transport_body(mut self) -> Self {
        self.serve_transport_body = false;
        self
    }

    /// Emit a download while navigating
    pub fn download(mut self, suggested_filename: Option<&str>, bytes: impl Into<Bytes>) -> Self {
        self.download = Some(Download {
            url: String::new(),
            suggested_filename: suggested_filename.map(str::to_string),
            bytes: bytes.into(),
        });
        self
    }

    /// Never finish navigating
    pub fn hang(mut self) -> Self {
        self.hang = true;
        self
    }

    /// Never report network idle
    pub fn never_idle(mut self) -> Self {
        self.never_idle = true;
        self
    }

    /// Cookie the page sets while loading
    pub fn sets_cookie(mut self, cookie: StoredCookie) -> Self {
        self.set_cookies.push(cookie);
        self
    }
}

/// Shared record of what sessions did
#[derive(Debug, Default)]
pub struct SessionLog {
    launched: AtomicUsize,
    released: AtomicUsize,
    closed: AtomicUsize,
    idle_waits: AtomicUsize,
    interactions: AtomicUsize,
    profiles: Mutex<Vec<SessionProfile>>,
    seeded_cookies: Mutex<Vec<StoredCookie>>,
    navigations: Mutex<Vec<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionLog {
    /// Sessions started
    pub fn launched(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }

    /// Sessions whose resources were released, by `close` or by drop
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Sessions closed through `close`
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of network-idle waits requested
    pub fn idle_waits(&self) -> usize {
        self.idle_waits.load(Ordering::SeqCst)
    }

    /// Number of synthetic interactions performed
    pub fn interactions(&self) -> usize {
        self.interactions.load(Ordering::SeqCst)
    }

    /// True when every launched session has been released
    pub fn all_released(&self) -> bool {
        self.launched() == self.released()
    }

    /// Profiles passed to `launch`, in order
    pub fn profiles(&self) -> Vec<SessionProfile> {
        lock(&self.profiles).clone()
    }

    /// Cookies seeded into sessions before navigation
    pub fn seeded_cookies(&self) -> Vec<StoredCookie> {
        lock(&self.seeded_cookies).clone()
    }

    /// URLs navigated to, in order
    pub fn navigations(&self) -> Vec<String> {
        lock(&self.navigations).clone()
    }
}

/// Engine serving [`ScriptedPage`]s keyed by URL
#[derive(Debug, Clone, Default)]
pub struct InMemoryEngine {
    pages: Arc<HashMap<String, ScriptedPage>>,
    log: Arc<SessionLog>,
    launch_failure: Option<String>,
}

impl InMemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `page` for `url`
    pub fn with_page(mut self, url: &str, page: ScriptedPage) -> Self {
        let key = normalize_key(url);
        Arc::make_mut(&mut self.pages).insert(key, page);
        self
    }

    /// Make every launch fail with `reason`
    pub fn with_launch_failure(mut self, reason: &str) -> Self {
        self.launch_failure = Some(reason.to_string());
        self
    }

    /// Shared session log
    pub fn log(&self) -> Arc<SessionLog> {
        Arc::clone(&self.log)
    }
}

fn normalize_key(url: &str) -> String {
    Url::parse(url)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| url.to_string())
}

#[async_trait]
impl BrowserEngine for InMemoryEngine {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn launch(
        &self,
        profile: &SessionProfile,
    ) -> Result<Box<dyn BrowserSession>, ScrapeError> {
        if let Some(reason) = &self.launch_failure {
            return Err(ScrapeError::Launch(reason.clone()));
        }

        self.log.launched.fetch_add(1, Ordering::SeqCst);
        lock(&self.log.profiles).push(profile.clone());

        let (tx, rx) = mpsc::channel(4);
        Ok(Box::new(MemorySession {
            pages: Arc::clone(&self.pages),
            log: Arc::clone(&self.log),
            downloads_tx: tx,
            downloads_rx: Some(rx),
            jar: Vec::new(),
            current: None,
        }))
    }
}

struct MemorySession {
    pages: Arc<HashMap<String, ScriptedPage>>,
    log: Arc<SessionLog>,
    downloads_tx: mpsc::Sender<Download>,
    downloads_rx: Option<mpsc::Receiver<Download>>,
    jar: Vec<StoredCookie>,
    current: Option<ScriptedPage>,
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.log.released.fetch_add(1, Ordering::SeqCst);
    }
}

impl MemorySession {
    fn current(&self) -> Result<&ScriptedPage, ScrapeError> {
        self.current
            .as_ref()
            .ok_or_else(|| ScrapeError::Browser("no page loaded".to_string()))
    }
}

#[async_trait]
impl BrowserSession for MemorySession {
    fn take_downloads(&mut self) -> Option<mpsc::Receiver<Download>> {
        self.downloads_rx.take()
    }

    async fn set_cookies(&mut self, cookies: &[StoredCookie]) -> Result<(), ScrapeError> {
        lock(&self.log.seeded_cookies).extend_from_slice(cookies);
        self.jar.extend_from_slice(cookies);
        Ok(())
    }

    async fn navigate(&mut self, url: &Url) -> Result<Navigation, ScrapeError> {
        lock(&self.log.navigations).push(url.to_string());

        let Some(page) = self.pages.get(url.as_str()).cloned() else {
            return Err(NavigationError::Failed {
                url: url.to_string(),
                reason: "net::ERR_NAME_NOT_RESOLVED".to_string(),
            }
            .into());
        };

        if page.hang {
            std::future::pending::<()>().await;
        }

        if let Some(reason) = &page.failure {
            return Err(NavigationError::Failed {
                url: url.to_string(),
                reason: reason.clone(),
            }
            .into());
        }

        if let Some(download) = &page.download {
            let mut download = download.clone();
            download.url = url.to_string();
            debug!("Scripted download from {}", download.url);
            // Receiver may already be gone; the download is then simply lost
            let _ = self.downloads_tx.send(download).await;
        }

        self.jar.extend(page.set_cookies.iter().cloned());

        let redirects = page.redirects.clone();
        let outcome = match &page.abort_reason {
            Some(reason) => NavigationOutcome::Aborted {
                reason: reason.clone(),
            },
            None => NavigationOutcome::Committed {
                final_url: page.final_url.clone().unwrap_or_else(|| url.to_string()),
                response: ResponseMetadata::new(
                    page.status,
                    page.status_text.clone(),
                    page.headers.clone(),
                ),
            },
        };

        self.current = Some(page);
        Ok(Navigation { redirects, outcome })
    }

    async fn wait_for_network_idle(&mut self) -> Result<(), ScrapeError> {
        self.log.idle_waits.fetch_add(1, Ordering::SeqCst);
        if self.current.as_ref().is_some_and(|p| p.never_idle) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn simulate_interaction(&mut self, _interaction: Interaction) -> Result<(), ScrapeError> {
        self.log.interactions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn page_content(&mut self) -> Result<PageContent, ScrapeError> {
        let page = self.current()?;
        let markup = page
            .live_markup
            .clone()
            .unwrap_or_else(|| String::from_utf8_lossy(&page.body).into_owned());
        let text = visible_text(&markup);
        Ok(PageContent { markup, text })
    }

    async fn document_body(&mut self) -> Result<Option<Bytes>, ScrapeError> {
        let page = self.current()?;
        Ok(page.serve_transport_body.then(|| page.body.clone()))
    }

    async fn cookies(&mut self) -> Result<Vec<StoredCookie>, ScrapeError> {
        Ok(self.jar.clone())
    }

    async fn close(self: Box<Self>) {
        self.log.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_html_page() {
        let engine = InMemoryEngine::new().with_page(
            "https://example.com",
            ScriptedPage::html("<p>Hello</p>").header("X-Test", "1"),
        );
        let log = engine.log();

        let mut session = engine.launch(&SessionProfile::new(false)).await.unwrap();
        let url = Url::parse("https://example.com/").unwrap();
        let nav = session.navigate(&url).await.unwrap();
        match nav.outcome {
            NavigationOutcome::Committed { final_url, response } => {
                assert_eq!(final_url, "https://example.com/");
                assert_eq!(response.status, 200);
                assert_eq!(response.header("x-test"), Some("1"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        let content = session.page_content().await.unwrap();
        assert_eq!(content.text, "Hello");
        assert!(session.document_body().await.unwrap().is_some());

        session.close().await;
        assert_eq!(log.launched(), 1);
        assert_eq!(log.closed(), 1);
        assert!(log.all_released());
    }

    #[tokio::test]
    async fn test_unknown_url_fails() {
        let engine = InMemoryEngine::new();
        let mut session = engine.launch(&SessionProfile::new(true)).await.unwrap();
        let url = Url::parse("https://nowhere.invalid/").unwrap();
        let err = session.navigate(&url).await.unwrap_err();
        assert!(err.to_string().contains("ERR_NAME_NOT_RESOLVED"));
    }

    #[tokio::test]
    async fn test_drop_releases_session() {
        let engine = InMemoryEngine::new();
        let log = engine.log();
        let session = engine.launch(&SessionProfile::new(false)).await.unwrap();
        drop(session);
        assert_eq!(log.closed(), 0);
        assert!(log.all_released());
    }

    #[tokio::test]
    async fn test_download_delivered_on_channel() {
        let engine = InMemoryEngine::new().with_page(
            "https://example.com/a.pdf",
            ScriptedPage::aborted().download(Some("a.pdf"), &b"%PDF-1.4"[..]),
        );
        let mut session = engine.launch(&SessionProfile::new(false)).await.unwrap();
        let mut rx = session.take_downloads().unwrap();
        assert!(session.take_downloads().is_none());

        let url = Url::parse("https://example.com/a.pdf").unwrap();
        let nav = session.navigate(&url).await.unwrap();
        assert!(matches!(nav.outcome, NavigationOutcome::Aborted { .. }));

        let download = rx.recv().await.unwrap();
        assert_eq!(download.suggested_filename.as_deref(), Some("a.pdf"));
        assert_eq!(download.url, "https://example.com/a.pdf");
    }
}
