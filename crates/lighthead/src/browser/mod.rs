//! Browser capability
//!
//! The orchestrator talks to a browser only through [`BrowserEngine`] and
//! [`BrowserSession`]. A session is one isolated profile (cookies, cache,
//! fingerprint) used for a single scrape and then torn down.
//!
//! Engines:
//! - [`ChromiumEngine`] - Chrome/Chromium over the DevTools protocol (`chromium` feature)
//! - [`InMemoryEngine`] - scripted pages, no browser process

#[cfg(feature = "chromium")]
mod chromium;
mod memory;

#[cfg(feature = "chromium")]
pub use chromium::{discover_websocket_url, find_chrome, ChromiumEngine};
pub use memory::{InMemoryEngine, ScriptedPage, SessionLog};

use crate::cookies::StoredCookie;
use crate::error::ScrapeError;
use crate::stealth::Fingerprint;
use crate::types::ResponseMetadata;
use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use tokio::sync::mpsc;
use url::Url;

/// How a session should present itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionProfile {
    pub stealth: bool,
    pub fingerprint: Fingerprint,
}

impl SessionProfile {
    /// Desktop profile, with the stealth bundle when `stealth` is set
    pub fn new(stealth: bool) -> Self {
        Self {
            stealth,
            fingerprint: Fingerprint::desktop(stealth),
        }
    }
}

/// A file the browser saved instead of rendering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    /// URL the download came from
    pub url: String,
    /// Filename proposed by the server or browser, if any
    pub suggested_filename: Option<String>,
    pub bytes: Bytes,
}

/// Response observed for one redirect hop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopResponse {
    /// URL that answered with the redirect
    pub url: String,
    pub response: ResponseMetadata,
}

/// How a navigation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationOutcome {
    /// The main document response arrived
    Committed {
        final_url: String,
        response: ResponseMetadata,
    },
    /// The browser abandoned the navigation, typically because it turned
    /// into a download
    Aborted { reason: String },
}

/// Result of [`BrowserSession::navigate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Navigation {
    /// Redirect responses in the order they were received
    pub redirects: Vec<HopResponse>,
    pub outcome: NavigationOutcome,
}

/// Synthetic user input
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interaction {
    pub pointer_x: f64,
    pub pointer_y: f64,
    pub scroll_y: f64,
}

impl Interaction {
    /// Pointer somewhere in the top-left 100x100 square, scroll up to 100px
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            pointer_x: rng.gen_range(0.0..100.0),
            pointer_y: rng.gen_range(0.0..100.0),
            scroll_y: rng.gen_range(0.0..100.0),
        }
    }
}

/// Rendered page content
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageContent {
    /// Live DOM serialization
    pub markup: String,
    /// Text content of the body
    pub text: String,
}

/// Factory for isolated browser sessions
#[async_trait]
pub trait BrowserEngine: Send + Sync {
    /// Identifier used in logs
    fn name(&self) -> &'static str;

    /// Start a fresh session
    ///
    /// The fingerprint and any init scripts must be in place before this
    /// returns, so they apply to the first navigation.
    async fn launch(&self, profile: &SessionProfile)
        -> Result<Box<dyn BrowserSession>, ScrapeError>;
}

/// One isolated browser session
///
/// Dropping a session must release its browser resources even when
/// [`close`](BrowserSession::close) was never awaited.
#[async_trait]
pub trait BrowserSession: Send {
    /// Channel of completed downloads; `None` after the first call
    fn take_downloads(&mut self) -> Option<mpsc::Receiver<Download>>;

    /// Seed the cookie jar
    async fn set_cookies(&mut self, cookies: &[StoredCookie]) -> Result<(), ScrapeError>;

    /// Navigate the page and report redirects and the outcome
    async fn navigate(&mut self, url: &Url) -> Result<Navigation, ScrapeError>;

    /// Resolve once network activity has quieted down
    ///
    /// May never resolve; callers bound it with their own timeout.
    async fn wait_for_network_idle(&mut self) -> Result<(), ScrapeError>;

    /// Move the pointer and scroll
    async fn simulate_interaction(&mut self, interaction: Interaction) -> Result<(), ScrapeError>;

    /// Current DOM markup and body text
    async fn page_content(&mut self) -> Result<PageContent, ScrapeError>;

    /// Body of the main document as received, before scripts ran
    async fn document_body(&mut self) -> Result<Option<Bytes>, ScrapeError>;

    /// Current cookie jar
    async fn cookies(&mut self) -> Result<Vec<StoredCookie>, ScrapeError>;

    /// Tear the session down
    async fn close(self: Box<Self>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_interaction_in_bounds() {
        for _ in 0..100 {
            let i = Interaction::random();
            assert!((0.0..100.0).contains(&i.pointer_x));
            assert!((0.0..100.0).contains(&i.pointer_y));
            assert!((0.0..100.0).contains(&i.scroll_y));
        }
    }

    #[test]
    fn test_session_profile() {
        let profile = SessionProfile::new(true);
        assert!(profile.stealth);
        assert!(!profile.fingerprint.init_scripts.is_empty());
        assert!(SessionProfile::new(false).fingerprint.init_scripts.is_empty());
    }
}
