//! Core types for Lighthead

use crate::error::ScrapeError;
use crate::validate::validate_url;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use url::Url;

/// Placeholder recorded when a redirect response carries no `Location` header
pub const UNKNOWN_LOCATION: &str = "unknown";

/// Default advisory redirect cap
pub const DEFAULT_MAX_REDIRECTS: u32 = 10;

/// Representation of a scrape result handed to the caller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Raw document markup
    #[default]
    Html,
    /// Simplified markdown rendering
    Markdown,
    /// Visible body text
    Text,
    /// Raw bytes of a binary payload
    Binary,
}

impl OutputFormat {
    /// Canonical name used in responses
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Html => "html",
            OutputFormat::Markdown => "markdown",
            OutputFormat::Text => "text",
            OutputFormat::Binary => "binary",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "html" => Ok(OutputFormat::Html),
            "markdown" | "md" => Ok(OutputFormat::Markdown),
            "text" | "txt" => Ok(OutputFormat::Text),
            "binary" => Ok(OutputFormat::Binary),
            _ => Err(format!("Unknown format: {}", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-request scrape options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScrapeOptions {
    /// Emit a diagnostic trace of every phase
    pub verbose: bool,
    /// Wait for the page to settle after redirects instead of returning at commit
    pub follow_redirects: bool,
    /// Cookie store read before navigation and written after
    pub cookie_file: Option<PathBuf>,
    /// Advisory redirect cap surfaced to callers
    pub max_redirects: u32,
    /// Apply anti-fingerprinting measures
    pub stealth: bool,
}

impl Default for ScrapeOptions {
    fn default() -> Self {
        Self {
            verbose: false,
            follow_redirects: true,
            cookie_file: None,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            stealth: true,
        }
    }
}

impl ScrapeOptions {
    /// Enable or disable phase tracing
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Enable or disable waiting for the page to settle
    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    /// Set the cookie store path
    pub fn cookie_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.cookie_file = Some(path.into());
        self
    }

    /// Set the advisory redirect cap
    pub fn max_redirects(mut self, max: u32) -> Self {
        self.max_redirects = max;
        self
    }

    /// Enable or disable stealth measures
    pub fn stealth(mut self, stealth: bool) -> Self {
        self.stealth = stealth;
        self
    }
}

/// A validated scrape request
#[derive(Debug, Clone)]
pub struct ScrapeRequest {
    url: Url,
    options: ScrapeOptions,
}

impl ScrapeRequest {
    /// Validate the URL and build a request with default options
    pub fn new(url: &str) -> Result<Self, ScrapeError> {
        Ok(Self {
            url: validate_url(url)?,
            options: ScrapeOptions::default(),
        })
    }

    /// Replace the options
    pub fn with_options(mut self, options: ScrapeOptions) -> Self {
        self.options = options;
        self
    }

    /// Target URL
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Request options
    pub fn options(&self) -> &ScrapeOptions {
        &self.options
    }

    /// True when the request path looks like a PDF document
    pub fn looks_like_pdf(&self) -> bool {
        self.url.as_str().to_lowercase().contains(".pdf")
    }
}

/// One observed 3xx hop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectRecord {
    /// URL that answered with the redirect
    pub from: String,
    /// `Location` target, or [`UNKNOWN_LOCATION`]
    pub to: String,
    /// Redirect status code
    pub status: u16,
}

impl RedirectRecord {
    /// Build a record from a redirect response
    pub fn from_response(url: impl Into<String>, response: &ResponseMetadata) -> Self {
        Self {
            from: url.into(),
            to: response
                .header("location")
                .unwrap_or(UNKNOWN_LOCATION)
                .to_string(),
            status: response.status,
        }
    }
}

/// Status line and headers of a response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    /// HTTP status code
    pub status: u16,
    /// HTTP status text
    pub status_text: String,
    /// Headers with lower-cased names
    pub headers: BTreeMap<String, String>,
}

impl ResponseMetadata {
    /// Build metadata, lower-casing header names
    pub fn new<K, V>(
        status: u16,
        status_text: impl Into<String>,
        headers: impl IntoIterator<Item = (K, V)>,
    ) -> Self
    where
        K: AsRef<str>,
        V: Into<String>,
    {
        Self {
            status,
            status_text: status_text.into(),
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.as_ref().to_lowercase(), v.into()))
                .collect(),
        }
    }

    /// Look up a header by case-insensitive name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    /// `content-type` header, or empty
    pub fn content_type(&self) -> &str {
        self.header("content-type").unwrap_or("")
    }

    /// True for 3xx responses
    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }
}

/// Rendered HTML page
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HtmlResult {
    /// Document markup
    pub html: String,
    /// Visible body text
    pub text: String,
    /// Markdown derived from `html`
    pub markdown: String,
    /// Requested URL
    pub url: String,
    /// URL after redirects
    pub final_url: String,
    /// Redirect hops in chronological order
    pub redirect_chain: Vec<RedirectRecord>,
    /// Final response
    pub response: ResponseMetadata,
}

/// Binary payload (PDF, image, archive, ...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryResult {
    /// Payload bytes
    #[serde(skip)]
    pub buffer: Bytes,
    /// Suggested filename
    pub filename: String,
    /// Content type of the payload
    pub content_type: String,
    /// Requested URL
    pub url: String,
    /// URL after redirects
    pub final_url: String,
    /// Redirect hops in chronological order
    pub redirect_chain: Vec<RedirectRecord>,
    /// Final response (synthesized for download-triggered fetches)
    pub response: ResponseMetadata,
}

/// Outcome of a successful scrape
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ScrapeResult {
    /// HTML document
    Html(HtmlResult),
    /// Binary payload
    Binary(BinaryResult),
}

impl ScrapeResult {
    /// `"html"` or `"binary"`
    pub fn kind(&self) -> &'static str {
        match self {
            ScrapeResult::Html(_) => "html",
            ScrapeResult::Binary(_) => "binary",
        }
    }

    /// Requested URL
    pub fn url(&self) -> &str {
        match self {
            ScrapeResult::Html(r) => &r.url,
            ScrapeResult::Binary(r) => &r.url,
        }
    }

    /// URL after redirects
    pub fn final_url(&self) -> &str {
        match self {
            ScrapeResult::Html(r) => &r.final_url,
            ScrapeResult::Binary(r) => &r.final_url,
        }
    }

    /// Redirect hops in chronological order
    pub fn redirect_chain(&self) -> &[RedirectRecord] {
        match self {
            ScrapeResult::Html(r) => &r.redirect_chain,
            ScrapeResult::Binary(r) => &r.redirect_chain,
        }
    }

    /// Final response
    pub fn response(&self) -> &ResponseMetadata {
        match self {
            ScrapeResult::Html(r) => &r.response,
            ScrapeResult::Binary(r) => &r.response,
        }
    }
}
