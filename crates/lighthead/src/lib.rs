//! Lighthead - headless-browser scraping with HTML to markdown conversion
//!
//! Fetches a page through a real browser, waits for it to settle, and
//! returns either the rendered document (markup, visible text, markdown) or
//! a binary payload such as a PDF, along with the redirect chain and final
//! response.
//!
//! ## Browser engines
//!
//! The [`Scraper`] orchestrator drives any [`BrowserEngine`]:
//! - [`ChromiumEngine`] - Chrome/Chromium over the DevTools protocol (`chromium` feature)
//! - [`InMemoryEngine`] - scripted pages for tests and offline use
//!
//! ```no_run
//! # async fn run() -> Result<(), lighthead::ScrapeError> {
//! use lighthead::{scrape, ScrapeOptions, ScrapeResult};
//!
//! match scrape("https://example.com", ScrapeOptions::default()).await? {
//!     ScrapeResult::Html(page) => println!("{}", page.markdown),
//!     ScrapeResult::Binary(file) => println!("{} ({} bytes)", file.filename, file.buffer.len()),
//! }
//! # Ok(())
//! # }
//! ```

pub mod browser;
#[cfg(feature = "chromium")]
pub mod client;
pub mod config;
mod convert;
pub mod cookies;
mod error;
mod extension;
pub mod scrape;
pub mod stealth;
mod types;
pub mod validate;

#[cfg(feature = "chromium")]
pub use browser::ChromiumEngine;
pub use browser::{BrowserEngine, BrowserSession, InMemoryEngine, ScriptedPage, SessionLog};
#[cfg(feature = "chromium")]
pub use client::{scrape, scrape_with_config};
pub use config::EngineConfig;
pub use convert::{to_markdown, visible_text};
pub use cookies::{load_cookies, save_cookies, CookieError, StoredCookie};
pub use error::{NavigationError, ScrapeError};
pub use extension::{content_type_for_filename, resolve_extension};
pub use scrape::Scraper;
pub use types::{
    BinaryResult, HtmlResult, OutputFormat, RedirectRecord, ResponseMetadata, ScrapeOptions,
    ScrapeRequest, ScrapeResult, DEFAULT_MAX_REDIRECTS, UNKNOWN_LOCATION,
};
pub use validate::{parse_bool, validate_format, validate_max_redirects, validate_url};

/// Service name reported by health checks
pub const SERVICE_NAME: &str = "lighthead-api";

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
