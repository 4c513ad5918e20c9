//! Error types for Lighthead

use thiserror::Error;

/// Errors that can occur while validating input or scraping a page
#[derive(Debug, Error)]
pub enum ScrapeError {
    /// URL is missing
    #[error("URL is required")]
    MissingUrl,

    /// URL does not parse at all
    #[error("Invalid URL format")]
    InvalidUrl,

    /// URL parses but uses a scheme other than http/https
    #[error("URL must use HTTP or HTTPS protocol")]
    UnsupportedProtocol,

    /// Output format is not one of the accepted names
    #[error("Invalid format: {format}. Valid formats are: {valid}")]
    InvalidFormat { format: String, valid: String },

    /// Numeric option outside of 0..=100
    #[error("{0} must be a number between 0 and 100")]
    InvalidRange(&'static str),

    /// Boolean option that is neither `true` nor `false`
    #[error("{0} must be 'true' or 'false'")]
    InvalidBoolean(&'static str),

    /// A flag was given without its value
    #[error("{0}")]
    MissingValue(String),

    /// Browser could not be started or attached to
    #[error("Failed to launch browser: {0}")]
    Launch(String),

    /// Navigation did not produce a usable response
    #[error(transparent)]
    Navigation(#[from] NavigationError),

    /// Browser protocol failure after navigation
    #[error("Browser error: {0}")]
    Browser(String),

    /// Local filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ScrapeError {
    /// True for errors raised before any browser session is launched
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ScrapeError::MissingUrl
                | ScrapeError::InvalidUrl
                | ScrapeError::UnsupportedProtocol
                | ScrapeError::InvalidFormat { .. }
                | ScrapeError::InvalidRange(_)
                | ScrapeError::InvalidBoolean(_)
                | ScrapeError::MissingValue(_)
        )
    }
}

/// Ways a navigation can fail
#[derive(Debug, Error)]
pub enum NavigationError {
    /// Navigation budget exhausted
    #[error("Navigation timed out after {secs}s for {url}")]
    Timeout { url: String, secs: u64 },

    /// Navigation aborted and no download compensated for it
    #[error("Navigation aborted for {url}: {reason}")]
    Aborted { url: String, reason: String },

    /// DNS failure, refused connection, and the like
    #[error("Navigation failed for {url}: {reason}")]
    Failed { url: String, reason: String },

    /// Navigation committed without a main document response
    #[error("Failed to load page: {url}")]
    NoResponse { url: String },
}
