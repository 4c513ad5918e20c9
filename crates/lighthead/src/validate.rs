//! Input validation shared by the CLI and the HTTP service

use crate::error::ScrapeError;
use crate::types::OutputFormat;
use url::Url;

/// Format names accepted by every surface
pub const TEXT_FORMATS: &[&str] = &["html", "markdown", "md", "text", "txt"];

/// Format names accepted by the HTTP service
pub const SERVICE_FORMATS: &[&str] = &["html", "markdown", "md", "text", "txt", "binary"];

/// Parse a URL and require an http or https scheme
///
/// An empty string is just another unparseable URL; surfaces that treat a
/// missing URL separately check for it first.
pub fn validate_url(raw: &str) -> Result<Url, ScrapeError> {
    let url = Url::parse(raw).map_err(|_| ScrapeError::InvalidUrl)?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        _ => Err(ScrapeError::UnsupportedProtocol),
    }
}

/// Parse an output format name (case-insensitive)
///
/// `binary` is only accepted when `allow_binary` is set.
pub fn validate_format(raw: &str, allow_binary: bool) -> Result<OutputFormat, ScrapeError> {
    let valid = if allow_binary {
        SERVICE_FORMATS
    } else {
        TEXT_FORMATS
    };

    let lowered = raw.to_lowercase();
    if !valid.contains(&lowered.as_str()) {
        return Err(ScrapeError::InvalidFormat {
            format: raw.to_string(),
            valid: valid.join(", "),
        });
    }

    lowered.parse().map_err(|_| ScrapeError::InvalidFormat {
        format: raw.to_string(),
        valid: valid.join(", "),
    })
}

/// Parse a redirect cap in `0..=100`
///
/// Only the leading integer is read, so `"12.5"` and `"12abc"` both give 12.
/// `param` names the option in the error message.
pub fn validate_max_redirects(raw: &str, param: &'static str) -> Result<u32, ScrapeError> {
    let value = parse_leading_int(raw).ok_or(ScrapeError::InvalidRange(param))?;
    if !(0..=100).contains(&value) {
        return Err(ScrapeError::InvalidRange(param));
    }
    u32::try_from(value).map_err(|_| ScrapeError::InvalidRange(param))
}

/// Parse a strict `true`/`false` flag
pub fn parse_bool(raw: &str, param: &'static str) -> Result<bool, ScrapeError> {
    match raw {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ScrapeError::InvalidBoolean(param)),
    }
}

fn parse_leading_int(raw: &str) -> Option<i64> {
    let trimmed = raw.trim_start();
    let (negative, rest) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };

    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }

    // Saturate absurdly long inputs; they fail the range check either way
    let magnitude = digits.parse::<i64>().unwrap_or(i64::MAX);
    Some(if negative { -magnitude } else { magnitude })
}
