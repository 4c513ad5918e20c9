//! Cookie persistence
//!
//! Cookies are stored as a pretty-printed JSON array in the layout browser
//! automation tools commonly export (`name`, `value`, `domain`, `path`,
//! `expires`, `httpOnly`, `secure`, `sameSite`). Files that use `key`
//! instead of `name` are accepted on load.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Cookie store failures
#[derive(Debug, Error)]
pub enum CookieError {
    /// File could not be read or written
    #[error("cookie file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// File is not a JSON cookie array
    #[error("cookie file is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

/// One persisted cookie
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCookie {
    #[serde(alias = "key")]
    pub name: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default = "default_path")]
    pub path: String,
    /// Unix seconds; `-1` marks a session cookie
    #[serde(default = "session_expiry")]
    pub expires: f64,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,
}

fn default_path() -> String {
    "/".to_string()
}

fn session_expiry() -> f64 {
    -1.0
}

impl StoredCookie {
    /// Session cookie for `domain` with path `/`
    pub fn new(name: impl Into<String>, value: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
            path: default_path(),
            expires: session_expiry(),
            http_only: false,
            secure: false,
            same_site: None,
        }
    }

    /// True when the cookie has no expiry
    pub fn is_session(&self) -> bool {
        self.expires < 0.0
    }
}

/// Read a cookie file; a missing file is an empty jar
pub fn load_cookies(path: &Path) -> Result<Vec<StoredCookie>, CookieError> {
    if !path.exists() {
        debug!("Cookie file {:?} does not exist, starting empty", path);
        return Ok(Vec::new());
    }

    let content = std::fs::read_to_string(path)?;
    let cookies: Vec<StoredCookie> = serde_json::from_str(&content)?;
    debug!("Loaded {} cookies from {:?}", cookies.len(), path);
    Ok(cookies)
}

/// Write the jar, replacing any previous content
pub fn save_cookies(path: &Path, cookies: &[StoredCookie]) -> Result<(), CookieError> {
    let json = serde_json::to_string_pretty(cookies)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, json)?;
    debug!("Saved {} cookies to {:?}", cookies.len(), path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let cookies = load_cookies(&dir.path().join("nope.json")).unwrap();
        assert!(cookies.is_empty());
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_cookies(&path), Err(CookieError::Parse(_))));
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("session.json");

        let mut auth = StoredCookie::new("auth", "abc123", ".example.com");
        auth.secure = true;
        auth.http_only = true;
        auth.expires = 1_900_000_000.0;
        auth.same_site = Some("Lax".to_string());
        let cookies = vec![auth, StoredCookie::new("theme", "dark", "example.com")];

        save_cookies(&path, &cookies).unwrap();
        let loaded = load_cookies(&path).unwrap();
        assert_eq!(loaded, cookies);
        assert!(!loaded[0].is_session());
        assert!(loaded[1].is_session());

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"httpOnly\": true"));
        assert!(raw.contains("\"sameSite\": \"Lax\""));
    }

    #[test]
    fn test_save_overwrites() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.json");
        save_cookies(&path, &[StoredCookie::new("a", "1", "x.com")]).unwrap();
        save_cookies(&path, &[]).unwrap();
        assert!(load_cookies(&path).unwrap().is_empty());
    }

    #[test]
    fn test_load_accepts_key_alias_and_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("exported.json");
        std::fs::write(
            &path,
            r#"[{"key": "sid", "value": "v", "domain": "example.com"}]"#,
        )
        .unwrap();

        let loaded = load_cookies(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "sid");
        assert_eq!(loaded[0].path, "/");
        assert!(loaded[0].is_session());
        assert!(loaded[0].same_site.is_none());
    }
}
