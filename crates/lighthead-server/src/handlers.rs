//! Endpoint handlers and the JSON envelope

use axum::{
    extract::{Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use base64::Engine as _;
use lighthead::{
    parse_bool, validate_format, validate_max_redirects, validate_url, BinaryResult, HtmlResult,
    OutputFormat, ScrapeError, ScrapeOptions, ScrapeRequest, ScrapeResult, SERVICE_NAME,
    VERSION,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use super::AppState;

/// Envelope for every JSON reply
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse {
    pub success: bool,
    pub status: String,
    pub output_length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_count: Option<usize>,
}

impl ApiResponse {
    fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            status: "error".to_string(),
            output_length: 0,
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Length as a browser would count it (UTF-16 units)
fn output_length(s: &str) -> usize {
    s.encode_utf16().count()
}

/// Request failures, each mapped to a status code
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Invalid or missing API key")]
    Unauthorized,

    #[error("{0}")]
    Internal(String),
}

impl From<ScrapeError> for ApiError {
    fn from(e: ScrapeError) -> Self {
        if e.is_validation() {
            ApiError::BadRequest(e.to_string())
        } else {
            ApiError::Internal(e.to_string())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ApiResponse::failure(self.to_string()))).into_response()
    }
}

/// Health check endpoint
pub async fn health() -> Json<ApiResponse> {
    Json(ApiResponse {
        success: true,
        status: "healthy".to_string(),
        output_length: 0,
        data: Some(json!({
            "service": SERVICE_NAME,
            "version": VERSION,
            "timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        })),
        ..Default::default()
    })
}

/// Query parameters for `/scrape`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeParams {
    pub url: Option<String>,
    pub format: Option<String>,
    pub follow_redirects: Option<String>,
    pub max_redirects: Option<String>,
    pub stealth: Option<String>,
}

impl ScrapeParams {
    /// Validate into a request and the requested representation
    fn into_request(self, verbose: bool) -> Result<(ScrapeRequest, OutputFormat), ScrapeError> {
        let url = self
            .url
            .filter(|u| !u.trim().is_empty())
            .ok_or(ScrapeError::MissingUrl)?;
        validate_url(&url)?;

        let format = validate_format(self.format.as_deref().unwrap_or("markdown"), true)?;
        let follow_redirects = parse_bool(
            self.follow_redirects.as_deref().unwrap_or("true"),
            "followRedirects",
        )?;
        let max_redirects =
            validate_max_redirects(self.max_redirects.as_deref().unwrap_or("10"), "maxRedirects")?;
        let stealth = parse_bool(self.stealth.as_deref().unwrap_or("true"), "stealth")?;

        let options = ScrapeOptions::default()
            .verbose(verbose)
            .follow_redirects(follow_redirects)
            .max_redirects(max_redirects)
            .stealth(stealth);
        Ok((ScrapeRequest::new(&url)?.with_options(options), format))
    }
}

/// Run one scrape
pub async fn scrape(
    State(state): State<AppState>,
    Query(params): Query<ScrapeParams>,
) -> Result<Response, ApiError> {
    let (request, format) = params.into_request(state.verbose)?;

    let result = state.scraper.scrape(&request).await.map_err(|e| {
        warn!("Scrape of {} failed: {}", request.url(), e);
        ApiError::from(e)
    })?;

    Ok(match result {
        ScrapeResult::Html(page) => Json(html_envelope(page, format)).into_response(),
        ScrapeResult::Binary(file) if format == OutputFormat::Binary => attachment(file),
        ScrapeResult::Binary(file) => Json(binary_envelope(file)).into_response(),
    })
}

fn html_envelope(page: HtmlResult, format: OutputFormat) -> ApiResponse {
    let redirect_count = page.redirect_chain.len();
    let (output, format) = match format {
        OutputFormat::Html => (page.html, OutputFormat::Html),
        OutputFormat::Text => (page.text, OutputFormat::Text),
        OutputFormat::Markdown | OutputFormat::Binary => (page.markdown, OutputFormat::Markdown),
    };

    ApiResponse {
        success: true,
        status: "completed".to_string(),
        output_length: output_length(&output),
        output: Some(output),
        format: Some(format.as_str().to_string()),
        final_url: Some(page.final_url),
        redirect_count: Some(redirect_count),
        ..Default::default()
    }
}

fn binary_envelope(file: BinaryResult) -> ApiResponse {
    let data = json!({
        "type": "binary",
        "filename": file.filename,
        "contentType": file.content_type,
        "size": file.buffer.len(),
        "url": file.url,
        "finalUrl": file.final_url,
        "redirectChain": file.redirect_chain,
        "response": file.response,
        "buffer": base64::engine::general_purpose::STANDARD.encode(&file.buffer),
    });

    ApiResponse {
        success: true,
        status: "completed".to_string(),
        output_length: file.buffer.len(),
        data: Some(data),
        format: Some(OutputFormat::Binary.as_str().to_string()),
        content_type: Some(file.content_type),
        final_url: Some(file.final_url),
        redirect_count: Some(file.redirect_chain.len()),
        ..Default::default()
    }
}

/// Raw payload as a file download
fn attachment(file: BinaryResult) -> Response {
    let content_type = HeaderValue::from_str(&file.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    let filename = file.filename.replace(['"', '\\', '\r', '\n'], "_");
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", filename))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));

    (
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        file.buffer,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> ScrapeParams {
        let mut p = ScrapeParams::default();
        for (k, v) in pairs {
            let v = Some(v.to_string());
            match *k {
                "url" => p.url = v,
                "format" => p.format = v,
                "followRedirects" => p.follow_redirects = v,
                "maxRedirects" => p.max_redirects = v,
                "stealth" => p.stealth = v,
                _ => {}
            }
        }
        p
    }

    #[test]
    fn test_param_defaults() {
        let (request, format) = params(&[("url", "https://example.com")])
            .into_request(false)
            .unwrap();
        assert_eq!(format, OutputFormat::Markdown);
        let options = request.options();
        assert!(options.follow_redirects);
        assert!(options.stealth);
        assert_eq!(options.max_redirects, 10);
        assert!(options.cookie_file.is_none());
    }

    #[test]
    fn test_param_errors() {
        let err = params(&[]).into_request(false).unwrap_err();
        assert_eq!(err.to_string(), "URL is required");

        let err = params(&[("url", "https://example.com"), ("stealth", "yes")])
            .into_request(false)
            .unwrap_err();
        assert_eq!(err.to_string(), "stealth must be 'true' or 'false'");

        let err = params(&[("url", "https://example.com"), ("maxRedirects", "abc")])
            .into_request(false)
            .unwrap_err();
        assert_eq!(err.to_string(), "maxRedirects must be a number between 0 and 100");
    }

    #[test]
    fn test_output_length_counts_utf16() {
        assert_eq!(output_length("abc"), 3);
        assert_eq!(output_length("é"), 1);
        assert_eq!(output_length("😀"), 2);
    }

    #[test]
    fn test_error_status_mapping() {
        let bad: ApiError = ScrapeError::InvalidUrl.into();
        assert_eq!(bad.into_response().status(), StatusCode::BAD_REQUEST);

        let internal: ApiError = ScrapeError::Launch("no chrome".to_string()).into();
        assert_eq!(
            internal.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );

        assert_eq!(
            ApiError::Unauthorized.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
    }
}
