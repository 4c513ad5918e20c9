//! Request middleware: API key gate and access log

use axum::{
    body::HttpBody,
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::info;

use super::handlers::ApiError;
use super::AppState;

/// Header carrying the API key
pub const API_KEY_HEADER: &str = "x-api-key";

/// Query parameter carrying the API key
pub const API_KEY_PARAM: &str = "apiKey";

/// Reject requests without the configured key; no-op when none is set
pub async fn require_api_key(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(req).await;
    };

    let from_header = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let provided = from_header.or_else(|| {
        req.uri().query().and_then(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .find(|(k, _)| k == API_KEY_PARAM)
                .map(|(_, v)| v.into_owned())
        })
    });

    match provided {
        Some(key) if key == expected => next.run(req).await,
        _ => ApiError::Unauthorized.into_response(),
    }
}

/// One nginx combined-style line per request
pub async fn access_log(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();
    let client = client_ip(&req);
    let referer = header_or_dash(req.headers(), header::REFERER.as_str());
    let user_agent = header_or_dash(req.headers(), header::USER_AGENT.as_str());

    let response = next.run(req).await;

    let bytes = response.body().size_hint().exact().unwrap_or(0);
    info!(
        target: "lighthead_server::access",
        "{} - - [{}] \"{} {} HTTP/1.1\" {} {} \"{}\" \"{}\" {}ms",
        client,
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
        method,
        uri,
        response.status().as_u16(),
        bytes,
        referer,
        user_agent,
        start.elapsed().as_millis()
    );
    response
}

fn client_ip(req: &Request) -> String {
    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return forwarded.to_string();
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn header_or_dash(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let req = Request::builder()
            .uri("/health")
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_ip(&req), "203.0.113.7");
    }

    #[test]
    fn test_client_ip_unknown() {
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        assert_eq!(client_ip(&req), "-");
    }

    #[test]
    fn test_header_or_dash() {
        let mut headers = HeaderMap::new();
        assert_eq!(header_or_dash(&headers, "referer"), "-");
        headers.insert("referer", "https://example.com/".parse().unwrap());
        assert_eq!(header_or_dash(&headers, "referer"), "https://example.com/");
    }
}
