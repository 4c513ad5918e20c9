//! HTTP API for lighthead
//!
//! Routes:
//! - `GET /health` - liveness, never authenticated
//! - `GET /scrape?url=&format=&followRedirects=&maxRedirects=&stealth=` - run one scrape
//!
//! When an API key is configured, `/scrape` requires it in the `x-api-key`
//! header or the `apiKey` query parameter.

pub mod config;
mod handlers;
mod middleware;
mod routes;

pub use config::ServerConfig;
pub use handlers::ApiResponse;
pub use routes::create_router;

use lighthead::Scraper;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Shared state for the web server
#[derive(Clone, Debug)]
pub struct AppState {
    pub scraper: Scraper,
    pub api_key: Option<Arc<str>>,
    /// Trace scrape phases at INFO
    pub verbose: bool,
}

impl AppState {
    pub fn new(scraper: Scraper, api_key: Option<&str>, verbose: bool) -> Self {
        Self {
            scraper,
            api_key: api_key.filter(|k| !k.is_empty()).map(Arc::from),
            verbose,
        }
    }
}

/// Bind and serve until Ctrl-C
pub async fn serve(config: &ServerConfig, scraper: Scraper) -> std::io::Result<()> {
    let state = AppState::new(scraper, config.api_key(), config.verbose);
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_address()).await?;
    info!("Lighthead API server running on {}", listener.local_addr()?);
    if config.api_key().is_some() {
        info!("API key authentication is enabled");
    } else {
        info!("API key authentication is disabled");
    }
    if config.verbose {
        info!("Verbose mode enabled for debugging");
    }

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutting down");
    })
    .await
}
