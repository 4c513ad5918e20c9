//! Lighthead API server

use clap::Parser;
use lighthead::{ChromiumEngine, EngineConfig, Scraper};
use lighthead_server::{serve, ServerConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Values from .env never override the real environment
    let _ = dotenvy::dotenv();
    let config = ServerConfig::parse();

    let default = if config.verbose {
        "lighthead=info,lighthead_server=info"
    } else {
        "lighthead=warn,lighthead_server=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let engine_config = EngineConfig::default().with_env_overrides();
    let scraper = Scraper::new(ChromiumEngine::new(engine_config.clone()), engine_config);

    if let Err(e) = serve(&config, scraper).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
