//! Server settings from flags and environment

use clap::Parser;

/// Lighthead API server
#[derive(Parser, Debug, Clone)]
#[command(name = "lighthead-server")]
#[command(version, about, long_about = None)]
pub struct ServerConfig {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 3005)]
    pub port: u16,

    /// Address to bind
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Shared secret required on /scrape (x-api-key header or apiKey query)
    #[arg(long, env = "API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Trace every scrape phase
    #[arg(short, long, env = "VERBOSE")]
    pub verbose: bool,
}

impl ServerConfig {
    /// Configured key, ignoring an empty value
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|k| !k.is_empty())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
