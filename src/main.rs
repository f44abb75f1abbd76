use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

use askdb::config::{AppConfig, CliArgs};
use askdb::util::logging::init_tracing;
use askdb::web::{self, state::AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    init_tracing();

    // Parse command line arguments
    let args = CliArgs::parse();

    // Load configuration
    let config = match AppConfig::new(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    info!(
        "Initializing query agent for {} database {} (LLM backend: {})",
        config.database.database_type, config.database.database_name, config.llm.backend
    );
    let app_state = Arc::new(AppState::new(config.clone())?);

    // Start the web server
    info!("Starting askdb server on {}:{}", config.web.host, config.web.port);
    match web::run_server(config.web, app_state).await {
        Ok(_) => info!("Server stopped gracefully"),
        Err(e) => {
            error!("Server error: {}", e);
            return Err(Box::new(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())) as Box<dyn std::error::Error + Send + Sync>);
        }
    }

    Ok(())
}
