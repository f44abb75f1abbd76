use clap::Parser;
use config::{Config, ConfigError, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// Identifier of the connected database in the SQL execution service.
    pub database_id: i64,
    /// Dialect family name, e.g. "postgres", "mysql", "sqlserver".
    pub database_type: String,
    /// Database name, used as the default schema for MySQL-family dialects.
    pub database_name: String,
    /// Endpoint of the SQL execution proxy.
    pub executor_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    /// Endpoint of the semantic table-search service.
    pub api_url: String,
    /// Top-K tables to retrieve per question.
    pub limit: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    pub backend: String, // "remote" or "ollama"
    pub model: String,   // Model name
    pub api_key: Option<String>,
    pub api_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub search: SearchConfig,
    pub web: WebConfig,
    pub llm: LlmConfig,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,
}

impl AppConfig {
    pub fn new(args: &CliArgs) -> Result<Self, ConfigError> {
        // Start with default configuration
        let mut config_builder = Config::builder();

        // Add configuration from file if specified
        if let Some(config_path) = &args.config {
            config_builder = config_builder.add_source(File::from(config_path.as_path()));
        } else {
            // Check for config in default locations
            let default_locations = vec![
                "config.toml",
                "config/config.toml",
                "/etc/askdb/config.toml",
            ];

            for location in default_locations {
                if Path::new(location).exists() {
                    config_builder =
                        config_builder.add_source(File::new(location, config::FileFormat::Toml));
                    break;
                }
            }
        }

        // Build the config
        let mut config: AppConfig = config_builder.build()?.try_deserialize()?;

        // Override with command line args if provided
        if let Some(host) = &args.host {
            config.web.host = host.clone();
        }
        if let Some(port) = args.port {
            config.web.port = port;
        }

        Ok(config)
    }
}

// Default implementation
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                database_id: 1,
                database_type: "postgres".to_string(),
                database_name: "main".to_string(),
                executor_url: "http://127.0.0.1:8081/execute".to_string(),
            },
            search: SearchConfig {
                api_url: "http://127.0.0.1:8082/search".to_string(),
                limit: 5,
            },
            web: WebConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
            },
            llm: LlmConfig {
                backend: "remote".to_string(),
                model: "gpt-4o-mini".to_string(),
                api_key: None,
                api_url: None,
            },
        }
    }
}
