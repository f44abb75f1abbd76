use crate::agent::{AgentSettings, QueryAgent};
use crate::config::AppConfig;
use crate::llm::LlmManager;
use crate::schema::HttpSchemaSearch;
use crate::sql::retry::DEFAULT_MAX_RETRIES;
use crate::sql::HttpSqlExecutor;
use std::sync::Arc;

/// Shared application state for the web server
pub struct AppState {
    pub config: AppConfig,
    pub agent: QueryAgent,
    pub startup_time: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let llm_manager = LlmManager::new(&config.llm)?;
        let search = HttpSchemaSearch::new(config.search.api_url.clone());
        let executor = HttpSqlExecutor::new(
            config.database.executor_url.clone(),
            config.database.database_id,
        )?;

        let settings = AgentSettings {
            database_id: config.database.database_id,
            database_type: config.database.database_type.clone(),
            database_name: config.database.database_name.clone(),
            search_limit: config.search.limit,
            max_sql_retries: DEFAULT_MAX_RETRIES,
        };

        let agent = QueryAgent::new(
            Arc::new(llm_manager),
            Arc::new(search),
            Arc::new(executor),
            settings,
        );

        Ok(Self {
            config,
            agent,
            startup_time: chrono::Utc::now(),
        })
    }
}
