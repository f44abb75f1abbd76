pub mod dialect;
pub mod repair;
pub mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::time::Duration;
use tracing::debug;

pub use dialect::SqlDialect;

/// One row of a query result, column name to value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Successful outcome of one physical SQL execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlResult {
    pub data: Vec<Row>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
}

#[derive(Debug)]
pub struct SqlExecError {
    pub message: String,
}

impl SqlExecError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl fmt::Display for SqlExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SQL execution error: {}", self.message)
    }
}

impl Error for SqlExecError {}

/// Contract for the external service that physically runs SQL. Bound to one
/// database connection by the caller before being handed to the orchestrator.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<SqlResult, SqlExecError>;
}

/// Adapter that proxies execution to the configured REST endpoint.
pub struct HttpSqlExecutor {
    client: reqwest::Client,
    api_url: String,
    database_id: i64,
}

#[derive(Serialize)]
struct ExecuteRequest<'a> {
    database_id: i64,
    sql: &'a str,
}

#[derive(Deserialize)]
struct ExecuteResponse {
    success: bool,
    #[serde(default)]
    data: Option<Vec<Row>>,
    #[serde(default)]
    row_count: Option<usize>,
    #[serde(default)]
    execution_time_ms: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

impl HttpSqlExecutor {
    pub fn new(api_url: String, database_id: i64) -> Result<Self, SqlExecError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| SqlExecError::new(e.to_string()))?;

        Ok(Self {
            client,
            api_url,
            database_id,
        })
    }
}

#[async_trait]
impl SqlExecutor for HttpSqlExecutor {
    async fn execute(&self, sql: &str) -> Result<SqlResult, SqlExecError> {
        debug!("Proxying SQL to {}: {}", self.api_url, sql);

        let response = self
            .client
            .post(&self.api_url)
            .json(&ExecuteRequest {
                database_id: self.database_id,
                sql,
            })
            .send()
            .await
            .map_err(|e| SqlExecError::new(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SqlExecError::new(format!(
                "executor responded with status code: {}",
                response.status()
            )));
        }

        let body: ExecuteResponse = response
            .json()
            .await
            .map_err(|e| SqlExecError::new(e.to_string()))?;

        if !body.success {
            return Err(SqlExecError::new(
                body.error.unwrap_or_else(|| "unknown executor failure".to_string()),
            ));
        }

        let data = body.data.unwrap_or_default();
        Ok(SqlResult {
            row_count: body.row_count.or(Some(data.len())),
            execution_time_ms: body.execution_time_ms,
            data,
        })
    }
}
