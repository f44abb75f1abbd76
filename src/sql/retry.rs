use crate::agent::plan::QueryExecution;
use crate::sql::repair::RepairRegistry;
use crate::sql::SqlExecutor;
use std::time::Instant;
use tracing::{debug, warn};

/// Attempts per tool call beyond the first: one repair retry plus one
/// transient-failure retry.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Statement-type allow-list applied before any SQL reaches the executor.
/// The prompt already instructs SELECT-only; this makes the trust model
/// explicit at the execution boundary.
pub fn ensure_read_only(sql: &str) -> Result<(), String> {
    let head = strip_leading_comments(sql);
    let first_word = head
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();

    match first_word.as_str() {
        "SELECT" | "WITH" => Ok(()),
        "" => Err("empty SQL statement".to_string()),
        other => Err(format!(
            "only SELECT statements are allowed, got '{}'",
            other
        )),
    }
}

fn strip_leading_comments(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    loop {
        if let Some(stripped) = rest.strip_prefix("--") {
            rest = match stripped.find('\n') {
                Some(idx) => stripped[idx + 1..].trim_start(),
                None => "",
            };
        } else if let Some(stripped) = rest.strip_prefix("/*") {
            rest = match stripped.find("*/") {
                Some(idx) => stripped[idx + 2..].trim_start(),
                None => "",
            };
        } else {
            return rest;
        }
    }
}

/// Executes one tool call with bounded retry-and-repair. Missing-table errors
/// are rewritten via the repair registry; any other error class retries the
/// same SQL, allowing for transient failures. Never panics and never returns
/// both a result and an error.
pub async fn execute_sql_with_retry(
    executor: &dyn SqlExecutor,
    sql: &str,
    purpose: &str,
    repairs: &RepairRegistry,
    max_retries: u32,
) -> QueryExecution {
    let mut current_sql = sql.to_string();
    let mut last_error = String::new();

    if let Err(reason) = ensure_read_only(&current_sql) {
        warn!("Rejected non-read-only statement: {}", reason);
        return QueryExecution {
            sql: current_sql,
            purpose: purpose.to_string(),
            result: None,
            error: Some(reason),
            execution_time_ms: None,
            row_count: None,
        };
    }

    for attempt in 0..=max_retries {
        let started = Instant::now();
        match executor.execute(&current_sql).await {
            Ok(result) => {
                let elapsed = result
                    .execution_time_ms
                    .unwrap_or_else(|| started.elapsed().as_millis() as u64);
                let row_count = result.data.len();
                debug!(
                    "SQL succeeded on attempt {} ({} rows, {}ms)",
                    attempt, row_count, elapsed
                );
                return QueryExecution {
                    sql: current_sql,
                    purpose: purpose.to_string(),
                    result: Some(result.data),
                    error: None,
                    execution_time_ms: Some(elapsed),
                    row_count: Some(row_count),
                };
            }
            Err(e) => {
                last_error = e.message;
                warn!(
                    "SQL failed on attempt {}/{}: {}",
                    attempt, max_retries, last_error
                );

                if attempt == max_retries {
                    break;
                }

                // A matched repair rewrites the statement for the next attempt;
                // otherwise the same SQL is retried as-is.
                if let Some(repaired) = repairs.try_repair(&last_error, &current_sql) {
                    current_sql = repaired;
                }
            }
        }
    }

    QueryExecution {
        sql: current_sql,
        purpose: purpose.to_string(),
        result: None,
        error: Some(last_error),
        execution_time_ms: None,
        row_count: None,
    }
}
