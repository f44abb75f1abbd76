use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// One candidate table returned by the semantic search service: its DDL-style
/// schema text and the similarity score that ranked it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMatch {
    pub schema: String,
    pub similarity: f64,
}

/// Envelope of a table-search call. `success = false` and an empty `data`
/// are treated identically by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaSearchResponse {
    pub success: bool,
    #[serde(default)]
    pub data: Option<Vec<TableMatch>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl SchemaSearchResponse {
    /// Usable schema context, or None when the orchestrator must
    /// short-circuit to the no-schema response.
    pub fn usable(&self) -> Option<&[TableMatch]> {
        if !self.success {
            return None;
        }
        match &self.data {
            Some(matches) if !matches.is_empty() => Some(matches),
            _ => None,
        }
    }
}

/// Contract for the external service that ranks relevant tables for a question.
#[async_trait]
pub trait SchemaSearch: Send + Sync {
    async fn search_similar_tables(
        &self,
        database_id: i64,
        question: &str,
        limit: usize,
    ) -> SchemaSearchResponse;
}

/// Adapter for the REST-hosted table search service. Transport failures are
/// folded into `success = false` so callers see one error shape.
pub struct HttpSchemaSearch {
    client: reqwest::Client,
    api_url: String,
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    database_id: i64,
    query: &'a str,
    limit: usize,
}

impl HttpSchemaSearch {
    pub fn new(api_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { client, api_url }
    }
}

#[async_trait]
impl SchemaSearch for HttpSchemaSearch {
    async fn search_similar_tables(
        &self,
        database_id: i64,
        question: &str,
        limit: usize,
    ) -> SchemaSearchResponse {
        debug!("Searching similar tables for question: {}", question);

        let response = self
            .client
            .post(&self.api_url)
            .json(&SearchRequest {
                database_id,
                query: question,
                limit,
            })
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                return SchemaSearchResponse {
                    success: false,
                    data: None,
                    error: Some(e.to_string()),
                }
            }
        };

        if !response.status().is_success() {
            return SchemaSearchResponse {
                success: false,
                data: None,
                error: Some(format!(
                    "search service responded with status code: {}",
                    response.status()
                )),
            };
        }

        match response.json::<SchemaSearchResponse>().await {
            Ok(body) => body,
            Err(e) => SchemaSearchResponse {
                success: false,
                data: None,
                error: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_and_empty_responses_are_unusable() {
        let failed = SchemaSearchResponse {
            success: false,
            data: Some(vec![TableMatch {
                schema: "CREATE TABLE t (id int)".to_string(),
                similarity: 0.9,
            }]),
            error: Some("down".to_string()),
        };
        assert!(failed.usable().is_none());

        let empty = SchemaSearchResponse {
            success: true,
            data: Some(vec![]),
            error: None,
        };
        assert!(empty.usable().is_none());

        let missing = SchemaSearchResponse {
            success: true,
            data: None,
            error: None,
        };
        assert!(missing.usable().is_none());
    }

    #[test]
    fn successful_response_exposes_matches() {
        let ok = SchemaSearchResponse {
            success: true,
            data: Some(vec![TableMatch {
                schema: "CREATE TABLE orders (id int)".to_string(),
                similarity: 0.8,
            }]),
            error: None,
        };
        assert_eq!(ok.usable().unwrap().len(), 1);
    }
}
