use crate::sql::Row;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// One prior exchange supplied by the caller. Read-only context; only the
/// most recent few entries are embedded in a prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationContext {
    pub question: String,
    pub answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_findings: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
}

/// Record of one tool call's SQL, purpose, and outcome. Exactly one of
/// `result`/`error` is set once execution finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryExecution {
    pub sql: String,
    pub purpose: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Vec<Row>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<usize>,
}

impl QueryExecution {
    pub fn succeeded(&self) -> bool {
        self.result.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartType {
    Bar,
    Pie,
    Line,
    None,
}

/// Maximum data points a chart may carry; larger payloads are clipped.
pub const MAX_CHART_POINTS: usize = 20;

/// Structured visualization hint extracted from the model's answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartSpec {
    #[serde(rename = "type")]
    pub chart_type: ChartType,
    pub data: Vec<Row>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_axis_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y_axis_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// The per-invocation record of a question, its executed queries, and its
/// final answer/chart. Created at the start of one invocation, mutated only
/// by the agent during it, returned immutably. Persistence is the caller's
/// responsibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPlan {
    pub id: String,
    pub question: String,
    pub final_answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_data: Option<ChartSpec>,
    pub database_type: String,
    pub total_execution_time_ms: u64,
    pub query_count: usize,
    pub queries: Vec<QueryExecution>,
}

impl QueryPlan {
    pub fn new(question: &str, database_type: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            question: question.to_string(),
            final_answer: String::new(),
            final_sql: None,
            chart_data: None,
            database_type: database_type.to_string(),
            total_execution_time_ms: 0,
            query_count: 0,
            queries: Vec::new(),
        }
    }

    /// Appends a finished execution, keeping query_count and the running
    /// total in sync.
    pub fn record(&mut self, execution: QueryExecution) {
        self.total_execution_time_ms += execution.execution_time_ms.unwrap_or(0);
        self.queries.push(execution);
        self.query_count = self.queries.len();
    }
}

/// Progress notification for UIs that want live updates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PlanStepEvent {
    PlanGenerated {
        plan_id: String,
        question: String,
    },
    StepStarted {
        plan_id: String,
        step_index: usize,
        sql: String,
        purpose: String,
    },
    StepCompleted {
        plan_id: String,
        step_index: usize,
        row_count: usize,
        execution_time_ms: u64,
    },
    StepError {
        plan_id: String,
        step_index: usize,
        error: String,
    },
    PlanCompleted {
        plan_id: String,
        query_count: usize,
    },
}

/// Optional progress channel. Sends are best-effort; a closed or absent
/// receiver never affects the invocation.
#[derive(Clone, Default)]
pub struct PlanEventSink {
    tx: Option<mpsc::Sender<PlanStepEvent>>,
}

impl PlanEventSink {
    pub fn new(tx: mpsc::Sender<PlanStepEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub async fn emit(&self, event: PlanStepEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event).await;
        }
    }
}
