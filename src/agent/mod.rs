pub mod chart;
pub mod fallback;
pub mod plan;
pub mod prompt;
pub mod refine;

use crate::llm::models::{ChatMessage, ToolDefinition, ToolUse};
use crate::llm::ChatModel;
use crate::schema::SchemaSearch;
use crate::sql::repair::RepairRegistry;
use crate::sql::retry::execute_sql_with_retry;
use crate::sql::SqlExecutor;
use futures_util::future::join_all;
use plan::{PlanEventSink, PlanStepEvent, QueryExecution, QueryPlan};
use prompt::PromptBuilder;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Hard cap on model turns per invocation. Bounds latency and cost against a
/// looping model.
pub const MAX_ITERATIONS: usize = 5;

/// Rows of a tool result embedded back into the conversation. The full result
/// stays on the QueryExecution.
const TOOL_RESULT_ROW_LIMIT: usize = 50;

const NO_SCHEMA_ANSWER: &str = "# No Database Schema Available\n\nNo relevant tables were found \
for this question. Make sure the database schema has been indexed, then try again.";

/// Per-database settings handed to the agent at construction.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub database_id: i64,
    pub database_type: String,
    pub database_name: String,
    /// Top-K tables requested from the schema search service.
    pub search_limit: usize,
    /// Retry budget per tool call beyond the first attempt.
    pub max_sql_retries: u32,
}

/// What one invocation returns: the user-facing markdown (chartdata block
/// already stripped) and the full plan for observability.
#[derive(Debug, Clone)]
pub struct AgentResponse {
    pub answer: String,
    pub plan: QueryPlan,
}

/// The model's side of the execute_sql contract, validated on receipt.
/// Additional tool kinds extend this enum; dispatch stays exhaustive.
#[derive(Debug)]
enum AgentTool {
    ExecuteSql(ExecuteSqlArgs),
}

#[derive(Debug, Clone, Deserialize)]
struct ExecuteSqlArgs {
    sql: String,
    #[serde(default)]
    purpose: String,
}

fn validate_tool_call(call: &ToolUse) -> Result<AgentTool, String> {
    match call.name.as_str() {
        "execute_sql" => serde_json::from_value::<ExecuteSqlArgs>(call.arguments.clone())
            .map(AgentTool::ExecuteSql)
            .map_err(|e| format!("invalid execute_sql arguments: {}", e)),
        other => Err(format!("unknown tool '{}'", other)),
    }
}

fn execute_sql_tool() -> ToolDefinition {
    ToolDefinition {
        name: "execute_sql".to_string(),
        description: "Execute one read-only SQL query against the connected database and return \
                      its rows."
            .to_string(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "sql": {
                    "type": "string",
                    "description": "The SELECT statement to run, schema-qualified and row-limited"
                },
                "purpose": {
                    "type": "string",
                    "description": "Short description of what this query is for"
                }
            },
            "required": ["sql", "purpose"]
        }),
    }
}

/// The query orchestration agent: turns a question plus retrieved schema
/// context into a bounded sequence of SQL tool invocations and a final
/// markdown answer with an optional chart.
pub struct QueryAgent {
    model: Arc<dyn ChatModel>,
    search: Arc<dyn SchemaSearch>,
    executor: Arc<dyn SqlExecutor>,
    settings: AgentSettings,
    events: PlanEventSink,
    cancel: CancellationToken,
}

impl QueryAgent {
    pub fn new(
        model: Arc<dyn ChatModel>,
        search: Arc<dyn SchemaSearch>,
        executor: Arc<dyn SqlExecutor>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            model,
            search,
            executor,
            settings,
            events: PlanEventSink::disabled(),
            cancel: CancellationToken::new(),
        }
    }

    /// Attaches a progress channel for UIs that want live step updates.
    pub fn with_events(mut self, events: PlanEventSink) -> Self {
        self.events = events;
        self
    }

    /// Attaches an external cancellation token; checked each iteration and
    /// raced against every model call.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Answers one question. Never panics and never propagates an error past
    /// this boundary: failures produce an error markdown block plus whatever
    /// partial plan was accumulated.
    pub async fn answer_question(
        &self,
        question: &str,
        history: &[plan::ConversationContext],
    ) -> AgentResponse {
        let mut plan = QueryPlan::new(question, &self.settings.database_type);
        info!("Answering question (plan {}): {}", plan.id, question);

        self.events
            .emit(PlanStepEvent::PlanGenerated {
                plan_id: plan.id.clone(),
                question: question.to_string(),
            })
            .await;

        let answer = match self.run_loop(question, history, &mut plan).await {
            Ok(answer) => answer,
            Err(e) => {
                error!("Question answering failed: {}", e);
                format!(
                    "## Something went wrong\n\nThe question could not be answered: {}\n\n\
                     Partial results, if any, are attached to the plan.",
                    e
                )
            }
        };

        plan.final_answer = answer.clone();
        plan.final_sql = plan.queries.last().map(|q| q.sql.clone());

        self.events
            .emit(PlanStepEvent::PlanCompleted {
                plan_id: plan.id.clone(),
                query_count: plan.query_count,
            })
            .await;

        AgentResponse { answer, plan }
    }

    async fn run_loop(
        &self,
        question: &str,
        history: &[plan::ConversationContext],
        plan: &mut QueryPlan,
    ) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
        // Schema retrieval; no usable schema short-circuits without a model call.
        let search_response = self
            .search
            .search_similar_tables(self.settings.database_id, question, self.settings.search_limit)
            .await;

        let Some(tables) = search_response.usable() else {
            if let Some(e) = &search_response.error {
                warn!("Schema search unavailable: {}", e);
            }
            return Ok(NO_SCHEMA_ANSWER.to_string());
        };

        let builder = PromptBuilder::new(&self.settings.database_type, &self.settings.database_name);
        let system = builder.system_instruction(tables);
        let mut messages = builder.build_messages(history, question);
        let tools = [execute_sql_tool()];
        let repairs = RepairRegistry::for_dialect(builder.dialect(), &self.settings.database_name);

        let mut final_text = String::new();

        for iteration in 0..MAX_ITERATIONS {
            if self.cancel.is_cancelled() {
                return Err("cancelled".into());
            }

            let turn = tokio::select! {
                result = self.model.chat(&system, &messages, &tools) => result?,
                _ = self.cancel.cancelled() => return Err("cancelled".into()),
            };

            if !turn.has_tool_calls() {
                info!("Model finished after {} iterations", iteration + 1);
                final_text = turn.text;
                break;
            }

            info!(
                "Iteration {}: model requested {} tool calls",
                iteration + 1,
                turn.tool_calls.len()
            );
            messages.push(ChatMessage::assistant_tool_calls(
                turn.text.clone(),
                turn.tool_calls.clone(),
            ));

            self.execute_tool_batch(&turn.tool_calls, &repairs, plan, &mut messages)
                .await;
        }

        // Cap reached with tool calls still pending, or the model went silent:
        // synthesize an answer from what was executed.
        if final_text.trim().is_empty() {
            if plan.queries.is_empty() {
                return Err("model produced neither an answer nor tool calls".into());
            }
            warn!("Agent loop exited without final text; synthesizing answer");
            if plan.queries.iter().any(|q| q.succeeded()) {
                if let Some(text) =
                    fallback::synthesize_answer(self.model.as_ref(), question, &plan.queries).await
                {
                    final_text = text;
                }
            }
            if final_text.trim().is_empty() {
                final_text = fallback::render_deterministic_answer(question, &plan.queries);
            }
        }

        let extracted = chart::extract_chart_data(&final_text);
        plan.chart_data = extracted.chart;
        Ok(extracted.answer)
    }

    /// Executes every tool call of one model turn concurrently, then appends
    /// the result messages and plan entries in the original call order.
    async fn execute_tool_batch(
        &self,
        calls: &[ToolUse],
        repairs: &RepairRegistry,
        plan: &mut QueryPlan,
        messages: &mut Vec<ChatMessage>,
    ) {
        // Validate up front; invalid calls get a failure payload without
        // reaching the executor.
        let validated: Vec<(&ToolUse, Result<AgentTool, String>)> =
            calls.iter().map(|call| (call, validate_tool_call(call))).collect();

        let mut pending = 0;
        for (_, outcome) in &validated {
            if let Ok(AgentTool::ExecuteSql(args)) = outcome {
                self.events
                    .emit(PlanStepEvent::StepStarted {
                        plan_id: plan.id.clone(),
                        step_index: plan.queries.len() + pending,
                        sql: args.sql.clone(),
                        purpose: args.purpose.clone(),
                    })
                    .await;
                pending += 1;
            }
        }

        let executions = join_all(validated.iter().map(|(_, outcome)| async move {
            match outcome {
                Ok(AgentTool::ExecuteSql(args)) => Some(
                    execute_sql_with_retry(
                        self.executor.as_ref(),
                        &args.sql,
                        &args.purpose,
                        repairs,
                        self.settings.max_sql_retries,
                    )
                    .await,
                ),
                Err(_) => None,
            }
        }))
        .await;

        for ((call, outcome), execution) in validated.into_iter().zip(executions) {
            match (outcome, execution) {
                (Ok(AgentTool::ExecuteSql(_)), Some(execution)) => {
                    let step_index = plan.queries.len();
                    messages.push(ChatMessage::tool_result(
                        call.id.clone(),
                        tool_result_payload(&execution),
                    ));

                    match &execution.error {
                        None => {
                            self.events
                                .emit(PlanStepEvent::StepCompleted {
                                    plan_id: plan.id.clone(),
                                    step_index,
                                    row_count: execution.row_count.unwrap_or(0),
                                    execution_time_ms: execution.execution_time_ms.unwrap_or(0),
                                })
                                .await;
                        }
                        Some(error) => {
                            self.events
                                .emit(PlanStepEvent::StepError {
                                    plan_id: plan.id.clone(),
                                    step_index,
                                    error: error.clone(),
                                })
                                .await;
                        }
                    }

                    plan.record(execution);
                }
                (Err(reason), _) => {
                    warn!("Rejected tool call '{}': {}", call.name, reason);
                    let payload = serde_json::json!({
                        "error": reason,
                        "suggestion": "Call execute_sql with a sql string and a purpose string.",
                    });
                    messages.push(ChatMessage::tool_result(call.id.clone(), payload.to_string()));
                }
                (Ok(_), None) => unreachable!("valid calls always produce an execution"),
            }
        }
    }
}

/// The payload sent back to the model for one finished tool call.
fn tool_result_payload(execution: &QueryExecution) -> String {
    match (&execution.result, &execution.error) {
        (Some(rows), _) => {
            let sample: Vec<_> = rows.iter().take(TOOL_RESULT_ROW_LIMIT).collect();
            serde_json::json!({
                "data": sample,
                "rowCount": execution.row_count.unwrap_or(rows.len()),
                "executionTime": execution.execution_time_ms.unwrap_or(0),
            })
            .to_string()
        }
        (None, Some(error)) => serde_json::json!({
            "error": error,
            "suggestion": "The query failed; try a different approach or different tables.",
        })
        .to_string(),
        _ => serde_json::json!({
            "error": "query produced no outcome",
            "suggestion": "Try a different approach.",
        })
        .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::plan::{ChartType, ConversationContext};
    use crate::llm::models::ModelTurn;
    use crate::llm::LlmError;
    use crate::schema::{SchemaSearchResponse, TableMatch};
    use crate::sql::{Row, SqlExecError, SqlResult};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct ScriptedModel {
        turns: Mutex<Vec<Result<ModelTurn, LlmError>>>,
        calls: Mutex<usize>,
    }

    impl ScriptedModel {
        fn new(turns: Vec<Result<ModelTurn, LlmError>>) -> Arc<Self> {
            Arc::new(Self {
                turns: Mutex::new(turns),
                calls: Mutex::new(0),
            })
        }

        fn call_count(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn chat(
            &self,
            _system: &str,
            _messages: &[ChatMessage],
            _tools: &[ToolDefinition],
        ) -> Result<ModelTurn, LlmError> {
            *self.calls.lock().unwrap() += 1;
            let mut turns = self.turns.lock().unwrap();
            if turns.is_empty() {
                return Err(LlmError::ResponseError("script exhausted".to_string()));
            }
            turns.remove(0)
        }
    }

    struct StaticSearch {
        response: SchemaSearchResponse,
    }

    #[async_trait]
    impl SchemaSearch for StaticSearch {
        async fn search_similar_tables(
            &self,
            _database_id: i64,
            _question: &str,
            _limit: usize,
        ) -> SchemaSearchResponse {
            self.response.clone()
        }
    }

    struct CountingExecutor {
        rows_per_query: usize,
        seen: Mutex<Vec<String>>,
    }

    impl CountingExecutor {
        fn new(rows_per_query: usize) -> Arc<Self> {
            Arc::new(Self {
                rows_per_query,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SqlExecutor for CountingExecutor {
        async fn execute(&self, sql: &str) -> Result<SqlResult, SqlExecError> {
            self.seen.lock().unwrap().push(sql.to_string());
            let data: Vec<Row> = (0..self.rows_per_query)
                .map(|i| {
                    let mut row = Row::new();
                    row.insert("label".to_string(), serde_json::json!(format!("item{}", i)));
                    row.insert("value".to_string(), serde_json::json!(i * 10));
                    row
                })
                .collect();
            Ok(SqlResult {
                row_count: Some(data.len()),
                execution_time_ms: Some(2),
                data,
            })
        }
    }

    fn ok_search() -> Arc<StaticSearch> {
        Arc::new(StaticSearch {
            response: SchemaSearchResponse {
                success: true,
                data: Some(vec![TableMatch {
                    schema: "CREATE TABLE public.orders (id int, total numeric)".to_string(),
                    similarity: 0.92,
                }]),
                error: None,
            },
        })
    }

    fn failed_search() -> Arc<StaticSearch> {
        Arc::new(StaticSearch {
            response: SchemaSearchResponse {
                success: false,
                data: None,
                error: Some("service unavailable".to_string()),
            },
        })
    }

    fn settings() -> AgentSettings {
        AgentSettings {
            database_id: 1,
            database_type: "postgres".to_string(),
            database_name: "main".to_string(),
            search_limit: 5,
            max_sql_retries: 2,
        }
    }

    fn tool_turn(calls: &[(&str, &str)]) -> Result<ModelTurn, LlmError> {
        Ok(ModelTurn {
            text: String::new(),
            tool_calls: calls
                .iter()
                .enumerate()
                .map(|(i, (sql, purpose))| ToolUse {
                    id: format!("call_{}", i),
                    name: "execute_sql".to_string(),
                    arguments: serde_json::json!({ "sql": sql, "purpose": purpose }),
                })
                .collect(),
        })
    }

    fn text_turn(text: &str) -> Result<ModelTurn, LlmError> {
        Ok(ModelTurn {
            text: text.to_string(),
            tool_calls: Vec::new(),
        })
    }

    const NO_HISTORY: &[ConversationContext] = &[];

    #[tokio::test]
    async fn single_query_ranking_question_yields_bar_chart() {
        let model = ScriptedModel::new(vec![
            tool_turn(&[("SELECT * FROM public.orders LIMIT 5", "top orders")]),
            text_turn(
                "The top orders are shown below.\n\n```chartdata\n{\"type\": \"bar\", \"data\": \
                 [{\"label\": \"a\", \"value\": 1}], \"xAxisKey\": \"label\", \"yAxisKey\": \
                 \"value\"}\n```",
            ),
        ]);
        let executor = CountingExecutor::new(5);
        let agent = QueryAgent::new(model.clone(), ok_search(), executor.clone(), settings());

        let response = agent
            .answer_question("What are the top 5 orders?", NO_HISTORY)
            .await;

        assert_eq!(response.plan.query_count, 1);
        assert_eq!(
            response.plan.final_sql.as_deref(),
            Some("SELECT * FROM public.orders LIMIT 5")
        );
        let chart = response.plan.chart_data.as_ref().unwrap();
        assert_eq!(chart.chart_type, ChartType::Bar);
        assert!(!response.answer.contains("chartdata"));
        assert!(response.answer.contains("top orders are shown"));
    }

    #[tokio::test]
    async fn failed_schema_search_short_circuits_without_model_calls() {
        let model = ScriptedModel::new(vec![]);
        let executor = CountingExecutor::new(1);
        let agent = QueryAgent::new(model.clone(), failed_search(), executor.clone(), settings());

        let response = agent.answer_question("anything", NO_HISTORY).await;

        assert!(response.answer.starts_with("# No Database Schema Available"));
        assert_eq!(response.plan.query_count, 0);
        assert_eq!(model.call_count(), 0);
        assert!(executor.seen().is_empty());
    }

    #[tokio::test]
    async fn batch_of_three_calls_recorded_contiguously_before_next_turn() {
        let model = ScriptedModel::new(vec![
            tool_turn(&[
                ("SELECT 1 FROM public.a", "first"),
                ("SELECT 2 FROM public.b", "second"),
                ("SELECT 3 FROM public.c", "third"),
            ]),
            text_turn("All three lookups done."),
        ]);
        let executor = CountingExecutor::new(2);
        let agent = QueryAgent::new(model.clone(), ok_search(), executor.clone(), settings());

        let response = agent.answer_question("three lookups", NO_HISTORY).await;

        assert_eq!(model.call_count(), 2);
        assert_eq!(response.plan.query_count, 3);
        let sqls: Vec<&str> = response.plan.queries.iter().map(|q| q.sql.as_str()).collect();
        assert_eq!(
            sqls,
            vec![
                "SELECT 1 FROM public.a",
                "SELECT 2 FROM public.b",
                "SELECT 3 FROM public.c"
            ]
        );
        assert_eq!(executor.seen().len(), 3);
    }

    #[tokio::test]
    async fn iteration_cap_triggers_synthesis_fallback() {
        // Five tool-call turns exhaust the loop; the sixth scripted turn
        // serves the secondary synthesis call.
        let mut turns: Vec<Result<ModelTurn, LlmError>> = (0..5)
            .map(|i| {
                let sql = format!("SELECT {} FROM public.t", i);
                tool_turn(&[(sql.as_str(), "probe")])
            })
            .collect();
        turns.push(text_turn("Synthesized summary of the five probes."));

        let model = ScriptedModel::new(turns);
        let executor = CountingExecutor::new(1);
        let agent = QueryAgent::new(model.clone(), ok_search(), executor.clone(), settings());

        let response = agent.answer_question("keep digging", NO_HISTORY).await;

        assert_eq!(model.call_count(), MAX_ITERATIONS + 1);
        assert_eq!(response.plan.query_count, MAX_ITERATIONS);
        assert_eq!(response.answer, "Synthesized summary of the five probes.");
    }

    #[tokio::test]
    async fn cap_with_failed_synthesis_renders_deterministic_answer() {
        let turns: Vec<Result<ModelTurn, LlmError>> = (0..5)
            .map(|i| {
                let sql = format!("SELECT {} FROM public.t", i);
                tool_turn(&[(sql.as_str(), "probe")])
            })
            .collect();
        // Script ends here: the synthesis call errors out.
        let model = ScriptedModel::new(turns);
        let executor = CountingExecutor::new(1);
        let agent = QueryAgent::new(model.clone(), ok_search(), executor.clone(), settings());

        let response = agent.answer_question("keep digging", NO_HISTORY).await;

        assert!(!response.answer.is_empty());
        assert!(response.answer.contains("## Results for"));
        assert!(response.plan.chart_data.is_none());
    }

    #[tokio::test]
    async fn model_error_returns_error_markdown_and_partial_plan() {
        let model = ScriptedModel::new(vec![Err(LlmError::ConnectionError(
            "connection refused".to_string(),
        ))]);
        let executor = CountingExecutor::new(1);
        let agent = QueryAgent::new(model.clone(), ok_search(), executor.clone(), settings());

        let response = agent.answer_question("anything", NO_HISTORY).await;

        assert!(response.answer.contains("## Something went wrong"));
        assert!(response.answer.contains("connection refused"));
        assert_eq!(response.plan.query_count, 0);
    }

    #[tokio::test]
    async fn invalid_tool_call_is_rejected_without_execution() {
        let bad_call = ModelTurn {
            text: String::new(),
            tool_calls: vec![ToolUse {
                id: "call_0".to_string(),
                name: "drop_database".to_string(),
                arguments: serde_json::json!({}),
            }],
        };
        let model = ScriptedModel::new(vec![Ok(bad_call), text_turn("Recovered.")]);
        let executor = CountingExecutor::new(1);
        let agent = QueryAgent::new(model.clone(), ok_search(), executor.clone(), settings());

        let response = agent.answer_question("anything", NO_HISTORY).await;

        assert_eq!(response.plan.query_count, 0);
        assert!(executor.seen().is_empty());
        assert_eq!(response.answer, "Recovered.");
    }

    #[tokio::test]
    async fn emits_one_plan_generated_and_one_plan_completed() {
        let (tx, mut rx) = mpsc::channel(64);
        let model = ScriptedModel::new(vec![
            tool_turn(&[("SELECT 1 FROM public.t", "probe")]),
            text_turn("Done."),
        ]);
        let executor = CountingExecutor::new(1);
        let agent = QueryAgent::new(model, ok_search(), executor, settings())
            .with_events(PlanEventSink::new(tx));

        agent.answer_question("anything", NO_HISTORY).await;

        let mut generated = 0;
        let mut completed = 0;
        let mut started = 0;
        let mut step_completed = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                PlanStepEvent::PlanGenerated { .. } => generated += 1,
                PlanStepEvent::PlanCompleted { .. } => completed += 1,
                PlanStepEvent::StepStarted { .. } => started += 1,
                PlanStepEvent::StepCompleted { .. } => step_completed += 1,
                PlanStepEvent::StepError { .. } => {}
            }
        }
        assert_eq!(generated, 1);
        assert_eq!(completed, 1);
        assert_eq!(started, 1);
        assert_eq!(step_completed, 1);
    }

    #[tokio::test]
    async fn cancellation_aborts_with_error_markdown() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let model = ScriptedModel::new(vec![text_turn("should not be reached")]);
        let executor = CountingExecutor::new(1);
        let agent = QueryAgent::new(model.clone(), ok_search(), executor, settings())
            .with_cancellation(cancel);

        let response = agent.answer_question("anything", NO_HISTORY).await;

        assert!(response.answer.contains("cancelled"));
        assert_eq!(model.call_count(), 0);
    }
}
