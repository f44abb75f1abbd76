//! Alternate, coarser-grained planning strategy: instead of iterative tool
//! calling, the model emits a full ordered step list up front and a scheduler
//! executes it, giving the model bounded opportunities to refine the not-yet
//! executed remainder based on intermediate results.

use crate::agent::fallback;
use crate::agent::plan::{QueryExecution, QueryPlan};
use crate::agent::prompt::PromptBuilder;
use crate::agent::AgentResponse;
use crate::llm::models::ChatMessage;
use crate::llm::ChatModel;
use crate::sql::repair::RepairRegistry;
use crate::sql::retry::execute_sql_with_retry;
use crate::sql::SqlExecutor;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Refinement runs after every second executed step, not after every step,
/// to bound the number of extra model calls.
pub const REFINE_EVERY_N_STEPS: usize = 2;

/// A step result this large is treated as unexpected and triggers an
/// immediate refinement, as does an empty result.
pub const UNEXPECTED_ROWS_THRESHOLD: usize = 100;

/// Upper bound on executed steps per invocation; refinements cannot grow a
/// plan past this.
pub const MAX_PLAN_STEPS: usize = 10;

/// One planned query in the dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
    pub id: String,
    pub purpose: String,
    pub sql: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub removed: bool,
}

/// Mutations a refinement call may apply to the pending remainder of a plan.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRefinement {
    #[serde(default)]
    pub add: Vec<PlanStep>,
    #[serde(default)]
    pub modify: Vec<StepModification>,
    #[serde(default)]
    pub remove: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct StepModification {
    pub id: String,
    pub sql: String,
}

/// Executes steps in dependency order and applies refinements to the pending
/// remainder. Executed steps are never mutated.
pub struct StepScheduler {
    steps: Vec<PlanStep>,
    executed: HashSet<String>,
}

impl StepScheduler {
    pub fn new(steps: Vec<PlanStep>) -> Self {
        Self {
            steps,
            executed: HashSet::new(),
        }
    }

    /// The first step that is not removed, not executed, and whose
    /// dependencies have all executed.
    pub fn next_eligible(&self) -> Option<PlanStep> {
        self.steps
            .iter()
            .find(|step| {
                !step.removed
                    && !self.executed.contains(&step.id)
                    && step.depends_on.iter().all(|dep| self.executed.contains(dep))
            })
            .cloned()
    }

    pub fn mark_executed(&mut self, id: &str) {
        self.executed.insert(id.to_string());
    }

    pub fn executed_count(&self) -> usize {
        self.executed.len()
    }

    pub fn pending(&self) -> Vec<&PlanStep> {
        self.steps
            .iter()
            .filter(|step| !step.removed && !self.executed.contains(&step.id))
            .collect()
    }

    pub fn is_done(&self) -> bool {
        self.next_eligible().is_none()
    }

    /// Applies a refinement to the pending remainder. Removing a step strips
    /// its id from every other step's dependency list so no pending step is
    /// left waiting on something that can never execute.
    pub fn apply_refinement(&mut self, refinement: PlanRefinement) {
        for modification in refinement.modify {
            if self.executed.contains(&modification.id) {
                warn!("Ignoring refinement of already-executed step {}", modification.id);
                continue;
            }
            if let Some(step) = self.steps.iter_mut().find(|s| s.id == modification.id) {
                debug!("Refinement rewrote SQL of step {}", step.id);
                step.sql = modification.sql;
            }
        }

        for id in refinement.remove {
            if self.executed.contains(&id) {
                warn!("Ignoring removal of already-executed step {}", id);
                continue;
            }
            for step in self.steps.iter_mut() {
                if step.id == id {
                    step.removed = true;
                }
                step.depends_on.retain(|dep| dep != &id);
            }
        }

        for step in refinement.add {
            if self.steps.iter().any(|s| s.id == step.id) {
                warn!("Ignoring added step with duplicate id {}", step.id);
                continue;
            }
            self.steps.push(step);
        }
    }
}

/// Whether a refinement call is due after the step that just executed.
pub fn should_refine(executed_count: usize, last_row_count: usize) -> bool {
    if last_row_count == 0 || last_row_count > UNEXPECTED_ROWS_THRESHOLD {
        return true;
    }
    executed_count % REFINE_EVERY_N_STEPS == 0
}

/// The single-shot planning strategy. Shares the prompt builder and the SQL
/// adapter with the tool-calling agent but drives execution from a
/// model-emitted dependency graph.
pub struct RefiningPlanner {
    model: Arc<dyn ChatModel>,
    executor: Arc<dyn SqlExecutor>,
    max_sql_retries: u32,
}

impl RefiningPlanner {
    pub fn new(model: Arc<dyn ChatModel>, executor: Arc<dyn SqlExecutor>, max_sql_retries: u32) -> Self {
        Self {
            model,
            executor,
            max_sql_retries,
        }
    }

    /// Plans, executes, and answers one question against an already-retrieved
    /// schema context.
    pub async fn run(
        &self,
        question: &str,
        tables: &[crate::schema::TableMatch],
        database_type: &str,
        database_name: &str,
    ) -> AgentResponse {
        let mut plan = QueryPlan::new(question, database_type);
        let builder = PromptBuilder::new(database_type, database_name);
        let repairs = RepairRegistry::for_dialect(builder.dialect(), database_name);

        let steps = match self.generate_steps(question, &builder, tables).await {
            Ok(steps) => steps,
            Err(e) => {
                warn!("Step planning failed: {}", e);
                plan.final_answer = format!("## Something went wrong\n\nPlanning failed: {}", e);
                let answer = plan.final_answer.clone();
                return AgentResponse { answer, plan };
            }
        };
        info!("Planned {} steps for question", steps.len());

        let mut scheduler = StepScheduler::new(steps);

        while let Some(step) = scheduler.next_eligible() {
            if plan.queries.len() >= MAX_PLAN_STEPS {
                warn!("Step budget exhausted with steps still pending");
                break;
            }
            let execution = execute_sql_with_retry(
                self.executor.as_ref(),
                &step.sql,
                &step.purpose,
                &repairs,
                self.max_sql_retries,
            )
            .await;

            let row_count = execution.row_count.unwrap_or(0);
            scheduler.mark_executed(&step.id);
            plan.record(execution);

            if !scheduler.is_done() && should_refine(scheduler.executed_count(), row_count) {
                match self.request_refinement(question, &scheduler, plan.queries.last()).await {
                    Ok(refinement) => scheduler.apply_refinement(refinement),
                    Err(e) => debug!("Refinement call failed, continuing unchanged: {}", e),
                }
            }
        }

        let answer = match fallback::synthesize_answer(self.model.as_ref(), question, &plan.queries)
            .await
        {
            Some(text) => {
                let extracted = crate::agent::chart::extract_chart_data(&text);
                plan.chart_data = extracted.chart;
                extracted.answer
            }
            None => fallback::render_deterministic_answer(question, &plan.queries),
        };

        plan.final_answer = answer.clone();
        plan.final_sql = plan.queries.last().map(|q| q.sql.clone());
        AgentResponse { answer, plan }
    }

    async fn generate_steps(
        &self,
        question: &str,
        builder: &PromptBuilder,
        tables: &[crate::schema::TableMatch],
    ) -> Result<Vec<PlanStep>, Box<dyn std::error::Error + Send + Sync>> {
        let system = builder.system_instruction(tables);
        let prompt = format!(
            "Plan the SQL queries needed to answer: {}\n\nRespond with only a JSON array of \
             steps, each {{\"id\": \"s1\", \"purpose\": \"...\", \"sql\": \"...\", \
             \"dependsOn\": []}}. Order steps so dependencies come first.",
            question
        );

        let turn = self.model.chat(&system, &[ChatMessage::user(prompt)], &[]).await?;
        let steps: Vec<PlanStep> = serde_json::from_str(extract_json(&turn.text))?;
        if steps.is_empty() {
            return Err("model returned an empty step list".into());
        }
        Ok(steps)
    }

    async fn request_refinement(
        &self,
        question: &str,
        scheduler: &StepScheduler,
        last: Option<&QueryExecution>,
    ) -> Result<PlanRefinement, Box<dyn std::error::Error + Send + Sync>> {
        let pending = serde_json::to_string(&scheduler.pending()).unwrap_or_default();
        let outcome = match last {
            Some(execution) => match (&execution.result, &execution.error) {
                (Some(rows), _) => format!("returned {} rows", rows.len()),
                (None, Some(error)) => format!("failed: {}", error),
                _ => "produced no outcome".to_string(),
            },
            None => "n/a".to_string(),
        };

        let prompt = format!(
            "Question: {}\nThe last executed step {}.\nPending steps: {}\n\nIf the pending plan \
             should change, respond with only a JSON object {{\"add\": [], \"modify\": \
             [{{\"id\": \"...\", \"sql\": \"...\"}}], \"remove\": [\"id\"]}}. Respond with \
             {{}} to keep it unchanged.",
            question, outcome, pending
        );

        let turn = self.model.chat("", &[ChatMessage::user(prompt)], &[]).await?;
        let refinement = serde_json::from_str(extract_json(&turn.text))?;
        Ok(refinement)
    }
}

/// Model answers often wrap JSON in a fenced block; unwrap it when present.
fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    for tag in ["```json", "```"] {
        if let Some(start) = trimmed.find(tag) {
            let rest = &trimmed[start + tag.len()..];
            if let Some(end) = rest.find("```") {
                return rest[..end].trim();
            }
        }
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, deps: &[&str]) -> PlanStep {
        PlanStep {
            id: id.to_string(),
            purpose: format!("step {}", id),
            sql: format!("SELECT '{}' FROM public.t", id),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            removed: false,
        }
    }

    #[test]
    fn scheduler_respects_dependency_order() {
        let mut scheduler =
            StepScheduler::new(vec![step("s2", &["s1"]), step("s1", &[]), step("s3", &["s2"])]);

        assert_eq!(scheduler.next_eligible().unwrap().id, "s1");
        scheduler.mark_executed("s1");
        assert_eq!(scheduler.next_eligible().unwrap().id, "s2");
        scheduler.mark_executed("s2");
        assert_eq!(scheduler.next_eligible().unwrap().id, "s3");
        scheduler.mark_executed("s3");
        assert!(scheduler.is_done());
    }

    #[test]
    fn removing_a_step_strips_it_from_dependency_lists() {
        let mut scheduler = StepScheduler::new(vec![step("s1", &[]), step("s2", &["s1", "s3"]), step("s3", &[])]);
        scheduler.mark_executed("s1");

        scheduler.apply_refinement(PlanRefinement {
            add: vec![],
            modify: vec![],
            remove: vec!["s3".to_string()],
        });

        // s2 no longer waits on the removed s3
        assert_eq!(scheduler.next_eligible().unwrap().id, "s2");
        assert!(scheduler.pending().iter().all(|s| s.id != "s3"));
    }

    #[test]
    fn refinement_never_touches_executed_steps() {
        let mut scheduler = StepScheduler::new(vec![step("s1", &[]), step("s2", &["s1"])]);
        scheduler.mark_executed("s1");

        scheduler.apply_refinement(PlanRefinement {
            add: vec![],
            modify: vec![StepModification {
                id: "s1".to_string(),
                sql: "SELECT 'mutated'".to_string(),
            }],
            remove: vec!["s1".to_string()],
        });

        let s1 = scheduler.steps.iter().find(|s| s.id == "s1").unwrap();
        assert!(!s1.removed);
        assert!(s1.sql.contains("FROM public.t"));
    }

    #[test]
    fn added_steps_become_schedulable() {
        let mut scheduler = StepScheduler::new(vec![step("s1", &[])]);
        scheduler.mark_executed("s1");

        scheduler.apply_refinement(PlanRefinement {
            add: vec![step("s4", &["s1"])],
            modify: vec![],
            remove: vec![],
        });

        assert_eq!(scheduler.next_eligible().unwrap().id, "s4");
    }

    #[test]
    fn refinement_cadence_is_every_second_step_or_surprising_result() {
        assert!(!should_refine(1, 10));
        assert!(should_refine(2, 10));
        assert!(!should_refine(3, 10));
        // Zero rows and oversized results refine immediately
        assert!(should_refine(1, 0));
        assert!(should_refine(3, UNEXPECTED_ROWS_THRESHOLD + 1));
    }

    #[test]
    fn extract_json_unwraps_fenced_blocks() {
        assert_eq!(extract_json("```json\n[1, 2]\n```"), "[1, 2]");
        assert_eq!(extract_json("```\n{}\n```"), "{}");
        assert_eq!(extract_json("  [1]  "), "[1]");
    }

    #[test]
    fn plan_steps_parse_from_camel_case_json() {
        let raw = r#"[{"id": "s1", "purpose": "count", "sql": "SELECT 1", "dependsOn": ["s0"]}]"#;
        let steps: Vec<PlanStep> = serde_json::from_str(raw).unwrap();
        assert_eq!(steps[0].depends_on, vec!["s0".to_string()]);
        assert!(!steps[0].removed);
    }
}
