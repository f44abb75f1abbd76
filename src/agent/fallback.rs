use crate::agent::plan::QueryExecution;
use crate::llm::models::ChatMessage;
use crate::llm::ChatModel;
use tracing::{info, warn};

/// Rows rendered per query in the deterministic fallback answer.
const FALLBACK_ROW_LIMIT: usize = 5;

/// Secondary synthesis: when the loop ran out of iterations without final
/// text, ask the model once more to summarize the executed queries under the
/// normal markdown + chartdata contract. Returns None when that call fails.
pub async fn synthesize_answer(
    model: &dyn ChatModel,
    question: &str,
    queries: &[QueryExecution],
) -> Option<String> {
    let mut prompt = format!(
        "The question was: {}\n\nThe following SQL queries were already executed. \
         Summarize what they show and answer the question in markdown. If the data \
         suits a chart, append a single fenced ```chartdata``` block with at most 20 \
         points; otherwise omit it.\n",
        question
    );

    for (i, query) in queries.iter().enumerate() {
        prompt.push_str(&format!("\n### Query {} ({})\n{}\n", i + 1, query.purpose, query.sql));
        match (&query.result, &query.error) {
            (Some(rows), _) => {
                let sample: Vec<_> = rows.iter().take(20).collect();
                prompt.push_str(&format!(
                    "Rows: {}\nSample: {}\n",
                    rows.len(),
                    serde_json::to_string(&sample).unwrap_or_default()
                ));
            }
            (None, Some(error)) => {
                prompt.push_str(&format!("Failed: {}\n", error));
            }
            _ => {}
        }
    }

    match model.chat("", &[ChatMessage::user(prompt)], &[]).await {
        Ok(turn) if !turn.text.trim().is_empty() => {
            info!("Answer synthesized by secondary model call");
            Some(turn.text)
        }
        Ok(_) => {
            warn!("Secondary synthesis call returned empty text");
            None
        }
        Err(e) => {
            warn!("Secondary synthesis call failed: {}", e);
            None
        }
    }
}

/// Last-resort deterministic rendering: a summary line, then for each
/// successful query a heading, its SQL, and the first rows as a markdown
/// table. Never includes chart data.
pub fn render_deterministic_answer(question: &str, queries: &[QueryExecution]) -> String {
    let succeeded = queries.iter().filter(|q| q.succeeded()).count();

    let mut answer = format!(
        "## Results for: {}\n\nExecuted {} queries ({} succeeded).\n",
        question,
        queries.len(),
        succeeded
    );

    for (i, query) in queries.iter().enumerate() {
        let Some(rows) = &query.result else { continue };

        answer.push_str(&format!("\n### Query {}: {}\n\n```sql\n{}\n```\n\n", i + 1, query.purpose, query.sql));

        if rows.is_empty() {
            answer.push_str("No rows returned.\n");
            continue;
        }

        // Header from the first row's columns
        let columns: Vec<&String> = rows[0].keys().collect();
        answer.push_str(&format!("| {} |\n", columns.iter().map(|c| c.as_str()).collect::<Vec<_>>().join(" | ")));
        answer.push_str(&format!("|{}\n", "---|".repeat(columns.len())));

        for row in rows.iter().take(FALLBACK_ROW_LIMIT) {
            let cells: Vec<String> = columns
                .iter()
                .map(|c| match row.get(*c) {
                    Some(serde_json::Value::String(s)) => s.clone(),
                    Some(serde_json::Value::Null) | None => "NULL".to_string(),
                    Some(v) => v.to_string(),
                })
                .collect();
            answer.push_str(&format!("| {} |\n", cells.join(" | ")));
        }

        if rows.len() > FALLBACK_ROW_LIMIT {
            answer.push_str(&format!("\n({} more rows not shown)\n", rows.len() - FALLBACK_ROW_LIMIT));
        }
    }

    answer
}
