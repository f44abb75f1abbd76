use crate::agent::plan::ConversationContext;
use crate::llm::models::ChatMessage;
use crate::schema::TableMatch;
use crate::sql::SqlDialect;

/// Prior exchanges embedded into a prompt, most recent first in the source
/// but kept in chronological order in the message list.
pub const MAX_HISTORY_TURNS: usize = 5;

/// Row cap the model is told to bake into every statement.
pub const DEFAULT_ROW_LIMIT: usize = 100;

/// Builds the system instruction and message list for one invocation.
pub struct PromptBuilder {
    dialect: SqlDialect,
    default_schema: String,
    database_type: String,
}

impl PromptBuilder {
    pub fn new(database_type: &str, database_name: &str) -> Self {
        let dialect = SqlDialect::from_database_type(database_type);
        Self {
            dialect,
            default_schema: dialect.default_schema(database_name),
            database_type: database_type.to_string(),
        }
    }

    pub fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    pub fn default_schema(&self) -> &str {
        &self.default_schema
    }

    /// The system instruction: candidate schemas verbatim, the SQL authoring
    /// rules, and the chart decision table.
    pub fn system_instruction(&self, tables: &[TableMatch]) -> String {
        let schema_block = tables
            .iter()
            .map(|t| t.schema.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        format!(
            r#"### Instructions:
You are a data analyst answering questions about a {database_type} database.
You may call the execute_sql function as many times as needed to gather data,
then answer in markdown. Adhere to these rules:
- **Generate SELECT statements only.** Never modify data.
- **Always schema-qualify table names.** The default schema for this database is `{default_schema}`; write `{default_schema}.table_name` unless the schema text below says otherwise.
- **Always limit result size** using the dialect's syntax: `{row_limit_hint}`.
- **Deliberately go through the question and database schema word by word** before writing SQL.
- Pass a short `purpose` with every execute_sql call describing what the query is for.

### Database schema:
{schema_block}

### Chart selection:
After you have the data, decide on a visualization:
- proportions or shares of a whole -> "pie"
- comparing or ranking absolute magnitudes -> "bar"
- trends over time -> "line"
- a single value, non-numeric data, or not enough data -> "none"

When the chart type is not "none", append exactly one fenced block tagged
`chartdata` to your final answer, containing JSON of the shape:
```chartdata
{{"type": "bar", "data": [{{"label": "a", "value": 1}}], "xAxisKey": "label", "yAxisKey": "value", "description": "..."}}
```
Keep `data` to at most 20 points. The rest of the answer is plain markdown."#,
            database_type = self.database_type,
            default_schema = self.default_schema,
            row_limit_hint = self.dialect.row_limit_hint(DEFAULT_ROW_LIMIT),
            schema_block = schema_block,
        )
    }

    /// Converts the capped history into alternating user/assistant turns and
    /// appends the current question as the final user turn.
    pub fn build_messages(
        &self,
        history: &[ConversationContext],
        question: &str,
    ) -> Vec<ChatMessage> {
        let recent = if history.len() > MAX_HISTORY_TURNS {
            &history[history.len() - MAX_HISTORY_TURNS..]
        } else {
            history
        };

        let mut messages = Vec::with_capacity(recent.len() * 2 + 1);
        for turn in recent {
            messages.push(ChatMessage::user(turn.question.clone()));

            let mut answer = turn.answer.clone();
            if let Some(sql) = &turn.sql_query {
                answer.push_str(&format!("\n\n(SQL used: {})", sql));
            }
            if let Some(findings) = &turn.key_findings {
                if !findings.is_empty() {
                    answer.push_str(&format!("\n\nKey findings: {}", findings.join("; ")));
                }
            }
            messages.push(ChatMessage::assistant(answer));
        }

        messages.push(ChatMessage::user(question.to_string()));
        messages
    }
}
