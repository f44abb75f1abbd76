use crate::sql::SqlDialect;
use regex::Regex;
use tracing::debug;

/// One repair rule: classifies an execution error and, when it matches,
/// proposes a rewritten statement to retry.
pub trait RepairStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn matches(&self, error: &str) -> bool;
    fn repair(&self, sql: &str) -> Option<String>;
}

/// Repairs "table not found" failures by qualifying the first bare table
/// reference with the dialect's default schema. Postgres phrases the same
/// condition as "relation ... not found"/"does not exist".
pub struct MissingTableRepair {
    default_schema: String,
    from_pattern: Regex,
}

impl MissingTableRepair {
    pub fn new(default_schema: String) -> Self {
        // Matches FROM followed by an unqualified identifier. The trailing
        // group rejects identifiers already carrying a schema qualifier.
        let from_pattern = Regex::new(r"(?i)\bFROM\s+([A-Za-z_][A-Za-z0-9_]*)([^.\w]|$)")
            .expect("static regex");
        Self {
            default_schema,
            from_pattern,
        }
    }
}

impl RepairStrategy for MissingTableRepair {
    fn name(&self) -> &'static str {
        "missing_table_schema_prefix"
    }

    fn matches(&self, error: &str) -> bool {
        let lower = error.to_lowercase();
        let missing = lower.contains("not found") || lower.contains("does not exist");
        let table_like = lower.contains("table") || lower.contains("relation");
        missing && table_like
    }

    fn repair(&self, sql: &str) -> Option<String> {
        let caps = self.from_pattern.captures(sql)?;
        let table = caps.get(1)?.as_str();
        if table.eq_ignore_ascii_case("select") {
            // FROM of a subquery opener slipped through; leave it alone.
            return None;
        }

        let qualified = format!("FROM {}.{}{}", self.default_schema, table, &caps[2]);
        let repaired = self
            .from_pattern
            .replacen(sql, 1, qualified.as_str())
            .to_string();
        if repaired == sql {
            None
        } else {
            Some(repaired)
        }
    }
}

/// Ordered set of repair rules for one dialect. First match wins.
pub struct RepairRegistry {
    strategies: Vec<Box<dyn RepairStrategy>>,
}

impl RepairRegistry {
    pub fn for_dialect(dialect: SqlDialect, database_name: &str) -> Self {
        let default_schema = dialect.default_schema(database_name);
        Self {
            strategies: vec![Box::new(MissingTableRepair::new(default_schema))],
        }
    }

    #[cfg(test)]
    pub fn with_strategies(strategies: Vec<Box<dyn RepairStrategy>>) -> Self {
        Self { strategies }
    }

    /// Returns the rewritten SQL from the first matching strategy, if any.
    pub fn try_repair(&self, error: &str, sql: &str) -> Option<String> {
        for strategy in &self.strategies {
            if strategy.matches(error) {
                if let Some(repaired) = strategy.repair(sql) {
                    debug!("Repair strategy '{}' rewrote SQL: {}", strategy.name(), repaired);
                    return Some(repaired);
                }
            }
        }
        None
    }
}
