use crate::agent::plan::{ChartSpec, ChartType, MAX_CHART_POINTS};
use crate::sql::Row;
use regex::Regex;
use tracing::debug;

/// Result of scanning the model's final text: the visible answer with the
/// chartdata block removed, and the parsed chart if the block was valid.
pub struct ExtractedChart {
    pub answer: String,
    pub chart: Option<ChartSpec>,
}

fn chartdata_pattern() -> Regex {
    Regex::new(r"(?s)```chartdata\s*(.*?)```").expect("static regex")
}

/// Pulls the structured visualization hint out of free-form model text. The
/// fenced block is stripped from the answer whether or not it parses; a
/// malformed block costs the chart, never the answer.
pub fn extract_chart_data(text: &str) -> ExtractedChart {
    let pattern = chartdata_pattern();

    let chart = pattern
        .captures(text)
        .and_then(|caps| parse_chart_block(caps.get(1).map(|m| m.as_str()).unwrap_or("")));

    let answer = pattern.replace_all(text, "").trim().to_string();

    ExtractedChart { answer, chart }
}

fn parse_chart_block(raw: &str) -> Option<ChartSpec> {
    let value: serde_json::Value = match serde_json::from_str(raw.trim()) {
        Ok(v) => v,
        Err(e) => {
            debug!("Discarding malformed chartdata block: {}", e);
            return None;
        }
    };

    // Only objects with a type field and an array data field are accepted.
    if !value.get("type").map(|t| t.is_string()).unwrap_or(false)
        || !value.get("data").map(|d| d.is_array()).unwrap_or(false)
    {
        debug!("Discarding chartdata block missing type or data array");
        return None;
    }

    let mut spec: ChartSpec = match serde_json::from_value(value) {
        Ok(spec) => spec,
        Err(e) => {
            debug!("Discarding chartdata block with invalid shape: {}", e);
            return None;
        }
    };

    if spec.data.len() > MAX_CHART_POINTS {
        spec.data.truncate(MAX_CHART_POINTS);
    }

    Some(spec)
}

/// Deterministic chart-type heuristic, usable as a fallback or sanity check
/// against the model's own choice. Mirrors the decision table given to the
/// model: proportion language wins, then time trends, then rankings.
pub fn decide_chart_type(question: &str, rows: &[Row]) -> ChartType {
    if rows.is_empty() || !has_numeric_column(rows) {
        return ChartType::None;
    }
    // A single scalar is an answer, not a chart.
    if rows.len() == 1 && rows[0].len() <= 1 {
        return ChartType::None;
    }

    let q = question.to_lowercase();

    const PIE_WORDS: &[&str] = &[
        "share", "proportion", "percentage", "percent", "breakdown", "distribution", "ratio",
    ];
    const LINE_WORDS: &[&str] = &[
        "trend", "over time", "per month", "per year", "per week", "per day", "monthly",
        "yearly", "weekly", "daily", "growth",
    ];
    const BAR_WORDS: &[&str] = &[
        "top", "most", "highest", "lowest", "largest", "smallest", "compare", "comparison",
        "rank", "ranking", "best", "worst", "by ",
    ];

    if PIE_WORDS.iter().any(|w| q.contains(w)) {
        ChartType::Pie
    } else if LINE_WORDS.iter().any(|w| q.contains(w)) {
        ChartType::Line
    } else if BAR_WORDS.iter().any(|w| q.contains(w)) {
        ChartType::Bar
    } else {
        ChartType::None
    }
}

fn has_numeric_column(rows: &[Row]) -> bool {
    rows.first()
        .map(|row| row.values().any(|v| v.is_number()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows_with_values(pairs: &[(&str, i64)]) -> Vec<Row> {
        pairs
            .iter()
            .map(|(label, value)| {
                let mut row = Row::new();
                row.insert("label".to_string(), serde_json::json!(label));
                row.insert("value".to_string(), serde_json::json!(value));
                row
            })
            .collect()
    }

    #[test]
    fn extracts_and_strips_valid_chartdata() {
        let text = "Sales are growing.\n\n```chartdata\n{\"type\": \"bar\", \"data\": [{\"label\": \"a\", \"value\": 1}], \"xAxisKey\": \"label\", \"yAxisKey\": \"value\"}\n```\n";
        let extracted = extract_chart_data(text);

        assert_eq!(extracted.answer, "Sales are growing.");
        let chart = extracted.chart.unwrap();
        assert_eq!(chart.chart_type, ChartType::Bar);
        assert_eq!(chart.data.len(), 1);
        assert_eq!(chart.x_axis_key.as_deref(), Some("label"));
    }

    #[test]
    fn malformed_block_is_stripped_but_discarded() {
        let text = "Answer.\n```chartdata\nnot json at all\n```";
        let extracted = extract_chart_data(text);

        assert_eq!(extracted.answer, "Answer.");
        assert!(extracted.chart.is_none());
    }

    #[test]
    fn block_without_data_array_is_discarded() {
        let text = "Answer.\n```chartdata\n{\"type\": \"bar\"}\n```";
        let extracted = extract_chart_data(text);
        assert!(extracted.chart.is_none());
    }

    #[test]
    fn oversized_data_is_clipped_to_twenty() {
        let points: Vec<String> = (0..30)
            .map(|i| format!("{{\"label\": \"p{}\", \"value\": {}}}", i, i))
            .collect();
        let text = format!(
            "A.\n```chartdata\n{{\"type\": \"line\", \"data\": [{}]}}\n```",
            points.join(",")
        );

        let extracted = extract_chart_data(&text);
        assert_eq!(extracted.chart.unwrap().data.len(), MAX_CHART_POINTS);
    }

    #[test]
    fn text_without_block_passes_through() {
        let extracted = extract_chart_data("Just an answer.");
        assert_eq!(extracted.answer, "Just an answer.");
        assert!(extracted.chart.is_none());
    }

    #[test]
    fn decides_pie_for_proportion_language() {
        let rows = rows_with_values(&[("a", 30), ("b", 70)]);
        assert_eq!(
            decide_chart_type("What is the share of revenue by region?", &rows),
            ChartType::Pie
        );
    }

    #[test]
    fn decides_line_for_trend_language() {
        let rows = rows_with_values(&[("jan", 1), ("feb", 2)]);
        assert_eq!(
            decide_chart_type("Show the sales trend over time", &rows),
            ChartType::Line
        );
    }

    #[test]
    fn decides_bar_for_ranking_language() {
        let rows = rows_with_values(&[("a", 5), ("b", 3)]);
        assert_eq!(
            decide_chart_type("What are the top 5 products?", &rows),
            ChartType::Bar
        );
    }

    #[test]
    fn single_scalar_or_non_numeric_means_no_chart() {
        let mut scalar = Row::new();
        scalar.insert("count".to_string(), serde_json::json!(42));
        assert_eq!(decide_chart_type("top products", &[scalar]), ChartType::None);

        let mut text_row = Row::new();
        text_row.insert("name".to_string(), serde_json::json!("alice"));
        let text_rows = vec![text_row.clone(), text_row];
        assert_eq!(decide_chart_type("top users", &text_rows), ChartType::None);

        assert_eq!(decide_chart_type("top users", &[]), ChartType::None);
    }
}
