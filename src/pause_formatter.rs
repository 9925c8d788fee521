//! Deterministic pause-message formatting.
//!
//! No direct prior-art analogue exists for a pause protocol; this module is
//! written in the small-pure-function-composed-by-the-caller style
//! `cloudllm::orchestration` uses for `parse_ralph_completions`/
//! `calculate_convergence_score` — plain functions over `serde_json::Value`
//! rather than a builder, since the input shapes are genuinely variable
//! (spec: "tolerant of two input shapes per stage").

use serde_json::Value;

const CLARITY_THRESHOLD: f64 = 70.0;

fn get_str<'a>(data: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| data.get(k)).and_then(Value::as_str)
}

fn get_f64(data: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| data.get(k)).and_then(Value::as_f64)
}

fn get_array<'a>(data: &'a Value, keys: &[&str]) -> Vec<&'a Value> {
    keys.iter()
        .find_map(|k| data.get(k))
        .and_then(Value::as_array)
        .map(|arr| arr.iter().collect())
        .unwrap_or_default()
}

fn bullet_list(items: &[&Value]) -> String {
    items
        .iter()
        .filter_map(|v| v.as_str().map(str::to_string).or_else(|| {
            v.get("text").and_then(Value::as_str).map(str::to_string)
        }))
        .map(|s| format!("- {}", s))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Formats stage 0 (`analyze_query`) output into a pause message. Tolerant
/// of two shapes: a flat object with `clarity_score`/`assumptions`/etc., or
/// a nested `query_plan` object carrying the same fields.
pub fn format_stage_0_pause(data: &Value, normalization_audit: &mut Vec<String>) -> String {
    let plan = data.get("query_plan").unwrap_or(data);
    if data.get("query_plan").is_some() {
        normalization_audit.push("stage0: used nested query_plan shape".to_string());
    } else {
        normalization_audit.push("stage0: used flat shape".to_string());
    }

    let clarity = get_f64(plan, &["clarity_score", "clarity"]).unwrap_or(0.0);
    let header = if clarity >= CLARITY_THRESHOLD {
        format!("## Research Plan — CONFIRMED ({:.0}% clarity)\n", clarity)
    } else {
        format!("## Research Plan — Needs Clarification ({:.0}% clarity)\n", clarity)
    };

    let mut sections = vec![header];

    let assumptions = get_array(plan, &["assumptions"]);
    if !assumptions.is_empty() {
        sections.push(format!("### Assumptions\n{}\n", bullet_list(&assumptions)));
    }

    let queries = get_array(plan, &["queries", "sub_queries"]);
    if !queries.is_empty() {
        sections.push(format!("### Planned Research Queries\n{}\n", bullet_list(&queries)));
    }

    let standards = get_array(plan, &["primary_standards", "authority_sources"]);
    if !standards.is_empty() {
        sections.push(format!("### Primary Standards\n{}\n", bullet_list(&standards)));
    }

    let clarifying = get_array(plan, &["clarifying_questions"]);
    if !clarifying.is_empty() {
        sections.push(format!("### Clarifying Questions\n{}\n", bullet_list(&clarifying)));
    }

    let alternatives = get_array(plan, &["alternative_interpretations"]);
    if !alternatives.is_empty() {
        sections.push(format!(
            "### Alternative Interpretations\n{}\n",
            bullet_list(&alternatives)
        ));
    }

    sections.push(
        "### Proceed?\nReply to continue, or say \"B. No — proceed\" to skip the web search calibration step.\n"
            .to_string(),
    );

    sections.push(format!(
        "<details><summary>Raw plan JSON</summary>\n\n```json\n{}\n```\n</details>\n",
        serde_json::to_string_pretty(plan).unwrap_or_default()
    ));

    sections.push(cost_footer(data));

    sections.join("\n")
}

/// Formats stage 1 (`websearch_calibration`) output into a pause message.
/// Tolerant of both the normal calibrated shape and the
/// `{ skipped: true, executionStatus }` short-circuit shape.
pub fn format_stage_1_pause(data: &Value, normalization_audit: &mut Vec<String>) -> String {
    let skipped = data.get("skipped").and_then(Value::as_bool).unwrap_or(false);
    let execution_status = get_str(data, &["execution_status", "executionStatus"]).unwrap_or("calibrated");

    if skipped {
        normalization_audit.push("stage1: used skipped shape".to_string());
        let variant_message = match execution_status {
            "user_skipped" => "Web search was skipped at your request.",
            "unavailable" => "Web search is currently unavailable; proceeding with knowledge-base research only.",
            "no_results" => "No web queries were available to run; proceeding with knowledge-base research only.",
            _ => "Web search calibration was skipped.",
        };
        let mut sections = vec![format!("## Web Search — SKIPPED\n\n{}\n", variant_message)];
        sections.push(
            "### Proceed?\n1. Confirm and continue\n2. Deny and stay\n3. Exit\n".to_string(),
        );
        sections.push(cost_footer(data));
        return sections.join("\n");
    }

    normalization_audit.push("stage1: used calibrated shape".to_string());
    let mut sections = vec!["## Web Search — CALIBRATED\n".to_string()];

    let warnings = get_array(data, &["warnings"]);
    if !warnings.is_empty() {
        sections.push(format!("### Warnings\n{}\n", bullet_list(&warnings)));
    }

    let queries = get_array(data, &["refined_queries", "queries"]);
    if !queries.is_empty() {
        sections.push(format!("### Planned Research Queries\n{}\n", bullet_list(&queries)));
    }

    sections.push(
        "### Proceed?\n1. Confirm and continue\n2. Deny and stay\n3. Exit\n".to_string(),
    );

    sections.push(format!(
        "<details><summary>Raw calibration JSON</summary>\n\n```json\n{}\n```\n</details>\n",
        serde_json::to_string_pretty(data).unwrap_or_default()
    ));

    sections.push(cost_footer(data));

    sections.join("\n")
}

fn cost_footer(data: &Value) -> String {
    let cost = get_f64(data, &["cost_usd", "costUsd"]).unwrap_or(0.0);
    format!("---\n_Cost so far: ${:.4}_", cost)
}
