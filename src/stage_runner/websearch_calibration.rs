//! Stage 1: `websearch_calibration`.
//!
//! Selects a bounded set of web queries from stage 0's output, runs them
//! through the bridge, then (unless short-circuited) asks the model to
//! refine the research plan against what the web turned up.

use serde_json::Value;

use crate::error::PipelineResult;
use crate::json_extract::{extract_json, ExtractedJson};
use crate::mcp_bridge::WebSearchResult;
use crate::state::{StageResult, TokenUsage};

use super::{StageHandlerInput, StageRunner};

const MAX_WEB_QUERIES: usize = 3;
const TRUNCATION_WARNING_RATIO: f64 = 0.95;

const FALLBACK_SYSTEM_PROMPT: &str = "You are calibrating a research plan against fresh web search \
results. Given the original query plan and the web search results provided, produce a refined plan \
as JSON with a `refined_queries` array and a `warnings` array describing any gaps.";

/// Selects up to `MAX_WEB_QUERIES`, preferring an explicit
/// `authority_sources.search_queries` list, then the normalized `queries`
/// array, then the raw `sub_queries`.
fn select_web_queries(stage0_data: &Value) -> Vec<String> {
    let from_authority = stage0_data
        .get("authority_sources")
        .and_then(|a| a.get("search_queries"))
        .and_then(Value::as_array);
    let from_queries = stage0_data.get("queries").and_then(Value::as_array);
    let from_sub_queries = stage0_data.get("sub_queries").and_then(Value::as_array);

    let source = from_authority.or(from_queries).or(from_sub_queries);
    source
        .map(|arr| {
            arr.iter()
                .filter_map(|q| {
                    q.as_str()
                        .map(str::to_string)
                        .or_else(|| q.get("text").and_then(Value::as_str).map(str::to_string))
                })
                .take(MAX_WEB_QUERIES)
                .collect()
        })
        .unwrap_or_default()
}

fn skipped_result(status: &str, summary: &str) -> StageResult {
    StageResult::skipped(
        summary,
        serde_json::json!({
            "skipped": true,
            "execution_status": status,
        }),
    )
}

pub async fn run(runner: &StageRunner, input: StageHandlerInput<'_>) -> PipelineResult<StageResult> {
    let stage0_data = input
        .state
        .get_stage_output(0)
        .map(|r| r.data.clone())
        .unwrap_or(Value::Null);

    let queries = select_web_queries(&stage0_data);

    let bridge = match &runner.bridge {
        None => return Ok(skipped_result("unavailable", "Web search unavailable")),
        Some(bridge) => bridge,
    };

    if queries.is_empty() {
        return Ok(skipped_result("no_results", "No web queries available"));
    }

    let mut results: Vec<WebSearchResult> = Vec::new();
    let mut warnings: Vec<String> = Vec::new();
    let mut succeeded = 0usize;

    for query in &queries {
        runner.emit_substep(crate::events::SubstepKind::McpStart {
            tool_name: "web_search".to_string(),
        });
        match bridge.web_search(query).await {
            Ok(mut hits) => {
                succeeded += 1;
                results.append(&mut hits);
                runner.emit_substep(crate::events::SubstepKind::McpResult {
                    tool_name: "web_search".to_string(),
                    success: true,
                });
            }
            Err(e) => {
                warnings.push(format!("query '{}' failed: {}", query, e));
                runner.emit_substep(crate::events::SubstepKind::McpResult {
                    tool_name: "web_search".to_string(),
                    success: false,
                });
            }
        }
    }

    if succeeded == 0 {
        return Ok(skipped_result("no_results", "All web queries failed"));
    }

    let dedup_warnings: Vec<String> = {
        let mut seen = std::collections::HashSet::new();
        warnings.into_iter().filter(|w| seen.insert(w.clone())).collect()
    };

    let results_summary: String = results
        .iter()
        .map(|r| format!("- {} ({})\n  {}", r.title, r.url, r.snippet))
        .collect::<Vec<_>>()
        .join("\n");

    let system_prompt = runner.load_prompt(1, "websearch-calibration", &[], FALLBACK_SYSTEM_PROMPT);
    let user_message = format!(
        "Original plan:\n{}\n\nWeb search results:\n{}",
        serde_json::to_string_pretty(&stage0_data).unwrap_or_default(),
        results_summary
    );

    let call_result = runner
        .call_llm("websearch_calibration", input.agent_config, system_prompt, user_message)
        .await?;

    let desired = input.agent_config.desired_output_tokens("websearch_calibration");
    let near_truncation =
        (call_result.usage.output_tokens as f64) >= (desired as f64) * TRUNCATION_WARNING_RATIO;

    let extracted = extract_json(&call_result.text);
    if near_truncation && !extracted.is_parsed() {
        log::warn!(
            "websearch_calibration: output near desired token budget ({}/{}) and JSON extraction failed; not auto-repairing",
            call_result.usage.output_tokens,
            desired
        );
    }

    let mut data = match &extracted {
        ExtractedJson::Parsed(value) => value.clone(),
        ExtractedJson::RawText(raw) => serde_json::json!({ "rawText": raw }),
    };

    // Telemetry is authoritatively stamped by the runner, overriding
    // anything the model wrote for these fields.
    if let Value::Object(ref mut map) = data {
        map.insert(
            "execution_status".to_string(),
            Value::String("calibrated".to_string()),
        );
        map.insert("queries_attempted".to_string(), Value::from(queries.len()));
        map.insert("queries_succeeded".to_string(), Value::from(succeeded));
        map.insert("result_count".to_string(), Value::from(results.len()));
        map.insert(
            "warnings".to_string(),
            Value::Array(dedup_warnings.iter().cloned().map(Value::String).collect()),
        );
        map.insert(
            "web_sources".to_string(),
            serde_json::to_value(&results).unwrap_or(Value::Array(vec![])),
        );
    }

    Ok(StageResult {
        text: call_result.text,
        summary: format!("Calibrated against {} web results", results.len()),
        usage: TokenUsage {
            input_tokens: call_result.usage.input_tokens,
            output_tokens: call_result.usage.output_tokens,
        },
        data,
    })
}
