//! Stage 0: `analyze_query`.
//!
//! Single LLM call that decomposes the user's question into a query plan.
//! Builds context optionally enhanced with a prior-research hint.

use serde_json::Value;

use crate::error::PipelineResult;
use crate::json_extract::{extract_json, ExtractedJson};
use crate::state::{StageResult, TokenUsage};
use crate::summary::build_prior_context_hint;

use super::{StageHandlerInput, StageRunner};

const FALLBACK_SYSTEM_PROMPT: &str = "You are a research query analyst. Given a user's question, \
decompose it into a structured query plan: an `original_query`, an array of `queries` (each with \
`text`), assumptions, clarifying questions, alternative interpretations, primary standards, and a \
`clarity_score` between 0 and 100. Respond with JSON only.";

pub async fn run(runner: &StageRunner, input: StageHandlerInput<'_>) -> PipelineResult<StageResult> {
    let prior_hint = input
        .follow_up_context
        .map(|ctx| build_prior_context_hint(ctx))
        .unwrap_or_default();

    let user_message = if prior_hint.is_empty() {
        input.user_message.to_string()
    } else {
        format!("{}\n\n{}", prior_hint, input.user_message)
    };

    let system_prompt = runner.load_prompt(
        0,
        "analyze-query",
        &[("query", input.user_message)],
        FALLBACK_SYSTEM_PROMPT,
    );

    let call_result = runner
        .call_llm("analyze_query", input.agent_config, system_prompt, user_message)
        .await?;

    let extracted = extract_json(&call_result.text);
    let mut data = match &extracted {
        ExtractedJson::Parsed(value) => value.clone(),
        ExtractedJson::RawText(raw) => serde_json::json!({ "rawText": raw }),
    };

    normalize_queries(&mut data);

    if let Value::Object(ref mut map) = data {
        if !map.contains_key("original_query") {
            map.insert(
                "original_query".to_string(),
                Value::String(input.user_message.to_string()),
            );
        }
    }

    if let Some(warning) = detect_sub_query_overlap(&data, input) {
        if let Value::Object(ref mut map) = data {
            map.insert("overlap_warning".to_string(), Value::String(warning));
        }
    }

    let summary = data
        .get("original_query")
        .and_then(Value::as_str)
        .unwrap_or(input.user_message)
        .to_string();

    Ok(StageResult {
        text: call_result.text,
        summary,
        usage: TokenUsage {
            input_tokens: call_result.usage.input_tokens,
            output_tokens: call_result.usage.output_tokens,
        },
        data,
    })
}

/// Ensures a top-level `queries` array always exists, deriving it from
/// `query_plan.sub_queries` if the model nested its response instead.
fn normalize_queries(data: &mut Value) {
    let already_has_queries = data
        .get("queries")
        .and_then(Value::as_array)
        .map(|arr| !arr.is_empty())
        .unwrap_or(false);
    if already_has_queries {
        return;
    }
    let derived = data
        .get("query_plan")
        .and_then(|plan| plan.get("sub_queries"))
        .and_then(Value::as_array)
        .cloned();
    if let Some(derived) = derived {
        if let Value::Object(ref mut map) = data {
            map.insert("queries".to_string(), Value::Array(derived));
        }
    }
}

/// Diagnostic-only overlap check between new sub-queries and prior
/// sub-queries: surfaces a warning, never auto-rejects.
fn detect_sub_query_overlap(data: &Value, input: &StageHandlerInput) -> Option<String> {
    let follow_up = input.follow_up_context?;
    let new_queries: Vec<String> = data
        .get("queries")
        .and_then(Value::as_array)?
        .iter()
        .filter_map(|q| q.get("text").and_then(Value::as_str).map(str::to_lowercase))
        .collect();
    let overlapping: Vec<&String> = new_queries
        .iter()
        .filter(|q| {
            follow_up
                .prior_sub_queries
                .iter()
                .any(|prior| prior.to_lowercase() == **q)
        })
        .collect();
    if overlapping.is_empty() {
        None
    } else {
        Some(format!(
            "{} new sub-quer{} textually overlap{} prior sub-queries",
            overlapping.len(),
            if overlapping.len() == 1 { "y" } else { "ies" },
            if overlapping.len() == 1 { "s" } else { "" },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_queries_derives_from_nested_query_plan() {
        let mut data = json!({
            "query_plan": { "sub_queries": ["a", "b"] }
        });
        normalize_queries(&mut data);
        assert_eq!(data["queries"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn normalize_queries_leaves_existing_top_level_array_alone() {
        let mut data = json!({ "queries": [{"text": "existing"}] });
        normalize_queries(&mut data);
        assert_eq!(data["queries"].as_array().unwrap().len(), 1);
    }
}
