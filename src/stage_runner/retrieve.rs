//! Stage 2: `retrieve`.
//!
//! A pure tool-call stage: no LLM is invoked. Runs knowledge-base search
//! for each selected query, dedupes by paragraph id, optionally applies
//! delta retrieval for follow-up sessions, and sorts by descending score.

use serde_json::Value;

use crate::context::RetrievalParagraph;
use crate::error::PipelineResult;
use crate::mcp_bridge::KbSearchOptions;
use crate::state::{StageResult, TokenUsage};

use super::{StageHandlerInput, StageRunner};

const MAX_RESULTS_PER_QUERY: usize = 8;

fn extract_text_values(arr: &[Value]) -> Vec<String> {
    arr.iter()
        .filter_map(|q| {
            q.as_str()
                .map(str::to_string)
                .or_else(|| q.get("text").and_then(Value::as_str).map(str::to_string))
        })
        .collect()
}

/// Prefers stage 1's refined queries (when stage 1 ran and wasn't
/// skipped), then falls back to stage 0's normalized `queries` array.
fn select_retrieval_queries(stage0_data: &Value, stage1_data: Option<&Value>) -> Vec<String> {
    if let Some(stage1_data) = stage1_data {
        let skipped = stage1_data
            .get("skipped")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !skipped {
            if let Some(refined) = stage1_data.get("refined_queries").and_then(Value::as_array) {
                let queries = extract_text_values(refined);
                if !queries.is_empty() {
                    return queries;
                }
            }
        }
    }
    stage0_data
        .get("queries")
        .and_then(Value::as_array)
        .map(|arr| extract_text_values(arr))
        .unwrap_or_default()
}

pub async fn run(runner: &StageRunner, input: StageHandlerInput<'_>) -> PipelineResult<StageResult> {
    let stage0_data = input
        .state
        .get_stage_output(0)
        .map(|r| r.data.clone())
        .unwrap_or(Value::Null);
    let stage1_data = input.state.get_stage_output(1).map(|r| r.data.clone());

    let queries = select_retrieval_queries(&stage0_data, stage1_data.as_ref());

    let bridge = match &runner.bridge {
        None => {
            return Ok(StageResult::skipped(
                "Knowledge base unavailable",
                serde_json::json!({ "skipped": true, "paragraphs": [] }),
            ));
        }
        Some(bridge) => bridge,
    };

    let delta_retrieval = input
        .agent_config
        .follow_up
        .as_ref()
        .map(|f| f.delta_retrieval)
        .unwrap_or(false);
    let exclude_ids: std::collections::HashSet<&str> = if delta_retrieval {
        input
            .follow_up_context
            .map(|ctx| ctx.prior_cited_paragraph_ids.iter().map(String::as_str).collect())
            .unwrap_or_default()
    } else {
        std::collections::HashSet::new()
    };

    let mut by_id: std::collections::HashMap<String, RetrievalParagraph> =
        std::collections::HashMap::new();

    for query in &queries {
        runner.emit_substep(crate::events::SubstepKind::McpStart {
            tool_name: "kb_search".to_string(),
        });
        let options = KbSearchOptions {
            max_results: Some(MAX_RESULTS_PER_QUERY),
        };
        match bridge.kb_search(query, options).await {
            Ok(paragraphs) => {
                runner.emit_substep(crate::events::SubstepKind::McpResult {
                    tool_name: "kb_search".to_string(),
                    success: true,
                });
                for paragraph in paragraphs {
                    if exclude_ids.contains(paragraph.id.as_str()) {
                        continue;
                    }
                    by_id
                        .entry(paragraph.id.clone())
                        .and_modify(|existing| {
                            if paragraph.score > existing.score {
                                *existing = paragraph.clone();
                            }
                        })
                        .or_insert(paragraph);
                }
            }
            Err(_) => {
                runner.emit_substep(crate::events::SubstepKind::McpResult {
                    tool_name: "kb_search".to_string(),
                    success: false,
                });
            }
        }
    }

    let mut paragraphs: Vec<RetrievalParagraph> = by_id.into_values().collect();
    paragraphs.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let summary = format!("Retrieved {} paragraphs for {} queries", paragraphs.len(), queries.len());
    let data = serde_json::json!({
        "queries_used": queries,
        "paragraphs": paragraphs,
        "delta_retrieval_applied": delta_retrieval,
    });

    Ok(StageResult {
        text: String::new(),
        summary,
        usage: TokenUsage::default(),
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prefers_stage1_refined_queries_when_present() {
        let stage0 = json!({ "queries": [{"text": "q0"}] });
        let stage1 = json!({ "refined_queries": ["r1", "r2"] });
        assert_eq!(select_retrieval_queries(&stage0, Some(&stage1)), vec!["r1", "r2"]);
    }

    #[test]
    fn falls_back_to_stage0_when_stage1_skipped() {
        let stage0 = json!({ "queries": [{"text": "q0"}] });
        let stage1 = json!({ "skipped": true });
        assert_eq!(select_retrieval_queries(&stage0, Some(&stage1)), vec!["q0"]);
    }

    #[test]
    fn falls_back_to_stage0_when_stage1_absent() {
        let stage0 = json!({ "queries": [{"text": "q0"}] });
        assert_eq!(select_retrieval_queries(&stage0, None), vec!["q0"]);
    }
}
