//! Stage 3: `synthesize`.
//!
//! The max-effort single LLM call that drafts the answer. Context is
//! assembled from the query plan, calibration output, retrieved
//! paragraphs (budget-truncated), optional repair feedback from a prior
//! iteration, and optional follow-up material. The drafted text is
//! deterministically post-processed before it is stored.

use serde_json::Value;

use crate::context::{build_stage_context, RetrievalParagraph, StageContextInput};
use crate::error::PipelineResult;
use crate::json_extract::{extract_json, ExtractedJson};
use crate::post_processor::{post_process_synthesis, PriorSectionSource, WebSource};
use crate::state::{StageResult, TokenUsage};

use super::{StageHandlerInput, StageRunner};

const DEFAULT_RETRIEVAL_TOKEN_BUDGET: usize = 70_000;

const FALLBACK_SYSTEM_PROMPT: &str = "You are drafting a research answer. Use the query plan, any web \
research context, and the retrieved reference paragraphs to write a thorough synthesis as JSON with a \
`synthesis` field (markdown prose) and a `citations` array of `{paragraph_id, claim}` objects. Every \
substantive claim must be grounded in a cited paragraph. Respond with JSON only.";

fn paragraphs_from_stage2(stage2_data: &Value) -> Vec<RetrievalParagraph> {
    stage2_data
        .get("paragraphs")
        .and_then(|v| serde_json::from_value::<Vec<RetrievalParagraph>>(v.clone()).ok())
        .unwrap_or_default()
}

/// Extracts `web_sources` from stage 1's output, supporting both the
/// structured shape (`web_sources: [{url, title, snippet}]`) and the
/// legacy shape where the model wrote free-form insights under
/// `refined_queries` or a top-level `insights` array.
fn web_sources_from_stage1(stage1_data: Option<&Value>) -> Vec<WebSource> {
    let Some(data) = stage1_data else { return Vec::new() };
    if let Some(arr) = data.get("web_sources").and_then(Value::as_array) {
        return arr
            .iter()
            .filter_map(|v| {
                let url = v.get("url").and_then(Value::as_str)?.to_string();
                let insight = v
                    .get("snippet")
                    .or_else(|| v.get("insight"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Some(WebSource { url, insight })
            })
            .collect();
    }
    data.get("insights")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|v| {
                    let url = v.get("url").and_then(Value::as_str)?.to_string();
                    let insight = v.get("insight").and_then(Value::as_str).unwrap_or_default().to_string();
                    Some(WebSource { url, insight })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn web_research_context_text(stage1_data: Option<&Value>) -> Option<String> {
    let data = stage1_data?;
    data.get("rawText")
        .or_else(|| data.get("refined_queries"))
        .map(|v| serde_json::to_string_pretty(v).unwrap_or_default())
}

pub async fn run(runner: &StageRunner, input: StageHandlerInput<'_>) -> PipelineResult<StageResult> {
    let stage0 = input.state.get_stage_output(0);
    let stage1_data = input.state.get_stage_output(1).map(|r| r.data.clone());
    let stage2_data = input
        .state
        .get_stage_output(2)
        .map(|r| r.data.clone())
        .unwrap_or(Value::Null);

    let query_plan_text = stage0.map(|r| r.text.clone());
    let paragraphs = paragraphs_from_stage2(&stage2_data);

    let prior_answer_text = input.follow_up_context.map(|ctx| ctx.prior_answer.as_str());
    let prior_sections_json = input.follow_up_context.map(|ctx| {
        serde_json::to_string_pretty(&ctx.prior_sections).unwrap_or_default()
    });

    let web_research_context = web_research_context_text(stage1_data.as_ref());

    let context_input = StageContextInput {
        query_plan: query_plan_text.as_deref(),
        prior_stage_outputs: Vec::new(),
        retrieval_paragraphs: paragraphs.clone(),
        retrieval_token_budget: Some(DEFAULT_RETRIEVAL_TOKEN_BUDGET),
        repair_feedback: input.repair_feedback,
        web_sources: None,
        web_research_context: web_research_context.as_deref(),
        prior_answer: prior_answer_text,
        prior_sections: prior_sections_json.as_deref(),
    };

    let user_message = build_stage_context(&context_input);
    let system_prompt = runner.load_prompt(3, "synthesize", &[], FALLBACK_SYSTEM_PROMPT);

    let call_result = runner
        .call_llm("synthesize", input.agent_config, system_prompt, user_message)
        .await?;

    let extracted = extract_json(&call_result.text);
    let mut data = match &extracted {
        ExtractedJson::Parsed(value) => value.clone(),
        ExtractedJson::RawText(raw) => serde_json::json!({ "synthesis": raw, "citations": [] }),
    };

    let raw_synthesis = data
        .get("synthesis")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let web_sources = web_sources_from_stage1(stage1_data.as_ref());
    let prior_section_sources: Vec<PriorSectionSource> = input
        .follow_up_context
        .map(|ctx| {
            ctx.prior_sections
                .iter()
                .map(|s| PriorSectionSource {
                    section_id: s.id.clone(),
                    heading: s.heading.clone(),
                    excerpt: s.excerpt.clone(),
                })
                .collect()
        })
        .unwrap_or_default();

    let processed = post_process_synthesis(&raw_synthesis, &web_sources, &prior_section_sources);

    if let Value::Object(ref mut map) = data {
        map.insert("synthesis".to_string(), Value::String(processed.clone()));
    }

    Ok(StageResult {
        text: call_result.text,
        summary: "Synthesized draft answer".to_string(),
        usage: TokenUsage {
            input_tokens: call_result.usage.input_tokens,
            output_tokens: call_result.usage.output_tokens,
        },
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_structured_web_sources() {
        let stage1 = json!({
            "web_sources": [
                {"url": "https://a.example", "title": "A", "snippet": "a snippet"}
            ]
        });
        let sources = web_sources_from_stage1(Some(&stage1));
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].url, "https://a.example");
        assert_eq!(sources[0].insight, "a snippet");
    }

    #[test]
    fn extracts_legacy_insights_shape() {
        let stage1 = json!({
            "insights": [{"url": "https://b.example", "insight": "b insight"}]
        });
        let sources = web_sources_from_stage1(Some(&stage1));
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].insight, "b insight");
    }

    #[test]
    fn no_stage1_yields_no_web_sources() {
        assert!(web_sources_from_stage1(None).is_empty());
    }
}
