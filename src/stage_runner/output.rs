//! Stage 5: `output`.
//!
//! Deterministic, no LLM involved: assembles the final answer from stages
//! 0, 1, 3, and 4 plus optional follow-up sections, renders it through the
//! injected [`AnswerRenderer`], and persists both the rendered document and
//! a machine-readable companion for future follow-up sessions.

use std::path::Path;

use serde_json::Value;

use crate::error::{PipelineError, PipelineResult};
use crate::renderer::FinalAnswer;
use crate::state::{StageResult, TokenUsage};
use crate::summary::PersistedAnswer;

use super::{StageHandlerInput, StageRunner};

const DEFAULT_FILE_NAME: &str = "research-answer.md";

fn citations_from_stage3(stage3_data: &Value) -> Vec<Value> {
    stage3_data
        .get("citations")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn cited_paragraph_ids(citations: &[Value]) -> Vec<String> {
    citations
        .iter()
        .filter_map(|c| c.get("paragraph_id").and_then(Value::as_str).map(str::to_string))
        .collect()
}

fn web_references_from_stage1(stage1_data: &Value) -> Vec<Value> {
    stage1_data
        .get("web_sources")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

pub async fn run(runner: &StageRunner, input: StageHandlerInput<'_>) -> PipelineResult<StageResult> {
    let stage0_data = input
        .state
        .get_stage_output(0)
        .map(|r| r.data.clone())
        .unwrap_or(Value::Null);
    let stage1_data = input
        .state
        .get_stage_output(1)
        .map(|r| r.data.clone())
        .unwrap_or(Value::Null);
    let stage3_data = input
        .state
        .get_stage_output(3)
        .map(|r| r.data.clone())
        .unwrap_or(Value::Null);

    let query = stage0_data
        .get("original_query")
        .and_then(Value::as_str)
        .unwrap_or(input.user_message)
        .to_string();
    let synthesis = stage3_data
        .get("synthesis")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let citations = citations_from_stage3(&stage3_data);
    let sub_queries = input.state.sub_query_texts();
    let web_references = web_references_from_stage1(&stage1_data);
    let follow_up_number = input.follow_up_context.map(|ctx| ctx.follow_up_number).unwrap_or(0);

    let answer = FinalAnswer {
        query: query.clone(),
        synthesis: synthesis.clone(),
        citations: citations.clone(),
        sub_queries: sub_queries.clone(),
        web_references: web_references.clone(),
        follow_up_number,
    };

    let rendered = runner.renderer.render(&answer)?;

    let file_name = input
        .agent_config
        .output
        .file_name
        .clone()
        .unwrap_or_else(|| DEFAULT_FILE_NAME.to_string());

    let plans_dir = input.session_path.join("plans");
    let data_dir = input.session_path.join("data");
    write_file(&plans_dir, &file_name, &rendered)?;

    let persisted = PersistedAnswer {
        version: Some(1),
        answer: synthesis.clone(),
        query: Some(query.clone()),
        sub_queries: sub_queries.clone(),
        cited_paragraph_ids: cited_paragraph_ids(&citations),
        follow_up_number,
    };
    let persisted_json = serde_json::to_string_pretty(&persisted).map_err(|e| {
        Box::new(PipelineError::StateLoadFailure {
            path: "answer.json".to_string(),
            detail: e.to_string(),
        }) as Box<dyn std::error::Error + Send + Sync>
    })?;
    write_file(&data_dir, "answer.json", &persisted_json)?;

    let data = serde_json::json!({
        "query": query,
        "file_name": file_name,
        "citation_count": citations.len(),
        "web_reference_count": web_references.len(),
        "follow_up_number": follow_up_number,
    });

    Ok(StageResult {
        text: rendered,
        summary: format!("Wrote final answer to plans/{}", file_name),
        usage: TokenUsage::default(),
        data,
    })
}

fn write_file(dir: &Path, file_name: &str, content: &str) -> PipelineResult<()> {
    std::fs::create_dir_all(dir)?;
    std::fs::write(dir.join(file_name), content)?;
    Ok(())
}
