//! Stage 4: `verify`.
//!
//! A tool-call stage: every citation stage 3 produced is checked against
//! the bridge's citation verifier. Any failure sets `needs_repair: true`
//! and produces feedback text the repair loop feeds back into stage 3.

use serde_json::Value;

use crate::error::PipelineResult;
use crate::mcp_bridge::CitationVerifyParams;
use crate::state::{StageResult, TokenUsage};

use super::{StageHandlerInput, StageRunner};

struct Citation {
    citation_id: String,
    paragraph_id: String,
    claim: String,
}

fn citations_from_stage3(stage3_data: &Value) -> Vec<Citation> {
    stage3_data
        .get("citations")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .enumerate()
                .filter_map(|(i, c)| {
                    let paragraph_id = c.get("paragraph_id").and_then(Value::as_str)?.to_string();
                    let claim = c.get("claim").and_then(Value::as_str).unwrap_or_default().to_string();
                    let citation_id = c
                        .get("citation_id")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("c{}", i + 1));
                    Some(Citation { citation_id, paragraph_id, claim })
                })
                .collect()
        })
        .unwrap_or_default()
}

pub async fn run(runner: &StageRunner, input: StageHandlerInput<'_>) -> PipelineResult<StageResult> {
    let stage3_data = input
        .state
        .get_stage_output(3)
        .map(|r| r.data.clone())
        .unwrap_or(Value::Null);
    let citations = citations_from_stage3(&stage3_data);

    let bridge = match &runner.bridge {
        None => {
            return Ok(StageResult::skipped(
                "Citation verification unavailable",
                serde_json::json!({ "skipped": true, "needsRepair": false, "verifications": [] }),
            ));
        }
        Some(bridge) => bridge,
    };

    let mut verifications = Vec::new();
    let mut failures = Vec::new();

    for citation in &citations {
        runner.emit_substep(crate::events::SubstepKind::McpStart {
            tool_name: "citation_verify".to_string(),
        });
        let params = CitationVerifyParams {
            citation_id: citation.citation_id.clone(),
            paragraph_id: citation.paragraph_id.clone(),
            claim: citation.claim.clone(),
        };
        match bridge.citation_verify(params).await {
            Ok(verification) => {
                runner.emit_substep(crate::events::SubstepKind::McpResult {
                    tool_name: "citation_verify".to_string(),
                    success: verification.verified,
                });
                if !verification.verified {
                    failures.push(format!(
                        "citation {} (paragraph {}): {}",
                        citation.citation_id,
                        citation.paragraph_id,
                        verification.reason.clone().unwrap_or_else(|| "not supported by cited text".to_string())
                    ));
                }
                verifications.push(serde_json::to_value(&verification).unwrap_or(Value::Null));
            }
            Err(e) => {
                runner.emit_substep(crate::events::SubstepKind::McpResult {
                    tool_name: "citation_verify".to_string(),
                    success: false,
                });
                failures.push(format!(
                    "citation {} (paragraph {}): verification call failed: {}",
                    citation.citation_id, citation.paragraph_id, e
                ));
            }
        }
    }

    let needs_repair = !failures.is_empty();
    let feedback = if needs_repair {
        format!(
            "The following citations failed verification and must be fixed or removed:\n{}",
            failures.join("\n")
        )
    } else {
        String::new()
    };

    let summary = if needs_repair {
        format!("{} of {} citations failed verification", failures.len(), citations.len())
    } else {
        format!("All {} citations verified", citations.len())
    };

    let data = serde_json::json!({
        "needsRepair": needs_repair,
        "verifications": verifications,
        "feedback": feedback,
        "failed_count": failures.len(),
        "total_count": citations.len(),
    });

    Ok(StageResult {
        text: String::new(),
        summary,
        usage: TokenUsage::default(),
        data,
    })
}
