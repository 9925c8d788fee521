//! Pipeline summaries and follow-up-session context loading.
//!
//! `PipelineSummary::generate` is grounded on `cloudllm::thought_chain`'s
//! habit of deriving a compact report from an append-only log
//! (`ThoughtChain::resolve_context`); `FollowUpContext::load` reads that
//! same kind of prior artifact back in, the way `resolve_context` replays
//! prior thoughts to rebuild context for a new turn.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::context::xml_escape;
use crate::state::PipelineState;

const MAX_SYNTHESIS_EXCERPT: usize = 800;
const MAX_PRIOR_EXCERPT: usize = 500;
const MAX_PRIOR_SUB_QUERIES_IN_HINT: usize = 5;

/// Headings that are structural/meta rather than research content; the
/// follow-up loader drops them when splitting a prior answer into sections.
const METADATA_HEADINGS: &[&str] = &["sources", "references", "appendix", "metadata", "citations"];

fn truncate_at_word_boundary(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max_len).collect();
    if let Some(last_space) = truncated.rfind(char::is_whitespace) {
        truncated.truncate(last_space);
    }
    format!("{}…", truncated.trim_end())
}

/// A compact, derived export written after every run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub original_query: Option<String>,
    pub synthesis_excerpt: Option<String>,
    pub citation_count: usize,
    pub confidence_label: Option<String>,
    pub verification_scores: Vec<f64>,
    pub completed_stages: Vec<usize>,
    pub partial: bool,
    pub exit_reason: ExitReason,
    pub output_path: Option<String>,
    pub query_decomposition: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Completed,
    Paused,
    Error,
    Breakout,
}

impl PipelineSummary {
    /// Builds a summary from accumulated stage outputs, truncating long
    /// text and extracting citations/scores defensively — every field here
    /// is optional in the source data, so absence never panics.
    pub fn generate(state: &PipelineState, total_stages: usize, exit_reason: ExitReason) -> Self {
        let original_query = state.original_query();

        let synthesis_excerpt = state
            .get_stage_output(3)
            .map(|r| truncate_with_ellipsis(&r.text, MAX_SYNTHESIS_EXCERPT));

        let citation_count = state
            .get_stage_output(3)
            .and_then(|r| r.data.get("citations"))
            .and_then(|c| c.as_array())
            .map(|arr| arr.len())
            .unwrap_or(0);

        let confidence_label = state
            .get_stage_output(4)
            .and_then(|r| r.data.get("confidence_label"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let verification_scores = state
            .get_stage_output(4)
            .and_then(|r| r.data.get("scores"))
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|x| x.as_f64()).collect())
            .unwrap_or_default();

        let completed_stages: Vec<usize> = (0..total_stages)
            .filter(|i| state.get_stage_output(*i).is_some())
            .collect();

        let partial = completed_stages.len() < total_stages;

        let output_path = state
            .get_stage_output(5)
            .and_then(|r| r.data.get("output_path"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let query_decomposition = state
            .get_stage_output(0)
            .map(|r| r.data.clone());

        PipelineSummary {
            original_query,
            synthesis_excerpt,
            citation_count,
            confidence_label,
            verification_scores,
            completed_stages,
            partial,
            exit_reason,
            output_path,
            query_decomposition,
        }
    }

    pub fn save_to(&self, dir: impl AsRef<Path>) -> std::io::Result<()> {
        let path = dir.as_ref().join("data").join("pipeline-summary.json");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
    }
}

fn truncate_with_ellipsis(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(max_len).collect();
        format!("{}…", truncated)
    }
}

/// One `## `-delimited section of a prior answer, numbered `P1, P2, …`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorSection {
    pub id: String,
    pub heading: String,
    pub excerpt: String,
}

/// The machine-readable final answer written by stage 5, re-read here
/// on follow-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedAnswer {
    #[serde(default)]
    pub version: Option<u32>,
    pub answer: String,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub sub_queries: Vec<String>,
    #[serde(default)]
    pub cited_paragraph_ids: Vec<String>,
    #[serde(default)]
    pub follow_up_number: u32,
}

/// Derived context for a follow-up session.
#[derive(Debug, Clone)]
pub struct FollowUpContext {
    pub follow_up_number: u32,
    pub prior_answer: String,
    pub prior_query: Option<String>,
    pub prior_sub_queries: Vec<String>,
    pub prior_cited_paragraph_ids: Vec<String>,
    pub prior_sections: Vec<PriorSection>,
}

impl FollowUpContext {
    /// Reads `{sessionsDir}/{previousSessionId}/data/answer.json`,
    /// validates it, and parses it into sections. Returns `None` on any
    /// schema or I/O failure — a missing or malformed prior session degrades
    /// to a fresh-session run rather than an error.
    pub fn load(sessions_dir: impl AsRef<Path>, previous_session_id: &str) -> Option<Self> {
        let path = sessions_dir
            .as_ref()
            .join(previous_session_id)
            .join("data")
            .join("answer.json");
        let raw = std::fs::read_to_string(path).ok()?;
        let parsed: PersistedAnswer = serde_json::from_str(&raw).ok()?;

        if matches!(parsed.version, Some(v) if v != 1) {
            return None;
        }
        if parsed.answer.trim().is_empty() {
            return None;
        }

        let prior_sections = parse_sections(&parsed.answer);

        Some(FollowUpContext {
            follow_up_number: parsed.follow_up_number + 1,
            prior_answer: parsed.answer,
            prior_query: parsed.query,
            prior_sub_queries: parsed.sub_queries,
            prior_cited_paragraph_ids: parsed.cited_paragraph_ids,
            prior_sections,
        })
    }
}

fn parse_sections(answer: &str) -> Vec<PriorSection> {
    let mut sections = Vec::new();
    let mut current_heading: Option<String> = None;
    let mut current_body = String::new();
    let mut index = 0usize;

    let mut flush = |heading: Option<String>, body: &str, sections: &mut Vec<PriorSection>, index: &mut usize| {
        if let Some(heading) = heading {
            if !METADATA_HEADINGS.contains(&heading.to_lowercase().as_str()) {
                *index += 1;
                sections.push(PriorSection {
                    id: format!("P{}", index),
                    heading,
                    excerpt: truncate_at_word_boundary(body.trim(), MAX_PRIOR_EXCERPT),
                });
            }
        }
    };

    for line in answer.lines() {
        if let Some(heading) = line.strip_prefix("## ") {
            flush(current_heading.take(), &current_body, &mut sections, &mut index);
            current_heading = Some(heading.trim().to_string());
            current_body = String::new();
        } else {
            current_body.push_str(line);
            current_body.push('\n');
        }
    }
    flush(current_heading, &current_body, &mut sections, &mut index);

    sections
}

/// Renders an XML-safe summary with at most 5 prior sub-queries plus all
/// prior section headings, followed by a "do not duplicate" directive.
pub fn build_prior_context_hint(ctx: &FollowUpContext) -> String {
    let sub_queries: Vec<&String> = ctx
        .prior_sub_queries
        .iter()
        .take(MAX_PRIOR_SUB_QUERIES_IN_HINT)
        .collect();
    let sub_queries_xml = sub_queries
        .iter()
        .map(|q| format!("<SUB_QUERY>{}</SUB_QUERY>", xml_escape(q)))
        .collect::<Vec<_>>()
        .join("\n");
    let headings_xml = ctx
        .prior_sections
        .iter()
        .map(|s| format!("<HEADING id=\"{}\">{}</HEADING>", xml_escape(&s.id), xml_escape(&s.heading)))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "<PRIOR_RESEARCH_CONTEXT>\n<FOLLOW_UP_NUMBER>{}</FOLLOW_UP_NUMBER>\n<PRIOR_SUB_QUERIES>\n{}\n</PRIOR_SUB_QUERIES>\n<PRIOR_SECTION_HEADINGS>\n{}\n</PRIOR_SECTION_HEADINGS>\n<DIRECTIVE>Do not duplicate prior research; build on it.</DIRECTIVE>\n</PRIOR_RESEARCH_CONTEXT>",
        ctx.follow_up_number, sub_queries_xml, headings_xml
    )
}
