//! Context assembly and token budgeting.
//!
//! Grounded on `cloudllm::context_strategy`'s threshold-as-builder-pattern
//! (`TrimStrategy::new(threshold)`) for the public-function-plus-doctest
//! style, generalized from "decide whether to compact a session" to
//! "assemble an XML-framed prompt body and decide how much output budget is
//! left".

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

/// One retrieved paragraph, in the canonical shape every MCP bridge method
/// maps provider-specific field names into.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalParagraph {
    pub id: String,
    pub text: String,
    pub score: f64,
    pub source: String,
}

/// `estimateTokens(text) = ceil((chars / 4) * 1.10)`. Intentionally
/// conservative (over-estimates).
pub fn estimate_tokens(text: &str) -> usize {
    let chars = text.chars().count() as f64;
    ((chars / 4.0) * 1.10).ceil() as usize
}

/// Escapes the five XML special characters for use in attribute values and
/// text content.
pub fn xml_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

/// Truncates a score-sorted paragraph list so the cumulative
/// `estimate_tokens` of the returned texts stays strictly under `budget`.
/// Returns a prefix of the input (preserving order).
pub fn truncate_by_token_budget(
    paragraphs: &[RetrievalParagraph],
    budget: usize,
) -> Vec<RetrievalParagraph> {
    let mut out = Vec::new();
    let mut used = 0usize;
    for p in paragraphs {
        let cost = estimate_tokens(&p.text);
        if used + cost >= budget {
            break;
        }
        used += cost;
        out.push(p.clone());
    }
    out
}

fn wrap_paragraph(p: &RetrievalParagraph) -> String {
    format!(
        "<PARAGRAPH id=\"{}\" score=\"{:.4}\" source=\"{}\">{}</PARAGRAPH>",
        xml_escape(&p.id),
        p.score,
        xml_escape(&p.source),
        xml_escape(&p.text)
    )
}

/// Inputs accepted by [`build_stage_context`], each optional and appended
/// in a fixed order.
#[derive(Debug, Clone, Default)]
pub struct StageContextInput<'a> {
    pub query_plan: Option<&'a str>,
    /// `(stage_name, text)` pairs rendered as `STAGE_OUTPUT_{NAME}` blocks.
    pub prior_stage_outputs: Vec<(&'a str, &'a str)>,
    pub retrieval_paragraphs: Vec<RetrievalParagraph>,
    pub retrieval_token_budget: Option<usize>,
    pub repair_feedback: Option<&'a str>,
    pub web_sources: Option<&'a str>,
    pub web_research_context: Option<&'a str>,
    pub prior_answer: Option<&'a str>,
    pub prior_sections: Option<&'a str>,
}

/// Assembles the XML-framed prompt body for a stage handler.
pub fn build_stage_context(input: &StageContextInput) -> String {
    let mut sections = Vec::new();

    if let Some(plan) = input.query_plan {
        sections.push(format!("<QUERY_PLAN>{}</QUERY_PLAN>", xml_escape(plan)));
    }

    for (name, text) in &input.prior_stage_outputs {
        let tag = format!("STAGE_OUTPUT_{}", name.to_uppercase());
        sections.push(format!("<{tag}>{}</{tag}>", xml_escape(text), tag = tag));
    }

    if !input.retrieval_paragraphs.is_empty() {
        let mut sorted = input.retrieval_paragraphs.clone();
        sorted.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        let budgeted = match input.retrieval_token_budget {
            Some(budget) => truncate_by_token_budget(&sorted, budget),
            None => sorted,
        };
        let inner: String = budgeted.iter().map(wrap_paragraph).collect::<Vec<_>>().join("\n");
        sections.push(format!("<ISA_CONTEXT>\n{}\n</ISA_CONTEXT>", inner));
    }

    if let Some(feedback) = input.repair_feedback {
        sections.push(format!(
            "<REPAIR_FEEDBACK>{}</REPAIR_FEEDBACK>",
            xml_escape(feedback)
        ));
    }

    if let Some(web) = input.web_sources {
        sections.push(format!("<WEB_SOURCES>{}</WEB_SOURCES>", xml_escape(web)));
    }
    if let Some(ctx) = input.web_research_context {
        sections.push(format!(
            "<WEB_RESEARCH_CONTEXT>{}</WEB_RESEARCH_CONTEXT>",
            xml_escape(ctx)
        ));
    }
    if let Some(answer) = input.prior_answer {
        sections.push(format!(
            "<PRIOR_ANSWER>{}</PRIOR_ANSWER>",
            xml_escape(answer)
        ));
    }
    if let Some(prior_sections) = input.prior_sections {
        sections.push(format!(
            "<PRIOR_SECTIONS>{}</PRIOR_SECTIONS>",
            xml_escape(prior_sections)
        ));
    }

    sections.join("\n\n")
}

/// `calculateMaxTokens(estimatedInput, desiredOutput) = min(desiredOutput,
/// contextWindow - estimatedInput)`, erroring when headroom falls below the
/// minimum-output floor.
pub struct ContextBudgetManager {
    pub context_window: usize,
    pub min_output_budget: usize,
}

impl ContextBudgetManager {
    pub fn new(context_window: usize, min_output_budget: usize) -> Self {
        ContextBudgetManager {
            context_window,
            min_output_budget,
        }
    }

    pub fn calculate_max_tokens(
        &self,
        estimated_input: usize,
        desired_output: usize,
    ) -> PipelineResult<usize> {
        if estimated_input + self.min_output_budget > self.context_window {
            return Err(Box::new(PipelineError::ContextOverflow {
                estimated_input,
                min_output: self.min_output_budget,
                context_window: self.context_window,
            }));
        }
        let headroom = self.context_window - estimated_input;
        Ok(desired_output.min(headroom))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_tokens_matches_formula() {
        // 40 chars -> ceil((40/4)*1.10) = ceil(11.0) = 11
        let text = "a".repeat(40);
        assert_eq!(estimate_tokens(&text), 11);
    }

    #[test]
    fn estimate_tokens_is_at_least_chars_over_four() {
        for len in [0, 1, 3, 7, 17, 123, 9001] {
            let text = "x".repeat(len);
            let estimate = estimate_tokens(&text);
            let floor = ((len as f64) / 4.0).ceil() as usize;
            assert!(estimate >= floor, "len={} estimate={} floor={}", len, estimate, floor);
        }
    }

    #[test]
    fn xml_escape_covers_all_five_entities() {
        assert_eq!(
            xml_escape("<a> & \"b\" 'c'"),
            "&lt;a&gt; &amp; &quot;b&quot; &apos;c&apos;"
        );
    }

    #[test]
    fn truncate_returns_prefix_strictly_under_budget() {
        let paragraphs: Vec<RetrievalParagraph> = (0..5)
            .map(|i| RetrievalParagraph {
                id: format!("p{}", i),
                text: "word ".repeat(20),
                score: 1.0 - (i as f64) * 0.1,
                source: "kb".into(),
            })
            .collect();
        let per_item = estimate_tokens(&paragraphs[0].text);
        let budget = per_item * 3;
        let result = truncate_by_token_budget(&paragraphs, budget);
        assert!(result.len() <= 2);
        let total: usize = result.iter().map(|p| estimate_tokens(&p.text)).sum();
        assert!(total < budget);
        for (a, b) in result.iter().zip(paragraphs.iter()) {
            assert_eq!(a.id, b.id);
        }
    }

    #[test]
    fn budget_manager_returns_min_of_desired_and_headroom() {
        let mgr = ContextBudgetManager::new(100_000, 1_000);
        let max = mgr.calculate_max_tokens(50_000, 8_000).unwrap();
        assert_eq!(max, 8_000);
        let max = mgr.calculate_max_tokens(95_000, 8_000).unwrap();
        assert_eq!(max, 5_000);
    }

    #[test]
    fn budget_manager_errors_below_floor() {
        let mgr = ContextBudgetManager::new(100_000, 2_000);
        let result = mgr.calculate_max_tokens(99_000, 8_000);
        assert!(result.is_err());
    }

    #[test]
    fn build_stage_context_orders_sections_correctly() {
        let input = StageContextInput {
            query_plan: Some("plan text"),
            repair_feedback: Some("citation X failed"),
            retrieval_paragraphs: vec![RetrievalParagraph {
                id: "p1".into(),
                text: "body".into(),
                score: 0.9,
                source: "kb".into(),
            }],
            ..Default::default()
        };
        let ctx = build_stage_context(&input);
        let plan_pos = ctx.find("QUERY_PLAN").unwrap();
        let isa_pos = ctx.find("ISA_CONTEXT").unwrap();
        let feedback_pos = ctx.find("REPAIR_FEEDBACK").unwrap();
        assert!(plan_pos < isa_pos);
        assert!(isa_pos < feedback_pos);
    }
}
