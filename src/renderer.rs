//! The presentation-layer renderer collaborator (out of scope).
//!
//! Grounded on the "external collaborator as trait object" shape used for
//! `ContextStrategy` in `cloudllm::agent` (`Box<dyn ContextStrategy>`
//! injected into the agent rather than hand-coded inline): the output
//! stage handler holds a `Box<dyn AnswerRenderer>` and never renders or
//! parses markdown for display itself.

use serde::Serialize;

use crate::error::PipelineResult;

/// Aggregate assembled by the output stage handler from stages 0, 1, 3,
/// and 4, plus optional follow-up sections.
#[derive(Debug, Clone, Serialize)]
pub struct FinalAnswer {
    pub query: String,
    pub synthesis: String,
    pub citations: Vec<serde_json::Value>,
    pub sub_queries: Vec<String>,
    pub web_references: Vec<serde_json::Value>,
    pub follow_up_number: u32,
}

/// Out-of-scope presentation collaborator invoked by the output stage.
pub trait AnswerRenderer: Send + Sync {
    /// Renders `answer` into the final document written to
    /// `{sessionPath}/plans/{fileName}`.
    fn render(&self, answer: &FinalAnswer) -> PipelineResult<String>;
}

/// Minimal Markdown renderer used by tests and as a default when no richer
/// collaborator is supplied; not meant to be the production renderer.
pub struct DefaultMarkdownRenderer;

impl AnswerRenderer for DefaultMarkdownRenderer {
    fn render(&self, answer: &FinalAnswer) -> PipelineResult<String> {
        let mut doc = format!("# {}\n\n{}\n", answer.query, answer.synthesis);
        if !answer.citations.is_empty() {
            doc.push_str("\n## Citations\n");
            for citation in &answer.citations {
                doc.push_str(&format!("- {}\n", citation));
            }
        }
        Ok(doc)
    }
}
