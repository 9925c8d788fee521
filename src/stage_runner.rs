//! The pure dispatcher over the six stage handlers.
//!
//! Grounded on `cloudllm::orchestration::Orchestration::run`'s
//! dispatch-by-mode pattern (match on a discriminant, delegate to one of
//! several `execute_*` methods that share the same signature) and on
//! `planner.rs`'s "compose context, call provider, parse typed result"
//! per-step shape. The runner itself holds no pipeline state; it is
//! polymorphic over `{call, bridge, progress}` so the same dispatcher works
//! across fresh runs, resumes, and repair iterations.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::config::AgentConfig;
use crate::context::ContextBudgetManager;
use crate::error::{PipelineError, PipelineResult};
use crate::events::SubstepKind;
use crate::llm_provider::{LlmCallParams, LlmProvider};
use crate::mcp_bridge::McpBridge;
use crate::renderer::AnswerRenderer;
use crate::state::{PipelineState, StageResult};
use crate::summary::FollowUpContext;

pub mod analyze_query;
pub mod output;
pub mod retrieve;
pub mod synthesize;
pub mod verify;
pub mod websearch_calibration;

/// Input bundle a stage handler receives.
pub struct StageHandlerInput<'a> {
    pub state: &'a PipelineState,
    pub agent_config: &'a AgentConfig,
    pub user_message: &'a str,
    pub follow_up_context: Option<&'a FollowUpContext>,
    pub repair_feedback: Option<&'a str>,
    pub repair_iteration: u32,
    pub session_path: &'a std::path::Path,
}

/// Progress-callback signature for substep streaming to a UI.
pub type ProgressCallback = Arc<dyn Fn(SubstepKind) + Send + Sync>;

/// Polymorphic over `{call, bridge, progress}`: the model client, the
/// optional MCP bridge (absent means web/KB tools are unavailable), and an
/// optional progress sink.
pub struct StageRunner {
    pub llm: Arc<dyn LlmProvider>,
    pub bridge: Option<Arc<dyn McpBridge>>,
    pub renderer: Arc<dyn AnswerRenderer>,
    pub prompts_dir: Option<PathBuf>,
    progress: Option<ProgressCallback>,
    prompt_cache: DashMap<PathBuf, Arc<String>>,
}

impl StageRunner {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        bridge: Option<Arc<dyn McpBridge>>,
        renderer: Arc<dyn AnswerRenderer>,
    ) -> Self {
        StageRunner {
            llm,
            bridge,
            renderer,
            prompts_dir: None,
            progress: None,
            prompt_cache: DashMap::new(),
        }
    }

    pub fn with_prompts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.prompts_dir = Some(dir.into());
        self
    }

    /// Single setter for a progress callback used for substep streaming.
    pub fn set_progress_callback(&mut self, callback: ProgressCallback) {
        self.progress = Some(callback);
    }

    pub(crate) fn emit_substep(&self, substep: SubstepKind) {
        if let Some(cb) = &self.progress {
            cb(substep);
        }
    }

    /// Loads `{promptsDir}/stage-{id}-{hyphenated-name}.md`, caching file
    /// content process-wide keyed by absolute path (monotonic: never
    /// invalidated within a process lifetime). Falls back to
    /// `fallback` when no file exists. Substitutes `{{key}}` placeholders.
    pub(crate) fn load_prompt(
        &self,
        stage_id: usize,
        hyphenated_name: &str,
        placeholders: &[(&str, &str)],
        fallback: &str,
    ) -> String {
        let template = match &self.prompts_dir {
            None => fallback.to_string(),
            Some(dir) => {
                let path = dir.join(format!("stage-{}-{}.md", stage_id, hyphenated_name));
                if let Some(cached) = self.prompt_cache.get(&path) {
                    (**cached).clone()
                } else if let Ok(content) = std::fs::read_to_string(&path) {
                    self.prompt_cache.insert(path, Arc::new(content.clone()));
                    content
                } else {
                    fallback.to_string()
                }
            }
        };
        substitute_placeholders(&template, placeholders)
    }

    pub(crate) fn desired_max_tokens(
        &self,
        agent_config: &AgentConfig,
        stage_name: &str,
        estimated_input: usize,
    ) -> PipelineResult<usize> {
        let desired = agent_config.desired_output_tokens(stage_name);
        let budget_manager = ContextBudgetManager::new(
            agent_config.orchestrator.effective_context_window(),
            agent_config.orchestrator.effective_min_output_budget(),
        );
        budget_manager.calculate_max_tokens(estimated_input, desired)
    }

    pub(crate) async fn call_llm(
        &self,
        stage_name: &str,
        agent_config: &AgentConfig,
        system_prompt: String,
        user_message: String,
    ) -> PipelineResult<crate::llm_provider::LlmCallResult> {
        let estimated_input =
            crate::context::estimate_tokens(&system_prompt) + crate::context::estimate_tokens(&user_message);
        let max_tokens = self.desired_max_tokens(agent_config, stage_name, estimated_input)?;
        let model = agent_config.orchestrator.effective_model().to_string();
        self.emit_substep(SubstepKind::LlmStart { model: model.clone() });
        let params = LlmCallParams::new(system_prompt, user_message)
            .with_model(model.clone())
            .with_desired_max_tokens(max_tokens)
            .with_effort(agent_config.orchestrator.effective_effort());
        let result = self.llm.call(params, None).await?;
        self.emit_substep(SubstepKind::LlmComplete {
            model,
            tokens_used: result.usage.output_tokens,
        });
        Ok(result)
    }

    /// Dispatches on stage name, the single entry point the driver calls.
    pub async fn run_stage(
        &self,
        stage_name: &str,
        input: StageHandlerInput<'_>,
    ) -> PipelineResult<StageResult> {
        match stage_name {
            "analyze_query" => analyze_query::run(self, input).await,
            "websearch_calibration" => websearch_calibration::run(self, input).await,
            "retrieve" => retrieve::run(self, input).await,
            "synthesize" => synthesize::run(self, input).await,
            "verify" => verify::run(self, input).await,
            "output" => output::run(self, input).await,
            other => Err(Box::new(PipelineError::StageFailed {
                stage: usize::MAX,
                detail: format!("unknown stage handler '{}'", other),
            })),
        }
    }
}

fn substitute_placeholders(template: &str, placeholders: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in placeholders {
        out = out.replace(&format!("{{{{{}}}}}", key), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_named_placeholders() {
        let out = substitute_placeholders("Query: {{query}}, today: {{today}}", &[
            ("query", "ISA 315"),
            ("today", "2026-07-30"),
        ]);
        assert_eq!(out, "Query: ISA 315, today: 2026-07-30");
    }

    #[test]
    fn leaves_unknown_placeholders_untouched() {
        let out = substitute_placeholders("Hello {{name}}", &[("query", "x")]);
        assert_eq!(out, "Hello {{name}}");
    }
}
