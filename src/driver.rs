//! The Orchestrator Driver: the top-level control loop.
//!
//! Grounded on `cloudllm::orchestration::Orchestration::run`'s round-based
//! loop (advance an index, execute, checkpoint, decide whether to
//! continue) and on `event.rs`'s split between a durable log and a live,
//! consumer-facing event channel. Exposed as a `tokio_stream` `Stream` over
//! `OrchestratorEvent`, matching the "async generator control flow... a
//! push-based channel is an acceptable substitute" allowance.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::AgentConfig;
use crate::cost_tracker::CostTracker;
use crate::error::PipelineError;
use crate::events::OrchestratorEvent;
use crate::mcp_bridge::McpBridge;
use crate::pause_formatter::{format_stage_0_pause, format_stage_1_pause};
use crate::renderer::AnswerRenderer;
use crate::llm_provider::LlmProvider;
use crate::stage_runner::{StageHandlerInput, StageRunner};
use crate::state::{PipelineState, StageEventKind, TokenUsage};
use crate::summary::{ExitReason, FollowUpContext, PipelineSummary};

const EVENT_CHANNEL_CAPACITY: usize = 64;
const RESUME_SKIP_SUBSTRINGS: &[&str] = &["no web search", "proceed directly", "skip web", "no, proceed"];

/// Recognizes stage-0→1 skip-web-search intent during resume: exact `B`/`b.`,
/// or a case-insensitive substring match against a small fixed set of
/// phrases. Everything else defaults to "do not skip".
fn parses_as_skip_intent(user_response: &str) -> bool {
    let trimmed = user_response.trim();
    if trimmed == "B" || trimmed == "b." {
        return true;
    }
    let lower = trimmed.to_lowercase();
    RESUME_SKIP_SUBSTRINGS.iter().any(|needle| lower.contains(needle))
}

/// A classified reply to a breakout confirmation prompt. Numeric shortcuts
/// only; exact matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakoutReply {
    Confirm,
    Deny,
    ExplicitBreakout,
}

/// The breakout-intent protocol names three numeric shortcuts (`1`/`2`/`3`)
/// but only a two-way outcome (breakout or resumed) for the confirm/deny
/// exchange. `ExplicitBreakout` is treated identically to `Confirm` here —
/// see DESIGN.md's open-question decision.
pub fn classify_breakout_reply(text: &str) -> Option<BreakoutReply> {
    match text.trim() {
        "1" | "1." => Some(BreakoutReply::Confirm),
        "2" | "2." => Some(BreakoutReply::Deny),
        "3" | "3." => Some(BreakoutReply::ExplicitBreakout),
        _ => None,
    }
}

/// One orchestrator instance owns exactly one session's durable state; the
/// session id is bound at construction rather than threaded through every
/// `run`/`resume`/`resumeFromBreakout` call.
pub struct PipelineOrchestrator {
    session_id: String,
    llm: Arc<dyn LlmProvider>,
    bridge: Option<Arc<dyn McpBridge>>,
    renderer: Arc<dyn AnswerRenderer>,
    prompts_dir: Option<PathBuf>,
    sessions_dir: PathBuf,
    previous_session_id: Option<String>,
}

impl PipelineOrchestrator {
    pub fn new(
        session_id: impl Into<String>,
        llm: Arc<dyn LlmProvider>,
        renderer: Arc<dyn AnswerRenderer>,
        sessions_dir: impl Into<PathBuf>,
    ) -> Self {
        PipelineOrchestrator {
            session_id: session_id.into(),
            llm,
            bridge: None,
            renderer,
            prompts_dir: None,
            sessions_dir: sessions_dir.into(),
            previous_session_id: None,
        }
    }

    /// Convenience constructor that mints a fresh session id.
    pub fn new_session(
        llm: Arc<dyn LlmProvider>,
        renderer: Arc<dyn AnswerRenderer>,
        sessions_dir: impl Into<PathBuf>,
    ) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), llm, renderer, sessions_dir)
    }

    pub fn with_bridge(mut self, bridge: Arc<dyn McpBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn with_prompts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.prompts_dir = Some(dir.into());
        self
    }

    /// Marks this run as a follow-up extending `previous_session_id`'s
    /// research.
    pub fn with_previous_session(mut self, previous_session_id: impl Into<String>) -> Self {
        self.previous_session_id = Some(previous_session_id.into());
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn session_path(&self) -> PathBuf {
        self.sessions_dir.join(&self.session_id)
    }

    fn build_stage_runner(
        &self,
        tx: mpsc::Sender<OrchestratorEvent>,
        current_stage: Arc<AtomicUsize>,
    ) -> StageRunner {
        let mut runner = StageRunner::new(self.llm.clone(), self.bridge.clone(), self.renderer.clone());
        if let Some(dir) = &self.prompts_dir {
            runner = runner.with_prompts_dir(dir.clone());
        }
        runner.set_progress_callback(Arc::new(move |substep| {
            let stage = current_stage.load(Ordering::Relaxed);
            let _ = tx.try_send(OrchestratorEvent::OrchestratorSubstep { stage, substep });
        }));
        runner
    }

    fn error_stream(message: String) -> ReceiverStream<OrchestratorEvent> {
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(OrchestratorEvent::OrchestratorError {
            stage: usize::MAX,
            message,
        });
        ReceiverStream::new(rx)
    }

    fn spawn(
        &self,
        state: PipelineState,
        user_message: String,
        agent_config: AgentConfig,
        start_stage: usize,
        skip_stages: Vec<usize>,
    ) -> ReceiverStream<OrchestratorEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let current_stage = Arc::new(AtomicUsize::new(start_stage));
        let stage_runner = self.build_stage_runner(tx.clone(), current_stage.clone());
        let session_path = self.session_path();
        let sessions_dir = self.sessions_dir.clone();
        tokio::spawn(async move {
            drive(
                stage_runner,
                sessions_dir,
                session_path,
                state,
                user_message,
                agent_config,
                start_stage,
                skip_stages,
                current_stage,
                tx,
            )
            .await;
        });
        ReceiverStream::new(rx)
    }

    /// `run(userMessage, agentConfig)`.
    pub fn run(&self, user_message: String, agent_config: AgentConfig) -> ReceiverStream<OrchestratorEvent> {
        let mut state = PipelineState::create(self.session_id.clone(), agent_config.slug.clone());
        if let Some(previous) = &self.previous_session_id {
            state = state.with_previous_session(previous.clone());
        }
        self.spawn(state, user_message, agent_config, 0, Vec::new())
    }

    /// `resume(userResponse, agentConfig)`.
    pub fn resume(&self, user_response: String, agent_config: AgentConfig) -> ReceiverStream<OrchestratorEvent> {
        let state = match PipelineState::load_from(self.session_path()) {
            Some(s) => s,
            None => {
                return Self::error_stream(format!(
                    "no persisted state for session '{}'",
                    self.session_id
                ))
            }
        };
        if !state.is_paused() {
            return Self::error_stream("session is not paused".to_string());
        }
        let paused_stage = state.paused_at_stage().unwrap_or(0);
        let skip_next = paused_stage == 0 && parses_as_skip_intent(&user_response);
        let state = state.add_event(
            StageEventKind::Resumed,
            paused_stage,
            serde_json::json!({ "response": user_response }),
        );
        let next_stage = paused_stage + 1;
        let skip_stages = if skip_next { vec![next_stage] } else { Vec::new() };
        let user_message = state.original_query().unwrap_or(user_response);
        self.spawn(state, user_message, agent_config, next_stage, skip_stages)
    }

    /// `resumeFromBreakout(userMessage, agentConfig, fromStage)`.
    pub fn resume_from_breakout(
        &self,
        user_message: String,
        agent_config: AgentConfig,
        from_stage: usize,
    ) -> ReceiverStream<OrchestratorEvent> {
        let state = match PipelineState::load_from(self.session_path()) {
            Some(s) => s,
            None => {
                return Self::error_stream(format!(
                    "no persisted state for session '{}'",
                    self.session_id
                ))
            }
        };
        if !state.is_resumable_after_breakout() {
            return Self::error_stream("session is not resumable after breakout".to_string());
        }
        let state = state.add_event(StageEventKind::ResumeFromBreakout, from_stage, serde_json::json!({}));
        if let Err(e) = state.save_to(self.session_path()) {
            return Self::error_stream(e.to_string());
        }
        self.spawn(state, user_message, agent_config, from_stage, Vec::new())
    }

    /// Called by the surrounding chat layer when it detects a breakout
    /// signal while the pipeline is paused. Appends `breakout_pending` and
    /// returns the updated state; the orchestrator itself never initiates
    /// breakout.
    pub fn request_breakout(&self, original_message: &str) -> crate::error::PipelineResult<PipelineState> {
        let state = PipelineState::load_from(self.session_path()).ok_or_else(|| {
            crate::error::boxed(PipelineError::StateLoadFailure {
                path: self.session_path().display().to_string(),
                detail: "no persisted state".to_string(),
            })
        })?;
        let stage = state.paused_at_stage().unwrap_or(0);
        let state = state.add_event(
            StageEventKind::BreakoutPending,
            stage,
            serde_json::json!({ "originalMessage": original_message }),
        );
        state.save_to(self.session_path())?;
        Ok(state)
    }

    /// Resolves a pending breakout confirmation.
    pub fn confirm_breakout(
        &self,
        reply: BreakoutReply,
        original_message: &str,
    ) -> crate::error::PipelineResult<PipelineState> {
        let state = PipelineState::load_from(self.session_path()).ok_or_else(|| {
            crate::error::boxed(PipelineError::StateLoadFailure {
                path: self.session_path().display().to_string(),
                detail: "no persisted state".to_string(),
            })
        })?;
        if !state.is_breakout_pending() {
            return Err(crate::error::boxed(PipelineError::MissingPrecondition {
                detail: "no breakout confirmation is pending".to_string(),
            }));
        }
        let stage = state.paused_at_stage().unwrap_or(0);
        let state = match reply {
            BreakoutReply::Deny => state.add_event(
                StageEventKind::Resumed,
                stage,
                serde_json::json!({ "response": "deny_breakout" }),
            ),
            BreakoutReply::Confirm | BreakoutReply::ExplicitBreakout => state.add_event(
                StageEventKind::Breakout,
                stage,
                serde_json::json!({ "message": original_message }),
            ),
        };
        state.save_to(self.session_path())?;
        Ok(state)
    }
}

fn rebuild_cost_tracker(state: &PipelineState, budget_usd: f64) -> CostTracker {
    let mut tracker = CostTracker::new(budget_usd);
    for event in state.get_events_by_type(StageEventKind::StageCompleted) {
        if let Some(usage) = event
            .data
            .get("usage")
            .and_then(|v| serde_json::from_value::<TokenUsage>(v.clone()).ok())
        {
            tracker.record_stage(event.stage, &usage);
        }
    }
    tracker
}

fn pause_message(stage_name: &str, data: &Value, audit: &mut Vec<String>) -> String {
    match stage_name {
        "analyze_query" => format_stage_0_pause(data, audit),
        "websearch_calibration" => format_stage_1_pause(data, audit),
        _ => serde_json::to_string_pretty(data).unwrap_or_default(),
    }
}

async fn send(tx: &mpsc::Sender<OrchestratorEvent>, event: OrchestratorEvent) -> bool {
    tx.send(event).await.is_ok()
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    stage_runner: StageRunner,
    sessions_dir: PathBuf,
    session_path: PathBuf,
    mut state: PipelineState,
    user_message: String,
    agent_config: AgentConfig,
    start_stage: usize,
    skip_stages: Vec<usize>,
    current_stage: Arc<AtomicUsize>,
    tx: mpsc::Sender<OrchestratorEvent>,
) {
    let follow_up_context = state
        .previous_session_id
        .clone()
        .and_then(|prev| FollowUpContext::load(&sessions_dir, &prev));

    let budget_usd = agent_config.orchestrator.effective_budget_usd();
    let mut cost_tracker = rebuild_cost_tracker(&state, budget_usd);
    let total_stages = agent_config.control_flow.stages.len();

    macro_rules! checkpoint {
        () => {
            if let Err(e) = state.save_to(&session_path) {
                send(&tx, OrchestratorEvent::OrchestratorError {
                    stage: current_stage.load(Ordering::Relaxed),
                    message: e.to_string(),
                })
                .await;
                return;
            }
        };
    }

    let stages: Vec<_> = agent_config
        .control_flow
        .stages
        .iter()
        .filter(|s| s.id >= start_stage)
        .cloned()
        .collect();

    for stage_cfg in stages {
        let stage = stage_cfg.id;
        current_stage.store(stage, Ordering::Relaxed);

        if skip_stages.contains(&stage) {
            state = state.add_event(StageEventKind::StageStarted, stage, serde_json::json!({ "skipped": true }));
            if !send(&tx, OrchestratorEvent::OrchestratorStageStart { stage, name: stage_cfg.name.clone() }).await {
                return;
            }
            let skip_result = crate::state::StageResult::skipped(
                "skipped by user request",
                serde_json::json!({ "skipped": true, "execution_status": "user_skipped" }),
            );
            state = state.set_stage_output(stage, skip_result.clone());
            state = state.add_event(
                StageEventKind::StageCompleted,
                stage,
                serde_json::json!({ "skipped": true, "usage": skip_result.usage }),
            );
            checkpoint!();
            if !send(&tx, OrchestratorEvent::OrchestratorStageComplete { stage, name: stage_cfg.name.clone() }).await {
                return;
            }
            continue;
        }

        state = state.add_event(StageEventKind::StageStarted, stage, serde_json::json!({}));
        if !send(&tx, OrchestratorEvent::OrchestratorStageStart { stage, name: stage_cfg.name.clone() }).await {
            return;
        }

        let input = StageHandlerInput {
            state: &state,
            agent_config: &agent_config,
            user_message: &user_message,
            follow_up_context: follow_up_context.as_ref(),
            repair_feedback: None,
            repair_iteration: 0,
            session_path: &session_path,
        };
        let result = stage_runner.run_stage(&stage_cfg.name, input).await;

        let result = match result {
            Ok(r) => r,
            Err(e) => {
                state = state.add_event(
                    StageEventKind::StageFailed,
                    stage,
                    serde_json::json!({ "error": e.to_string() }),
                );
                checkpoint!();
                send(&tx, OrchestratorEvent::OrchestratorError { stage, message: e.to_string() }).await;
                return;
            }
        };

        state = state.set_stage_output(stage, result.clone());
        cost_tracker.record_stage(stage, &result.usage);
        state = state.add_event(
            StageEventKind::StageCompleted,
            stage,
            serde_json::json!({ "usage": result.usage }),
        );
        checkpoint!();

        let pauses_here = agent_config.control_flow.pause_after_stages.contains(&stage);
        if pauses_here {
            let mut audit = Vec::new();
            let message = pause_message(&stage_cfg.name, &result.data, &mut audit);
            state = state.add_event(StageEventKind::PauseRequested, stage, serde_json::json!({}));
            state = state.add_event(
                StageEventKind::PauseFormatted,
                stage,
                serde_json::json!({ "message": message, "normalizationAudit": audit }),
            );
            checkpoint!();
            if !send(&tx, OrchestratorEvent::OrchestratorStageComplete { stage, name: stage_cfg.name.clone() }).await {
                return;
            }
            send(&tx, OrchestratorEvent::OrchestratorPause { stage, message }).await;
            return;
        }

        if !send(&tx, OrchestratorEvent::OrchestratorStageComplete { stage, name: stage_cfg.name.clone() }).await {
            return;
        }

        if !cost_tracker.within_budget() {
            send(&tx, OrchestratorEvent::OrchestratorBudgetExceeded {
                spent_usd: cost_tracker.total_cost_usd(),
                budget_usd,
            })
            .await;
            let summary = PipelineSummary::generate(&state, total_stages, ExitReason::Error);
            let _ = summary.save_to(&session_path);
            return;
        }

        if let Some(unit) = agent_config.repair_unit_for_stage(stage).cloned() {
            let mut iteration = 0u32;
            loop {
                let needs_repair = state
                    .get_stage_output(stage)
                    .and_then(|r| r.data.get("needsRepair"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if !needs_repair || iteration >= unit.max_iterations {
                    break;
                }
                iteration += 1;
                if !send(&tx, OrchestratorEvent::OrchestratorRepairStart {
                    iteration,
                    max_iterations: unit.max_iterations,
                })
                .await
                {
                    return;
                }

                let feedback = state
                    .get_stage_output(stage)
                    .and_then(|r| r.data.get(&unit.feedback_field))
                    .and_then(Value::as_str)
                    .map(str::to_string);

                for &repair_stage in &unit.stages {
                    current_stage.store(repair_stage, Ordering::Relaxed);
                    state = state.add_event(
                        StageEventKind::StageStarted,
                        repair_stage,
                        serde_json::json!({ "repairIteration": iteration, "feedback": feedback }),
                    );
                    if !send(&tx, OrchestratorEvent::OrchestratorStageStart {
                        stage: repair_stage,
                        name: stage_name_for(&agent_config, repair_stage),
                    })
                    .await
                    {
                        return;
                    }

                    let input = StageHandlerInput {
                        state: &state,
                        agent_config: &agent_config,
                        user_message: &user_message,
                        follow_up_context: follow_up_context.as_ref(),
                        repair_feedback: feedback.as_deref(),
                        repair_iteration: iteration,
                        session_path: &session_path,
                    };
                    let stage_name = stage_name_for(&agent_config, repair_stage);
                    let result = match stage_runner.run_stage(&stage_name, input).await {
                        Ok(r) => r,
                        Err(e) => {
                            state = state.add_event(
                                StageEventKind::StageFailed,
                                repair_stage,
                                serde_json::json!({ "error": e.to_string() }),
                            );
                            checkpoint!();
                            send(&tx, OrchestratorEvent::OrchestratorError {
                                stage: repair_stage,
                                message: e.to_string(),
                            })
                            .await;
                            return;
                        }
                    };
                    state = state.set_stage_output(repair_stage, result.clone());
                    cost_tracker.record_stage(repair_stage, &result.usage);
                    state = state.add_event(
                        StageEventKind::StageCompleted,
                        repair_stage,
                        serde_json::json!({ "usage": result.usage, "repairIteration": iteration }),
                    );
                    checkpoint!();
                    if !send(&tx, OrchestratorEvent::OrchestratorStageComplete {
                        stage: repair_stage,
                        name: stage_name.clone(),
                    })
                    .await
                    {
                        return;
                    }
                }

                if !cost_tracker.within_budget() {
                    send(&tx, OrchestratorEvent::OrchestratorBudgetExceeded {
                        spent_usd: cost_tracker.total_cost_usd(),
                        budget_usd,
                    })
                    .await;
                    let summary = PipelineSummary::generate(&state, total_stages, ExitReason::Error);
                    let _ = summary.save_to(&session_path);
                    return;
                }
            }
        }
    }

    let report = cost_tracker.generate_report();
    let summary = PipelineSummary::generate(&state, total_stages, ExitReason::Completed);
    let _ = summary.save_to(&session_path);
    send(&tx, OrchestratorEvent::OrchestratorComplete {
        stages_completed: state.last_completed_stage_index().max(-1) as usize + 1,
        cost_report: report,
    })
    .await;
}

fn stage_name_for(agent_config: &AgentConfig, stage: usize) -> String {
    agent_config
        .control_flow
        .stages
        .iter()
        .find(|s| s.id == stage)
        .map(|s| s.name.clone())
        .unwrap_or_else(|| format!("stage_{}", stage))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_exact_b_and_b_dot_as_skip_intent() {
        assert!(parses_as_skip_intent("B"));
        assert!(parses_as_skip_intent("b."));
        assert!(!parses_as_skip_intent("b"));
    }

    #[test]
    fn parses_phrase_variants_case_insensitively() {
        assert!(parses_as_skip_intent("No Web Search please"));
        assert!(parses_as_skip_intent("let's proceed directly"));
        assert!(!parses_as_skip_intent("continue with the plan"));
    }

    #[test]
    fn classifies_numeric_breakout_shortcuts_exactly() {
        assert_eq!(classify_breakout_reply("1"), Some(BreakoutReply::Confirm));
        assert_eq!(classify_breakout_reply("2."), Some(BreakoutReply::Deny));
        assert_eq!(classify_breakout_reply("3"), Some(BreakoutReply::ExplicitBreakout));
        assert_eq!(classify_breakout_reply("yes"), None);
    }
}
