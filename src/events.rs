//! The consumer-visible orchestrator event stream.
//!
//! Distinguished from the durable `StageEvent` log (`state.rs`) the same
//! way a durable `Thought` log is kept separate from a live
//! `EventHandler`/`AgentEvent`/`OrchestrationEvent` channel: the state log
//! is what gets checkpointed to disk, this enum is what a caller consumes
//! via `for await`.

use serde::Serialize;

use crate::cost_tracker::CostReport;

/// Fine-grained progress emitted mid-stage, the live equivalent of
/// `cloudllm::event::AgentEvent::{LLMCallStarted, ToolCallDetected, ...}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubstepKind {
    McpStart { tool_name: String },
    McpResult { tool_name: String, success: bool },
    LlmStart { model: String },
    LlmComplete { model: String, tokens_used: usize },
    Status { message: String },
}

/// Events emitted from `PipelineOrchestrator::run`/`resume`/
/// `resume_from_breakout`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    OrchestratorStageStart { stage: usize, name: String },
    OrchestratorStageComplete { stage: usize, name: String },
    OrchestratorPause { stage: usize, message: String },
    OrchestratorRepairStart { iteration: u32, max_iterations: u32 },
    OrchestratorBudgetExceeded { spent_usd: f64, budget_usd: f64 },
    OrchestratorComplete { stages_completed: usize, cost_report: CostReport },
    OrchestratorError { stage: usize, message: String },
    OrchestratorSubstep { stage: usize, substep: SubstepKind },
}
