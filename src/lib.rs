// src/lib.rs

pub mod clients;
pub mod config;
pub mod context;
pub mod cost_tracker;
pub mod driver;
pub mod error;
pub mod events;
pub mod http_pool;
pub mod json_extract;
pub mod llm_provider;
pub mod mcp_bridge;
pub mod pause_formatter;
pub mod post_processor;
pub mod renderer;
pub mod stage_runner;
pub mod state;
pub mod summary;

pub use config::{AgentConfig, ControlFlowConfig, RepairUnit, StageConfig};
pub use driver::{classify_breakout_reply, BreakoutReply, PipelineOrchestrator};
pub use error::{PipelineError, PipelineResult};
pub use events::{OrchestratorEvent, SubstepKind};
pub use mcp_bridge::{HttpMcpBridge, McpBridge};
pub use renderer::{AnswerRenderer, DefaultMarkdownRenderer, FinalAnswer};
pub use state::{PipelineState, StageEventKind, StageResult, TokenUsage};
pub use summary::{ExitReason, FollowUpContext, PipelineSummary};
