//! The embedding LLM provider's call interface.
//!
//! Mirrors `cloudllm::client_wrapper::ClientWrapper` closely: an
//! `async_trait`, `Send + Sync` bound, streaming-first design. Where that
//! trait is a general chat-completion abstraction with optional native tool
//! calling, `LlmProvider` is narrower and stricter: temperature is never
//! sent, adaptive thinking is always on, tools are never exposed to the
//! model, and streaming is mandatory rather than opportunistic.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::error::PipelineResult;

/// A stream event surfaced to `onStreamEvent` during a call.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    TextDelta(String),
    ThinkingDelta(String),
}

/// Boxed stream of incremental events, analogous to
/// `cloudllm::client_wrapper`'s `MessageChunkStream` type alias.
pub type StreamEventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Parameters accepted by [`LlmProvider::call`].
#[derive(Debug, Clone)]
pub struct LlmCallParams {
    pub system_prompt: String,
    pub user_message: String,
    pub model: Option<String>,
    pub desired_max_tokens: Option<usize>,
    pub effort: Option<String>,
}

impl LlmCallParams {
    pub fn new(system_prompt: impl Into<String>, user_message: impl Into<String>) -> Self {
        LlmCallParams {
            system_prompt: system_prompt.into(),
            user_message: user_message.into(),
            model: None,
            desired_max_tokens: None,
            effort: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_desired_max_tokens(mut self, tokens: usize) -> Self {
        self.desired_max_tokens = Some(tokens);
        self
    }

    pub fn with_effort(mut self, effort: impl Into<String>) -> Self {
        self.effort = Some(effort.into());
        self
    }
}

/// Token usage reported by the provider for a single call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

/// Aggregated result of a streaming call: final text, optional
/// thinking summary, a count of opaque redacted-thinking blocks, usage,
/// stop reason, and the effective model name actually used.
#[derive(Debug, Clone)]
pub struct LlmCallResult {
    pub text: String,
    pub thinking_summary: Option<String>,
    pub redacted_thinking_block_count: usize,
    pub usage: ProviderUsage,
    pub stop_reason: String,
    pub model: String,
}

/// The out-of-scope embedding LLM provider's interface.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Streams a single call. `on_stream_event` is invoked for every
    /// `text_delta`/`thinking_delta` increment. Implementations must: fetch
    /// a fresh auth token per call, force streaming, never send a
    /// temperature parameter, always enable adaptive thinking, and never
    /// expose tools to the model.
    async fn call(
        &self,
        params: LlmCallParams,
        on_stream_event: Option<Box<dyn FnMut(StreamEvent) + Send>>,
    ) -> PipelineResult<LlmCallResult>;

    /// The provider's default model identifier, used when a call doesn't
    /// override it.
    fn default_model(&self) -> &str;
}
