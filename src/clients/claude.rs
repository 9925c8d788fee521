//! Anthropic Claude adapter for [`LlmProvider`].
//!
//! Adapted from `cloudllm::clients::claude::ClaudeClient`: same model enum
//! and base-URL construction, but the wire calls go straight over a pooled
//! `reqwest::Client` instead of delegating to a vendored OpenAI-compatible
//! SDK, because this provider's streaming contract (always-on streaming, no
//! temperature, adaptive thinking always enabled, no tools) doesn't map
//! cleanly onto that SDK's chat-completion request builder.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;

use crate::error::{PipelineError, PipelineResult};
use crate::http_pool;
use crate::llm_provider::{LlmCallParams, LlmCallResult, LlmProvider, ProviderUsage, StreamEvent};

/// Claude models available through the Messages API (snapshot, mirrors
/// `cloudllm::clients::claude::Model` exactly).
#[derive(Debug, Clone, Copy)]
pub enum Model {
    ClaudeOpus41,
    ClaudeOpus4,
    ClaudeSonnet4,
    ClaudeSonnet37,
    ClaudeHaiku35,
}

fn model_to_string(model: Model) -> String {
    match model {
        Model::ClaudeOpus41 => "claude-opus-4-1".to_string(),
        Model::ClaudeOpus4 => "claude-opus-4-0".to_string(),
        Model::ClaudeSonnet4 => "claude-sonnet-4-0".to_string(),
        Model::ClaudeSonnet37 => "claude-sonnet-3-7-sonnet-latest".to_string(),
        Model::ClaudeHaiku35 => "claude-haiku-3-5-haiku-latest".to_string(),
    }
}

/// Streaming adapter over Anthropic's Messages API.
pub struct ClaudeProvider {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl ClaudeProvider {
    pub fn new_with_model_enum(api_key: impl Into<String>, model: Model) -> Self {
        Self::new_with_model_str(api_key, &model_to_string(model))
    }

    pub fn new_with_model_str(api_key: impl Into<String>, model: &str) -> Self {
        Self::new_with_base_url(api_key, model, "https://api.anthropic.com/v1")
    }

    pub fn new_with_base_url(
        api_key: impl Into<String>,
        model: &str,
        base_url: &str,
    ) -> Self {
        ClaudeProvider {
            api_key: api_key.into(),
            model: model.to_string(),
            base_url: base_url.to_string(),
            client: http_pool::get_or_create_client(base_url),
        }
    }

    /// Re-reads the auth token from the environment on every call rather
    /// than caching it at construction.
    fn current_token(&self) -> String {
        std::env::var("ANTHROPIC_API_KEY").unwrap_or_else(|_| self.api_key.clone())
    }
}

#[async_trait]
impl LlmProvider for ClaudeProvider {
    fn default_model(&self) -> &str {
        &self.model
    }

    async fn call(
        &self,
        params: LlmCallParams,
        mut on_stream_event: Option<Box<dyn FnMut(StreamEvent) + Send>>,
    ) -> PipelineResult<LlmCallResult> {
        let model = params.model.clone().unwrap_or_else(|| self.model.clone());
        let max_tokens = params.desired_max_tokens.unwrap_or(4_096);

        let body = serde_json::json!({
            "model": model,
            "max_tokens": max_tokens,
            "stream": true,
            "thinking": { "type": "enabled", "budget_tokens": max_tokens / 2 },
            "system": params.system_prompt,
            "messages": [{ "role": "user", "content": params.user_message }],
        });

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", self.current_token())
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                Box::new(PipelineError::Io(e.to_string())) as Box<dyn std::error::Error + Send + Sync>
            })?;

        let mut stream = response.bytes_stream();
        let mut text = String::new();
        let mut thinking = String::new();
        let mut redacted_thinking_block_count = 0usize;
        let mut usage = ProviderUsage::default();
        let mut stop_reason = String::new();
        let mut buffer = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                Box::new(PipelineError::Io(e.to_string())) as Box<dyn std::error::Error + Send + Sync>
            })?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(line_end) = buffer.find('\n') {
                let line = buffer[..line_end].trim_end_matches('\r').to_string();
                buffer.drain(..=line_end);
                if let Some(payload) = line.strip_prefix("data: ") {
                    if payload == "[DONE]" {
                        continue;
                    }
                    if let Ok(event) = serde_json::from_str::<Value>(payload) {
                        apply_stream_event(
                            &event,
                            &mut text,
                            &mut thinking,
                            &mut redacted_thinking_block_count,
                            &mut usage,
                            &mut stop_reason,
                            &mut on_stream_event,
                        );
                    }
                }
            }
        }

        Ok(LlmCallResult {
            text,
            thinking_summary: if thinking.is_empty() { None } else { Some(thinking) },
            redacted_thinking_block_count,
            usage,
            stop_reason,
            model,
        })
    }
}

fn apply_stream_event(
    event: &Value,
    text: &mut String,
    thinking: &mut String,
    redacted_thinking_block_count: &mut usize,
    usage: &mut ProviderUsage,
    stop_reason: &mut String,
    on_stream_event: &mut Option<Box<dyn FnMut(StreamEvent) + Send>>,
) {
    let event_type = event.get("type").and_then(Value::as_str).unwrap_or("");
    match event_type {
        "content_block_delta" => {
            if let Some(delta) = event.get("delta") {
                let delta_type = delta.get("type").and_then(Value::as_str).unwrap_or("");
                if delta_type == "text_delta" {
                    if let Some(piece) = delta.get("text").and_then(Value::as_str) {
                        text.push_str(piece);
                        if let Some(cb) = on_stream_event {
                            cb(StreamEvent::TextDelta(piece.to_string()));
                        }
                    }
                } else if delta_type == "thinking_delta" {
                    if let Some(piece) = delta.get("thinking").and_then(Value::as_str) {
                        thinking.push_str(piece);
                        if let Some(cb) = on_stream_event {
                            cb(StreamEvent::ThinkingDelta(piece.to_string()));
                        }
                    }
                }
            }
        }
        "content_block_start" => {
            if let Some(block) = event.get("content_block") {
                if block.get("type").and_then(Value::as_str) == Some("redacted_thinking") {
                    *redacted_thinking_block_count += 1;
                }
            }
        }
        "message_delta" => {
            if let Some(reason) = event
                .get("delta")
                .and_then(|d| d.get("stop_reason"))
                .and_then(Value::as_str)
            {
                *stop_reason = reason.to_string();
            }
            if let Some(output_tokens) = event
                .get("usage")
                .and_then(|u| u.get("output_tokens"))
                .and_then(Value::as_u64)
            {
                usage.output_tokens = output_tokens as usize;
            }
        }
        "message_start" => {
            if let Some(input_tokens) = event
                .get("message")
                .and_then(|m| m.get("usage"))
                .and_then(|u| u.get("input_tokens"))
                .and_then(Value::as_u64)
            {
                usage.input_tokens = input_tokens as usize;
            }
        }
        _ => {}
    }
}
