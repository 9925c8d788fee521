//! Typed facade over the external MCP tool-call protocol.
//!
//! Grounded directly on `cloudllm::tool_protocol::ToolProtocol` (the trait
//! shape: `execute`, `list_tools`, `protocol_name`) and
//! `cloudllm::tool_protocols::McpClientProtocol` (the HTTP adapter: a
//! pooled client POSTing to a fixed endpoint convention). The envelope
//! format and the `parse_mcp_result` pipeline are new here — `cloudllm`'s
//! own `ToolResult` is a flat success/output/error struct, not an envelope
//! of content blocks, so this module's envelope parsing has no direct
//! counterpart there beyond the general "typed wrapper over an untyped
//! transport" idiom.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::RetrievalParagraph;
use crate::error::{PipelineError, PipelineResult};
use crate::http_pool;

/// One block inside an MCP response envelope.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default)]
    pub text: Option<String>,
}

/// The raw shape every MCP tool call returns.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct McpEnvelope {
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub is_error: Option<bool>,
}

/// Returns the concatenated text of every text content block, without
/// attempting JSON parsing. Used by tools that emit pre-formatted strings
/// (e.g. `formatContext`).
pub fn extract_mcp_text(envelope: &McpEnvelope, tool_name: &str) -> PipelineResult<String> {
    check_not_error(envelope, tool_name)?;
    check_non_empty(envelope, tool_name)?;
    let text = envelope
        .content
        .iter()
        .filter_map(|b| b.text.as_deref())
        .collect::<Vec<_>>()
        .join("");
    Ok(text)
}

fn check_not_error(envelope: &McpEnvelope, tool_name: &str) -> PipelineResult<()> {
    if envelope.is_error == Some(true) {
        let detail = envelope
            .content
            .iter()
            .filter_map(|b| b.text.as_deref())
            .collect::<Vec<_>>()
            .join(" ");
        return Err(Box::new(PipelineError::ToolTransportFailure {
            tool_name: tool_name.to_string(),
            detail,
        }));
    }
    Ok(())
}

fn check_non_empty(envelope: &McpEnvelope, tool_name: &str) -> PipelineResult<()> {
    if envelope.content.is_empty() {
        return Err(Box::new(PipelineError::ToolTransportFailure {
            tool_name: tool_name.to_string(),
            detail: "empty content envelope".to_string(),
        }));
    }
    Ok(())
}

/// Runs an envelope through a five-step pipeline: error-flag check,
/// non-empty check, text extraction, JSON parse, schema
/// validation (performed here as typed deserialization into `T`, tolerating
/// both `{ "results": [...] }` and bare `[...]` list shapes via `unwrap_list_field`).
pub fn parse_mcp_result<T>(envelope: &McpEnvelope, tool_name: &str) -> PipelineResult<T>
where
    T: for<'de> Deserialize<'de>,
{
    check_not_error(envelope, tool_name)?;
    check_non_empty(envelope, tool_name)?;
    let text = envelope
        .content
        .iter()
        .find_map(|b| b.text.as_deref())
        .ok_or_else(|| {
            Box::new(PipelineError::ToolTransportFailure {
                tool_name: tool_name.to_string(),
                detail: "no text content block present".to_string(),
            }) as Box<dyn std::error::Error + Send + Sync>
        })?;
    let value: Value = serde_json::from_str(text).map_err(|_| {
        let excerpt: String = text.chars().take(200).collect();
        Box::new(PipelineError::MalformedJson {
            context: format!("'{}' response payload: {}", tool_name, excerpt),
        }) as Box<dyn std::error::Error + Send + Sync>
    })?;
    serde_json::from_value(value).map_err(|e| {
        Box::new(PipelineError::SchemaMismatch {
            tool_name: tool_name.to_string(),
            detail: e.to_string(),
        }) as Box<dyn std::error::Error + Send + Sync>
    })
}

/// Unwraps either `{ "results": [...] }` or a bare `[...]` into the inner
/// list, used by bridge methods whose servers disagree on wrapping.
fn unwrap_list_field(value: &Value, field: &str) -> Value {
    if value.is_array() {
        return value.clone();
    }
    value
        .get(field)
        .cloned()
        .unwrap_or_else(|| Value::Array(vec![]))
}

/// A single web search hit.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebSearchResult {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub snippet: String,
}

/// Params and outcome for citation verification.
#[derive(Debug, Clone, Serialize)]
pub struct CitationVerifyParams {
    pub citation_id: String,
    pub paragraph_id: String,
    pub claim: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CitationVerification {
    pub citation_id: String,
    pub verified: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityVerifyParams {
    pub entity_name: String,
    pub context: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityVerification {
    pub entity_name: String,
    pub recognized: bool,
}

/// Optional per-call tuning for [`McpBridge::kb_search`].
#[derive(Debug, Clone, Default)]
pub struct KbSearchOptions {
    pub max_results: Option<usize>,
}

/// The bridge's tool set, polymorphic over `{webSearch, kbSearch,
/// citationVerify, hopRetrieve, formatContext, entityVerify}`.
#[async_trait]
pub trait McpBridge: Send + Sync {
    async fn web_search(&self, query: &str) -> PipelineResult<Vec<WebSearchResult>>;
    async fn kb_search(
        &self,
        query: &str,
        options: KbSearchOptions,
    ) -> PipelineResult<Vec<RetrievalParagraph>>;
    async fn citation_verify(
        &self,
        params: CitationVerifyParams,
    ) -> PipelineResult<CitationVerification>;
    async fn hop_retrieve(
        &self,
        paragraph_id: &str,
        depth: u32,
    ) -> PipelineResult<Vec<RetrievalParagraph>>;
    async fn format_context(&self, paragraph_ids: &[String]) -> PipelineResult<String>;
    async fn entity_verify(&self, params: EntityVerifyParams) -> PipelineResult<EntityVerification>;
}

/// HTTP adapter over a remote MCP server, grounded on
/// `cloudllm::tool_protocols::McpClientProtocol`'s `{endpoint}/execute`
/// POST convention and pooled-client reuse.
pub struct HttpMcpBridge {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpMcpBridge {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        let client = http_pool::get_or_create_client(&endpoint);
        HttpMcpBridge { endpoint, client }
    }

    async fn execute(&self, tool_name: &str, params: Value) -> PipelineResult<McpEnvelope> {
        let url = format!("{}/execute", self.endpoint);
        let body = serde_json::json!({ "tool": tool_name, "parameters": params });
        let response = self.client.post(&url).json(&body).send().await.map_err(|e| {
            Box::new(PipelineError::ToolTransportFailure {
                tool_name: tool_name.to_string(),
                detail: e.to_string(),
            }) as Box<dyn std::error::Error + Send + Sync>
        })?;
        let envelope: McpEnvelope = response.json().await.map_err(|e| {
            Box::new(PipelineError::ToolTransportFailure {
                tool_name: tool_name.to_string(),
                detail: e.to_string(),
            }) as Box<dyn std::error::Error + Send + Sync>
        })?;
        Ok(envelope)
    }
}

#[async_trait]
impl McpBridge for HttpMcpBridge {
    async fn web_search(&self, query: &str) -> PipelineResult<Vec<WebSearchResult>> {
        let envelope = self
            .execute("web_search", serde_json::json!({ "query": query }))
            .await?;
        let text = extract_mcp_text(&envelope, "web_search")?;
        let value: Value = serde_json::from_str(&text).map_err(|_| {
            Box::new(PipelineError::MalformedJson {
                context: "web_search response".to_string(),
            }) as Box<dyn std::error::Error + Send + Sync>
        })?;
        let list = unwrap_list_field(&value, "results");
        serde_json::from_value(list).map_err(|e| {
            Box::new(PipelineError::SchemaMismatch {
                tool_name: "web_search".to_string(),
                detail: e.to_string(),
            }) as Box<dyn std::error::Error + Send + Sync>
        })
    }

    async fn kb_search(
        &self,
        query: &str,
        options: KbSearchOptions,
    ) -> PipelineResult<Vec<RetrievalParagraph>> {
        let mut params = serde_json::json!({ "query": query });
        if let Some(max_results) = options.max_results {
            params["maxResults"] = Value::from(max_results);
        }
        let envelope = self.execute("kb_search", params).await?;
        let text = extract_mcp_text(&envelope, "kb_search")?;
        let value: Value = serde_json::from_str(&text).map_err(|_| {
            Box::new(PipelineError::MalformedJson {
                context: "kb_search response".to_string(),
            }) as Box<dyn std::error::Error + Send + Sync>
        })?;
        let list = unwrap_list_field(&value, "results");
        #[derive(Deserialize)]
        struct RawParagraph {
            id: String,
            text: String,
            #[serde(default)]
            score: f64,
            #[serde(default)]
            source: Option<String>,
        }
        let raw: Vec<RawParagraph> = serde_json::from_value(list).map_err(|e| {
            Box::new(PipelineError::SchemaMismatch {
                tool_name: "kb_search".to_string(),
                detail: e.to_string(),
            }) as Box<dyn std::error::Error + Send + Sync>
        })?;
        Ok(raw
            .into_iter()
            .map(|r| RetrievalParagraph {
                id: r.id,
                text: r.text,
                score: r.score,
                source: r.source.unwrap_or_else(|| "kb".to_string()),
            })
            .collect())
    }

    async fn citation_verify(
        &self,
        params: CitationVerifyParams,
    ) -> PipelineResult<CitationVerification> {
        let envelope = self
            .execute(
                "citation_verify",
                serde_json::json!({
                    "citationId": params.citation_id,
                    "paragraphId": params.paragraph_id,
                    "claim": params.claim,
                }),
            )
            .await?;
        parse_mcp_result(&envelope, "citation_verify")
    }

    async fn hop_retrieve(
        &self,
        paragraph_id: &str,
        depth: u32,
    ) -> PipelineResult<Vec<RetrievalParagraph>> {
        let envelope = self
            .execute(
                "hop_retrieve",
                serde_json::json!({ "paragraphId": paragraph_id, "depth": depth }),
            )
            .await?;
        let text = extract_mcp_text(&envelope, "hop_retrieve")?;
        let value: Value = serde_json::from_str(&text).map_err(|_| {
            Box::new(PipelineError::MalformedJson {
                context: "hop_retrieve response".to_string(),
            }) as Box<dyn std::error::Error + Send + Sync>
        })?;
        let list = unwrap_list_field(&value, "results");
        serde_json::from_value(list).map_err(|e| {
            Box::new(PipelineError::SchemaMismatch {
                tool_name: "hop_retrieve".to_string(),
                detail: e.to_string(),
            }) as Box<dyn std::error::Error + Send + Sync>
        })
    }

    async fn format_context(&self, paragraph_ids: &[String]) -> PipelineResult<String> {
        let envelope = self
            .execute(
                "format_context",
                serde_json::json!({ "paragraphIds": paragraph_ids }),
            )
            .await?;
        extract_mcp_text(&envelope, "format_context")
    }

    async fn entity_verify(
        &self,
        params: EntityVerifyParams,
    ) -> PipelineResult<EntityVerification> {
        let envelope = self
            .execute(
                "entity_verify",
                serde_json::json!({ "entityName": params.entity_name, "context": params.context }),
            )
            .await?;
        parse_mcp_result(&envelope, "entity_verify")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope_with_text(text: &str) -> McpEnvelope {
        McpEnvelope {
            content: vec![ContentBlock {
                block_type: "text".to_string(),
                text: Some(text.to_string()),
            }],
            is_error: None,
        }
    }

    #[test]
    fn parse_mcp_result_rejects_error_envelopes() {
        let envelope = McpEnvelope {
            content: vec![ContentBlock {
                block_type: "text".to_string(),
                text: Some("kb offline".to_string()),
            }],
            is_error: Some(true),
        };
        let result: PipelineResult<CitationVerification> =
            parse_mcp_result(&envelope, "citation_verify");
        assert!(result.is_err());
    }

    #[test]
    fn parse_mcp_result_rejects_empty_content() {
        let envelope = McpEnvelope {
            content: vec![],
            is_error: None,
        };
        let result: PipelineResult<CitationVerification> =
            parse_mcp_result(&envelope, "citation_verify");
        assert!(result.is_err());
    }

    #[test]
    fn parse_mcp_result_reports_malformed_json_with_excerpt() {
        let envelope = envelope_with_text("not valid json{{{");
        let result: PipelineResult<CitationVerification> =
            parse_mcp_result(&envelope, "citation_verify");
        let err = result.unwrap_err();
        assert!(err.to_string().contains("citation_verify"));
    }

    #[test]
    fn parse_mcp_result_validates_schema() {
        let envelope = envelope_with_text(r#"{"citationId": "c1", "verified": true}"#);
        let result: CitationVerification = parse_mcp_result(&envelope, "citation_verify").unwrap();
        assert!(result.verified);
        assert_eq!(result.citation_id, "c1");
    }

    #[test]
    fn extract_mcp_text_does_not_parse_json() {
        let envelope = envelope_with_text("plain formatted string, not json");
        let text = extract_mcp_text(&envelope, "format_context").unwrap();
        assert_eq!(text, "plain formatted string, not json");
    }

    #[test]
    fn unwrap_list_field_handles_both_shapes() {
        let wrapped = serde_json::json!({ "results": [1, 2, 3] });
        let bare = serde_json::json!([1, 2, 3]);
        assert_eq!(unwrap_list_field(&wrapped, "results"), unwrap_list_field(&bare, "results"));
    }
}
