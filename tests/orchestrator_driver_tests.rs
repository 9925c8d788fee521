use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_stream::StreamExt;

use researchctl::context::RetrievalParagraph;
use researchctl::llm_provider::{LlmCallParams, LlmCallResult, LlmProvider, ProviderUsage, StreamEvent};
use researchctl::mcp_bridge::{
    CitationVerification, CitationVerifyParams, EntityVerification, EntityVerifyParams,
    KbSearchOptions, McpBridge, WebSearchResult,
};
use researchctl::{
    classify_breakout_reply, AgentConfig, BreakoutReply, ControlFlowConfig, DefaultMarkdownRenderer,
    OrchestratorEvent, PipelineOrchestrator, RepairUnit, StageConfig,
};

/// Returns scripted JSON text in call order; repeats the last response once
/// the queue is drained.
struct FakeLlmProvider {
    responses: Mutex<VecDeque<String>>,
}

impl FakeLlmProvider {
    fn new(responses: Vec<&str>) -> Self {
        FakeLlmProvider {
            responses: Mutex::new(responses.into_iter().map(String::from).collect()),
        }
    }
}

#[async_trait]
impl LlmProvider for FakeLlmProvider {
    async fn call(
        &self,
        _params: LlmCallParams,
        _on_stream_event: Option<Box<dyn FnMut(StreamEvent) + Send>>,
    ) -> researchctl::PipelineResult<LlmCallResult> {
        let mut queue = self.responses.lock().unwrap();
        let text = queue.pop_front().unwrap_or_else(|| "{}".to_string());
        Ok(LlmCallResult {
            text,
            thinking_summary: None,
            redacted_thinking_block_count: 0,
            usage: ProviderUsage {
                input_tokens: 100,
                output_tokens: 50,
            },
            stop_reason: "end_turn".to_string(),
            model: "fake-model".to_string(),
        })
    }

    fn default_model(&self) -> &str {
        "fake-model"
    }
}

/// A bridge whose `citation_verify` fails its first call and succeeds
/// afterward, to drive the repair loop; every other method returns a fixed
/// canned response.
struct FakeMcpBridge {
    web_results: Vec<WebSearchResult>,
    kb_results: Vec<RetrievalParagraph>,
    citation_verify_calls: Mutex<usize>,
    fail_first_citation: bool,
}

impl FakeMcpBridge {
    fn new(fail_first_citation: bool) -> Self {
        FakeMcpBridge {
            web_results: vec![WebSearchResult {
                url: "https://example.com/a".to_string(),
                title: "A primer".to_string(),
                snippet: "useful background".to_string(),
            }],
            kb_results: vec![RetrievalParagraph {
                id: "p1".to_string(),
                text: "ISA 315 requires risk assessment procedures.".to_string(),
                score: 0.9,
                source: "kb".to_string(),
            }],
            citation_verify_calls: Mutex::new(0),
            fail_first_citation,
        }
    }
}

#[async_trait]
impl McpBridge for FakeMcpBridge {
    async fn web_search(&self, _query: &str) -> researchctl::PipelineResult<Vec<WebSearchResult>> {
        Ok(self.web_results.clone())
    }

    async fn kb_search(
        &self,
        _query: &str,
        _options: KbSearchOptions,
    ) -> researchctl::PipelineResult<Vec<RetrievalParagraph>> {
        Ok(self.kb_results.clone())
    }

    async fn citation_verify(
        &self,
        params: CitationVerifyParams,
    ) -> researchctl::PipelineResult<CitationVerification> {
        let mut calls = self.citation_verify_calls.lock().unwrap();
        *calls += 1;
        let verified = !(self.fail_first_citation && *calls == 1);
        Ok(CitationVerification {
            citation_id: params.citation_id,
            verified,
            reason: if verified {
                None
            } else {
                Some("not supported by cited text".to_string())
            },
        })
    }

    async fn hop_retrieve(
        &self,
        _paragraph_id: &str,
        _depth: u32,
    ) -> researchctl::PipelineResult<Vec<RetrievalParagraph>> {
        Ok(Vec::new())
    }

    async fn format_context(&self, _paragraph_ids: &[String]) -> researchctl::PipelineResult<String> {
        Ok(String::new())
    }

    async fn entity_verify(
        &self,
        params: EntityVerifyParams,
    ) -> researchctl::PipelineResult<EntityVerification> {
        Ok(EntityVerification {
            entity_name: params.entity_name,
            recognized: true,
        })
    }
}

fn stage_list() -> Vec<StageConfig> {
    [
        (0, "analyze_query"),
        (1, "websearch_calibration"),
        (2, "retrieve"),
        (3, "synthesize"),
        (4, "verify"),
        (5, "output"),
    ]
    .into_iter()
    .map(|(id, name)| StageConfig {
        id,
        name: name.to_string(),
        description: None,
    })
    .collect()
}

fn agent_config(pause_after_stages: Vec<usize>, repair_units: Vec<RepairUnit>) -> AgentConfig {
    AgentConfig {
        slug: "auditor".to_string(),
        name: "Auditor".to_string(),
        control_flow: ControlFlowConfig {
            stages: stage_list(),
            pause_after_stages,
            repair_units,
        },
        output: Default::default(),
        orchestrator: Default::default(),
        prompts_dir: None,
        follow_up: None,
    }
}

async fn collect(mut stream: impl futures_util::Stream<Item = OrchestratorEvent> + Unpin) -> Vec<OrchestratorEvent> {
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn happy_path_completes_all_stages_without_pausing() {
    let dir = tempfile::tempdir().unwrap();
    let llm = std::sync::Arc::new(FakeLlmProvider::new(vec![
        r#"{"original_query": "What is ISA 315?", "queries": [{"text": "ISA 315 risk assessment"}]}"#,
        r#"{"synthesis": "ISA 315 concerns risk assessment.", "citations": []}"#,
    ]));
    let renderer = std::sync::Arc::new(DefaultMarkdownRenderer);
    let orchestrator = PipelineOrchestrator::new("s1", llm, renderer, dir.path());

    let events = collect(orchestrator.run("What is ISA 315?".to_string(), agent_config(vec![], vec![]))).await;

    assert!(matches!(
        events.last(),
        Some(OrchestratorEvent::OrchestratorComplete { stages_completed: 6, .. })
    ));
    assert!(events
        .iter()
        .any(|e| matches!(e, OrchestratorEvent::OrchestratorStageStart { stage: 0, .. })));
    assert!(dir.path().join("s1/plans/research-answer.md").exists());
    assert!(dir.path().join("s1/data/answer.json").exists());
}

#[tokio::test]
async fn pause_after_stage_then_resume_continues_to_next_stage() {
    let dir = tempfile::tempdir().unwrap();
    let llm = std::sync::Arc::new(FakeLlmProvider::new(vec![
        r#"{"original_query": "What is ISA 315?", "queries": [{"text": "ISA 315"}]}"#,
        r#"{"synthesis": "Answer text.", "citations": []}"#,
    ]));
    let renderer = std::sync::Arc::new(DefaultMarkdownRenderer);
    let orchestrator = PipelineOrchestrator::new("s2", llm, renderer, dir.path());

    let first_events = collect(orchestrator.run(
        "What is ISA 315?".to_string(),
        agent_config(vec![0], vec![]),
    ))
    .await;
    assert!(matches!(first_events.last(), Some(OrchestratorEvent::OrchestratorPause { stage: 0, .. })));

    let resumed_events = collect(orchestrator.resume(
        "continue with the plan".to_string(),
        agent_config(vec![0], vec![]),
    ))
    .await;
    assert!(matches!(
        resumed_events.last(),
        Some(OrchestratorEvent::OrchestratorComplete { stages_completed: 6, .. })
    ));
}

#[tokio::test]
async fn resume_with_skip_phrase_marks_websearch_calibration_user_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let llm = std::sync::Arc::new(FakeLlmProvider::new(vec![
        r#"{"original_query": "What is ISA 315?", "queries": [{"text": "ISA 315"}]}"#,
        r#"{"synthesis": "Answer text.", "citations": []}"#,
    ]));
    let bridge = std::sync::Arc::new(FakeMcpBridge::new(false));
    let renderer = std::sync::Arc::new(DefaultMarkdownRenderer);
    let orchestrator = PipelineOrchestrator::new("s3", llm, renderer, dir.path()).with_bridge(bridge);

    collect(orchestrator.run("What is ISA 315?".to_string(), agent_config(vec![0], vec![]))).await;

    let resumed_events = collect(orchestrator.resume(
        "no web search, proceed directly".to_string(),
        agent_config(vec![0], vec![]),
    ))
    .await;
    assert!(matches!(
        resumed_events.last(),
        Some(OrchestratorEvent::OrchestratorComplete { .. })
    ));

    let state = researchctl::PipelineState::load_from(orchestrator.session_path()).unwrap();
    let stage1 = state.get_stage_output(1).unwrap();
    assert_eq!(stage1.data.get("execution_status").and_then(|v| v.as_str()), Some("user_skipped"));
}

#[tokio::test]
async fn citation_verification_failure_triggers_one_repair_iteration() {
    let dir = tempfile::tempdir().unwrap();
    let llm = std::sync::Arc::new(FakeLlmProvider::new(vec![
        r#"{"original_query": "What is ISA 315?", "queries": [{"text": "ISA 315"}]}"#,
        r#"{"refined_queries": ["ISA 315"], "warnings": []}"#,
        r#"{"synthesis": "Draft citing p1.", "citations": [{"paragraph_id": "p1", "claim": "risk assessment is required"}]}"#,
        r#"{"synthesis": "Repaired draft citing p1.", "citations": [{"paragraph_id": "p1", "claim": "risk assessment is required"}]}"#,
    ]));
    let bridge = std::sync::Arc::new(FakeMcpBridge::new(true));
    let renderer = std::sync::Arc::new(DefaultMarkdownRenderer);
    let orchestrator = PipelineOrchestrator::new("s4", llm, renderer, dir.path()).with_bridge(bridge);

    let repair_unit = RepairUnit {
        stages: vec![3, 4],
        max_iterations: 2,
        feedback_field: "feedback".to_string(),
    };
    let events = collect(orchestrator.run(
        "What is ISA 315?".to_string(),
        agent_config(vec![], vec![repair_unit]),
    ))
    .await;

    assert!(events
        .iter()
        .any(|e| matches!(e, OrchestratorEvent::OrchestratorRepairStart { iteration: 1, .. })));
    assert!(matches!(
        events.last(),
        Some(OrchestratorEvent::OrchestratorComplete { stages_completed: 6, .. })
    ));

    let state = researchctl::PipelineState::load_from(orchestrator.session_path()).unwrap();
    let verify_output = state.get_stage_output(4).unwrap();
    assert_eq!(verify_output.data.get("needsRepair").and_then(|v| v.as_bool()), Some(false));
}

#[tokio::test]
async fn breakout_mid_pause_then_resume_from_breakout_completes() {
    let dir = tempfile::tempdir().unwrap();
    let llm = std::sync::Arc::new(FakeLlmProvider::new(vec![
        r#"{"original_query": "What is ISA 315?", "queries": [{"text": "ISA 315"}]}"#,
        r#"{"synthesis": "Answer text.", "citations": []}"#,
    ]));
    let renderer = std::sync::Arc::new(DefaultMarkdownRenderer);
    let orchestrator = PipelineOrchestrator::new("s5", llm, renderer, dir.path());

    collect(orchestrator.run("What is ISA 315?".to_string(), agent_config(vec![0], vec![]))).await;

    orchestrator.request_breakout("actually, tell me a joke").unwrap();
    assert_eq!(classify_breakout_reply("1"), Some(BreakoutReply::Confirm));
    let state = orchestrator
        .confirm_breakout(BreakoutReply::Confirm, "actually, tell me a joke")
        .unwrap();
    assert!(!state.is_paused());
    assert!(state.is_resumable_after_breakout());

    let events = collect(orchestrator.resume_from_breakout(
        "What is ISA 315?".to_string(),
        agent_config(vec![0], vec![]),
        1,
    ))
    .await;
    assert!(matches!(
        events.last(),
        Some(OrchestratorEvent::OrchestratorComplete { stages_completed: 6, .. })
    ));
}

#[tokio::test]
async fn follow_up_session_loads_prior_answer_into_stage_zero_context() {
    let dir = tempfile::tempdir().unwrap();

    let first_llm = std::sync::Arc::new(FakeLlmProvider::new(vec![
        r#"{"original_query": "What is ISA 315?", "queries": [{"text": "Q1"}, {"text": "Q2"}]}"#,
        r#"{"synthesis": "## Background\nISA 315 concerns risk assessment.\n", "citations": [{"paragraph_id": "p1", "claim": "risk assessment"}]}"#,
    ]));
    let renderer = std::sync::Arc::new(DefaultMarkdownRenderer);
    let first = PipelineOrchestrator::new("s1", first_llm, renderer.clone(), dir.path());
    let first_events = collect(first.run("What is ISA 315?".to_string(), agent_config(vec![], vec![]))).await;
    assert!(matches!(
        first_events.last(),
        Some(OrchestratorEvent::OrchestratorComplete { .. })
    ));

    let second_llm = std::sync::Arc::new(FakeLlmProvider::new(vec![
        r#"{"original_query": "How does ISA 315 interact with ISA 330?", "queries": [{"text": "Q3"}]}"#,
        r#"{"synthesis": "Follow-up synthesis.", "citations": []}"#,
    ]));
    let second = PipelineOrchestrator::new("s2", second_llm, renderer, dir.path())
        .with_previous_session("s1");
    collect(second.run(
        "How does ISA 315 interact with ISA 330?".to_string(),
        agent_config(vec![], vec![]),
    ))
    .await;

    let state = researchctl::PipelineState::load_from(second.session_path()).unwrap();
    assert_eq!(state.previous_session_id.as_deref(), Some("s1"));
}

#[tokio::test]
async fn is_paused_invariant_matches_pending_versus_resolved_event_counts() {
    let dir = tempfile::tempdir().unwrap();
    let llm = std::sync::Arc::new(FakeLlmProvider::new(vec![
        r#"{"original_query": "Q", "queries": [{"text": "q1"}]}"#,
    ]));
    let renderer = std::sync::Arc::new(DefaultMarkdownRenderer);
    let orchestrator = PipelineOrchestrator::new("s6", llm, renderer, dir.path());

    collect(orchestrator.run("Q".to_string(), agent_config(vec![0], vec![]))).await;
    let state = researchctl::PipelineState::load_from(orchestrator.session_path()).unwrap();
    let pending = state.get_events_by_type(researchctl::StageEventKind::PauseRequested).len();
    let resolved = state.get_events_by_type(researchctl::StageEventKind::Resumed).len();
    assert_eq!(pending, 1);
    assert_eq!(resolved, 0);
    assert!(state.is_paused());
}

#[tokio::test]
async fn resume_without_persisted_state_yields_error_event() {
    let dir = tempfile::tempdir().unwrap();
    let llm = std::sync::Arc::new(FakeLlmProvider::new(vec!["{}"]));
    let renderer = std::sync::Arc::new(DefaultMarkdownRenderer);
    let orchestrator = PipelineOrchestrator::new("missing", llm, renderer, dir.path());

    let events = collect(orchestrator.resume("go".to_string(), agent_config(vec![], vec![]))).await;
    assert!(matches!(events.as_slice(), [OrchestratorEvent::OrchestratorError { .. }]));
}
