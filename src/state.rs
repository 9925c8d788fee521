//! Immutable, event-sourced pipeline state.
//!
//! `PipelineState` never mutates in place: every operation that "changes"
//! state (`add_event`, `set_stage_output`) takes `&self` and returns a new
//! `PipelineState`, built with structural sharing via `Arc` over the event
//! vector's items. This is the same observable guarantee
//! `cloudllm::thought_chain::ThoughtChain` gives its callers (append, then
//! recompute derived facts from the log), generalized to a ten-variant
//! event set instead of a hash-chained five-variant one.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PipelineError, PipelineResult};

/// The fixed set of event kinds that can appear in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageEventKind {
    StageStarted,
    StageCompleted,
    StageFailed,
    PauseRequested,
    PauseFormatted,
    Resumed,
    BreakoutPending,
    Breakout,
    BreakoutResumePending,
    ResumeFromBreakout,
}

/// A single entry in the append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEvent {
    #[serde(rename = "type")]
    pub kind: StageEventKind,
    pub stage: usize,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Value,
}

impl StageEvent {
    pub fn new(kind: StageEventKind, stage: usize, data: Value) -> Self {
        StageEvent {
            kind,
            stage,
            timestamp: Utc::now(),
            data,
        }
    }
}

/// Token usage counters attached to a stage result, summed for cost
/// accounting and for `total_usage`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

impl TokenUsage {
    pub fn total(&self) -> usize {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&self, other: &TokenUsage) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens + other.input_tokens,
            output_tokens: self.output_tokens + other.output_tokens,
        }
    }
}

/// The completed output of one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub text: String,
    pub summary: String,
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default)]
    pub data: Value,
}

impl StageResult {
    pub fn skipped(summary: impl Into<String>, data: Value) -> Self {
        StageResult {
            text: String::new(),
            summary: summary.into(),
            usage: TokenUsage::default(),
            data,
        }
    }
}

/// A lightweight serializable snapshot used for persistence and for the
/// property-law "round trips indistinguishably except `savedAt`".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStateSnapshot {
    pub session_id: String,
    pub agent_slug: String,
    #[serde(default)]
    pub previous_session_id: Option<String>,
    pub events: Vec<StageEvent>,
    /// Stage index keys are serialized as strings because JSON object keys
    /// must be strings; `BTreeMap` keeps them ordered for byte-stable
    /// output, satisfying invariant 6 (idempotent persistence).
    pub stage_outputs: BTreeMap<String, StageResult>,
    pub current_stage: i64,
    pub saved_at: DateTime<Utc>,
}

/// The central, immutable, event-sourced pipeline state.
#[derive(Debug, Clone)]
pub struct PipelineState {
    pub session_id: String,
    pub agent_slug: String,
    pub previous_session_id: Option<String>,
    events: Arc<Vec<StageEvent>>,
    stage_outputs: Arc<BTreeMap<usize, StageResult>>,
    pub current_stage: i64,
}

impl PipelineState {
    /// Creates an empty state at run start.
    pub fn create(session_id: impl Into<String>, agent_slug: impl Into<String>) -> Self {
        PipelineState {
            session_id: session_id.into(),
            agent_slug: agent_slug.into(),
            previous_session_id: None,
            events: Arc::new(Vec::new()),
            stage_outputs: Arc::new(BTreeMap::new()),
            current_stage: -1,
        }
    }

    pub fn with_previous_session(mut self, previous_session_id: impl Into<String>) -> Self {
        self.previous_session_id = Some(previous_session_id.into());
        self
    }

    /// Appends an event, returning a new state. The current stage pointer
    /// advances whenever a `stage_started` event names a later stage.
    pub fn add_event(&self, kind: StageEventKind, stage: usize, data: Value) -> PipelineState {
        let mut events = (*self.events).clone();
        let advances_stage = kind == StageEventKind::StageStarted;
        events.push(StageEvent::new(kind, stage, data));
        let current_stage = if advances_stage {
            stage as i64
        } else {
            self.current_stage
        };
        PipelineState {
            session_id: self.session_id.clone(),
            agent_slug: self.agent_slug.clone(),
            previous_session_id: self.previous_session_id.clone(),
            events: Arc::new(events),
            stage_outputs: self.stage_outputs.clone(),
            current_stage,
        }
    }

    /// Records the completed output for a stage, returning a new state.
    pub fn set_stage_output(&self, stage: usize, result: StageResult) -> PipelineState {
        let mut outputs = (*self.stage_outputs).clone();
        outputs.insert(stage, result);
        PipelineState {
            session_id: self.session_id.clone(),
            agent_slug: self.agent_slug.clone(),
            previous_session_id: self.previous_session_id.clone(),
            events: self.events.clone(),
            stage_outputs: Arc::new(outputs),
            current_stage: self.current_stage,
        }
    }

    pub fn get_stage_output(&self, stage: usize) -> Option<&StageResult> {
        self.stage_outputs.get(&stage)
    }

    pub fn events(&self) -> &[StageEvent] {
        &self.events
    }

    pub fn get_events_by_type(&self, kind: StageEventKind) -> Vec<&StageEvent> {
        self.events.iter().filter(|e| e.kind == kind).collect()
    }

    pub fn get_events_for_stage(&self, stage: usize) -> Vec<&StageEvent> {
        self.events.iter().filter(|e| e.stage == stage).collect()
    }

    // ---- Derived predicates, computed on demand from `events` ----

    pub fn is_paused(&self) -> bool {
        let pending = self
            .get_events_by_type(StageEventKind::PauseRequested)
            .len();
        let resolved = self.get_events_by_type(StageEventKind::Resumed).len()
            + self.get_events_by_type(StageEventKind::Breakout).len();
        pending > resolved
    }

    pub fn is_breakout_pending(&self) -> bool {
        let last_pending_idx = self
            .events
            .iter()
            .rposition(|e| e.kind == StageEventKind::BreakoutPending);
        match last_pending_idx {
            None => false,
            Some(idx) => !self.events[idx + 1..].iter().any(|e| {
                e.kind == StageEventKind::Resumed || e.kind == StageEventKind::Breakout
            }),
        }
    }

    pub fn is_resumable_after_breakout(&self) -> bool {
        let last_breakout_idx = self
            .events
            .iter()
            .rposition(|e| e.kind == StageEventKind::Breakout);
        let has_unresolved_breakout = match last_breakout_idx {
            None => false,
            Some(idx) => !self.events[idx + 1..]
                .iter()
                .any(|e| e.kind == StageEventKind::ResumeFromBreakout),
        };
        has_unresolved_breakout && self.last_completed_stage_index() >= 0 && !self.is_paused()
    }

    pub fn last_completed_stage_index(&self) -> i64 {
        self.get_events_by_type(StageEventKind::StageCompleted)
            .iter()
            .map(|e| e.stage as i64)
            .max()
            .unwrap_or(-1)
    }

    pub fn paused_at_stage(&self) -> Option<usize> {
        if !self.is_paused() {
            return None;
        }
        self.events
            .iter()
            .rev()
            .find(|e| e.kind == StageEventKind::PauseRequested)
            .map(|e| e.stage)
    }

    pub fn total_usage(&self) -> TokenUsage {
        self.stage_outputs
            .values()
            .fold(TokenUsage::default(), |acc, r| acc.add(&r.usage))
    }

    /// Extracted from stage-0 output's `data.original_query` /
    /// `data.queries[*].text` (normalized by the stage-0 handler before
    /// being stored).
    pub fn original_query(&self) -> Option<String> {
        self.get_stage_output(0)
            .and_then(|r| r.data.get("original_query"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn sub_query_texts(&self) -> Vec<String> {
        self.get_stage_output(0)
            .and_then(|r| r.data.get("queries"))
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|q| {
                        q.get("text")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                            .or_else(|| q.as_str().map(str::to_string))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    // ---- Persistence ----

    pub fn to_snapshot(&self) -> PipelineStateSnapshot {
        let stage_outputs = self
            .stage_outputs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        PipelineStateSnapshot {
            session_id: self.session_id.clone(),
            agent_slug: self.agent_slug.clone(),
            previous_session_id: self.previous_session_id.clone(),
            events: (*self.events).clone(),
            stage_outputs,
            current_stage: self.current_stage,
            saved_at: Utc::now(),
        }
    }

    pub fn from_snapshot(snapshot: PipelineStateSnapshot) -> PipelineState {
        let stage_outputs = snapshot
            .stage_outputs
            .into_iter()
            .filter_map(|(k, v)| k.parse::<usize>().ok().map(|idx| (idx, v)))
            .collect();
        PipelineState {
            session_id: snapshot.session_id,
            agent_slug: snapshot.agent_slug,
            previous_session_id: snapshot.previous_session_id,
            events: Arc::new(snapshot.events),
            stage_outputs: Arc::new(stage_outputs),
            current_stage: snapshot.current_stage,
        }
    }

    fn state_path(dir: &Path) -> PathBuf {
        dir.join("data").join("pipeline-state.json")
    }

    pub fn save_to(&self, dir: impl AsRef<Path>) -> PipelineResult<()> {
        let dir = dir.as_ref();
        let path = Self::state_path(dir);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let snapshot = self.to_snapshot();
        let json = serde_json::to_string_pretty(&snapshot).map_err(|e| {
            Box::new(PipelineError::Io(e.to_string())) as Box<dyn std::error::Error + Send + Sync>
        })?;
        std::fs::write(&path, json)?;
        Ok(())
    }

    /// Returns `None` on missing file or parse failure; never throws.
    pub fn load_from(dir: impl AsRef<Path>) -> Option<PipelineState> {
        let path = Self::state_path(dir.as_ref());
        let raw = std::fs::read_to_string(path).ok()?;
        let snapshot: PipelineStateSnapshot = serde_json::from_str(&raw).ok()?;
        Some(PipelineState::from_snapshot(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_state_has_documented_defaults() {
        let s = PipelineState::create("s1", "auditor");
        assert!(!s.is_paused());
        assert!(!s.is_breakout_pending());
        assert!(!s.is_resumable_after_breakout());
        assert_eq!(s.last_completed_stage_index(), -1);
        assert_eq!(s.paused_at_stage(), None);
        assert_eq!(s.total_usage().total(), 0);
    }

    #[test]
    fn add_event_never_mutates_original() {
        let s0 = PipelineState::create("s1", "auditor");
        let s1 = s0.add_event(StageEventKind::StageStarted, 0, json!({}));
        assert_eq!(s0.events().len(), 0);
        assert_eq!(s1.events().len(), 1);
        assert_eq!(s0.current_stage, -1);
        assert_eq!(s1.current_stage, 0);
    }

    #[test]
    fn is_paused_counts_pending_vs_resolving() {
        let s = PipelineState::create("s1", "auditor")
            .add_event(StageEventKind::PauseRequested, 0, json!({}));
        assert!(s.is_paused());
        let s = s.add_event(StageEventKind::Resumed, 0, json!({"text": "go"}));
        assert!(!s.is_paused());
    }

    #[test]
    fn breakout_clears_paused() {
        let s = PipelineState::create("s1", "auditor")
            .add_event(StageEventKind::StageStarted, 0, json!({}))
            .add_event(StageEventKind::StageCompleted, 0, json!({}))
            .add_event(StageEventKind::PauseRequested, 0, json!({}))
            .add_event(StageEventKind::BreakoutPending, 0, json!({}))
            .add_event(StageEventKind::Breakout, 0, json!({"message": "other topic"}));
        assert!(!s.is_paused());
        assert!(s.is_resumable_after_breakout());
    }

    #[test]
    fn snapshot_round_trip_preserves_observable_state() {
        let s = PipelineState::create("s1", "auditor")
            .add_event(StageEventKind::StageStarted, 0, json!({}))
            .set_stage_output(
                0,
                StageResult {
                    text: "hello".into(),
                    summary: "hi".into(),
                    usage: TokenUsage {
                        input_tokens: 10,
                        output_tokens: 5,
                    },
                    data: json!({"original_query": "What is ISA 315?"}),
                },
            );
        let snap = s.to_snapshot();
        let roundtripped = PipelineState::from_snapshot(snap);
        assert_eq!(roundtripped.events().len(), s.events().len());
        assert_eq!(
            roundtripped.get_stage_output(0).unwrap().text,
            s.get_stage_output(0).unwrap().text
        );
        assert_eq!(roundtripped.original_query(), s.original_query());
        assert_eq!(roundtripped.current_stage, s.current_stage);
    }

    #[test]
    fn save_then_load_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let s = PipelineState::create("s1", "auditor")
            .add_event(StageEventKind::StageStarted, 0, json!({}))
            .set_stage_output(
                0,
                StageResult {
                    text: "hello".into(),
                    summary: "hi".into(),
                    usage: TokenUsage::default(),
                    data: json!({}),
                },
            );
        s.save_to(dir.path()).unwrap();
        let loaded = PipelineState::load_from(dir.path()).unwrap();
        assert_eq!(loaded.session_id, "s1");
        assert_eq!(loaded.get_stage_output(0).unwrap().text, "hello");
    }

    #[test]
    fn load_from_missing_dir_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(PipelineState::load_from(dir.path()).is_none());
    }
}
