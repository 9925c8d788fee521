//! Error types shared across the pipeline.
//!
//! Hand-rolled enums implementing [`std::fmt::Display`] and
//! [`std::error::Error`] rather than pulling in a derive-macro error crate.
//! Fallible functions throughout this crate return
//! `Result<T, Box<dyn std::error::Error + Send + Sync>>`; `PipelineError`
//! (and the smaller per-subsystem enums alongside it) are the concrete
//! values usually boxed into that slot.

use std::fmt;

/// Errors surfaced by the orchestrator driver, stage runner, and the
/// subsystems they call directly.
#[derive(Debug, Clone)]
pub enum PipelineError {
    /// A tool or model response failed schema validation. Fatal to the
    /// stage that produced it.
    SchemaMismatch { tool_name: String, detail: String },
    /// The model's output could not be parsed as JSON at all. Callers
    /// should prefer [`crate::json_extract::extract_json`], which degrades
    /// to a `rawText` sentinel instead of returning this variant; this
    /// variant exists for the rare case where even that extraction blows
    /// up (e.g. no text content at all).
    MalformedJson { context: String },
    /// An MCP bridge call transported but reported `isError`.
    ToolTransportFailure { tool_name: String, detail: String },
    /// Estimated input tokens plus the minimum output floor exceed the
    /// model's context window.
    ContextOverflow {
        estimated_input: usize,
        min_output: usize,
        context_window: usize,
    },
    /// Cumulative cost has crossed the configured budget.
    BudgetExceeded { spent_usd: f64, budget_usd: f64 },
    /// A stage ran without a precondition it needed (e.g. retrieve with no
    /// query source available). Callers should treat this as "return an
    /// empty/skipped result", not as a fatal error, but the type exists for
    /// code paths that want to surface it explicitly.
    MissingPrecondition { detail: String },
    /// Persisted state could not be loaded (missing file, unreadable,
    /// unparsable). `PipelineState::load_from` swallows this into `None`
    /// per spec; the driver's `resume`/`resume_from_breakout` entry points
    /// surface it as an error event instead.
    StateLoadFailure { path: String, detail: String },
    /// A stage handler raised an unexpected error (as opposed to a
    /// recoverable/expected failure kind above).
    StageFailed { stage: usize, detail: String },
    /// Generic I/O failure wrapping the underlying message.
    Io(String),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::SchemaMismatch { tool_name, detail } => {
                write!(f, "schema mismatch for tool '{}': {}", tool_name, detail)
            }
            PipelineError::MalformedJson { context } => {
                write!(f, "malformed JSON in {}", context)
            }
            PipelineError::ToolTransportFailure { tool_name, detail } => {
                write!(f, "tool '{}' transport failure: {}", tool_name, detail)
            }
            PipelineError::ContextOverflow {
                estimated_input,
                min_output,
                context_window,
            } => write!(
                f,
                "context overflow: estimated input {} + min output {} exceeds window {}",
                estimated_input, min_output, context_window
            ),
            PipelineError::BudgetExceeded {
                spent_usd,
                budget_usd,
            } => write!(
                f,
                "budget exceeded: spent ${:.4} of ${:.4}",
                spent_usd, budget_usd
            ),
            PipelineError::MissingPrecondition { detail } => {
                write!(f, "missing precondition: {}", detail)
            }
            PipelineError::StateLoadFailure { path, detail } => {
                write!(f, "failed to load state from '{}': {}", path, detail)
            }
            PipelineError::StageFailed { stage, detail } => {
                write!(f, "stage {} failed: {}", stage, detail)
            }
            PipelineError::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::Io(e.to_string())
    }
}

/// Convenience alias used throughout the crate for fallible async returns.
pub type PipelineResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Boxes a [`PipelineError`] into the crate-wide error object slot.
pub fn boxed(err: PipelineError) -> Box<dyn std::error::Error + Send + Sync> {
    Box::new(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_budget_exceeded() {
        let err = PipelineError::BudgetExceeded {
            spent_usd: 1.5,
            budget_usd: 1.0,
        };
        assert_eq!(format!("{}", err), "budget exceeded: spent $1.5000 of $1.0000");
    }

    #[test]
    fn converts_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "nope");
        let pe: PipelineError = io_err.into();
        matches!(pe, PipelineError::Io(_));
    }
}
