//! Concrete [`crate::llm_provider::LlmProvider`] adapters.
//!
//! The embedding LLM provider is an out-of-scope collaborator reached only
//! through the trait; this crate ships exactly one concrete adapter
//! (`claude`) so the trait boundary is exercised end to end, matching
//! `cloudllm::clients`'s pattern of one module per vendor.

pub mod claude;
