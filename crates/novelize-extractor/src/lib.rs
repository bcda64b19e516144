//! Novelize Extractor - Character extraction pipeline
//!
//! Turns prose chunks into `(name, action)` candidate pairs through a
//! completion gateway, and owns the prompt templates and the response
//! grammar shared with the resolution engine.

use async_trait::async_trait;
use novelize_core::Result;

pub mod adapter;
pub mod parser;
pub mod prompts;

pub use adapter::{ExtractionAdapter, ExtractionOutcome, StopReason};
pub use parser::{ParsedResponse, ResponseParser};
pub use prompts::PromptBuilder;

/// Trait for candidate extractors
#[async_trait]
pub trait CandidateExtractor: Send + Sync {
    async fn extract(&self, chunk: &str) -> Result<ExtractionOutcome>;
}
