//! Novelize LLM - Completion gateway implementations
//!
//! Provides the provider clients plus the decorators that make a remote
//! model usable from the engine:
//! - [`RateLimitedGateway`] paces calls (governor GCRA quota)
//! - [`TimeoutGateway`] bounds each provider call
//! - [`RetryingGateway`] applies bounded exponential retry
//!
//! Author: hephaex@gmail.com

use std::sync::Arc;

use novelize_core::{AppConfig, CompletionGateway, LlmConfig, LlmProvider, RateLimitConfig, Result};

pub mod error_parsing;
pub mod llm;
pub mod rate_limit;
pub mod retry;

pub use llm::{AnthropicGateway, OllamaGateway, OpenAiGateway};
pub use rate_limit::{limiter_from_config, DirectRateLimiter, RateLimitedGateway};
pub use retry::{RetryPolicy, RetryingGateway, TimeoutGateway};

/// Gateway handle produced by [`build_gateway`]
pub type SessionGateway = RetryingGateway<Arc<dyn CompletionGateway>>;

/// Create the bare provider client from config
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn CompletionGateway>> {
    match config.provider {
        LlmProvider::OpenAI | LlmProvider::Azure => Ok(Arc::new(OpenAiGateway::from_config(config)?)),
        LlmProvider::Anthropic => Ok(Arc::new(AnthropicGateway::from_config(config)?)),
        LlmProvider::Ollama => Ok(Arc::new(OllamaGateway::from_config(config)?)),
    }
}

/// Assemble provider -> timeout -> pacing -> retry for one session
pub fn build_gateway(config: &AppConfig) -> Result<SessionGateway> {
    let provider = create_provider(&config.llm)?;
    tracing::info!(
        provider = provider.name(),
        model = %config.llm.model,
        "Gateway created"
    );

    let policy = RetryPolicy::from_config(&config.retry, config.llm.timeout_secs);
    Ok(layer_gateway(provider, &config.rate_limit, policy))
}

/// Stack the decorators around a provider.
///
/// The policy's per-attempt timeout is moved below the pacing layer, so a call
/// waiting for its slot is never cut short by the deadline.
pub fn layer_gateway(
    provider: Arc<dyn CompletionGateway>,
    rate_limit: &RateLimitConfig,
    mut policy: RetryPolicy,
) -> SessionGateway {
    let bounded: Arc<dyn CompletionGateway> = match policy.timeout.take() {
        Some(timeout) => Arc::new(TimeoutGateway::new(provider, timeout)),
        None => provider,
    };

    let paced: Arc<dyn CompletionGateway> =
        match RateLimitedGateway::from_config(bounded.clone(), rate_limit) {
            Some(gateway) => Arc::new(gateway),
            None => bounded,
        };

    RetryingGateway::new(paced, policy)
}
