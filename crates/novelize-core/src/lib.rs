//! Novelize Core - Domain models, traits, and shared types
//!
//! This crate defines the core abstractions used throughout Novelize:
//! - Entity model (entities, notes, the insertion-ordered entity table)
//! - Common error types, including the gateway failure taxonomy
//! - The completion gateway trait every model backend implements
//! - Configuration management

pub mod config;
pub mod entity;

pub use config::{
    AmbiguityPolicy, AppConfig, ConfigError, ConsolidationConfig, ExportConfig,
    ExtractionConfig, ExtractionMode, LlmConfig, LlmProvider, LoggingConfig, RateLimitConfig,
    ResolutionConfig, RetryConfig,
};
pub use entity::{CandidatePair, Decision, Entity, EntityTable, Note, NOTE_DELIMITER};

use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Failure reported by a completion gateway.
///
/// `Throttled` and `Transient` are retried by the retry layer; `Fatal` never
/// is. `Exhausted` is produced once the retry layer runs out of attempts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Gateway throttled: {0}")]
    Throttled(String),

    #[error("Transient gateway failure: {0}")]
    Transient(String),

    #[error("Fatal gateway failure: {0}")]
    Fatal(String),

    #[error("Gateway gave up after {attempts} attempts: {message}")]
    Exhausted { attempts: u32, message: String },
}

/// Discriminant of a [`GatewayError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayErrorKind {
    Throttled,
    Transient,
    Fatal,
    Exhausted,
}

impl GatewayError {
    pub fn kind(&self) -> GatewayErrorKind {
        match self {
            Self::Throttled(_) => GatewayErrorKind::Throttled,
            Self::Transient(_) => GatewayErrorKind::Transient,
            Self::Fatal(_) => GatewayErrorKind::Fatal,
            Self::Exhausted { .. } => GatewayErrorKind::Exhausted,
        }
    }

    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Throttled(_) | Self::Transient(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// The failure description without the kind prefix
    pub fn message(&self) -> &str {
        match self {
            Self::Throttled(m) | Self::Transient(m) | Self::Fatal(m) => m,
            Self::Exhausted { message, .. } => message,
        }
    }
}

/// Core error types for Novelize operations
#[derive(Error, Debug)]
pub enum NovelizeError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Ambiguous resolution for '{candidate}': {matches:?}")]
    AmbiguousResolution {
        candidate: String,
        matches: Vec<String>,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Export error: {0}")]
    ExportError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl NovelizeError {
    /// Errors that must abort a whole session rather than a single chunk or candidate
    pub fn is_session_fatal(&self) -> bool {
        match self {
            Self::ConfigError(_) => true,
            Self::Gateway(e) => e.is_fatal(),
            _ => false,
        }
    }
}

impl From<ConfigError> for NovelizeError {
    fn from(e: ConfigError) -> Self {
        Self::ConfigError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NovelizeError>;

// ============================================================================
// Completion Gateway
// ============================================================================

/// Per-call generation options.
///
/// Unset fields fall back to the gateway's configured defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionOptions {
    pub max_output_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub stop_sequences: Vec<String>,
}

impl CompletionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the output token cap
    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = Some(tokens);
        self
    }

    /// Set the sampling temperature
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Add a stop sequence
    pub fn with_stop_sequence(mut self, stop: impl Into<String>) -> Self {
        self.stop_sequences.push(stop.into());
        self
    }
}

/// Text-completion capability the engine treats as a black box.
///
/// One call is one blocking request/response from the caller's point of view;
/// the engine never issues two calls concurrently within a session.
#[async_trait::async_trait]
pub trait CompletionGateway: Send + Sync {
    /// Generate text for a prompt
    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> std::result::Result<String, GatewayError>;

    /// Gateway name for logging
    fn name(&self) -> &str;
}

#[async_trait::async_trait]
impl<G: CompletionGateway + ?Sized> CompletionGateway for std::sync::Arc<G> {
    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> std::result::Result<String, GatewayError> {
        (**self).complete(prompt, options).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

// ============================================================================
// Tests
// ============================================================================
