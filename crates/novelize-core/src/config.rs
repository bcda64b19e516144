//! Novelize Configuration Management
//!
//! Handles configuration from environment variables and TOML files
//! with sensible defaults for local development.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// LLM provider configuration
    pub llm: LlmConfig,

    /// Retry/backoff around gateway calls
    pub retry: RetryConfig,

    /// Request pacing
    pub rate_limit: RateLimitConfig,

    /// Character extraction
    pub extraction: ExtractionConfig,

    /// Entity resolution
    pub resolution: ResolutionConfig,

    /// Note consolidation
    pub consolidation: ConsolidationConfig,

    /// Tabular export
    pub export: ExportConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::FileReadError {
            path: path.clone(),
            source: e,
        })?;

        Self::from_toml_str(&content).map_err(|e| match e {
            ConfigError::ParseError { message, .. } => ConfigError::ParseError { path, message },
            other => other,
        })
    }

    /// Parse TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: PathBuf::from("<inline>"),
            message: e.to_string(),
        })
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError {
            path: PathBuf::from("<inline>"),
            message: e.to_string(),
        })
    }

    /// Merge with environment variables (env takes precedence)
    pub fn with_env_override(mut self) -> Result<Self, ConfigError> {
        self.apply_env()?;
        Ok(self)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        // LLM
        if let Ok(provider) = std::env::var("LLM_PROVIDER") {
            self.llm.provider = provider.parse()?;
        }
        if let Ok(model) = std::env::var("LLM_MODEL") {
            self.llm.model = model;
        }
        if let Ok(url) = std::env::var("LLM_BASE_URL") {
            self.llm.base_url = Some(url);
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            self.llm.openai_api_key = Some(key);
        }
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            self.llm.anthropic_api_key = Some(key);
        }
        if let Ok(url) = std::env::var("OLLAMA_URL") {
            self.llm.ollama_url = url;
        }
        if let Some(secs) = parse_env("LLM_TIMEOUT_SECS")? {
            self.llm.timeout_secs = secs;
        }

        // Engine
        if let Ok(mode) = std::env::var("NOVELIZE_EXTRACTION_MODE") {
            self.extraction.mode = mode.parse()?;
        }
        if let Some(threshold) = parse_env("NOVELIZE_NOTE_THRESHOLD")? {
            self.consolidation.threshold_chars = threshold;
        }
        if let Some(attempts) = parse_env("NOVELIZE_MAX_ATTEMPTS")? {
            self.retry.max_attempts = attempts;
        }
        if let Ok(policy) = std::env::var("NOVELIZE_AMBIGUITY_POLICY") {
            self.resolution.ambiguity_policy = policy.parse()?;
        }
        if let Some(rpm) = parse_env("NOVELIZE_RPM")? {
            self.rate_limit.requests_per_minute = Some(rpm);
        }

        // Logging
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.logging.level = level;
        }

        Ok(())
    }

    /// Check the configuration before a session starts
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "retry.max_attempts".to_string(),
                value: "0".to_string(),
            });
        }
        if self.consolidation.threshold_chars == 0 {
            return Err(ConfigError::InvalidValue {
                key: "consolidation.threshold_chars".to_string(),
                value: "0".to_string(),
            });
        }
        if self.rate_limit.requests_per_minute == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "rate_limit.requests_per_minute".to_string(),
                value: "0".to_string(),
            });
        }
        for (key, value) in [
            ("extraction.none_sentinel", &self.extraction.none_sentinel),
            ("extraction.end_sentinel", &self.extraction.end_sentinel),
            ("resolution.new_sentinel", &self.resolution.new_sentinel),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: value.clone(),
                });
            }
        }

        match self.llm.provider {
            LlmProvider::OpenAI | LlmProvider::Azure if self.llm.openai_api_key.is_none() => {
                Err(ConfigError::MissingRequired("OPENAI_API_KEY".to_string()))
            }
            LlmProvider::Anthropic if self.llm.anthropic_api_key.is_none() => {
                Err(ConfigError::MissingRequired("ANTHROPIC_API_KEY".to_string()))
            }
            _ => Ok(()),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// LLM provider to use
    pub provider: LlmProvider,

    /// OpenAI API key
    pub openai_api_key: Option<String>,

    /// Anthropic API key
    pub anthropic_api_key: Option<String>,

    /// Base URL override (Azure, proxies, compatible APIs)
    pub base_url: Option<String>,

    /// Ollama server URL
    pub ollama_url: String,

    /// Model name to use
    pub model: String,

    /// Default maximum tokens for completion
    pub max_tokens: u32,

    /// Default temperature for generation
    pub temperature: f32,

    /// Per-attempt request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Anthropic,
            openai_api_key: None,
            anthropic_api_key: None,
            base_url: None,
            ollama_url: "http://localhost:11434".to_string(),
            model: "claude-3-5-sonnet-latest".to_string(),
            max_tokens: 4096,
            temperature: 0.1,
            timeout_secs: 60,
        }
    }
}

/// Supported LLM providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    OpenAI,
    Anthropic,
    Ollama,
    Azure,
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "ollama" => Ok(Self::Ollama),
            "azure" => Ok(Self::Azure),
            _ => Err(ConfigError::InvalidValue {
                key: "LLM_PROVIDER".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Retry/backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per call, including the first
    pub max_attempts: u32,

    /// Unit delay in milliseconds; retry n (counting from 1) waits
    /// `base_delay_ms * multiplier^n`, so 2s before the first retry by default
    pub base_delay_ms: u64,

    /// Exponential growth factor
    pub multiplier: u64,

    /// Upper bound on a single wait
    pub max_delay_ms: u64,

    /// Randomize waits
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            multiplier: 2,
            max_delay_ms: 60_000,
            jitter: true,
        }
    }
}

/// Request pacing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Sustained request rate; `None` disables pacing
    pub requests_per_minute: Option<u32>,

    /// Requests allowed back-to-back before pacing kicks in
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: None,
            burst: 1,
        }
    }
}

/// How characters are pulled out of a chunk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionMode {
    /// One call returns every character in the chunk
    #[default]
    Exhaustive,
    /// Repeated calls, one new character each, until the end sentinel
    Incremental,
}

impl std::str::FromStr for ExtractionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "exhaustive" | "all" => Ok(Self::Exhaustive),
            "incremental" | "single" => Ok(Self::Incremental),
            _ => Err(ConfigError::InvalidValue {
                key: "extraction.mode".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for ExtractionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exhaustive => write!(f, "exhaustive"),
            Self::Incremental => write!(f, "incremental"),
        }
    }
}

/// Extraction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub mode: ExtractionMode,

    /// Response line meaning "no characters in this chunk"
    pub none_sentinel: String,

    /// Response line meaning "no more new characters" (incremental mode)
    pub end_sentinel: String,

    /// Hard cap on incremental calls per chunk
    pub max_entities_per_chunk: usize,

    /// Output token cap for extraction calls
    pub max_output_tokens: u32,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            mode: ExtractionMode::Exhaustive,
            none_sentinel: "<none>".to_string(),
            end_sentinel: "<end>".to_string(),
            max_entities_per_chunk: 50,
            max_output_tokens: 1000,
        }
    }
}

/// What to do when the gateway names several existing entities
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguityPolicy {
    /// Attribute the action to the first named entity and log a warning
    #[default]
    PickFirst,
    /// Create a new entity keyed by the raw candidate name
    TreatAsNew,
}

impl std::str::FromStr for AmbiguityPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "pick_first" | "first" => Ok(Self::PickFirst),
            "treat_as_new" | "new" => Ok(Self::TreatAsNew),
            _ => Err(ConfigError::InvalidValue {
                key: "resolution.ambiguity_policy".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Entity resolution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionConfig {
    pub ambiguity_policy: AmbiguityPolicy,

    /// Response meaning "this is a new character"
    pub new_sentinel: String,

    /// Skip the gateway when the candidate equals a known identifier
    pub shortcut_exact_match: bool,

    /// Output token cap for classification calls
    pub max_output_tokens: u32,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            ambiguity_policy: AmbiguityPolicy::PickFirst,
            new_sentinel: "<new>".to_string(),
            shortcut_exact_match: true,
            max_output_tokens: 100,
        }
    }
}

/// Note consolidation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    /// Notes longer than this (in characters) are summarized on the next update
    pub threshold_chars: usize,

    /// Word budget requested from the summarizer
    pub summary_word_limit: usize,

    /// Output token cap for summarization calls
    pub max_output_tokens: u32,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            threshold_chars: 500,
            summary_word_limit: 100,
            max_output_tokens: 1000,
        }
    }
}

/// Export configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Destination CSV file
    pub path: PathBuf,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("characters_summary.csv"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// JSON format for logs
    pub json_format: bool,

    /// Include file/line in logs
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            include_location: false,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}
