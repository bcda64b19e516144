//! Extraction adapter
//!
//! Turns one chunk of prose into candidate pairs using either:
//! - Exhaustive mode: a single call returning every character at once
//! - Incremental mode: repeated single-character calls with a per-chunk
//!   exclusion list, until the model signals there is nobody left
//!
//! A malformed response ends the chunk without a retry. Only a fatal gateway
//! failure is returned as an error; everything else is reported through
//! [`StopReason`] so the caller can keep what was gathered.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use novelize_core::{
    CandidatePair, CompletionGateway, CompletionOptions, ExtractionConfig, ExtractionMode,
    Result,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::parser::ResponseParser;
use crate::prompts::PromptBuilder;
use crate::CandidateExtractor;

// ============================================================================
// Outcome
// ============================================================================

/// Why extraction stopped for a chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum StopReason {
    /// The exhaustive response was read to the end
    Complete,
    /// The model answered with a sentinel
    Sentinel,
    /// The response had no `Name: Action` line
    Malformed,
    /// The model offered a name it already gave for this chunk
    RepeatedName(String),
    /// `max_entities_per_chunk` reached
    Limit,
    /// Non-fatal gateway failure
    GatewayFailure(String),
}

impl StopReason {
    /// Terminal failure rather than a normal end of the chunk
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Malformed | Self::GatewayFailure(_))
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete => write!(f, "complete"),
            Self::Sentinel => write!(f, "sentinel"),
            Self::Malformed => write!(f, "malformed response"),
            Self::RepeatedName(name) => write!(f, "repeated name '{name}'"),
            Self::Limit => write!(f, "entity limit reached"),
            Self::GatewayFailure(msg) => write!(f, "gateway failure: {msg}"),
        }
    }
}

/// Candidates extracted from one chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractionOutcome {
    pub candidates: Vec<CandidatePair>,
    pub stop: StopReason,
    /// Gateway calls made for this chunk
    pub calls: u32,
}

impl ExtractionOutcome {
    fn new(candidates: Vec<CandidatePair>, stop: StopReason, calls: u32) -> Self {
        Self {
            candidates,
            stop,
            calls,
        }
    }

    /// The model reported no characters at all
    pub fn found_nothing(&self) -> bool {
        self.candidates.is_empty() && self.stop == StopReason::Sentinel
    }

    /// Extraction failed before yielding anything
    pub fn failed(&self) -> bool {
        self.candidates.is_empty() && self.stop.is_failure()
    }
}

// ============================================================================
// Adapter
// ============================================================================

/// Gateway-backed extractor supporting both modes
pub struct ExtractionAdapter {
    gateway: Arc<dyn CompletionGateway>,
    prompts: PromptBuilder,
    parser: ResponseParser,
    config: ExtractionConfig,
}

impl ExtractionAdapter {
    /// Create an adapter; fails on unusable sentinel configuration
    pub fn new(gateway: Arc<dyn CompletionGateway>, config: ExtractionConfig) -> Result<Self> {
        Ok(Self {
            parser: ResponseParser::from_config(&config)?,
            prompts: PromptBuilder::new(),
            gateway,
            config,
        })
    }

    /// Use custom prompt templates
    pub fn with_prompts(mut self, prompts: PromptBuilder) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn mode(&self) -> ExtractionMode {
        self.config.mode
    }

    fn options(&self) -> CompletionOptions {
        CompletionOptions::new().with_max_output_tokens(self.config.max_output_tokens)
    }

    /// One call, every character
    pub async fn extract_all(&self, chunk: &str) -> Result<ExtractionOutcome> {
        let prompt = self.prompts.extract_all(chunk, &self.config.none_sentinel);
        debug!(prompt_chars = prompt.len(), "Exhaustive extraction prompt built");

        let started = Instant::now();
        let response = match self.gateway.complete(&prompt, &self.options()).await {
            Ok(response) => response,
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                warn!(error = %e, "Exhaustive extraction call failed");
                return Ok(ExtractionOutcome::new(
                    Vec::new(),
                    StopReason::GatewayFailure(e.to_string()),
                    1,
                ));
            }
        };
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Exhaustive extraction call finished"
        );

        let parsed = self.parser.parse(&response);
        if parsed.discarded > 0 {
            debug!(discarded = parsed.discarded, "Lines outside the grammar discarded");
        }

        let stop = if !parsed.pairs.is_empty() {
            StopReason::Complete
        } else if parsed.sentinel.is_some() {
            StopReason::Sentinel
        } else {
            warn!(response = %response.trim(), "Malformed extraction response");
            StopReason::Malformed
        };

        Ok(ExtractionOutcome::new(parsed.pairs, stop, 1))
    }

    /// Repeated single-character calls until the model runs out
    pub async fn extract_incremental(&self, chunk: &str) -> Result<ExtractionOutcome> {
        // exclusion list is scoped to this chunk
        let mut seen: Vec<String> = Vec::new();
        let mut candidates = Vec::new();
        let mut calls = 0u32;
        let options = self.options();

        let stop = loop {
            if candidates.len() >= self.config.max_entities_per_chunk {
                warn!(
                    limit = self.config.max_entities_per_chunk,
                    "Incremental extraction hit the per-chunk cap"
                );
                break StopReason::Limit;
            }

            let prompt = self
                .prompts
                .extract_single(chunk, &seen, &self.config.end_sentinel);
            calls += 1;

            let started = Instant::now();
            let response = match self.gateway.complete(&prompt, &options).await {
                Ok(response) => response,
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    warn!(call = calls, error = %e, "Single-character extraction call failed");
                    break StopReason::GatewayFailure(e.to_string());
                }
            };
            info!(
                call = calls,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Single-character extraction call finished"
            );

            let parsed = self.parser.parse(&response);
            let Some(pair) = parsed.pairs.into_iter().next() else {
                if parsed.sentinel.is_some() {
                    break StopReason::Sentinel;
                }
                warn!(response = %response.trim(), "Malformed single-character response");
                break StopReason::Malformed;
            };

            let lowered = pair.name.to_lowercase();
            if seen.iter().any(|name| name.to_lowercase() == lowered) {
                debug!(name = %pair.name, "Model repeated an extracted name");
                break StopReason::RepeatedName(pair.name);
            }

            debug!(name = %pair.name, "Extracted character");
            seen.push(pair.name.clone());
            candidates.push(pair);
        };

        Ok(ExtractionOutcome::new(candidates, stop, calls))
    }
}

#[async_trait]
impl CandidateExtractor for ExtractionAdapter {
    async fn extract(&self, chunk: &str) -> Result<ExtractionOutcome> {
        match self.config.mode {
            ExtractionMode::Exhaustive => self.extract_all(chunk).await,
            ExtractionMode::Incremental => self.extract_incremental(chunk).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use novelize_core::{GatewayError, NovelizeError};
    use std::sync::Mutex;

    /// Replays scripted responses and records prompts
    struct ScriptedGateway {
        responses: Mutex<Vec<std::result::Result<String, GatewayError>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedGateway {
        fn new(mut responses: Vec<std::result::Result<String, GatewayError>>) -> Arc<Self> {
            responses.reverse();
            Arc::new(Self {
                responses: Mutex::new(responses),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn ok(lines: &[&str]) -> Arc<Self> {
            Self::new(lines.iter().map(|l| Ok(l.to_string())).collect())
        }

        fn prompts(&self) -> Vec<String> {
            self.prompts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CompletionGateway for ScriptedGateway {
        async fn complete(
            &self,
            prompt: &str,
            _options: &CompletionOptions,
        ) -> std::result::Result<String, GatewayError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok("<end>".to_string()))
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn adapter(gateway: Arc<ScriptedGateway>, mode: ExtractionMode) -> ExtractionAdapter {
        let config = ExtractionConfig {
            mode,
            ..ExtractionConfig::default()
        };
        ExtractionAdapter::new(gateway, config).unwrap()
    }

    #[tokio::test]
    async fn test_exhaustive_parses_all_pairs() {
        let gateway = ScriptedGateway::ok(&["Alice: Went to the market; Bob: Helped carry the basket"]);
        let outcome = adapter(gateway.clone(), ExtractionMode::Exhaustive)
            .extract("Alice went to the market. Bob helped her.")
            .await
            .unwrap();

        assert_eq!(outcome.stop, StopReason::Complete);
        assert_eq!(outcome.calls, 1);
        assert_eq!(
            outcome.candidates,
            vec![
                CandidatePair::new("Alice", "Went to the market"),
                CandidatePair::new("Bob", "Helped carry the basket"),
            ]
        );
        assert!(gateway.prompts()[0].contains("Bob helped her."));
    }

    #[tokio::test]
    async fn test_exhaustive_none_sentinel() {
        let outcome = adapter(ScriptedGateway::ok(&["<none>"]), ExtractionMode::Exhaustive)
            .extract("The wind blew.")
            .await
            .unwrap();

        assert!(outcome.found_nothing());
        assert!(!outcome.failed());
    }

    #[tokio::test]
    async fn test_exhaustive_malformed() {
        let outcome = adapter(
            ScriptedGateway::ok(&["I could not find anyone."]),
            ExtractionMode::Exhaustive,
        )
        .extract("text")
        .await
        .unwrap();

        assert_eq!(outcome.stop, StopReason::Malformed);
        assert!(outcome.failed());
    }

    #[tokio::test]
    async fn test_exhaustive_transient_failure_is_reported() {
        let gateway = ScriptedGateway::new(vec![Err(GatewayError::Exhausted {
            attempts: 5,
            message: "throttled".to_string(),
        })]);
        let outcome = adapter(gateway, ExtractionMode::Exhaustive)
            .extract("text")
            .await
            .unwrap();

        assert!(matches!(outcome.stop, StopReason::GatewayFailure(_)));
        assert!(outcome.failed());
    }

    #[tokio::test]
    async fn test_fatal_failure_propagates() {
        let gateway = ScriptedGateway::new(vec![Err(GatewayError::Fatal("bad key".to_string()))]);
        let err = adapter(gateway, ExtractionMode::Incremental)
            .extract("text")
            .await
            .unwrap_err();

        assert!(matches!(err, NovelizeError::Gateway(GatewayError::Fatal(_))));
    }

    #[tokio::test]
    async fn test_incremental_until_sentinel_with_exclusions() {
        let gateway = ScriptedGateway::ok(&["Alice: Went to the market", "Bob: Helped her", "<end>"]);
        let outcome = adapter(gateway.clone(), ExtractionMode::Incremental)
            .extract("Alice went to the market. Bob helped her.")
            .await
            .unwrap();

        assert_eq!(outcome.stop, StopReason::Sentinel);
        assert_eq!(outcome.calls, 3);
        assert_eq!(outcome.candidates.len(), 2);

        let prompts = gateway.prompts();
        assert!(prompts[0].contains("[None]"));
        assert!(prompts[1].contains("[Alice]"));
        assert!(prompts[2].contains("[Alice, Bob]"));
    }

    #[tokio::test]
    async fn test_incremental_exclusions_do_not_leak_between_chunks() {
        let gateway = ScriptedGateway::ok(&["Alice: Ran", "<end>", "Bob: Walked", "<end>"]);
        let adapter = adapter(gateway.clone(), ExtractionMode::Incremental);

        adapter.extract("chunk one").await.unwrap();
        adapter.extract("chunk two").await.unwrap();

        assert!(gateway.prompts()[2].contains("[None]"));
    }

    #[tokio::test]
    async fn test_incremental_malformed_is_a_hard_stop() {
        let gateway = ScriptedGateway::ok(&["Alice: Ran", "Sorry, I am not sure.", "Bob: Walked"]);
        let outcome = adapter(gateway.clone(), ExtractionMode::Incremental)
            .extract("text")
            .await
            .unwrap();

        assert_eq!(outcome.stop, StopReason::Malformed);
        assert_eq!(outcome.candidates, vec![CandidatePair::new("Alice", "Ran")]);
        assert_eq!(gateway.prompts().len(), 2);
    }

    #[tokio::test]
    async fn test_incremental_repeated_name_stops() {
        let gateway = ScriptedGateway::ok(&["Alice: Ran", "alice: Ran again"]);
        let outcome = adapter(gateway, ExtractionMode::Incremental)
            .extract("text")
            .await
            .unwrap();

        assert_eq!(outcome.stop, StopReason::RepeatedName("alice".to_string()));
        assert_eq!(outcome.candidates.len(), 1);
    }

    #[tokio::test]
    async fn test_incremental_keeps_pairs_on_gateway_failure() {
        let gateway = ScriptedGateway::new(vec![
            Ok("Alice: Ran".to_string()),
            Err(GatewayError::Transient("503".to_string())),
        ]);
        let outcome = adapter(gateway, ExtractionMode::Incremental)
            .extract("text")
            .await
            .unwrap();

        assert!(matches!(outcome.stop, StopReason::GatewayFailure(_)));
        assert_eq!(outcome.candidates.len(), 1);
        assert!(!outcome.failed());
    }

    #[tokio::test]
    async fn test_incremental_cap() {
        let gateway = ScriptedGateway::ok(&["A: one", "B: two", "C: three"]);
        let config = ExtractionConfig {
            mode: ExtractionMode::Incremental,
            max_entities_per_chunk: 2,
            ..ExtractionConfig::default()
        };
        let outcome = ExtractionAdapter::new(gateway.clone(), config)
            .unwrap()
            .extract("text")
            .await
            .unwrap();

        assert_eq!(outcome.stop, StopReason::Limit);
        assert_eq!(outcome.candidates.len(), 2);
        assert_eq!(gateway.prompts().len(), 2);
    }
}
