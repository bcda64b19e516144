//! Entity resolver
//!
//! Decides whether a candidate name refers to a known entity. The judgment
//! itself is delegated to the completion gateway; this module only builds the
//! question and maps the answer back onto known identifiers. It never mutates
//! the entity table.

use std::sync::Arc;

use novelize_core::{
    AmbiguityPolicy, CompletionGateway, CompletionOptions, Decision, ResolutionConfig, Result,
};
use novelize_extractor::{PromptBuilder, ResponseParser};
use tracing::{debug, info};

/// Quoting and emphasis models wrap around names
const QUOTING: &[char] = &['*', '_', '"', '`'];

/// Quoting plus punctuation, tried last
const NAME_DECORATION: &[char] = &['*', '_', '"', '\'', '`', '.', '[', ']'];

/// Gateway-backed candidate resolver
pub struct EntityResolver {
    gateway: Arc<dyn CompletionGateway>,
    prompts: PromptBuilder,
    new_sentinel: ResponseParser,
    config: ResolutionConfig,
}

impl EntityResolver {
    pub fn new(gateway: Arc<dyn CompletionGateway>, config: ResolutionConfig) -> Result<Self> {
        Ok(Self {
            new_sentinel: ResponseParser::new([config.new_sentinel.as_str()])?,
            prompts: PromptBuilder::new(),
            gateway,
            config,
        })
    }

    pub fn with_prompts(mut self, prompts: PromptBuilder) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn policy(&self) -> AmbiguityPolicy {
        self.config.ambiguity_policy
    }

    /// Classify `candidate` against `known`, using `context` as evidence
    pub async fn resolve(&self, candidate: &str, known: &[String], context: &str) -> Decision {
        let candidate = candidate.trim();

        if known.is_empty() {
            return Decision::New;
        }

        if self.config.shortcut_exact_match && known.iter().any(|id| id == candidate) {
            debug!(candidate, "Exact identifier match, gateway skipped");
            return Decision::Match(candidate.to_string());
        }

        let prompt = self
            .prompts
            .classify(candidate, known, context, &self.config.new_sentinel);
        let options = CompletionOptions::new().with_max_output_tokens(self.config.max_output_tokens);

        match self.gateway.complete(&prompt, &options).await {
            Ok(response) => {
                let decision = self.interpret(candidate, &response, known);
                debug!(candidate, ?decision, "Candidate resolved");
                decision
            }
            Err(e) => Decision::Error(e),
        }
    }

    /// Map a classification response onto known identifiers
    pub fn interpret(&self, candidate: &str, response: &str, known: &[String]) -> Decision {
        let Some(answer) = response.lines().map(str::trim).find(|l| !l.is_empty()) else {
            info!(candidate, "Empty classification, treated as new");
            return Decision::New;
        };

        if self.new_sentinel.is_sentinel(answer) {
            return Decision::New;
        }

        if let Some(id) = find_known(answer, known) {
            return Decision::Match(id.to_string());
        }

        let mut matches: Vec<String> = Vec::new();
        for part in answer.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            if let Some(id) = find_known(part, known) {
                if !matches.iter().any(|m| m == id) {
                    matches.push(id.to_string());
                }
            }
        }

        match matches.len() {
            0 => {
                info!(candidate, response = answer, "Unrecognised classification, treated as new");
                Decision::New
            }
            1 => Decision::Match(matches.remove(0)),
            _ => Decision::Ambiguous(matches),
        }
    }

    /// Apply the configured tie-break; `None` means the candidate becomes a new entity
    pub fn break_tie<'a>(&self, matches: &'a [String]) -> Option<&'a str> {
        match self.config.ambiguity_policy {
            AmbiguityPolicy::PickFirst => matches.first().map(String::as_str),
            AmbiguityPolicy::TreatAsNew => None,
        }
    }
}

fn unquote(raw: &str) -> &str {
    let name = raw.trim().trim_matches(QUOTING).trim();
    name.strip_prefix('\'')
        .and_then(|inner| inner.strip_suffix('\''))
        .unwrap_or(name)
        .trim()
}

fn clean(raw: &str) -> &str {
    raw.trim().trim_matches(NAME_DECORATION).trim()
}

/// Identifiers may carry punctuation of their own (`Jr.`, `'Lil`), so the raw
/// answer is tried before any stripping
fn find_known<'a>(answer: &str, known: &'a [String]) -> Option<&'a str> {
    let raw = answer.trim();
    [raw, unquote(raw), clean(raw)]
        .into_iter()
        .filter(|name| !name.is_empty())
        .find_map(|name| lookup(name, known))
}

/// Exact match first, then a unique case-insensitive match
fn lookup<'a>(name: &str, known: &'a [String]) -> Option<&'a str> {
    if let Some(id) = known.iter().find(|id| id.as_str() == name) {
        return Some(id.as_str());
    }

    let lowered = name.to_lowercase();
    let mut folded = known.iter().filter(|id| id.to_lowercase() == lowered);
    match (folded.next(), folded.next()) {
        (Some(id), None) => Some(id.as_str()),
        _ => None,
    }
}
