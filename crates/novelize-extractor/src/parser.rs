//! Response grammar
//!
//! Model output is read line by line:
//!
//! ```text
//! Line    := Segment (";" Segment)*
//! Segment := Name ":" Action | Action
//! ```
//!
//! A segment with a colon starts a new pair and is split on its first colon,
//! so actions may contain further colons. A colon-less segment is one more
//! action for the pair before it. A line is a sentinel only when the whole
//! line is a configured sentinel token (case-insensitive).
//!
//! Author: hephaex@gmail.com

use novelize_core::{CandidatePair, ExtractionConfig, NovelizeError, Result, NOTE_DELIMITER};
use regex::Regex;
use serde::Serialize;

/// Leading list markers: `-`, `*`, `•`, `+`, `1.`, `2)`
const LIST_MARKER_PATTERN: &str = r"^(?:[-*•+]|\d{1,3}[.)])\s+";

/// Characters wrapped around names and sentinels by chatty models
const DECORATION: &[char] = &['*', '_', '"', '\'', '`'];

/// Result of parsing one gateway response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParsedResponse {
    /// Pairs in response order
    pub pairs: Vec<CandidatePair>,
    /// Sentinel token that ended the response, if any
    pub sentinel: Option<String>,
    /// Non-empty lines that did not fit the grammar
    pub discarded: usize,
}

impl ParsedResponse {
    /// A sentinel and nothing else
    pub fn is_sentinel_only(&self) -> bool {
        self.sentinel.is_some() && self.pairs.is_empty()
    }

    /// Neither a pair nor a sentinel
    pub fn is_malformed(&self) -> bool {
        self.sentinel.is_none() && self.pairs.is_empty()
    }
}

/// Parser for `Name: Action` responses
#[derive(Debug, Clone)]
pub struct ResponseParser {
    sentinels: Vec<String>,
    sentinel_line: Regex,
    list_marker: Regex,
}

impl ResponseParser {
    /// Build a parser recognising the given sentinel tokens
    pub fn new<I, S>(sentinels: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let sentinels: Vec<String> = sentinels
            .into_iter()
            .map(|s| s.into().trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        if sentinels.is_empty() {
            return Err(NovelizeError::ConfigError(
                "at least one sentinel token is required".to_string(),
            ));
        }

        let alternatives = sentinels
            .iter()
            .map(|s| regex::escape(s))
            .collect::<Vec<_>>()
            .join("|");
        let sentinel_line = Regex::new(&format!(
            r#"(?i)^[*_"'`\s]*(?:{alternatives})[*_"'`.\s]*$"#
        ))
        .map_err(|e| NovelizeError::ConfigError(format!("Invalid sentinel token: {e}")))?;

        let list_marker = Regex::new(LIST_MARKER_PATTERN)
            .map_err(|e| NovelizeError::ConfigError(format!("Invalid list marker pattern: {e}")))?;

        Ok(Self {
            sentinels,
            sentinel_line,
            list_marker,
        })
    }

    /// Parser for the extraction sentinels (`none` and `end`)
    pub fn from_config(config: &ExtractionConfig) -> Result<Self> {
        Self::new([config.none_sentinel.as_str(), config.end_sentinel.as_str()])
    }

    pub fn sentinels(&self) -> &[String] {
        &self.sentinels
    }

    /// True when the whole line is a sentinel token
    pub fn is_sentinel(&self, line: &str) -> bool {
        self.sentinel_line.is_match(line.trim())
    }

    /// Parse a full response; stops at the first sentinel line
    pub fn parse(&self, response: &str) -> ParsedResponse {
        let mut parsed = ParsedResponse::default();

        for raw in response.lines() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }

            if self.is_sentinel(line) {
                parsed.sentinel = Some(line.trim_matches(DECORATION).trim().to_string());
                break;
            }

            let line = self.list_marker.replace(line, "");
            match parse_line(&line) {
                Some(pairs) => parsed.pairs.extend(pairs),
                None => parsed.discarded += 1,
            }
        }

        parsed
    }
}

/// Parse one grammar line; `None` when the line does not open with a pair
fn parse_line(line: &str) -> Option<Vec<CandidatePair>> {
    let mut segments = line.split(';');
    let first = segments.next()?;
    if !first.contains(':') {
        return None;
    }

    let mut pairs = Vec::new();
    // `None` while the latest named segment was unusable (empty name)
    let mut current: Option<CandidatePair> = None;

    for segment in std::iter::once(first).chain(segments) {
        match segment.split_once(':') {
            Some((name, action)) => {
                flush(&mut pairs, current.take());
                let name = clean_name(name);
                current = (!name.is_empty()).then(|| CandidatePair::new(name, clean_action(action)));
            }
            None => {
                let extra = clean_action(segment);
                if let (Some(pair), false) = (current.as_mut(), extra.is_empty()) {
                    if !pair.action.is_empty() {
                        pair.action.push_str(NOTE_DELIMITER);
                    }
                    pair.action.push_str(&extra);
                }
            }
        }
    }

    flush(&mut pairs, current);
    Some(pairs)
}

fn flush(pairs: &mut Vec<CandidatePair>, pair: Option<CandidatePair>) {
    if let Some(pair) = pair.filter(|p| !p.action.is_empty()) {
        pairs.push(pair);
    }
}

fn clean_name(raw: &str) -> String {
    raw.trim().trim_matches(DECORATION).trim().to_string()
}

fn clean_action(raw: &str) -> String {
    raw.trim().trim_start_matches(DECORATION).trim().to_string()
}
