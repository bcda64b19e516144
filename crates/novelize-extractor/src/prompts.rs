//! Prompt templates
//!
//! Templates are plain text files compiled into the binary. Placeholders use
//! `{name}` syntax and are filled in a single pass, so text taken from the
//! novel can never inject another placeholder.

const EXTRACT_ALL_TEMPLATE: &str = include_str!("prompts/extract_all.txt");
const EXTRACT_SINGLE_TEMPLATE: &str = include_str!("prompts/extract_single.txt");
const CLASSIFY_TEMPLATE: &str = include_str!("prompts/classify.txt");
const SUMMARIZE_TEMPLATE: &str = include_str!("prompts/summarize.txt");

/// Rendered in place of an empty exclusion list
const EMPTY_LIST: &str = "None";

/// Builds every prompt the pipeline sends to the gateway
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    extract_all: String,
    extract_single: String,
    classify: String,
    summarize: String,
}

impl PromptBuilder {
    /// Create a builder with the bundled templates
    pub fn new() -> Self {
        Self {
            extract_all: EXTRACT_ALL_TEMPLATE.to_string(),
            extract_single: EXTRACT_SINGLE_TEMPLATE.to_string(),
            classify: CLASSIFY_TEMPLATE.to_string(),
            summarize: SUMMARIZE_TEMPLATE.to_string(),
        }
    }

    /// Override the exhaustive extraction template (`{text}`, `{none_sentinel}`)
    pub fn with_extract_all_template(mut self, template: impl Into<String>) -> Self {
        self.extract_all = template.into();
        self
    }

    /// Override the single-character template (`{text}`, `{exclusions}`, `{end_sentinel}`)
    pub fn with_extract_single_template(mut self, template: impl Into<String>) -> Self {
        self.extract_single = template.into();
        self
    }

    /// Override the classification template
    /// (`{known}`, `{candidate}`, `{context}`, `{new_sentinel}`)
    pub fn with_classify_template(mut self, template: impl Into<String>) -> Self {
        self.classify = template.into();
        self
    }

    /// Override the summarization template
    /// (`{identifier}`, `{note}`, `{action}`, `{word_limit}`)
    pub fn with_summarize_template(mut self, template: impl Into<String>) -> Self {
        self.summarize = template.into();
        self
    }

    /// Ask for every character in `text` at once
    pub fn extract_all(&self, text: &str, none_sentinel: &str) -> String {
        fill(
            &self.extract_all,
            &[("text", text.trim()), ("none_sentinel", none_sentinel)],
        )
    }

    /// Ask for one character not yet in `exclusions`
    pub fn extract_single(&self, text: &str, exclusions: &[String], end_sentinel: &str) -> String {
        let exclusions = join_or_none(exclusions);
        fill(
            &self.extract_single,
            &[
                ("text", text.trim()),
                ("exclusions", &exclusions),
                ("end_sentinel", end_sentinel),
            ],
        )
    }

    /// Ask whether `candidate` is one of `known`
    pub fn classify(
        &self,
        candidate: &str,
        known: &[String],
        context: &str,
        new_sentinel: &str,
    ) -> String {
        let known = join_or_none(known);
        fill(
            &self.classify,
            &[
                ("known", &known),
                ("candidate", candidate),
                ("context", context.trim()),
                ("new_sentinel", new_sentinel),
            ],
        )
    }

    /// Ask for a bounded summary of `note` plus `action`
    pub fn summarize(&self, identifier: &str, note: &str, action: &str, word_limit: usize) -> String {
        let word_limit = word_limit.to_string();
        fill(
            &self.summarize,
            &[
                ("identifier", identifier),
                ("note", note),
                ("action", action),
                ("word_limit", &word_limit),
            ],
        )
    }
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn join_or_none(items: &[String]) -> String {
    if items.is_empty() {
        EMPTY_LIST.to_string()
    } else {
        items.join(", ")
    }
}

/// Substitute `{key}` placeholders; unknown braces are kept as-is
fn fill(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len() + 256);
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];

        let replacement = after.find('}').and_then(|close| {
            let key = &after[..close];
            vars.iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| (close, *value))
        });

        match replacement {
            Some((close, value)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}
