//! Note consolidator
//!
//! Owns every mutation of an entity's note:
//! - unknown identifier: insert a new entity, note = action verbatim
//! - note at or under the threshold: append with `"; "`
//! - note over the threshold: replace with a gateway summary
//!
//! The threshold is checked before appending, so one append may overshoot it;
//! compaction happens on the entity's next update. A failed summarization
//! leaves the note untouched.

use std::sync::Arc;

use novelize_core::{
    CompletionGateway, CompletionOptions, ConsolidationConfig, Entity, EntityTable, NovelizeError,
    Result,
};
use novelize_extractor::PromptBuilder;
use serde::Serialize;
use tracing::{debug, info};

/// What a consolidation did to the table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Consolidation {
    Inserted,
    Appended,
    Summarized,
}

/// Gateway-backed note consolidator
pub struct NoteConsolidator {
    gateway: Arc<dyn CompletionGateway>,
    prompts: PromptBuilder,
    config: ConsolidationConfig,
}

impl NoteConsolidator {
    pub fn new(gateway: Arc<dyn CompletionGateway>, config: ConsolidationConfig) -> Self {
        Self {
            gateway,
            prompts: PromptBuilder::new(),
            config,
        }
    }

    pub fn with_prompts(mut self, prompts: PromptBuilder) -> Self {
        self.prompts = prompts;
        self
    }

    /// Note length (characters) above which the next update summarizes
    pub fn threshold(&self) -> usize {
        self.config.threshold_chars
    }

    /// Merge `action` into the note of `identifier`
    pub async fn consolidate(
        &self,
        table: &mut EntityTable,
        identifier: &str,
        action: &str,
        chunk_index: usize,
    ) -> Result<Consolidation> {
        let (note, note_len) = match table.get_mut(identifier) {
            None => {
                table.insert(Entity::new(identifier, action, chunk_index));
                debug!(identifier, "Entity created");
                return Ok(Consolidation::Inserted);
            }
            Some(entity) if entity.note_len() <= self.config.threshold_chars => {
                entity.append(action);
                debug!(identifier, note_len = entity.note_len(), "Action appended");
                return Ok(Consolidation::Appended);
            }
            Some(entity) => (entity.text(), entity.note_len()),
        };

        let summary = self.summarize(identifier, &note, action).await?;

        // the table is exclusively borrowed, so the entity cannot have vanished
        if let Some(entity) = table.get_mut(identifier) {
            entity.replace_with_summary(summary, 1);
            info!(
                identifier,
                before = note_len,
                after = entity.note_len(),
                "Note summarized"
            );
        }
        Ok(Consolidation::Summarized)
    }

    async fn summarize(&self, identifier: &str, note: &str, action: &str) -> Result<String> {
        let prompt = self
            .prompts
            .summarize(identifier, note, action, self.config.summary_word_limit);
        let options = CompletionOptions::new().with_max_output_tokens(self.config.max_output_tokens);

        let summary = self.gateway.complete(&prompt, &options).await?;
        let summary = summary.trim();
        if summary.is_empty() {
            return Err(NovelizeError::MalformedResponse(format!(
                "empty summary for '{identifier}'"
            )));
        }
        Ok(summary.to_string())
    }
}
