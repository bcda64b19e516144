//! Session aggregator
//!
//! Drives extraction, resolution and consolidation over an ordered sequence
//! of chunks. Processing is strictly sequential: every candidate sees the
//! table as left by all earlier candidates, and chunk *i+1* sees the fully
//! consolidated table from chunk *i*.
//!
//! Failure granularity:
//! - a candidate failure is recorded and the candidate skipped
//! - a chunk failure is recorded and the chunk skipped
//! - a configuration or fatal gateway failure aborts the session, returning
//!   the partial table alongside the error
//!
//! Author: hephaex@gmail.com

use std::sync::Arc;

use novelize_core::{
    AppConfig, CandidatePair, CompletionGateway, Decision, EntityTable, NovelizeError, Result,
};
use novelize_extractor::{CandidateExtractor, ExtractionAdapter, StopReason};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::consolidator::{Consolidation, NoteConsolidator};
use crate::resolver::EntityResolver;

// ============================================================================
// State and report
// ============================================================================

/// Where the session currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    ProcessingChunk,
    ExtractingCandidates,
    ResolvingEntity,
    ConsolidatingNote,
    Done,
    Cancelled,
    Aborted,
}

/// A candidate whose resolution or consolidation failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateFailure {
    pub chunk_index: usize,
    pub name: String,
    pub message: String,
}

/// A chunk whose extraction produced nothing usable
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkFailure {
    pub chunk_index: usize,
    pub message: String,
}

/// How an ambiguous resolution was settled
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AmbiguityRecord {
    pub chunk_index: usize,
    pub candidate: String,
    pub matches: Vec<String>,
    /// Identifier the action was attributed to
    pub chosen: String,
}

/// Why extraction ended for a chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkStop {
    pub chunk_index: usize,
    pub reason: StopReason,
}

/// Counters and failures collected over one session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionReport {
    pub session_id: String,
    /// Chunks attempted, whatever their outcome
    pub chunks_processed: usize,
    /// Chunks where the model reported no characters
    pub chunks_skipped: usize,
    pub chunks_failed: usize,
    pub candidates_seen: usize,
    pub entities_created: usize,
    pub appends: usize,
    pub summarizations: usize,
    pub ambiguities: Vec<AmbiguityRecord>,
    pub candidate_failures: Vec<CandidateFailure>,
    pub chunk_failures: Vec<ChunkFailure>,
    pub extraction_stops: Vec<ChunkStop>,
}

impl SessionReport {
    pub fn ambiguous_resolutions(&self) -> usize {
        self.ambiguities.len()
    }

    fn record(&mut self, consolidation: Consolidation) {
        match consolidation {
            Consolidation::Inserted => self.entities_created += 1,
            Consolidation::Appended => self.appends += 1,
            Consolidation::Summarized => self.summarizations += 1,
        }
    }

    fn candidate_failed(&mut self, chunk_index: usize, name: &str, err: &dyn std::fmt::Display) {
        self.candidate_failures.push(CandidateFailure {
            chunk_index,
            name: name.to_string(),
            message: err.to_string(),
        });
    }

    fn chunk_failed(&mut self, chunk_index: usize, message: String) {
        self.chunks_failed += 1;
        self.chunk_failures.push(ChunkFailure {
            chunk_index,
            message,
        });
    }
}

/// Final table plus what happened while building it
#[derive(Debug, Clone)]
pub struct SessionOutput {
    pub table: EntityTable,
    pub report: SessionReport,
    pub state: SessionState,
}

/// A session stopped early; `output` keeps everything completed so far
#[derive(Debug, thiserror::Error)]
#[error("session aborted: {error}")]
pub struct SessionAborted {
    #[source]
    pub error: NovelizeError,
    pub output: SessionOutput,
}

// ============================================================================
// Aggregator
// ============================================================================

/// Owns the entity table for one session
pub struct SessionAggregator {
    id: Uuid,
    extractor: Arc<dyn CandidateExtractor>,
    resolver: EntityResolver,
    consolidator: NoteConsolidator,
    table: EntityTable,
    report: SessionReport,
    state: SessionState,
    cancel: CancellationToken,
    next_chunk: usize,
}

impl SessionAggregator {
    /// Wire the default extractor, resolver and consolidator to one gateway
    pub fn new(gateway: Arc<dyn CompletionGateway>, config: &AppConfig) -> Result<Self> {
        let extractor = ExtractionAdapter::new(gateway.clone(), config.extraction.clone())?;
        let resolver = EntityResolver::new(gateway.clone(), config.resolution.clone())?;
        let consolidator = NoteConsolidator::new(gateway, config.consolidation.clone());
        Ok(Self::from_parts(Arc::new(extractor), resolver, consolidator))
    }

    /// Assemble a session from prepared components
    pub fn from_parts(
        extractor: Arc<dyn CandidateExtractor>,
        resolver: EntityResolver,
        consolidator: NoteConsolidator,
    ) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            extractor,
            resolver,
            consolidator,
            table: EntityTable::new(),
            report: SessionReport {
                session_id: id.to_string(),
                ..SessionReport::default()
            },
            state: SessionState::Idle,
            cancel: CancellationToken::new(),
            next_chunk: 0,
        }
    }

    /// Continue from a table built by an earlier session
    pub fn with_table(mut self, table: EntityTable) -> Self {
        self.table = table;
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn CandidateExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    /// Use an externally owned cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn table(&self) -> &EntityTable {
        &self.table
    }

    pub fn report(&self) -> &SessionReport {
        &self.report
    }

    /// Process the next chunk in sequence
    ///
    /// Returns an error only when the session must stop: a session-fatal
    /// failure or cancellation. The table is left consistent either way.
    pub async fn process_chunk(&mut self, chunk: &str) -> Result<()> {
        let index = self.next_chunk;
        self.next_chunk += 1;
        self.report.chunks_processed += 1;

        self.state = SessionState::ProcessingChunk;
        info!(chunk = index, chars = chunk.chars().count(), "Processing chunk");

        self.state = SessionState::ExtractingCandidates;
        let outcome = match self.extractor.extract(chunk).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_session_fatal() => {
                self.report.chunk_failed(index, e.to_string());
                return Err(e);
            }
            Err(e) => {
                warn!(chunk = index, error = %e, "Extraction failed, chunk skipped");
                self.report.chunk_failed(index, e.to_string());
                self.state = SessionState::ProcessingChunk;
                return Ok(());
            }
        };

        self.report.extraction_stops.push(ChunkStop {
            chunk_index: index,
            reason: outcome.stop.clone(),
        });

        if outcome.found_nothing() {
            info!(chunk = index, "No characters found, table unchanged");
            self.report.chunks_skipped += 1;
            self.state = SessionState::ProcessingChunk;
            return Ok(());
        }

        if outcome.failed() {
            warn!(chunk = index, reason = %outcome.stop, "Extraction yielded nothing, chunk skipped");
            self.report.chunk_failed(index, outcome.stop.to_string());
            self.state = SessionState::ProcessingChunk;
            return Ok(());
        }

        info!(
            chunk = index,
            candidates = outcome.candidates.len(),
            stop = %outcome.stop,
            "Candidates extracted"
        );

        for candidate in outcome.candidates {
            if self.cancel.is_cancelled() {
                self.state = SessionState::Cancelled;
                return Err(NovelizeError::Cancelled);
            }
            self.process_candidate(index, chunk, candidate).await?;
        }

        self.state = SessionState::ProcessingChunk;
        Ok(())
    }

    async fn process_candidate(
        &mut self,
        chunk_index: usize,
        context: &str,
        candidate: CandidatePair,
    ) -> Result<()> {
        self.report.candidates_seen += 1;

        self.state = SessionState::ResolvingEntity;
        let known = self.table.identifiers();
        let decision = self.resolver.resolve(&candidate.name, &known, context).await;

        let identifier = match decision {
            Decision::Match(identifier) => identifier,
            Decision::New => candidate.name.clone(),
            Decision::Ambiguous(matches) => self.settle_ambiguity(chunk_index, &candidate, matches),
            Decision::Error(e) if e.is_fatal() => return Err(e.into()),
            Decision::Error(e) => {
                warn!(candidate = %candidate.name, error = %e, "Resolution failed, candidate skipped");
                self.report.candidate_failed(chunk_index, &candidate.name, &e);
                return Ok(());
            }
        };

        self.state = SessionState::ConsolidatingNote;
        match self
            .consolidator
            .consolidate(&mut self.table, &identifier, &candidate.action, chunk_index)
            .await
        {
            Ok(consolidation) => {
                debug!(identifier = %identifier, ?consolidation, "Candidate consolidated");
                self.report.record(consolidation);
                Ok(())
            }
            Err(e) if e.is_session_fatal() => Err(e),
            Err(e) => {
                warn!(identifier = %identifier, error = %e, "Consolidation failed, note unchanged");
                self.report.candidate_failed(chunk_index, &candidate.name, &e);
                Ok(())
            }
        }
    }

    fn settle_ambiguity(
        &mut self,
        chunk_index: usize,
        candidate: &CandidatePair,
        matches: Vec<String>,
    ) -> String {
        let chosen = self
            .resolver
            .break_tie(&matches)
            .map(str::to_string)
            .unwrap_or_else(|| candidate.name.clone());

        let ambiguity = NovelizeError::AmbiguousResolution {
            candidate: candidate.name.clone(),
            matches: matches.clone(),
        };
        warn!(error = %ambiguity, chosen = %chosen, policy = ?self.resolver.policy(), "Ambiguity settled");

        self.report.ambiguities.push(AmbiguityRecord {
            chunk_index,
            candidate: candidate.name.clone(),
            matches,
            chosen: chosen.clone(),
        });
        chosen
    }

    /// Process every chunk in order and return the final table
    pub async fn run<I, S>(self, chunks: I) -> std::result::Result<SessionOutput, SessionAborted>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let span = info_span!("session", id = %self.id);
        self.run_chunks(chunks).instrument(span).await
    }

    async fn run_chunks<I, S>(mut self, chunks: I) -> std::result::Result<SessionOutput, SessionAborted>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        info!(seeded_entities = self.table.len(), "Session started");

        for chunk in chunks {
            if self.cancel.is_cancelled() {
                self.state = SessionState::Cancelled;
                return Err(self.abort(NovelizeError::Cancelled));
            }
            if let Err(e) = self.process_chunk(chunk.as_ref()).await {
                return Err(self.abort(e));
            }
        }

        self.state = SessionState::Done;
        info!(
            entities = self.table.len(),
            chunks = self.report.chunks_processed,
            failed_chunks = self.report.chunks_failed,
            failed_candidates = self.report.candidate_failures.len(),
            "Session complete"
        );
        Ok(self.finish())
    }

    fn abort(mut self, error: NovelizeError) -> SessionAborted {
        if matches!(error, NovelizeError::Cancelled) {
            self.state = SessionState::Cancelled;
            info!(entities = self.table.len(), "Session cancelled");
        } else {
            self.state = SessionState::Aborted;
            error!(error = %error, entities = self.table.len(), "Session aborted");
        }
        SessionAborted {
            error,
            output: self.finish(),
        }
    }

    /// Hand back the table and report without processing further chunks
    pub fn finish(self) -> SessionOutput {
        SessionOutput {
            table: self.table,
            report: self.report,
            state: self.state,
        }
    }
}
