//! Novelize Engine - Incremental character consolidation
//!
//! Resolves extracted candidates against the characters already known,
//! merges their actions into bounded running notes, and drives the whole
//! pipeline across a stream of chunks:
//!
//! ```text
//! chunk -> extractor -> candidates -> resolver -> consolidator -> table
//! ```
//!
//! Author: hephaex@gmail.com

pub mod consolidator;
pub mod export;
pub mod resolver;
pub mod session;

pub use consolidator::{Consolidation, NoteConsolidator};
pub use export::{export_csv, to_csv_string, write_csv, CSV_HEADER};
pub use resolver::EntityResolver;
pub use session::{
    AmbiguityRecord, CandidateFailure, ChunkFailure, ChunkStop, SessionAborted, SessionAggregator,
    SessionOutput, SessionReport, SessionState,
};
