//! Entity model
//!
//! An [`Entity`] is a character tracked across a session. Its running note is
//! either the raw action fragments attributed to it so far, or a model-written
//! summary followed by whatever was appended after the last summarization.
//! The [`EntityTable`] keeps entities in first-appearance order.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::GatewayError;

/// Separator placed between note parts when rendering or appending
pub const NOTE_DELIMITER: &str = "; ";

// ============================================================================
// Candidate pairs and resolver decisions
// ============================================================================

/// A raw (name, action) pair produced by extraction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePair {
    pub name: String,
    pub action: String,
}

impl CandidatePair {
    pub fn new(name: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action: action.into(),
        }
    }
}

/// Outcome of resolving a candidate name against the known identifiers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Refers to an existing entity
    Match(String),
    /// A character not seen before
    New,
    /// The gateway named more than one existing entity, in response order
    Ambiguous(Vec<String>),
    /// The gateway call failed
    Error(GatewayError),
}

// ============================================================================
// Notes
// ============================================================================

/// Running note for an entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Note {
    /// Actions appended verbatim, in arrival order
    Fragments { fragments: Vec<String> },
    /// A summary plus the actions appended since it was written
    Summary {
        summary: String,
        appended: Vec<String>,
    },
}

impl Note {
    /// Render the note as a single line
    pub fn render(&self) -> String {
        match self {
            Self::Fragments { fragments } => fragments.join(NOTE_DELIMITER),
            Self::Summary { summary, appended } => {
                let mut text = summary.clone();
                for part in appended {
                    text.push_str(NOTE_DELIMITER);
                    text.push_str(part);
                }
                text
            }
        }
    }

    fn push(&mut self, action: String) {
        match self {
            Self::Fragments { fragments } => fragments.push(action),
            Self::Summary { appended, .. } => appended.push(action),
        }
    }

    fn is_blank(&self) -> bool {
        match self {
            Self::Fragments { fragments } => fragments.is_empty(),
            Self::Summary { summary, appended } => summary.is_empty() && appended.is_empty(),
        }
    }
}

// ============================================================================
// Entity
// ============================================================================

/// A resolved character and everything noted about it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    identifier: String,
    note: Note,
    /// Character count of the rendered note
    note_len: usize,
    /// Number of actions ever attributed to this entity
    action_count: usize,
    /// How many times the note was replaced by a summary
    summarizations: u32,
    /// Index of the chunk where the entity first appeared
    pub first_seen_chunk: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// Create an entity whose note is exactly `first_action`
    pub fn new(
        identifier: impl Into<String>,
        first_action: impl Into<String>,
        first_seen_chunk: usize,
    ) -> Self {
        let first_action = first_action.into();
        let now = Utc::now();
        Self {
            identifier: identifier.into(),
            note_len: first_action.chars().count(),
            note: Note::Fragments {
                fragments: vec![first_action],
            },
            action_count: 1,
            summarizations: 0,
            first_seen_chunk,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn note(&self) -> &Note {
        &self.note
    }

    /// Rendered note text
    pub fn text(&self) -> String {
        self.note.render()
    }

    /// Length of the rendered note in characters
    pub fn note_len(&self) -> usize {
        self.note_len
    }

    pub fn action_count(&self) -> usize {
        self.action_count
    }

    pub fn summarizations(&self) -> u32 {
        self.summarizations
    }

    pub fn is_summarized(&self) -> bool {
        matches!(self.note, Note::Summary { .. })
    }

    /// Append an action after the current note, never truncating
    pub fn append(&mut self, action: impl Into<String>) {
        let action = action.into();
        if !self.note.is_blank() {
            self.note_len += NOTE_DELIMITER.chars().count();
        }
        self.note_len += action.chars().count();
        self.note.push(action);
        self.action_count += 1;
        self.updated_at = Utc::now();
    }

    /// Replace the whole note with a summary that already covers `absorbed` new actions
    pub fn replace_with_summary(&mut self, summary: impl Into<String>, absorbed: usize) {
        let summary = summary.into();
        self.note_len = summary.chars().count();
        self.note = Note::Summary {
            summary,
            appended: Vec::new(),
        };
        self.action_count += absorbed;
        self.summarizations += 1;
        self.updated_at = Utc::now();
    }
}

// ============================================================================
// Entity table
// ============================================================================

/// Identifier -> entity mapping in first-appearance order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityTable {
    entities: IndexMap<String, Entity>,
}

impl EntityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.entities.contains_key(identifier)
    }

    pub fn get(&self, identifier: &str) -> Option<&Entity> {
        self.entities.get(identifier)
    }

    pub fn get_mut(&mut self, identifier: &str) -> Option<&mut Entity> {
        self.entities.get_mut(identifier)
    }

    /// Insert an entity unless its identifier is already taken.
    ///
    /// Returns `false` and leaves the table untouched on a collision.
    pub fn insert(&mut self, entity: Entity) -> bool {
        if self.entities.contains_key(entity.identifier()) {
            return false;
        }
        self.entities.insert(entity.identifier.clone(), entity);
        true
    }

    /// Known identifiers in insertion order
    pub fn identifiers(&self) -> Vec<String> {
        self.entities.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// (identifier, rendered note) rows in insertion order
    pub fn rows(&self) -> Vec<(String, String)> {
        self.entities
            .values()
            .map(|e| (e.identifier.clone(), e.text()))
            .collect()
    }
}

impl<'a> IntoIterator for &'a EntityTable {
    type Item = &'a Entity;
    type IntoIter = indexmap::map::Values<'a, String, Entity>;

    fn into_iter(self) -> Self::IntoIter {
        self.entities.values()
    }
}

// ============================================================================
// Tests
// ============================================================================
