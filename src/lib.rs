//! patternbank - library of reusable analysis patterns
//!
//! Stores analysis recipes (SQL templates plus metadata) in SQLite,
//! indexes their descriptions as embeddings, and suggests the best
//! pattern for a natural-language question with confidence gating.
//!
//! Architecture:
//! - Relational store (rusqlite): authoritative patterns, versions, usage
//! - Vector index (separate SQLite file): derived embeddings, rebuildable
//! - Embedding providers: feature hashing (default), local ONNX, remote API
//! - Variable extractor: {{placeholder}} templates -> parameterized SQL
//! - Usage tracker: fire-and-forget analytics over a background thread

pub mod cli;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extract;
pub mod index;
pub mod library;
pub mod model;
pub mod store;
pub mod usage;
pub mod util;

pub use config::Config;
pub use error::{LibResult, LibraryError};
pub use library::PatternLibrary;
pub use model::{
    ConfidenceBand, MatchKind, Pattern, PatternChanges, PatternFields, PatternStatus, SearchHit,
    Stats, SuggestionResult,
};
