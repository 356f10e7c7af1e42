//! Error taxonomy for the pattern library
//!
//! Four caller-visible conditions plus a storage wrapper:
//! - `Validation`: bad input, caller's fault, no state change
//! - `NotFound`: unknown pattern id (get returns None instead; update/delete raise)
//! - `IndexUnavailable`: vector store unreachable; search falls back to keywords
//! - `Transaction`: dual-store write inconsistency, always rolled back
//! - `Store`: underlying SQLite failure

use std::fmt;

/// Result alias used throughout the library
pub type LibResult<T> = Result<T, LibraryError>;

/// Errors surfaced by the pattern library
#[derive(Debug)]
pub enum LibraryError {
    /// Missing or malformed input; nothing was written
    Validation(String),
    /// Referenced pattern does not exist
    NotFound(String),
    /// Vector index unreachable; callers may fall back to keyword search
    IndexUnavailable(String),
    /// Cross-store write failed and was rolled back
    Transaction(String),
    /// Underlying relational store error
    Store(rusqlite::Error),
}

impl fmt::Display for LibraryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(msg) => write!(f, "Validation error: {}", msg),
            Self::NotFound(id) => write!(f, "Pattern not found: {}", id),
            Self::IndexUnavailable(msg) => write!(f, "Vector index unavailable: {}", msg),
            Self::Transaction(msg) => write!(f, "Transaction rolled back: {}", msg),
            Self::Store(e) => write!(f, "Store error: {}", e),
        }
    }
}

impl std::error::Error for LibraryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for LibraryError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(e)
    }
}

impl From<r2d2::Error> for LibraryError {
    fn from(e: r2d2::Error) -> Self {
        // A pool that cannot hand out connections is a store-level outage
        Self::Store(rusqlite::Error::InvalidParameterName(format!(
            "connection pool: {}",
            e
        )))
    }
}

impl LibraryError {
    /// Exit code for the CLI: 1 for caller mistakes, 2 for internal failures
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation(_) | Self::NotFound(_) => 1,
            Self::IndexUnavailable(_) | Self::Transaction(_) | Self::Store(_) => 2,
        }
    }
}
