//! Vector index over pattern descriptions
//!
//! Derived store: one embedding per active pattern version, keyed by
//! pattern id, kept in its own SQLite file next to the relational store.
//! Losing this file loses no data; `rebuild` regenerates it from the
//! relational store's active descriptions.
//!
//! # Blob format
//!
//! Embeddings are stored as little-endian f32 bytes. Blob length must be
//! dimensions * 4; anything else is treated as corrupt and skipped.
//!
//! # Availability
//!
//! Every public operation can fail with `IndexUnavailable`. Callers
//! (the library facade) decide how to degrade: search falls back to
//! keywords, writes roll back the relational commit.

use crate::embeddings::{create_provider, Embedding, EmbeddingConfig, EmbeddingProvider};
use crate::error::{LibResult, LibraryError};
use crate::util::truncate_utf8_safe;
use chrono::Utc;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Remote providers reject oversized inputs; descriptions past this are
/// cut at a character boundary before embedding
const MAX_EMBED_BYTES: usize = 8192;

/// Cosine similarity between two embeddings, clamped to [0, 1]
///
/// Mismatched dimensions score zero rather than erroring; that only
/// happens with a stale index and the rebuild path handles it.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(0.0, 1.0)
}

/// Convert an embedding to a blob for storage
pub fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

/// Convert a stored blob back to an embedding
pub fn blob_to_embedding(blob: &[u8]) -> Option<Embedding> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

/// Derived embedding store with pluggable provider
pub struct VectorIndex {
    conn: Mutex<Connection>,
    provider: Box<dyn EmbeddingProvider>,
    /// Set when the index is known to be missing embeddings: the
    /// persisted config no longer matched on open, or a compensated
    /// write could not put a prior embedding back
    stale: AtomicBool,
}

impl VectorIndex {
    /// Open (or create) the index and reconcile it with the embedding
    /// configuration. A provider/model/dimension change clears stored
    /// embeddings; similarity across mixed vector spaces is meaningless.
    pub fn new(index_path: impl AsRef<Path>, config: &EmbeddingConfig) -> LibResult<Self> {
        Self::open_with(index_path, create_provider(config), &config.model)
    }

    /// Open with an explicit provider (tests inject failing providers)
    #[cfg(test)]
    pub(crate) fn with_provider(
        index_path: impl AsRef<Path>,
        provider: Box<dyn EmbeddingProvider>,
    ) -> LibResult<Self> {
        Self::open_with(index_path, provider, "")
    }

    fn open_with(
        index_path: impl AsRef<Path>,
        provider: Box<dyn EmbeddingProvider>,
        model: &str,
    ) -> LibResult<Self> {
        if let Some(parent) = index_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    LibraryError::IndexUnavailable(format!("cannot create index directory: {}", e))
                })?;
            }
        }

        let conn = Connection::open(index_path.as_ref()).map_err(unavailable)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(unavailable)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS pattern_embeddings (
                pattern_id TEXT PRIMARY KEY,
                domain TEXT NOT NULL,
                embedding BLOB NOT NULL,
                embedded_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_embeddings_domain ON pattern_embeddings(domain);

            CREATE TABLE IF NOT EXISTS embedding_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
        "#,
        )
        .map_err(unavailable)?;

        let fingerprint = format!("{}:{}:{}", provider.name(), model, provider.dimensions());
        let stored: Option<String> = conn
            .query_row(
                "SELECT value FROM embedding_meta WHERE key = 'fingerprint'",
                [],
                |row| row.get(0),
            )
            .ok();

        let mut cleared_on_open = false;
        if let Some(previous) = &stored {
            if *previous != fingerprint {
                tracing::warn!(
                    "Embedding config changed ({} -> {}); clearing index, reindex required",
                    previous,
                    fingerprint
                );
                conn.execute("DELETE FROM pattern_embeddings", [])
                    .map_err(unavailable)?;
                cleared_on_open = true;
            }
        }
        conn.execute(
            "INSERT INTO embedding_meta (key, value) VALUES ('fingerprint', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![fingerprint],
        )
        .map_err(unavailable)?;

        tracing::debug!(
            "Vector index ready (provider: {}, {} dims)",
            provider.name(),
            provider.dimensions()
        );

        Ok(Self {
            conn: Mutex::new(conn),
            provider,
            stale: AtomicBool::new(cleared_on_open),
        })
    }

    /// Whether the provider can produce embeddings right now
    pub fn is_available(&self) -> bool {
        self.provider.is_ready()
    }

    /// True when the index is known to be missing embeddings
    pub fn needs_rebuild(&self) -> bool {
        self.stale.load(Ordering::Relaxed)
    }

    /// Record that an embedding could not be written back; the index
    /// stays usable but is incomplete until `rebuild` runs
    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::Relaxed);
    }

    /// Embed a description and write it under the pattern id
    pub fn upsert(&self, pattern_id: &str, domain: &str, description: &str) -> LibResult<()> {
        let embedding = self
            .provider
            .embed(truncate_utf8_safe(description, MAX_EMBED_BYTES))
            .map_err(|e| LibraryError::IndexUnavailable(e.to_string()))?;

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO pattern_embeddings (pattern_id, domain, embedding, embedded_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(pattern_id) DO UPDATE SET
                 domain = excluded.domain,
                 embedding = excluded.embedding,
                 embedded_at = excluded.embedded_at",
            params![
                pattern_id,
                domain,
                embedding_to_blob(&embedding),
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(unavailable)?;
        Ok(())
    }

    /// Remove a pattern's embedding; absent ids are a no-op
    pub fn remove(&self, pattern_id: &str) -> LibResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM pattern_embeddings WHERE pattern_id = ?1",
            params![pattern_id],
        )
        .map_err(unavailable)?;
        Ok(())
    }

    /// Rank indexed patterns against a query text
    ///
    /// Returns (pattern_id, similarity) pairs sorted descending, with
    /// scores below `min_similarity` dropped and the rest truncated to
    /// `limit`. Embedding happens here; callers never see raw vectors.
    pub fn query(
        &self,
        text: &str,
        domain: Option<&str>,
        limit: usize,
        min_similarity: f64,
    ) -> LibResult<Vec<(String, f64)>> {
        let query_embedding = self
            .provider
            .embed(truncate_utf8_safe(text, MAX_EMBED_BYTES))
            .map_err(|e| LibraryError::IndexUnavailable(e.to_string()))?;

        let conn = self.conn.lock().unwrap();
        let (sql, has_domain) = match domain {
            Some(_) => (
                "SELECT pattern_id, embedding FROM pattern_embeddings WHERE domain = ?1",
                true,
            ),
            None => ("SELECT pattern_id, embedding FROM pattern_embeddings", false),
        };

        let mut stmt = conn.prepare(sql).map_err(unavailable)?;
        let rows: Vec<(String, Vec<u8>)> = if has_domain {
            stmt.query_map(params![domain], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(unavailable)?
                .collect::<Result<_, _>>()
                .map_err(unavailable)?
        } else {
            stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(unavailable)?
                .collect::<Result<_, _>>()
                .map_err(unavailable)?
        };

        let mut scored: Vec<(String, f64)> = rows
            .into_iter()
            .filter_map(|(id, blob)| {
                let embedding = blob_to_embedding(&blob)?;
                Some((id, cosine_similarity(&query_embedding, &embedding)))
            })
            .filter(|(_, score)| *score >= min_similarity)
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    /// Drop everything and re-embed the given (id, domain, description)
    /// triples. Returns the number of patterns indexed.
    pub fn rebuild(&self, entries: &[(String, String, String)]) -> LibResult<usize> {
        let texts: Vec<&str> = entries
            .iter()
            .map(|(_, _, d)| truncate_utf8_safe(d, MAX_EMBED_BYTES))
            .collect();
        let embeddings = self
            .provider
            .embed_batch(&texts)
            .map_err(|e| LibraryError::IndexUnavailable(e.to_string()))?;

        if embeddings.len() != entries.len() {
            return Err(LibraryError::IndexUnavailable(format!(
                "provider returned {} embeddings for {} texts",
                embeddings.len(),
                entries.len()
            )));
        }

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(unavailable)?;
        tx.execute("DELETE FROM pattern_embeddings", [])
            .map_err(unavailable)?;
        let now = Utc::now().to_rfc3339();
        for ((pattern_id, domain, _), embedding) in entries.iter().zip(embeddings.iter()) {
            tx.execute(
                "INSERT INTO pattern_embeddings (pattern_id, domain, embedding, embedded_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![pattern_id, domain, embedding_to_blob(embedding), now],
            )
            .map_err(unavailable)?;
        }
        tx.commit().map_err(unavailable)?;
        self.stale.store(false, Ordering::Relaxed);

        tracing::info!("Rebuilt vector index: {} patterns", entries.len());
        Ok(entries.len())
    }

    /// Number of indexed patterns
    pub fn count(&self) -> LibResult<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM pattern_embeddings", [], |row| {
                row.get(0)
            })
            .map_err(unavailable)?;
        Ok(count as u64)
    }
}

/// Index-side SQLite failures surface as unavailability, not store errors;
/// the relational store stays authoritative either way
fn unavailable(e: rusqlite::Error) -> LibraryError {
    LibraryError::IndexUnavailable(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::ProviderType;
    use tempfile::tempdir;

    fn hashed_config() -> EmbeddingConfig {
        EmbeddingConfig::default()
    }

    fn disabled_config() -> EmbeddingConfig {
        EmbeddingConfig {
            provider: ProviderType::None,
            ..Default::default()
        }
    }

    #[test]
    fn test_blob_roundtrip() {
        let embedding = vec![0.5f32, -1.25, 0.0, 3.75];
        let blob = embedding_to_blob(&embedding);
        assert_eq!(blob.len(), 16);
        assert_eq!(blob_to_embedding(&blob).unwrap(), embedding);
    }

    #[test]
    fn test_blob_rejects_truncated() {
        assert!(blob_to_embedding(&[1, 2, 3]).is_none());
    }

    #[test]
    fn test_cosine_similarity_basics() {
        let a = vec![1.0f32, 0.0];
        let b = vec![1.0f32, 0.0];
        let c = vec![0.0f32, 1.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&a, &c).abs() < 1e-9);
        // Mismatched dims and zero vectors never panic
        assert_eq!(cosine_similarity(&a, &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&a, &[0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_upsert_query_remove() {
        let dir = tempdir().unwrap();
        let index = VectorIndex::new(dir.path().join("index.db"), &hashed_config()).unwrap();
        assert!(index.is_available());

        index
            .upsert("p1", "servicedesk", "hours allocated across projects")
            .unwrap();
        index
            .upsert("p2", "finance", "invoices issued per client per month")
            .unwrap();
        assert_eq!(index.count().unwrap(), 2);

        let hits = index
            .query("show me hours allocated across projects", None, 5, 0.0)
            .unwrap();
        assert_eq!(hits[0].0, "p1");
        assert!(hits[0].1 > hits[1].1);
        assert!(hits[0].1 > 0.75);

        // Domain filter excludes the other lineage entirely
        let finance = index
            .query("hours allocated", Some("finance"), 5, 0.0)
            .unwrap();
        assert!(finance.iter().all(|(id, _)| id == "p2"));

        index.remove("p1").unwrap();
        assert_eq!(index.count().unwrap(), 1);
        // Removing a missing id is fine
        index.remove("p1").unwrap();
    }

    #[test]
    fn test_upsert_replaces_existing() {
        let dir = tempdir().unwrap();
        let index = VectorIndex::new(dir.path().join("index.db"), &hashed_config()).unwrap();

        index.upsert("p1", "sales", "old description").unwrap();
        index
            .upsert("p1", "sales", "churned accounts by region")
            .unwrap();
        assert_eq!(index.count().unwrap(), 1);

        let hits = index
            .query("churned accounts by region", None, 5, 0.0)
            .unwrap();
        assert!(hits[0].1 > 0.9);
    }

    #[test]
    fn test_query_drops_scores_below_floor() {
        let dir = tempdir().unwrap();
        let index = VectorIndex::new(dir.path().join("index.db"), &hashed_config()).unwrap();
        index
            .upsert("close", "sales", "churned accounts by region")
            .unwrap();
        index
            .upsert("far", "sales", "warehouse inventory turnover")
            .unwrap();

        let all = index
            .query("churned accounts by region", None, 5, 0.0)
            .unwrap();
        assert_eq!(all.len(), 2);

        let floored = index
            .query("churned accounts by region", None, 5, 0.7)
            .unwrap();
        assert_eq!(floored.len(), 1);
        assert_eq!(floored[0].0, "close");
    }

    #[test]
    fn test_mark_stale_until_rebuild() {
        let dir = tempdir().unwrap();
        let index = VectorIndex::new(dir.path().join("index.db"), &hashed_config()).unwrap();
        assert!(!index.needs_rebuild());

        index.mark_stale();
        assert!(index.needs_rebuild());

        let entries = vec![("p1".to_string(), "sales".to_string(), "churn".to_string())];
        index.rebuild(&entries).unwrap();
        assert!(!index.needs_rebuild());
    }

    #[test]
    fn test_disabled_provider_reports_unavailable() {
        let dir = tempdir().unwrap();
        let index = VectorIndex::new(dir.path().join("index.db"), &disabled_config()).unwrap();
        assert!(!index.is_available());

        let err = index.upsert("p1", "x", "desc").unwrap_err();
        assert!(matches!(err, LibraryError::IndexUnavailable(_)));
        let err = index.query("anything", None, 5, 0.0).unwrap_err();
        assert!(matches!(err, LibraryError::IndexUnavailable(_)));
    }

    #[test]
    fn test_config_change_clears_index() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.db");

        let index = VectorIndex::new(&path, &hashed_config()).unwrap();
        index.upsert("p1", "sales", "something").unwrap();
        drop(index);

        // Reopen with a different provider fingerprint
        let changed = EmbeddingConfig {
            model: "other-model".into(),
            provider: ProviderType::None,
            ..Default::default()
        };
        let index = VectorIndex::new(&path, &changed).unwrap();
        assert!(index.needs_rebuild());
        assert_eq!(index.count().unwrap(), 0);
    }

    #[test]
    fn test_rebuild_replaces_contents() {
        let dir = tempdir().unwrap();
        let index = VectorIndex::new(dir.path().join("index.db"), &hashed_config()).unwrap();
        index.upsert("stale", "x", "stale entry").unwrap();

        let entries = vec![
            ("p1".to_string(), "sales".to_string(), "churn by region".to_string()),
            ("p2".to_string(), "sales".to_string(), "pipeline velocity".to_string()),
        ];
        assert_eq!(index.rebuild(&entries).unwrap(), 2);
        assert_eq!(index.count().unwrap(), 2);
        assert!(index
            .query("stale entry", None, 5, 0.0)
            .unwrap()
            .iter()
            .all(|(id, _)| id != "stale"));
    }
}
