//! Pattern library facade
//!
//! Single entry point tying the relational store, the vector index, the
//! variable extractor and the usage tracker together. Callers (the CLI,
//! or an agent shim) talk only to `PatternLibrary`.
//!
//! # Architecture
//!
//! ```text
//!                    PatternLibrary
//!                    ├── PatternStore   (authoritative, SQLite)
//!                    ├── VectorIndex    (derived embeddings, SQLite)
//!                    ├── UsageTracker   (background writer thread)
//!                    └── VariableExtractor
//! ```
//!
//! # Dual-store writes
//!
//! Mutations commit to the relational store first, then sync the index.
//! If the index sync fails the relational commit is compensated away and
//! the caller sees `Transaction`; the stores never diverge. The index is
//! additionally rebuildable from scratch via `reindex`.
//!
//! # Degraded search
//!
//! When the index cannot answer (provider down, corrupt file, timeout),
//! search degrades to FTS keyword matching with no similarity scores,
//! and suggestion fails open to a no-match result. Neither ever returns
//! a silent empty success hiding an outage; degradation is logged.

use crate::config::{Config, SuggestionConfig};
use crate::error::{LibResult, LibraryError};
use crate::extract::VariableExtractor;
use crate::index::VectorIndex;
use crate::model::{
    Alternative, ConfidenceBand, MatchKind, Pattern, PatternChanges, PatternFields, PatternStatus,
    SearchHit, Stats, SuggestionResult, UsageRecord,
};
use crate::store::PatternStore;
use crate::usage::UsageTracker;
use chrono::Utc;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

/// How many index candidates to pull before joining against the store;
/// oversized because some ids may be stale or below threshold
const CANDIDATE_POOL: usize = 25;

/// Facade over both stores
pub struct PatternLibrary {
    store: Arc<PatternStore>,
    index: Arc<VectorIndex>,
    tracker: UsageTracker,
    extractor: Arc<VariableExtractor>,
    suggestion: SuggestionConfig,
}

impl PatternLibrary {
    /// Open the library with the given configuration
    pub fn open(config: &Config) -> LibResult<Self> {
        let store = Arc::new(PatternStore::new(config.db_path())?);
        let index = Arc::new(VectorIndex::new(config.index_path(), &config.embedding)?);
        let tracker = UsageTracker::new(Arc::clone(&store), config.usage.queue_capacity);

        if index.needs_rebuild() {
            tracing::warn!("Vector index was cleared by a config change; run reindex");
        }

        Ok(Self {
            store,
            index,
            tracker,
            extractor: Arc::new(VariableExtractor::new()),
            suggestion: config.suggestion.clone(),
        })
    }

    // =========================================================================
    // CRUD
    // =========================================================================

    /// Save a new pattern and index its description
    ///
    /// # Errors
    /// `Validation` for missing required fields; `Transaction` when the
    /// index sync fails (the relational write is compensated away).
    pub fn save_pattern(&self, fields: &PatternFields) -> LibResult<Pattern> {
        let pattern = self.store.save(fields)?;

        if let Err(e) = self
            .index
            .upsert(&pattern.pattern_id, &pattern.domain, &pattern.description)
        {
            // Compensate: a pattern that is not searchable was never saved
            self.store.delete(&pattern.pattern_id, true)?;
            return Err(LibraryError::Transaction(format!(
                "index sync failed, save rolled back: {}",
                e
            )));
        }
        Ok(pattern)
    }

    /// Get a pattern by id; `None` for unknown or (without the flag) archived
    pub fn get_pattern(&self, pattern_id: &str, include_archived: bool) -> LibResult<Option<Pattern>> {
        self.store.get(pattern_id, include_archived)
    }

    /// List active patterns, newest first, with the total count
    pub fn list_patterns(
        &self,
        domain: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> LibResult<(Vec<Pattern>, u64)> {
        self.store.list(domain, limit, offset)
    }

    /// Create a new version of a pattern's lineage
    ///
    /// No-op change sets return the current active version without
    /// creating anything. The index entry moves from the old version id
    /// to the new one atomically with respect to callers.
    pub fn update_pattern(
        &self,
        pattern_id: &str,
        changes: &PatternChanges,
        change_note: &str,
    ) -> LibResult<Pattern> {
        // Identify the current active version for compensation
        let prior_active = self
            .store
            .version_history(pattern_id)?
            .into_iter()
            .find(|p| p.status == PatternStatus::Active);

        let updated = self.store.update(pattern_id, changes, change_note)?;

        let prior = match &prior_active {
            Some(p) if p.pattern_id != updated.pattern_id => p,
            // No-op update; nothing changed, index already correct
            _ => return Ok(updated),
        };

        let synced = self
            .index
            .remove(&prior.pattern_id)
            .and_then(|_| {
                self.index
                    .upsert(&updated.pattern_id, &updated.domain, &updated.description)
            });
        if let Err(e) = synced {
            self.store.rollback_version(
                &updated.pattern_id,
                Some(&prior.pattern_id),
                PatternStatus::Active,
            )?;
            // Put the old embedding back if remove went through; when
            // that fails too the active row has no index entry, so flag
            // the index for rebuild instead of losing it silently
            if let Err(restore_err) = self
                .index
                .upsert(&prior.pattern_id, &prior.domain, &prior.description)
            {
                tracing::warn!(
                    "Could not restore index entry for {} after rollback ({}); reindex required",
                    prior.pattern_id,
                    restore_err
                );
                self.index.mark_stale();
            }
            return Err(LibraryError::Transaction(format!(
                "index sync failed, update rolled back: {}",
                e
            )));
        }
        Ok(updated)
    }

    /// Archive (default) or permanently remove a pattern version
    pub fn delete_pattern(&self, pattern_id: &str, hard: bool) -> LibResult<()> {
        self.store.delete(pattern_id, hard)?;
        // Index removal is embedding-free and works even with the
        // provider down; failure here leaves only a stale entry that
        // search filters out against the store
        if let Err(e) = self.index.remove(pattern_id) {
            tracing::warn!("Could not remove {} from index: {}", pattern_id, e);
        }
        Ok(())
    }

    /// Bring an archived pattern back as a new active version
    pub fn restore_pattern(&self, pattern_id: &str) -> LibResult<Pattern> {
        let restored = self.store.restore(pattern_id)?;

        if let Err(e) = self
            .index
            .upsert(&restored.pattern_id, &restored.domain, &restored.description)
        {
            self.store.rollback_version(
                &restored.pattern_id,
                Some(pattern_id),
                PatternStatus::Archived,
            )?;
            return Err(LibraryError::Transaction(format!(
                "index sync failed, restore rolled back: {}",
                e
            )));
        }
        Ok(restored)
    }

    /// All versions of the lineage `pattern_id` belongs to, oldest first
    pub fn version_history(&self, pattern_id: &str) -> LibResult<Vec<Pattern>> {
        self.store.version_history(pattern_id)
    }

    // =========================================================================
    // Search
    // =========================================================================

    /// Rank active patterns against a natural-language query
    ///
    /// `threshold` is the minimum similarity for a hit; `None` uses the
    /// configured medium threshold. Empty queries list active patterns
    /// by usage count. Semantic search runs under a time budget; on
    /// timeout or index outage the call degrades to keyword matching
    /// (hits carry no score).
    pub fn search_patterns(
        &self,
        query: &str,
        domain: Option<&str>,
        threshold: Option<f64>,
        limit: usize,
    ) -> LibResult<Vec<SearchHit>> {
        let threshold = threshold.unwrap_or(self.suggestion.medium_threshold);
        let query = query.trim();
        if query.is_empty() {
            let patterns = self.store.list_by_usage(domain, limit)?;
            return Ok(patterns
                .into_iter()
                .map(|pattern| SearchHit {
                    pattern,
                    score: None,
                    matched_by: MatchKind::Usage,
                })
                .collect());
        }

        let semantic = self.semantic_candidates(query, domain, threshold);
        match semantic {
            Ok(candidates) => {
                let mut hits = Vec::new();
                for (id, score) in candidates {
                    // Stale index entries (deleted or superseded ids)
                    // drop out here; the store is authoritative
                    if let Some(pattern) = self.store.get(&id, false)? {
                        if pattern.status == PatternStatus::Active {
                            hits.push(SearchHit {
                                pattern,
                                score: Some(score),
                                matched_by: MatchKind::Semantic,
                            });
                        }
                    }
                    if hits.len() == limit {
                        break;
                    }
                }
                Ok(hits)
            }
            Err(e) => {
                tracing::warn!("Semantic search unavailable ({}); keyword fallback", e);
                let patterns = self.store.keyword_search(query, domain, limit)?;
                Ok(patterns
                    .into_iter()
                    .map(|pattern| SearchHit {
                        pattern,
                        score: None,
                        matched_by: MatchKind::Keyword,
                    })
                    .collect())
            }
        }
    }

    /// Run the index query on a worker thread under the search budget
    fn semantic_candidates(
        &self,
        query: &str,
        domain: Option<&str>,
        threshold: f64,
    ) -> LibResult<Vec<(String, f64)>> {
        let index = Arc::clone(&self.index);
        let query = query.to_string();
        let domain = domain.map(str::to_string);
        let timeout = Duration::from_millis(self.suggestion.search_timeout_ms);

        run_with_timeout(timeout, move || {
            index.query(&query, domain.as_deref(), CANDIDATE_POOL, threshold)
        })
        .unwrap_or_else(|| {
            Err(LibraryError::IndexUnavailable(
                "semantic search timed out".to_string(),
            ))
        })
    }

    // =========================================================================
    // Suggestion
    // =========================================================================

    /// Suggest the best pattern for a question, with confidence gating
    ///
    /// High confidence (>= high threshold) may auto-apply: with
    /// `auto_apply` set and every template placeholder resolved from the
    /// question, `sql_ready` carries a parameterized query. Medium
    /// confidence is suggested but never auto-applied. Below the medium
    /// threshold the result is a clean no-match.
    ///
    /// The whole computation runs under the suggestion budget and fails
    /// open: timeouts and index outages produce a no-match, never an
    /// error, so the caller's ad-hoc path is always available.
    pub fn suggest_pattern(
        &self,
        question: &str,
        domain: Option<&str>,
        auto_apply: bool,
    ) -> LibResult<SuggestionResult> {
        let question = question.trim();
        if question.is_empty() {
            return Ok(SuggestionResult::no_match());
        }

        let store = Arc::clone(&self.store);
        let index = Arc::clone(&self.index);
        let extractor = Arc::clone(&self.extractor);
        let config = self.suggestion.clone();
        let question_owned = question.to_string();
        let domain_owned = domain.map(str::to_string);
        let timeout = Duration::from_millis(config.suggest_timeout_ms);

        let outcome = run_with_timeout(timeout, move || {
            suggest_inner(
                &store,
                &index,
                &extractor,
                &config,
                &question_owned,
                domain_owned.as_deref(),
                auto_apply,
            )
        });

        match outcome {
            Some(Ok(result)) => Ok(result),
            Some(Err(LibraryError::IndexUnavailable(e))) => {
                tracing::warn!("Suggestion degraded to no-match: {}", e);
                Ok(SuggestionResult::no_match())
            }
            Some(Err(e)) => Err(e),
            None => {
                tracing::warn!(
                    "Suggestion timed out after {}ms; returning no-match",
                    self.suggestion.suggest_timeout_ms
                );
                Ok(SuggestionResult::no_match())
            }
        }
    }

    // =========================================================================
    // Usage and maintenance
    // =========================================================================

    /// Record a usage attempt; fire-and-forget, never blocks
    pub fn track_usage(
        &self,
        pattern_id: &str,
        user_question: &str,
        success: bool,
        feedback: Option<String>,
    ) -> bool {
        self.tracker.track(UsageRecord {
            pattern_id: pattern_id.to_string(),
            user_question: user_question.to_string(),
            used_date: Utc::now(),
            success,
            feedback,
        })
    }

    /// Wait for queued usage records to land (tests and shutdown paths)
    pub fn flush_usage(&self, timeout: Duration) -> bool {
        self.tracker.flush(timeout)
    }

    /// Usage statistics, library-wide or for one pattern id
    pub fn get_stats(&self, pattern_id: Option<&str>) -> LibResult<Stats> {
        self.store.usage_stats(pattern_id)
    }

    /// Rebuild the vector index from the store's active patterns
    pub fn reindex(&self) -> LibResult<usize> {
        let entries = self.store.active_descriptions()?;
        self.index.rebuild(&entries)
    }

    /// Move usage records past the retention window to the archive table
    pub fn archive_old_usage(&self, retention_days: u32) -> LibResult<usize> {
        self.store.archive_old_usage(retention_days)
    }

    /// Whether the index lost its contents at open and needs `reindex`
    pub fn index_needs_rebuild(&self) -> bool {
        self.index.needs_rebuild()
    }
}

/// Core suggestion logic, run on the budget thread
fn suggest_inner(
    store: &PatternStore,
    index: &VectorIndex,
    extractor: &VariableExtractor,
    config: &SuggestionConfig,
    question: &str,
    domain: Option<&str>,
    auto_apply: bool,
) -> LibResult<SuggestionResult> {
    // Query without a domain filter so a near-tie in the caller's
    // domain can win over a marginally higher foreign-domain score
    let mut candidates = index.query(question, None, CANDIDATE_POOL, config.medium_threshold)?;

    // A crowded index can truncate in-domain near-ties out of the
    // unfiltered pool; a domain-scoped pass keeps them eligible for
    // the tie-break
    if let Some(d) = domain {
        let scoped = index.query(question, Some(d), CANDIDATE_POOL, config.medium_threshold)?;
        for (id, score) in scoped {
            if !candidates.iter().any(|(seen, _)| *seen == id) {
                candidates.push((id, score));
            }
        }
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    }

    // Join against the store; only active versions are suggestible
    let mut scored: Vec<(Pattern, f64)> = Vec::new();
    for (id, score) in candidates {
        if let Some(pattern) = store.get(&id, false)? {
            if pattern.status == PatternStatus::Active {
                scored.push((pattern, score));
            }
        }
    }

    let Some(top_score) = scored.first().map(|(_, s)| *s) else {
        return Ok(SuggestionResult::no_match());
    };

    // Everything within epsilon of the top is a tie; an in-domain tie
    // beats a foreign-domain leader
    let tie_cutoff = top_score - config.tie_epsilon;
    let winner_pos = domain
        .and_then(|d| {
            scored
                .iter()
                .position(|(p, s)| *s >= tie_cutoff && p.domain == d)
        })
        .unwrap_or(0);

    let (pattern, confidence) = scored.swap_remove(winner_pos);
    let band = if confidence >= config.high_threshold {
        ConfidenceBand::High
    } else {
        ConfidenceBand::Medium
    };

    let alternatives: Vec<Alternative> = scored
        .iter()
        .filter(|(_, s)| *s >= tie_cutoff)
        .map(|(p, s)| Alternative {
            pattern_id: p.pattern_id.clone(),
            name: p.name.clone(),
            domain: p.domain.clone(),
            score: *s,
        })
        .collect();

    // Auto-apply only at high confidence, and only when every
    // placeholder resolved; a partial binding is never executable
    let sql_ready = if band == ConfidenceBand::High && auto_apply {
        let extraction = extractor.extract(&pattern.query_template, question);
        extractor.prepare(&pattern.query_template, &extraction)
    } else {
        None
    };

    tracing::debug!(
        "Suggested {} (confidence {:.3}, {:?}, {} alternatives)",
        pattern.pattern_id,
        confidence,
        band,
        alternatives.len()
    );

    Ok(SuggestionResult {
        matched: true,
        pattern_id: Some(pattern.pattern_id.clone()),
        pattern: Some(pattern),
        confidence,
        band,
        sql_ready,
        alternatives,
    })
}

/// Run a closure on a worker thread; `None` on timeout
///
/// The worker is detached on timeout and finishes in the background;
/// its result is discarded.
fn run_with_timeout<T, F>(timeout: Duration, f: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(f());
    });
    rx.recv_timeout(timeout).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::{
        Embedding, EmbeddingError, EmbeddingProvider, HashedProvider, ProviderType,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Provider that works for a fixed number of embeddings, then acts
    /// like a remote endpoint that went away mid-operation
    struct FailAfter {
        inner: HashedProvider,
        remaining: AtomicUsize,
    }

    impl FailAfter {
        fn new(allowed: usize) -> Self {
            Self {
                inner: HashedProvider::new(),
                remaining: AtomicUsize::new(allowed),
            }
        }
    }

    impl EmbeddingProvider for FailAfter {
        fn name(&self) -> &'static str {
            "hashed"
        }

        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }

        fn is_ready(&self) -> bool {
            true
        }

        fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
            let left = self.remaining.load(Ordering::SeqCst);
            if left == 0 {
                return Err(EmbeddingError::NetworkError("provider offline".into()));
            }
            self.remaining.store(left - 1, Ordering::SeqCst);
            self.inner.embed(text)
        }
    }

    fn library_with_provider(
        dir: &std::path::Path,
        provider: Box<dyn EmbeddingProvider>,
    ) -> PatternLibrary {
        let store = Arc::new(PatternStore::new(dir.join("patterns.db")).unwrap());
        let index = Arc::new(VectorIndex::with_provider(dir.join("vector_index.db"), provider).unwrap());
        let tracker = UsageTracker::new(Arc::clone(&store), 16);
        PatternLibrary {
            store,
            index,
            tracker,
            extractor: Arc::new(VariableExtractor::new()),
            suggestion: Config::default().suggestion,
        }
    }

    fn library_at(dir: &std::path::Path, provider: ProviderType) -> PatternLibrary {
        let mut config = Config::default();
        config.data_dir = dir.to_path_buf();
        config.embedding.provider = provider;
        PatternLibrary::open(&config).unwrap()
    }

    fn timesheet_fields() -> PatternFields {
        PatternFields {
            name: "Timesheet Project Breakdown".into(),
            domain: "servicedesk".into(),
            question_type: "aggregation".into(),
            description: "show how hours are allocated across projects".into(),
            query_template:
                "SELECT project, SUM(hours) FROM timesheet WHERE date >= {{start_date}} AND date <= {{end_date}} GROUP BY project"
                    .into(),
            presentation_format: "table".into(),
            business_context: "weekly capacity review".into(),
            tags: vec!["timesheet".into(), "hours".into()],
        }
    }

    #[test]
    fn test_save_indexes_and_search_finds() {
        let dir = tempdir().unwrap();
        let library = library_at(dir.path(), ProviderType::Hashed);
        let saved = library.save_pattern(&timesheet_fields()).unwrap();

        let hits = library
            .search_patterns("show me how hours are allocated across projects", None, None, 5)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].pattern.pattern_id, saved.pattern_id);
        assert_eq!(hits[0].matched_by, MatchKind::Semantic);
        assert!(hits[0].score.unwrap() >= 0.75);
    }

    #[test]
    fn test_save_rolls_back_when_index_down() {
        let dir = tempdir().unwrap();
        let library = library_at(dir.path(), ProviderType::None);

        let err = library.save_pattern(&timesheet_fields()).unwrap_err();
        assert!(matches!(err, LibraryError::Transaction(_)));
        // Compensation removed the relational row too
        assert_eq!(library.list_patterns(None, 10, 0).unwrap().1, 0);
    }

    #[test]
    fn test_update_moves_index_to_new_version() {
        let dir = tempdir().unwrap();
        let library = library_at(dir.path(), ProviderType::Hashed);
        let v1 = library.save_pattern(&timesheet_fields()).unwrap();

        let changes = PatternChanges {
            description: Some("billable hours split by client engagement".into()),
            ..Default::default()
        };
        let v2 = library
            .update_pattern(&v1.pattern_id, &changes, "reword for billing")
            .unwrap();
        assert_eq!(v2.version, 2);

        // Only the new version is searchable
        let hits = library
            .search_patterns("billable hours split by client engagement", None, None, 5)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].pattern.pattern_id, v2.pattern_id);
        assert!(hits
            .iter()
            .all(|h| h.pattern.pattern_id != v1.pattern_id));
    }

    #[test]
    fn test_update_flags_rebuild_when_rollback_cannot_restore_embedding() {
        let dir = tempdir().unwrap();
        // One embedding allowed: the save consumes it, then the
        // provider is gone for the rest of the test
        let library = library_with_provider(dir.path(), Box::new(FailAfter::new(1)));
        let v1 = library.save_pattern(&timesheet_fields()).unwrap();
        assert!(!library.index_needs_rebuild());

        let changes = PatternChanges {
            description: Some("billable hours split by client engagement".into()),
            ..Default::default()
        };
        // remove() needs no embedding and succeeds; the new upsert and
        // the rollback re-upsert both fail
        let err = library
            .update_pattern(&v1.pattern_id, &changes, "reword")
            .unwrap_err();
        assert!(matches!(err, LibraryError::Transaction(_)));

        // The rollback kept v1 active, and the missing embedding is
        // flagged instead of silently dropping v1 from semantic search
        let active = library.get_pattern(&v1.pattern_id, false).unwrap().unwrap();
        assert_eq!(active.status, PatternStatus::Active);
        assert!(library.index_needs_rebuild());
    }

    #[test]
    fn test_archive_excludes_from_search_until_restore() {
        let dir = tempdir().unwrap();
        let library = library_at(dir.path(), ProviderType::Hashed);
        let p = library.save_pattern(&timesheet_fields()).unwrap();

        library.delete_pattern(&p.pattern_id, false).unwrap();
        assert!(library
            .search_patterns("hours allocated across projects", None, None, 5)
            .unwrap()
            .is_empty());
        assert!(library.get_pattern(&p.pattern_id, false).unwrap().is_none());
        assert!(library.get_pattern(&p.pattern_id, true).unwrap().is_some());

        let restored = library.restore_pattern(&p.pattern_id).unwrap();
        let hits = library
            .search_patterns("hours allocated across projects", None, None, 5)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].pattern.pattern_id, restored.pattern_id);
    }

    #[test]
    fn test_search_degrades_to_keywords_when_index_down() {
        let dir = tempdir().unwrap();
        // Seed with a working provider, then reopen with embeddings off
        {
            let library = library_at(dir.path(), ProviderType::Hashed);
            library.save_pattern(&timesheet_fields()).unwrap();
        }
        let degraded = library_at(dir.path(), ProviderType::None);

        let hits = degraded
            .search_patterns("hours allocated projects", None, None, 5)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].matched_by, MatchKind::Keyword);
        assert!(hits[0].score.is_none());
    }

    #[test]
    fn test_search_threshold_override() {
        let dir = tempdir().unwrap();
        let library = library_at(dir.path(), ProviderType::Hashed);
        let mut fields = timesheet_fields();
        fields.description = "hours allocated across projects for the current quarter".into();
        library.save_pattern(&fields).unwrap();

        // This pairing scores between the medium and high thresholds
        let query = "hours allocated across projects for the previous sprint";
        assert_eq!(library.search_patterns(query, None, None, 5).unwrap().len(), 1);

        // A stricter floor hides it, a looser one keeps it
        assert!(library
            .search_patterns(query, None, Some(0.9), 5)
            .unwrap()
            .is_empty());
        assert_eq!(
            library.search_patterns(query, None, Some(0.5), 5).unwrap().len(),
            1
        );
    }

    #[test]
    fn test_empty_query_lists_by_usage() {
        let dir = tempdir().unwrap();
        let library = library_at(dir.path(), ProviderType::Hashed);
        let a = library.save_pattern(&timesheet_fields()).unwrap();
        let mut other = timesheet_fields();
        other.name = "Client Invoices".into();
        other.description = "invoices issued per client".into();
        let b = library.save_pattern(&other).unwrap();

        library.track_usage(&b.pattern_id, "invoices?", true, None);
        library.track_usage(&b.pattern_id, "invoices again", true, None);
        library.track_usage(&a.pattern_id, "hours", true, None);
        assert!(library.flush_usage(Duration::from_secs(5)));

        let hits = library.search_patterns("  ", None, None, 5).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].pattern.pattern_id, b.pattern_id);
        assert_eq!(hits[0].matched_by, MatchKind::Usage);
        assert!(hits[0].score.is_none());
    }

    #[test]
    fn test_suggest_high_confidence_with_auto_apply() {
        let dir = tempdir().unwrap();
        let library = library_at(dir.path(), ProviderType::Hashed);
        library.save_pattern(&timesheet_fields()).unwrap();

        let result = library
            .suggest_pattern(
                "show how hours are allocated across projects last 30 days",
                Some("servicedesk"),
                true,
            )
            .unwrap();
        assert!(result.matched);
        assert_eq!(result.band, ConfidenceBand::High);
        assert!(result.confidence >= 0.80);

        let prepared = result.sql_ready.unwrap();
        assert!(prepared.sql.contains(":start_date"));
        assert!(prepared.sql.contains(":end_date"));
        assert!(!prepared.sql.contains("{{"));
        // The extracted dates are bound, never spliced into the SQL text
        assert!(prepared.params.contains_key("start_date"));
        assert!(prepared.params.contains_key("end_date"));
    }

    #[test]
    fn test_suggest_medium_confidence_never_auto_applies() {
        let dir = tempdir().unwrap();
        let library = library_at(dir.path(), ProviderType::Hashed);
        let mut fields = timesheet_fields();
        fields.description = "hours allocated across projects for the current quarter".into();
        library.save_pattern(&fields).unwrap();

        // Partial vocabulary overlap lands between the thresholds
        let result = library
            .suggest_pattern(
                "hours allocated across projects for the previous sprint",
                None,
                true,
            )
            .unwrap();
        assert!(result.matched);
        assert_eq!(result.band, ConfidenceBand::Medium);
        assert!(result.confidence >= 0.70 && result.confidence < 0.80);
        assert!(result.sql_ready.is_none());
    }

    #[test]
    fn test_suggest_no_match_below_threshold() {
        let dir = tempdir().unwrap();
        let library = library_at(dir.path(), ProviderType::Hashed);
        library.save_pattern(&timesheet_fields()).unwrap();

        let result = library
            .suggest_pattern("completely unrelated marketing campaign question", None, false)
            .unwrap();
        assert!(!result.matched);
        assert_eq!(result.band, ConfidenceBand::Low);
        assert!(result.pattern_id.is_none());
        assert!(result.sql_ready.is_none());
    }

    #[test]
    fn test_suggest_fails_open_when_index_down() {
        let dir = tempdir().unwrap();
        let library = library_at(dir.path(), ProviderType::None);

        let result = library
            .suggest_pattern("anything at all", None, true)
            .unwrap();
        assert!(!result.matched);
    }

    #[test]
    fn test_suggest_prefers_in_domain_on_tie() {
        let dir = tempdir().unwrap();
        let library = library_at(dir.path(), ProviderType::Hashed);

        let mut sd = timesheet_fields();
        sd.description = "hours logged by engineers across projects".into();
        let sd_pattern = library.save_pattern(&sd).unwrap();

        let mut fin = timesheet_fields();
        fin.name = "Finance Hours".into();
        fin.domain = "finance".into();
        fin.description = "hours logged by engineers across projects".into();
        library.save_pattern(&fin).unwrap();

        // Identical descriptions score identically; the caller's domain wins
        let result = library
            .suggest_pattern(
                "hours logged by engineers across projects",
                Some("servicedesk"),
                false,
            )
            .unwrap();
        assert_eq!(result.pattern_id.as_deref(), Some(sd_pattern.pattern_id.as_str()));
        assert_eq!(result.alternatives.len(), 1);
        assert_eq!(result.alternatives[0].domain, "finance");
    }

    #[test]
    fn test_tie_break_survives_crowded_index() {
        let dir = tempdir().unwrap();
        let library = library_at(dir.path(), ProviderType::Hashed);

        let description = "hours logged by engineers across projects";
        for i in 0..30 {
            let mut foreign = timesheet_fields();
            foreign.name = format!("Finance Hours {}", i);
            foreign.domain = "finance".into();
            foreign.description = description.into();
            library.save_pattern(&foreign).unwrap();
        }
        let mut sd = timesheet_fields();
        sd.name = "Servicedesk Hours".into();
        sd.description = description.into();
        let sd_pattern = library.save_pattern(&sd).unwrap();

        // 30 identically-scored foreign patterns overflow the candidate
        // pool; the in-domain one still wins the tie
        let result = library
            .suggest_pattern(description, Some("servicedesk"), false)
            .unwrap();
        assert_eq!(
            result.pattern_id.as_deref(),
            Some(sd_pattern.pattern_id.as_str())
        );
    }

    #[test]
    fn test_reindex_restores_lost_index() {
        let dir = tempdir().unwrap();
        let library = library_at(dir.path(), ProviderType::Hashed);
        library.save_pattern(&timesheet_fields()).unwrap();

        // Simulate index loss
        drop(library);
        std::fs::remove_file(dir.path().join("vector_index.db")).unwrap();
        let library = library_at(dir.path(), ProviderType::Hashed);

        assert_eq!(library.reindex().unwrap(), 1);
        let hits = library
            .search_patterns("hours allocated across projects", None, None, 5)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].matched_by, MatchKind::Semantic);
    }

    #[test]
    fn test_stats_roundtrip_through_facade() {
        let dir = tempdir().unwrap();
        let library = library_at(dir.path(), ProviderType::Hashed);
        let p = library.save_pattern(&timesheet_fields()).unwrap();

        library.track_usage(&p.pattern_id, "hours?", true, None);
        library.track_usage(&p.pattern_id, "hours again", false, Some("wrong grain".into()));
        assert!(library.flush_usage(Duration::from_secs(5)));

        let stats = library.get_stats(None).unwrap();
        assert_eq!(stats.total_uses, 2);
        assert!((stats.overall_success_rate - 0.5).abs() < 1e-9);
        assert_eq!(stats.patterns[0].pattern_id, p.pattern_id);
    }
}
