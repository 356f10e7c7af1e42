//! Relational pattern store (SQLite)
//!
//! Authoritative record of pattern metadata, version lineage, and usage
//! history. The vector index is a derived projection of this store and
//! can always be rebuilt from it.
//!
//! # Architecture
//!
//! ```text
//! PatternLibrary (facade)
//!         │
//!         └──→ PatternStore
//!                 ├──→ writer Connection (Mutex, WAL mode, transactions)
//!                 └──→ r2d2 pool (read-only queries, max 4)
//! ```
//!
//! # WAL Mode Concurrency
//!
//! WAL mode allows concurrent readers while a write transaction is open,
//! so search and get never block behind save/update. Writes to different
//! lineages still serialize on the single writer connection; SQLite's
//! transaction granularity makes finer locking pointless at this scale.
//!
//! # Versioning
//!
//! `update` never mutates content in place: it writes version N+1 with a
//! back-reference to N and flips N to `deprecated`. Version numbers in a
//! lineage are contiguous from 1 and exactly one version is `active`
//! (zero while the lineage is archived).

use crate::error::{LibResult, LibraryError};
use crate::model::{
    derive_pattern_id, Pattern, PatternChanges, PatternFields, PatternStats, PatternStatus, Stats,
    UsageRecord,
};
use chrono::{DateTime, Duration, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;

/// Pattern columns used by every SELECT, with `last_used` derived from
/// successful usage records at read time (never stored on the row)
const PATTERN_COLUMNS: &str = "
    p.pattern_id, p.lineage_id, p.version, p.status, p.name, p.domain,
    p.question_type, p.description, p.query_template, p.presentation_format,
    p.business_context, p.tags, p.previous_version_id, p.change_note,
    p.created_date,
    (SELECT MAX(u.used_date) FROM pattern_usage u
      WHERE u.pattern_id = p.pattern_id AND u.success = 1) AS last_used";

/// Relational store for patterns and usage history
pub struct PatternStore {
    /// Read-only pool for concurrent queries
    pool: Pool<SqliteConnectionManager>,
    /// Single writer connection; all mutations serialize here
    writer: Mutex<Connection>,
}

impl PatternStore {
    /// Open (or create) the store at the given path
    pub fn new(db_path: impl AsRef<Path>) -> LibResult<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    LibraryError::Validation(format!("cannot create data directory: {}", e))
                })?;
            }
        }

        let writer = Connection::open(db_path.as_ref())?;
        writer.pragma_update(None, "journal_mode", "WAL")?;
        Self::init_schema(&writer)?;

        let manager = SqliteConnectionManager::file(db_path.as_ref());
        let pool = Pool::builder().max_size(4).build(manager)?;

        // Verify a pooled connection works before handing the store out
        let conn = pool.get()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i32>(0))?;

        Ok(Self {
            pool,
            writer: Mutex::new(writer),
        })
    }

    fn init_schema(conn: &Connection) -> LibResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS patterns (
                pattern_id TEXT PRIMARY KEY,
                lineage_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                status TEXT NOT NULL,
                name TEXT NOT NULL,
                domain TEXT NOT NULL,
                question_type TEXT NOT NULL,
                description TEXT NOT NULL,
                query_template TEXT NOT NULL,
                presentation_format TEXT NOT NULL DEFAULT 'table',
                business_context TEXT NOT NULL DEFAULT '',
                tags TEXT NOT NULL DEFAULT '[]',
                previous_version_id TEXT,
                change_note TEXT,
                created_date TEXT NOT NULL,
                UNIQUE(lineage_id, version)
            );

            CREATE INDEX IF NOT EXISTS idx_patterns_lineage ON patterns(lineage_id);
            CREATE INDEX IF NOT EXISTS idx_patterns_domain ON patterns(domain);
            CREATE INDEX IF NOT EXISTS idx_patterns_status ON patterns(status);

            CREATE TABLE IF NOT EXISTS pattern_usage (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pattern_id TEXT NOT NULL,
                user_question TEXT NOT NULL,
                used_date TEXT NOT NULL,
                success INTEGER NOT NULL,
                feedback TEXT,
                orphaned INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_usage_pattern ON pattern_usage(pattern_id);
            CREATE INDEX IF NOT EXISTS idx_usage_date ON pattern_usage(used_date);

            CREATE TABLE IF NOT EXISTS pattern_usage_archive (
                id INTEGER PRIMARY KEY,
                pattern_id TEXT NOT NULL,
                user_question TEXT NOT NULL,
                used_date TEXT NOT NULL,
                success INTEGER NOT NULL,
                feedback TEXT,
                orphaned INTEGER NOT NULL DEFAULT 0
            );

            CREATE VIRTUAL TABLE IF NOT EXISTS patterns_fts USING fts5(
                pattern_id UNINDEXED,
                description
            );
        "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> LibResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    fn row_to_pattern(row: &Row<'_>) -> rusqlite::Result<Pattern> {
        let tags_json: String = row.get(11)?;
        let tags: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_default();
        let created: String = row.get(14)?;
        let last_used: Option<String> = row.get(15)?;

        Ok(Pattern {
            pattern_id: row.get(0)?,
            lineage_id: row.get(1)?,
            version: row.get(2)?,
            status: PatternStatus::parse(&row.get::<_, String>(3)?),
            name: row.get(4)?,
            domain: row.get(5)?,
            question_type: row.get(6)?,
            description: row.get(7)?,
            query_template: row.get(8)?,
            presentation_format: row.get(9)?,
            business_context: row.get(10)?,
            tags,
            previous_version_id: row.get(12)?,
            change_note: row.get(13)?,
            created_date: created
                .parse::<DateTime<Utc>>()
                .unwrap_or_else(|_| Utc::now()),
            last_used: last_used.and_then(|s| s.parse().ok()),
        })
    }

    // =========================================================================
    // CRUD
    // =========================================================================

    /// Save a new pattern as version 1 of a fresh lineage
    pub fn save(&self, fields: &PatternFields) -> LibResult<Pattern> {
        if let Err(field) = fields.validate() {
            return Err(LibraryError::Validation(format!(
                "{} must not be empty",
                field
            )));
        }

        let created = Utc::now();
        let lineage_id = derive_pattern_id(&fields.name, &fields.domain, &created, 0);
        let pattern_id = derive_pattern_id(&fields.name, &fields.domain, &created, 1);

        let mut writer = self.writer.lock().unwrap();
        let tx = writer.transaction()?;
        tx.execute(
            "INSERT INTO patterns (pattern_id, lineage_id, version, status, name, domain,
                                   question_type, description, query_template,
                                   presentation_format, business_context, tags,
                                   previous_version_id, change_note, created_date)
             VALUES (?1, ?2, 1, 'active', ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, NULL, NULL, ?11)",
            params![
                pattern_id,
                lineage_id,
                fields.name,
                fields.domain,
                fields.question_type,
                fields.description,
                fields.query_template,
                fields.presentation_format,
                fields.business_context,
                serde_json::to_string(&fields.tags).unwrap_or_else(|_| "[]".into()),
                created.to_rfc3339(),
            ],
        )?;
        tx.execute(
            "INSERT INTO patterns_fts (pattern_id, description) VALUES (?1, ?2)",
            params![pattern_id, fields.description],
        )?;
        tx.commit()?;

        tracing::debug!("Saved pattern {} v1 ({})", pattern_id, fields.name);
        self.fetch(&pattern_id)?
            .ok_or_else(|| LibraryError::NotFound(pattern_id))
    }

    /// Fetch by id regardless of status (internal)
    fn fetch(&self, pattern_id: &str) -> LibResult<Option<Pattern>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM patterns p WHERE p.pattern_id = ?1",
            PATTERN_COLUMNS
        );
        let pattern = conn
            .query_row(&sql, params![pattern_id], Self::row_to_pattern)
            .optional()?;
        Ok(pattern)
    }

    /// Get a pattern by id
    ///
    /// Archived patterns are hidden unless `include_archived` is set.
    /// Unknown ids return `None` rather than an error.
    pub fn get(&self, pattern_id: &str, include_archived: bool) -> LibResult<Option<Pattern>> {
        match self.fetch(pattern_id)? {
            Some(p) if p.status == PatternStatus::Archived && !include_archived => Ok(None),
            other => Ok(other),
        }
    }

    /// List active patterns, newest first, with the unfiltered total count
    pub fn list(
        &self,
        domain: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> LibResult<(Vec<Pattern>, u64)> {
        let conn = self.conn()?;

        let (filter, count_sql) = match domain {
            Some(_) => (
                "AND p.domain = ?1",
                "SELECT COUNT(*) FROM patterns p WHERE p.status = 'active' AND p.domain = ?1",
            ),
            None => (
                "",
                "SELECT COUNT(*) FROM patterns p WHERE p.status = 'active'",
            ),
        };

        let sql = format!(
            "SELECT {} FROM patterns p WHERE p.status = 'active' {}
             ORDER BY p.created_date DESC LIMIT ?{} OFFSET ?{}",
            PATTERN_COLUMNS,
            filter,
            if domain.is_some() { 2 } else { 1 },
            if domain.is_some() { 3 } else { 2 },
        );

        let mut stmt = conn.prepare(&sql)?;
        let patterns: Vec<Pattern> = match domain {
            Some(d) => stmt
                .query_map(params![d, limit as i64, offset as i64], Self::row_to_pattern)?
                .collect::<Result<_, _>>()?,
            None => stmt
                .query_map(params![limit as i64, offset as i64], Self::row_to_pattern)?
                .collect::<Result<_, _>>()?,
        };

        let total: i64 = match domain {
            Some(d) => conn.query_row(count_sql, params![d], |row| row.get(0))?,
            None => conn.query_row(count_sql, [], |row| row.get(0))?,
        };

        Ok((patterns, total as u64))
    }

    /// Active patterns ordered by usage count descending
    ///
    /// Backs the empty-query search listing; no similarity applies.
    pub fn list_by_usage(&self, domain: Option<&str>, limit: usize) -> LibResult<Vec<Pattern>> {
        let conn = self.conn()?;
        let filter = if domain.is_some() { "AND p.domain = ?2" } else { "" };
        let sql = format!(
            "SELECT {} FROM patterns p WHERE p.status = 'active' {}
             ORDER BY (SELECT COUNT(*) FROM pattern_usage u WHERE u.pattern_id = p.pattern_id) DESC,
                      p.created_date DESC
             LIMIT ?1",
            PATTERN_COLUMNS, filter,
        );

        let mut stmt = conn.prepare(&sql)?;
        let patterns = match domain {
            Some(d) => stmt
                .query_map(params![limit as i64, d], Self::row_to_pattern)?
                .collect::<Result<_, _>>()?,
            None => stmt
                .query_map(params![limit as i64], Self::row_to_pattern)?
                .collect::<Result<_, _>>()?,
        };
        Ok(patterns)
    }

    /// Create version N+1 of the lineage that `pattern_id` belongs to
    ///
    /// A no-op change set (every provided field already matches the
    /// active version) returns the active version unchanged and creates
    /// nothing. The previous active version becomes `deprecated`.
    pub fn update(
        &self,
        pattern_id: &str,
        changes: &PatternChanges,
        change_note: &str,
    ) -> LibResult<Pattern> {
        let base = self
            .fetch(pattern_id)?
            .ok_or_else(|| LibraryError::NotFound(pattern_id.to_string()))?;
        if base.status == PatternStatus::Archived {
            return Err(LibraryError::Validation(format!(
                "pattern {} is archived; restore it before updating",
                pattern_id
            )));
        }

        // Version against the lineage head, not whatever version the
        // caller happened to reference
        let active = self
            .active_of_lineage(&base.lineage_id)?
            .ok_or_else(|| LibraryError::NotFound(pattern_id.to_string()))?;

        if changes.is_noop_for(&active) {
            tracing::debug!("No-op update for {}; keeping v{}", active.pattern_id, active.version);
            return Ok(active);
        }

        let merged = Pattern {
            name: changes.name.clone().unwrap_or_else(|| active.name.clone()),
            question_type: changes
                .question_type
                .clone()
                .unwrap_or_else(|| active.question_type.clone()),
            description: changes
                .description
                .clone()
                .unwrap_or_else(|| active.description.clone()),
            query_template: changes
                .query_template
                .clone()
                .unwrap_or_else(|| active.query_template.clone()),
            presentation_format: changes
                .presentation_format
                .clone()
                .unwrap_or_else(|| active.presentation_format.clone()),
            business_context: changes
                .business_context
                .clone()
                .unwrap_or_else(|| active.business_context.clone()),
            tags: changes.tags.clone().unwrap_or_else(|| active.tags.clone()),
            ..active.clone()
        };

        if merged.name.trim().is_empty()
            || merged.question_type.trim().is_empty()
            || merged.description.trim().is_empty()
        {
            return Err(LibraryError::Validation(
                "updated fields must not be empty".into(),
            ));
        }

        let created = Utc::now();
        let next_version = self.max_version(&active.lineage_id)? + 1;
        let new_id = derive_pattern_id(&merged.name, &merged.domain, &created, next_version);

        let mut writer = self.writer.lock().unwrap();
        let tx = writer.transaction()?;
        tx.execute(
            "INSERT INTO patterns (pattern_id, lineage_id, version, status, name, domain,
                                   question_type, description, query_template,
                                   presentation_format, business_context, tags,
                                   previous_version_id, change_note, created_date)
             VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                new_id,
                active.lineage_id,
                next_version,
                merged.name,
                merged.domain,
                merged.question_type,
                merged.description,
                merged.query_template,
                merged.presentation_format,
                merged.business_context,
                serde_json::to_string(&merged.tags).unwrap_or_else(|_| "[]".into()),
                active.pattern_id,
                change_note,
                created.to_rfc3339(),
            ],
        )?;
        tx.execute(
            "UPDATE patterns SET status = 'deprecated' WHERE pattern_id = ?1",
            params![active.pattern_id],
        )?;
        tx.execute(
            "DELETE FROM patterns_fts WHERE pattern_id = ?1",
            params![active.pattern_id],
        )?;
        tx.execute(
            "INSERT INTO patterns_fts (pattern_id, description) VALUES (?1, ?2)",
            params![new_id, merged.description],
        )?;
        tx.commit()?;

        tracing::info!(
            "Created version {} of lineage {} ({} -> {})",
            next_version,
            active.lineage_id,
            active.pattern_id,
            new_id
        );

        self.fetch(&new_id)?
            .ok_or_else(|| LibraryError::NotFound(new_id))
    }

    /// Archive (soft) or remove (hard) a pattern version
    ///
    /// Hard deletion orphans usage records rather than deleting them;
    /// usage history is an audit trail.
    pub fn delete(&self, pattern_id: &str, hard: bool) -> LibResult<()> {
        let existing = self
            .fetch(pattern_id)?
            .ok_or_else(|| LibraryError::NotFound(pattern_id.to_string()))?;

        let mut writer = self.writer.lock().unwrap();
        let tx = writer.transaction()?;
        if hard {
            tx.execute(
                "DELETE FROM patterns WHERE pattern_id = ?1",
                params![pattern_id],
            )?;
            tx.execute(
                "UPDATE pattern_usage SET orphaned = 1 WHERE pattern_id = ?1",
                params![pattern_id],
            )?;
        } else {
            tx.execute(
                "UPDATE patterns SET status = 'archived' WHERE pattern_id = ?1",
                params![pattern_id],
            )?;
        }
        tx.execute(
            "DELETE FROM patterns_fts WHERE pattern_id = ?1",
            params![pattern_id],
        )?;
        tx.commit()?;

        tracing::info!(
            "{} pattern {} ({})",
            if hard { "Hard-deleted" } else { "Archived" },
            pattern_id,
            existing.name
        );
        Ok(())
    }

    /// Revive an archived pattern as a new active version
    ///
    /// The archived row stays archived; restoration appends version
    /// max+1 with the archived content and a back-reference to it.
    pub fn restore(&self, pattern_id: &str) -> LibResult<Pattern> {
        let archived = self
            .fetch(pattern_id)?
            .ok_or_else(|| LibraryError::NotFound(pattern_id.to_string()))?;
        if archived.status != PatternStatus::Archived {
            return Err(LibraryError::Validation(format!(
                "pattern {} is not archived (status: {})",
                pattern_id, archived.status
            )));
        }
        if self.active_of_lineage(&archived.lineage_id)?.is_some() {
            return Err(LibraryError::Validation(format!(
                "lineage of {} already has an active version",
                pattern_id
            )));
        }

        let created = Utc::now();
        let next_version = self.max_version(&archived.lineage_id)? + 1;
        let new_id = derive_pattern_id(&archived.name, &archived.domain, &created, next_version);

        let mut writer = self.writer.lock().unwrap();
        let tx = writer.transaction()?;
        tx.execute(
            "INSERT INTO patterns (pattern_id, lineage_id, version, status, name, domain,
                                   question_type, description, query_template,
                                   presentation_format, business_context, tags,
                                   previous_version_id, change_note, created_date)
             VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                new_id,
                archived.lineage_id,
                next_version,
                archived.name,
                archived.domain,
                archived.question_type,
                archived.description,
                archived.query_template,
                archived.presentation_format,
                archived.business_context,
                serde_json::to_string(&archived.tags).unwrap_or_else(|_| "[]".into()),
                archived.pattern_id,
                format!("restored from {}", archived.pattern_id),
                created.to_rfc3339(),
            ],
        )?;
        tx.execute(
            "INSERT INTO patterns_fts (pattern_id, description) VALUES (?1, ?2)",
            params![new_id, archived.description],
        )?;
        tx.commit()?;

        tracing::info!("Restored {} as {} (v{})", pattern_id, new_id, next_version);
        self.fetch(&new_id)?
            .ok_or_else(|| LibraryError::NotFound(new_id))
    }

    /// Compensating rollback after a failed vector-index sync
    ///
    /// Removes the freshly committed version and puts its predecessor
    /// back into the given status, restoring the pre-write state.
    pub fn rollback_version(
        &self,
        new_id: &str,
        prior_id: Option<&str>,
        prior_status: PatternStatus,
    ) -> LibResult<()> {
        let prior = match prior_id {
            Some(id) => self.fetch(id)?,
            None => None,
        };

        let mut writer = self.writer.lock().unwrap();
        let tx = writer.transaction()?;
        tx.execute("DELETE FROM patterns WHERE pattern_id = ?1", params![new_id])?;
        tx.execute(
            "DELETE FROM patterns_fts WHERE pattern_id = ?1",
            params![new_id],
        )?;
        if let Some(prior) = prior {
            tx.execute(
                "UPDATE patterns SET status = ?1 WHERE pattern_id = ?2",
                params![prior_status.to_string(), prior.pattern_id],
            )?;
            if prior_status == PatternStatus::Active {
                tx.execute(
                    "INSERT INTO patterns_fts (pattern_id, description) VALUES (?1, ?2)",
                    params![prior.pattern_id, prior.description],
                )?;
            }
        }
        tx.commit()?;

        tracing::warn!("Rolled back version {} after index failure", new_id);
        Ok(())
    }

    // =========================================================================
    // Lineage queries
    // =========================================================================

    fn active_of_lineage(&self, lineage_id: &str) -> LibResult<Option<Pattern>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM patterns p WHERE p.lineage_id = ?1 AND p.status = 'active'",
            PATTERN_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![lineage_id], Self::row_to_pattern)
            .optional()?)
    }

    fn max_version(&self, lineage_id: &str) -> LibResult<i64> {
        let conn = self.conn()?;
        let max: i64 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM patterns WHERE lineage_id = ?1",
            params![lineage_id],
            |row| row.get(0),
        )?;
        Ok(max)
    }

    /// All versions of the lineage `pattern_id` belongs to, oldest first
    pub fn version_history(&self, pattern_id: &str) -> LibResult<Vec<Pattern>> {
        let base = self
            .fetch(pattern_id)?
            .ok_or_else(|| LibraryError::NotFound(pattern_id.to_string()))?;

        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM patterns p WHERE p.lineage_id = ?1 ORDER BY p.version",
            PATTERN_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let versions = stmt
            .query_map(params![base.lineage_id], Self::row_to_pattern)?
            .collect::<Result<_, _>>()?;
        Ok(versions)
    }

    /// Active patterns as (id, domain, description) triples for reindexing
    pub fn active_descriptions(&self) -> LibResult<Vec<(String, String, String)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT pattern_id, domain, description FROM patterns WHERE status = 'active'",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }

    // =========================================================================
    // Keyword fallback search (FTS5)
    // =========================================================================

    /// Keyword search over active descriptions; the degraded-mode path
    /// when the vector index is unreachable. Results carry no
    /// similarity score.
    pub fn keyword_search(
        &self,
        query: &str,
        domain: Option<&str>,
        limit: usize,
    ) -> LibResult<Vec<Pattern>> {
        let fts_query = fts_any_token(query);
        if fts_query.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn()?;
        let filter = if domain.is_some() { "AND p.domain = ?3" } else { "" };
        let sql = format!(
            "SELECT {} FROM patterns_fts
             JOIN patterns p ON p.pattern_id = patterns_fts.pattern_id
             WHERE patterns_fts MATCH ?1 AND p.status = 'active' {}
             ORDER BY bm25(patterns_fts)
             LIMIT ?2",
            PATTERN_COLUMNS, filter,
        );

        let mut stmt = conn.prepare(&sql)?;
        let patterns = match domain {
            Some(d) => stmt
                .query_map(params![fts_query, limit as i64, d], Self::row_to_pattern)?
                .collect::<Result<_, _>>()?,
            None => stmt
                .query_map(params![fts_query, limit as i64], Self::row_to_pattern)?
                .collect::<Result<_, _>>()?,
        };
        Ok(patterns)
    }

    // =========================================================================
    // Usage history
    // =========================================================================

    /// Append one usage record (called from the tracker thread)
    pub fn record_usage(&self, record: &UsageRecord) -> LibResult<()> {
        let writer = self.writer.lock().unwrap();
        writer.execute(
            "INSERT INTO pattern_usage (pattern_id, user_question, used_date, success, feedback)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.pattern_id,
                record.user_question,
                record.used_date.to_rfc3339(),
                record.success,
                record.feedback,
            ],
        )?;
        Ok(())
    }

    /// Derived usage statistics, library-wide or for one pattern
    pub fn usage_stats(&self, pattern_id: Option<&str>) -> LibResult<Stats> {
        let conn = self.conn()?;

        let filter = if pattern_id.is_some() {
            "WHERE u.pattern_id = ?1"
        } else {
            ""
        };
        let sql = format!(
            "SELECT u.pattern_id,
                    COALESCE(p.name, '(deleted)') AS name,
                    COUNT(*) AS total_uses,
                    SUM(u.success) AS success_count,
                    MAX(CASE WHEN u.success = 1 THEN u.used_date END) AS last_used
             FROM pattern_usage u
             LEFT JOIN patterns p ON p.pattern_id = u.pattern_id
             {}
             GROUP BY u.pattern_id
             ORDER BY total_uses DESC",
            filter,
        );

        let mut stmt = conn.prepare(&sql)?;
        let map_row = |row: &Row<'_>| -> rusqlite::Result<PatternStats> {
            let total: i64 = row.get(2)?;
            let successes: i64 = row.get::<_, Option<i64>>(3)?.unwrap_or(0);
            let last_used: Option<String> = row.get(4)?;
            Ok(PatternStats {
                pattern_id: row.get(0)?,
                name: row.get(1)?,
                total_uses: total as u64,
                success_count: successes as u64,
                success_rate: if total > 0 {
                    successes as f64 / total as f64
                } else {
                    0.0
                },
                last_used: last_used.and_then(|s| s.parse().ok()),
            })
        };

        let patterns: Vec<PatternStats> = match pattern_id {
            Some(id) => stmt
                .query_map(params![id], map_row)?
                .collect::<Result<_, _>>()?,
            None => stmt.query_map([], map_row)?.collect::<Result<_, _>>()?,
        };

        // Version rows share a lineage; only the active ones are "the
        // library" for reporting purposes
        let total_patterns: i64 = conn.query_row(
            "SELECT COUNT(*) FROM patterns WHERE status = 'active'",
            [],
            |row| row.get(0),
        )?;
        let total_uses: u64 = patterns.iter().map(|p| p.total_uses).sum();
        let total_successes: u64 = patterns.iter().map(|p| p.success_count).sum();

        Ok(Stats {
            total_patterns: total_patterns as u64,
            total_uses,
            overall_success_rate: if total_uses > 0 {
                total_successes as f64 / total_uses as f64
            } else {
                0.0
            },
            patterns,
        })
    }

    /// Move usage records older than the retention window to the
    /// archive table (moved, never deleted)
    pub fn archive_old_usage(&self, retention_days: u32) -> LibResult<usize> {
        let cutoff = (Utc::now() - Duration::days(retention_days as i64)).to_rfc3339();

        let mut writer = self.writer.lock().unwrap();
        let tx = writer.transaction()?;
        tx.execute(
            "INSERT INTO pattern_usage_archive
             SELECT * FROM pattern_usage WHERE used_date < ?1",
            params![cutoff],
        )?;
        let moved = tx.execute("DELETE FROM pattern_usage WHERE used_date < ?1", params![cutoff])?;
        tx.commit()?;

        if moved > 0 {
            tracing::info!("Archived {} usage records older than {} days", moved, retention_days);
        }
        Ok(moved)
    }
}

/// Build an FTS5 query that matches any token of the input
///
/// Each token is individually quoted so user text can never inject FTS
/// syntax; tokens are OR-ed for recall in degraded mode.
fn fts_any_token(query: &str) -> String {
    query
        .split_whitespace()
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" OR ")
}
