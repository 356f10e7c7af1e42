//! Core data types for the pattern library
//!
//! A `Pattern` is one immutable version of a reusable analysis recipe.
//! Versions of the same recipe share a `lineage_id`; at most one version
//! per lineage is `active`. Usage records are append-only and aggregate
//! into derived statistics at read time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Lifecycle state of a single pattern version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternStatus {
    /// Current version of its lineage; eligible for search and suggestion
    Active,
    /// Superseded by a newer version
    Deprecated,
    /// Soft-deleted; retrievable by id with an explicit flag only
    Archived,
}

impl std::fmt::Display for PatternStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Deprecated => write!(f, "deprecated"),
            Self::Archived => write!(f, "archived"),
        }
    }
}

impl PatternStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            "archived" => Self::Archived,
            _ => Self::Deprecated,
        }
    }
}

/// One stored version of an analysis pattern
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    /// Stable identifier for this specific version
    pub pattern_id: String,
    /// Identifier shared by all versions of this recipe
    pub lineage_id: String,
    /// Monotonic version number within the lineage, starting at 1
    pub version: i64,
    pub status: PatternStatus,
    pub name: String,
    /// Namespacing tag, e.g. "servicedesk"
    pub domain: String,
    pub question_type: String,
    /// Natural-language description; this is what gets embedded for search
    pub description: String,
    /// SQL template with `{{placeholder}}` tokens
    pub query_template: String,
    pub presentation_format: String,
    pub business_context: String,
    pub tags: Vec<String>,
    /// Back-reference to the version this one superseded (never forward)
    pub previous_version_id: Option<String>,
    pub change_note: Option<String>,
    pub created_date: DateTime<Utc>,
    /// Derived from usage history at read time, never stored on the row
    pub last_used: Option<DateTime<Utc>>,
}

/// Input fields for a brand-new pattern (version 1 of a new lineage)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternFields {
    pub name: String,
    pub domain: String,
    pub question_type: String,
    pub description: String,
    pub query_template: String,
    pub presentation_format: String,
    pub business_context: String,
    pub tags: Vec<String>,
}

impl PatternFields {
    /// Check required fields; returns the offending field name on failure
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.name.trim().is_empty() {
            return Err("name");
        }
        if self.domain.trim().is_empty() {
            return Err("domain");
        }
        if self.question_type.trim().is_empty() {
            return Err("question_type");
        }
        if self.description.trim().is_empty() {
            return Err("description");
        }
        Ok(())
    }
}

/// Partial update applied when creating a new version
///
/// `None` fields carry over from the current version unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternChanges {
    pub name: Option<String>,
    pub question_type: Option<String>,
    pub description: Option<String>,
    pub query_template: Option<String>,
    pub presentation_format: Option<String>,
    pub business_context: Option<String>,
    pub tags: Option<Vec<String>>,
}

impl PatternChanges {
    /// True when every provided field already matches the pattern
    pub fn is_noop_for(&self, p: &Pattern) -> bool {
        self.name.as_ref().map_or(true, |v| *v == p.name)
            && self
                .question_type
                .as_ref()
                .map_or(true, |v| *v == p.question_type)
            && self
                .description
                .as_ref()
                .map_or(true, |v| *v == p.description)
            && self
                .query_template
                .as_ref()
                .map_or(true, |v| *v == p.query_template)
            && self
                .presentation_format
                .as_ref()
                .map_or(true, |v| *v == p.presentation_format)
            && self
                .business_context
                .as_ref()
                .map_or(true, |v| *v == p.business_context)
            && self.tags.as_ref().map_or(true, |v| *v == p.tags)
    }
}

/// One invocation attempt against a specific pattern version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub pattern_id: String,
    pub user_question: String,
    pub used_date: DateTime<Utc>,
    pub success: bool,
    pub feedback: Option<String>,
}

/// Derived usage statistics for one pattern version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternStats {
    pub pattern_id: String,
    pub name: String,
    pub total_uses: u64,
    pub success_count: u64,
    pub success_rate: f64,
    pub last_used: Option<DateTime<Utc>>,
}

/// Library-wide usage aggregates (or a single-pattern slice of them)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stats {
    pub total_patterns: u64,
    pub total_uses: u64,
    pub overall_success_rate: f64,
    /// Per-pattern breakdown, ordered by total uses descending
    pub patterns: Vec<PatternStats>,
}

/// How a search result was matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    /// Embedding cosine similarity
    Semantic,
    /// FTS keyword fallback (no similarity score)
    Keyword,
    /// Empty-query listing ordered by usage count
    Usage,
}

/// One ranked search result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub pattern: Pattern,
    /// Similarity in [0,1]; `None` for keyword/usage matches
    pub score: Option<f64>,
    pub matched_by: MatchKind,
}

/// Discrete classification of a similarity score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceBand {
    /// Eligible for auto-apply
    High,
    /// Suggested but never auto-applied
    Medium,
    /// Below threshold; no match reported
    Low,
}

/// Candidate that tied with the top suggestion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alternative {
    pub pattern_id: String,
    pub name: String,
    pub domain: String,
    pub score: f64,
}

/// Outcome of `suggest_pattern`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestionResult {
    pub matched: bool,
    pub pattern_id: Option<String>,
    pub pattern: Option<Pattern>,
    pub confidence: f64,
    pub band: ConfidenceBand,
    /// Ready-to-execute parameterization; only set for high-confidence
    /// matches with `auto_apply` and a fully resolved template
    pub sql_ready: Option<crate::extract::PreparedQuery>,
    /// Candidates within the tie window of the top score
    pub alternatives: Vec<Alternative>,
}

impl SuggestionResult {
    /// The "no pattern matched, fall back to ad-hoc analysis" outcome
    pub fn no_match() -> Self {
        Self {
            matched: false,
            pattern_id: None,
            pattern: None,
            confidence: 0.0,
            band: ConfidenceBand::Low,
            sql_ready: None,
            alternatives: Vec::new(),
        }
    }
}

/// Derive a version-specific pattern id from its identity fields
///
/// SHA-256 over name, domain, creation timestamp and version, truncated
/// to 16 hex characters. Stable for a given version, unique across them.
pub fn derive_pattern_id(
    name: &str,
    domain: &str,
    created: &DateTime<Utc>,
    version: i64,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update([0x1f]);
    hasher.update(domain.as_bytes());
    hasher.update([0x1f]);
    hasher.update(created.to_rfc3339().as_bytes());
    hasher.update([0x1f]);
    hasher.update(version.to_le_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> PatternFields {
        PatternFields {
            name: "Timesheet Project Breakdown".into(),
            domain: "servicedesk".into(),
            question_type: "aggregation".into(),
            description: "Hours allocated across projects".into(),
            query_template: "SELECT project, SUM(hours) FROM timesheet".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_required_fields() {
        assert!(fields().validate().is_ok());

        let mut missing = fields();
        missing.description = "  ".into();
        assert_eq!(missing.validate(), Err("description"));
    }

    #[test]
    fn test_derive_pattern_id_is_stable() {
        let now = Utc::now();
        let a = derive_pattern_id("x", "y", &now, 1);
        let b = derive_pattern_id("x", "y", &now, 1);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);

        let c = derive_pattern_id("x", "y", &now, 2);
        assert_ne!(a, c);
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            PatternStatus::Active,
            PatternStatus::Deprecated,
            PatternStatus::Archived,
        ] {
            assert_eq!(PatternStatus::parse(&status.to_string()), status);
        }
    }

    #[test]
    fn test_changes_noop_detection() {
        let p = Pattern {
            pattern_id: "a".into(),
            lineage_id: "l".into(),
            version: 1,
            status: PatternStatus::Active,
            name: "n".into(),
            domain: "d".into(),
            question_type: "q".into(),
            description: "desc".into(),
            query_template: "t".into(),
            presentation_format: "table".into(),
            business_context: String::new(),
            tags: vec!["one".into()],
            previous_version_id: None,
            change_note: None,
            created_date: Utc::now(),
            last_used: None,
        };

        let noop = PatternChanges {
            description: Some("desc".into()),
            ..Default::default()
        };
        assert!(noop.is_noop_for(&p));

        let real = PatternChanges {
            description: Some("different".into()),
            ..Default::default()
        };
        assert!(!real.is_noop_for(&p));
    }
}
