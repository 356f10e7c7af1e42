//! Variable extraction for query templates
//!
//! A query template declares its inputs as `{{placeholder}}` tokens. This
//! module parses a free-text question against those placeholders and
//! produces structured values for parameterized binding.
//!
//! # Injection safety
//!
//! Extracted values never enter SQL text. `prepare()` rewrites each
//! `{{name}}` token to the named parameter `:name` and hands the values
//! back as a map; binding is the database driver's job. An adversarial
//! question can at worst produce a weird *value*, never a SQL fragment.
//!
//! # Partial extraction
//!
//! Unresolvable placeholders are a normal outcome, not an error: the
//! result carries the resolved subset plus the list of unresolved names
//! so the caller can ask for manual completion.

use chrono::{Datelike, Duration, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A typed value extracted from a user question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ExtractedValue {
    Text(String),
    /// Comma-joinable list of proper nouns or quoted names
    TextList(Vec<String>),
    Integer(i64),
    Date(NaiveDate),
    DateRange { start: NaiveDate, end: NaiveDate },
}

/// Result of extracting template placeholders from a question
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extraction {
    /// Placeholder name → resolved value
    pub values: BTreeMap<String, ExtractedValue>,
    /// Placeholders that could not be resolved from the question
    pub unresolved: Vec<String>,
}

impl Extraction {
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// A template rewritten for parameterized execution
///
/// `sql` contains only the template text with `{{x}}` replaced by `:x`;
/// `params` carries the values to bind. Nothing user-provided appears
/// in `sql`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreparedQuery {
    pub sql: String,
    pub params: BTreeMap<String, ExtractedValue>,
}

/// Extraction strategy chosen from the placeholder's name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    /// Start bound of a date range
    RangeStart,
    /// End bound of a date range
    RangeEnd,
    /// Single date (falls back to a range's start)
    Date,
    /// Numeric identifier or limit
    Number,
    /// Quoted names or capitalized proper nouns
    Names,
}

impl Strategy {
    fn for_placeholder(name: &str) -> Self {
        let lower = name.to_lowercase();
        if lower.contains("start") || lower.contains("from") {
            Self::RangeStart
        } else if lower.contains("end") || lower.contains("until") || lower.contains("to_date") {
            Self::RangeEnd
        } else if lower.contains("date") || lower.contains("period") || lower.contains("month") {
            Self::Date
        } else if lower.contains("id")
            || lower.contains("limit")
            || lower.contains("count")
            || lower.contains("top")
            || lower.contains("num")
        {
            Self::Number
        } else {
            Self::Names
        }
    }
}

/// Parses `{{placeholder}}` templates against free-text questions
pub struct VariableExtractor {
    placeholder_re: Regex,
    quoted_re: Regex,
    iso_date_re: Regex,
    month_year_re: Regex,
    last_n_days_re: Regex,
    number_re: Regex,
    capitalized_re: Regex,
}

impl VariableExtractor {
    pub fn new() -> Self {
        // Static patterns; compilation cannot fail
        Self {
            placeholder_re: Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}")
                .expect("static regex"),
            quoted_re: Regex::new(r#""([^"]+)"|'([^']+)'"#).expect("static regex"),
            iso_date_re: Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})\b").expect("static regex"),
            month_year_re: Regex::new(
                r"(?i)\b(january|february|march|april|may|june|july|august|september|october|november|december)\s+(\d{4})\b",
            )
            .expect("static regex"),
            last_n_days_re: Regex::new(r"(?i)\blast\s+(\d+)\s+days?\b").expect("static regex"),
            number_re: Regex::new(r"\b\d+\b").expect("static regex"),
            capitalized_re: Regex::new(r"\b([A-Z][a-z0-9]+(?:\s+[A-Z][a-z0-9]+)*)\b")
                .expect("static regex"),
        }
    }

    /// Distinct placeholder names in declaration order
    pub fn placeholders(&self, template: &str) -> Vec<String> {
        let mut seen = Vec::new();
        for cap in self.placeholder_re.captures_iter(template) {
            let name = cap[1].to_string();
            if !seen.contains(&name) {
                seen.push(name);
            }
        }
        seen
    }

    /// Extract values for every placeholder the template declares
    ///
    /// Resolution is best-effort per placeholder; see the module docs on
    /// partial extraction.
    pub fn extract(&self, template: &str, question: &str) -> Extraction {
        let placeholders = self.placeholders(template);
        let date_range = self.find_date_range(question);
        let names = self.find_names(question);
        let numbers = self.find_numbers(question);

        let mut values = BTreeMap::new();
        let mut unresolved = Vec::new();
        let mut numbers_used = 0usize;

        for placeholder in placeholders {
            let resolved = match Strategy::for_placeholder(&placeholder) {
                Strategy::RangeStart => date_range.map(|(start, _)| ExtractedValue::Date(start)),
                Strategy::RangeEnd => date_range.map(|(_, end)| ExtractedValue::Date(end)),
                Strategy::Date => date_range.map(|(start, end)| {
                    if start == end {
                        ExtractedValue::Date(start)
                    } else {
                        ExtractedValue::DateRange { start, end }
                    }
                }),
                Strategy::Number => {
                    let v = numbers.get(numbers_used).copied();
                    if v.is_some() {
                        numbers_used += 1;
                    }
                    v.map(ExtractedValue::Integer)
                }
                Strategy::Names => {
                    if names.is_empty() {
                        None
                    } else {
                        Some(ExtractedValue::TextList(names.clone()))
                    }
                }
            };

            match resolved {
                Some(value) => {
                    values.insert(placeholder, value);
                }
                None => unresolved.push(placeholder),
            }
        }

        Extraction { values, unresolved }
    }

    /// Rewrite the template for parameterized execution
    ///
    /// Returns `None` when the extraction is incomplete; a template with
    /// unresolved placeholders is not ready to run.
    pub fn prepare(&self, template: &str, extraction: &Extraction) -> Option<PreparedQuery> {
        if !extraction.is_complete() {
            return None;
        }

        let sql = self
            .placeholder_re
            .replace_all(template, |caps: &regex::Captures<'_>| format!(":{}", &caps[1]))
            .into_owned();

        Some(PreparedQuery {
            sql,
            params: extraction.values.clone(),
        })
    }

    /// Find a date range in the question, resolving relative phrases
    /// against today's UTC date
    fn find_date_range(&self, question: &str) -> Option<(NaiveDate, NaiveDate)> {
        // Explicit ISO dates win
        let mut iso: Vec<NaiveDate> = self
            .iso_date_re
            .captures_iter(question)
            .filter_map(|c| {
                NaiveDate::from_ymd_opt(
                    c[1].parse().ok()?,
                    c[2].parse().ok()?,
                    c[3].parse().ok()?,
                )
            })
            .collect();
        if iso.len() >= 2 {
            iso.sort();
            return Some((iso[0], iso[iso.len() - 1]));
        }
        if iso.len() == 1 {
            return Some((iso[0], iso[0]));
        }

        // "March 2024" style month references
        if let Some(c) = self.month_year_re.captures(question) {
            let month = month_number(&c[1]);
            let year: i32 = c[2].parse().ok()?;
            let start = NaiveDate::from_ymd_opt(year, month, 1)?;
            return Some((start, month_end(start)));
        }

        // "last N days"
        if let Some(c) = self.last_n_days_re.captures(question) {
            let days: i64 = c[1].parse().ok()?;
            let today = Utc::now().date_naive();
            return Some((today - Duration::days(days), today));
        }

        // Fixed relative phrases
        let lower = question.to_lowercase();
        let today = Utc::now().date_naive();
        if lower.contains("last month") {
            let first_of_this = today.with_day(1)?;
            let end = first_of_this - Duration::days(1);
            return Some((end.with_day(1)?, end));
        }
        if lower.contains("this month") {
            return Some((today.with_day(1)?, month_end(today)));
        }
        if lower.contains("last week") {
            let days_since_monday = today.weekday().num_days_from_monday() as i64;
            let this_monday = today - Duration::days(days_since_monday);
            return Some((this_monday - Duration::days(7), this_monday - Duration::days(1)));
        }
        if lower.contains("last year") {
            let year = today.year() - 1;
            return Some((
                NaiveDate::from_ymd_opt(year, 1, 1)?,
                NaiveDate::from_ymd_opt(year, 12, 31)?,
            ));
        }
        if lower.contains("yesterday") {
            let d = today - Duration::days(1);
            return Some((d, d));
        }
        if lower.contains("today") {
            return Some((today, today));
        }

        None
    }

    /// Find candidate names: quoted strings first, then capitalized runs
    fn find_names(&self, question: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .quoted_re
            .captures_iter(question)
            .filter_map(|c| c.get(1).or_else(|| c.get(2)))
            .map(|m| m.as_str().trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if !names.is_empty() {
            return names;
        }

        // Capitalized runs, skipping the sentence-initial word and common
        // question openers
        const OPENERS: &[&str] = &[
            "Show", "What", "How", "List", "Give", "Which", "Who", "When", "Where", "Why", "Get",
            "Find", "Compare", "Break", "Display", "Tell",
        ];
        for m in self.capitalized_re.find_iter(question) {
            if m.start() == 0 {
                continue;
            }
            let candidate = m.as_str();
            if OPENERS.contains(&candidate) {
                continue;
            }
            names.push(candidate.to_string());
        }
        names
    }

    /// Find standalone integers, excluding digits inside ISO dates
    fn find_numbers(&self, question: &str) -> Vec<i64> {
        let date_spans: Vec<(usize, usize)> = self
            .iso_date_re
            .find_iter(question)
            .map(|m| (m.start(), m.end()))
            .collect();

        self.number_re
            .find_iter(question)
            .filter(|m| {
                !date_spans
                    .iter()
                    .any(|(s, e)| m.start() >= *s && m.end() <= *e)
            })
            .filter_map(|m| m.as_str().parse().ok())
            .collect()
    }
}

impl Default for VariableExtractor {
    fn default() -> Self {
        Self::new()
    }
}

fn month_number(name: &str) -> u32 {
    match name.to_lowercase().as_str() {
        "january" => 1,
        "february" => 2,
        "march" => 3,
        "april" => 4,
        "may" => 5,
        "june" => 6,
        "july" => 7,
        "august" => 8,
        "september" => 9,
        "october" => 10,
        "november" => 11,
        _ => 12,
    }
}

fn month_end(any_day: NaiveDate) -> NaiveDate {
    let (year, month) = (any_day.year(), any_day.month());
    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    // First of a month always exists; fall back to the input on the
    // unreachable None path rather than panicking
    first_of_next
        .map(|d| d - Duration::days(1))
        .unwrap_or(any_day)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> VariableExtractor {
        VariableExtractor::new()
    }

    #[test]
    fn test_placeholder_scan() {
        let e = extractor();
        let template = "SELECT * FROM t WHERE d BETWEEN {{start_date}} AND {{end_date}} AND n IN ({{names}}) AND n IN ({{names}})";
        assert_eq!(
            e.placeholders(template),
            vec!["start_date", "end_date", "names"]
        );
    }

    #[test]
    fn test_iso_date_range() {
        let e = extractor();
        let ex = e.extract(
            "SELECT 1 WHERE d BETWEEN {{start_date}} AND {{end_date}}",
            "hours between 2024-01-01 and 2024-03-31",
        );
        assert!(ex.is_complete());
        assert_eq!(
            ex.values["start_date"],
            ExtractedValue::Date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
        );
        assert_eq!(
            ex.values["end_date"],
            ExtractedValue::Date(NaiveDate::from_ymd_opt(2024, 3, 31).unwrap())
        );
    }

    #[test]
    fn test_month_year_phrase() {
        let e = extractor();
        let ex = e.extract("SELECT 1 WHERE {{period_date}}", "totals for March 2024");
        assert_eq!(
            ex.values["period_date"],
            ExtractedValue::DateRange {
                start: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
                end: NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
            }
        );
    }

    #[test]
    fn test_last_month_is_full_calendar_month() {
        let e = extractor();
        let ex = e.extract("SELECT 1 WHERE {{report_date}}", "report for last month");
        match &ex.values["report_date"] {
            ExtractedValue::DateRange { start, end } => {
                assert_eq!(start.day(), 1);
                assert!(end >= start);
                assert_eq!(start.month(), end.month());
            }
            other => panic!("expected date range, got {:?}", other),
        }
    }

    #[test]
    fn test_quoted_names() {
        let e = extractor();
        let ex = e.extract(
            "SELECT 1 WHERE client IN ({{client_names}})",
            "hours for \"Acme Corp\" and 'Globex'",
        );
        assert_eq!(
            ex.values["client_names"],
            ExtractedValue::TextList(vec!["Acme Corp".into(), "Globex".into()])
        );
    }

    #[test]
    fn test_capitalized_fallback_skips_openers() {
        let e = extractor();
        let ex = e.extract(
            "SELECT 1 WHERE p IN ({{project_names}})",
            "Show hours for Apollo and Mercury",
        );
        assert_eq!(
            ex.values["project_names"],
            ExtractedValue::TextList(vec!["Apollo".into(), "Mercury".into()])
        );
    }

    #[test]
    fn test_numbers_skip_date_digits() {
        let e = extractor();
        let ex = e.extract(
            "SELECT 1 WHERE id = {{ticket_id}}",
            "status of ticket 4821 since 2024-01-01",
        );
        assert_eq!(ex.values["ticket_id"], ExtractedValue::Integer(4821));
    }

    #[test]
    fn test_partial_extraction_lists_unresolved() {
        let e = extractor();
        let ex = e.extract(
            "SELECT 1 WHERE d > {{start_date}} AND id = {{user_id}}",
            "just some text with nothing usable",
        );
        assert!(ex.values.is_empty());
        assert_eq!(ex.unresolved, vec!["start_date", "user_id"]);
        assert!(!ex.is_complete());
    }

    #[test]
    fn test_prepare_requires_complete_extraction() {
        let e = extractor();
        let template = "SELECT 1 WHERE id = {{user_id}}";
        let partial = e.extract(template, "nothing here");
        assert!(e.prepare(template, &partial).is_none());

        let full = e.extract(template, "user 42");
        let prepared = e.prepare(template, &full).unwrap();
        assert_eq!(prepared.sql, "SELECT 1 WHERE id = :user_id");
        assert_eq!(prepared.params["user_id"], ExtractedValue::Integer(42));
    }

    #[test]
    fn test_injection_text_never_reaches_sql() {
        let e = extractor();
        let template = "SELECT * FROM x WHERE name IN ({{names}})";
        let attack = "Robert'); DROP TABLE x;--";
        let ex = e.extract(template, attack);
        if let Some(prepared) = e.prepare(template, &ex) {
            assert!(!prepared.sql.contains("DROP TABLE"));
            assert_eq!(prepared.sql, "SELECT * FROM x WHERE name IN (:names)");
        }
        // Whatever was extracted is data in the map, not SQL
        if let Some(ExtractedValue::TextList(names)) = ex.values.get("names") {
            assert!(!names.is_empty());
        }
    }
}
