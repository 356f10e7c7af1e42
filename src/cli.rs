// CLI module - command-line argument parsing and handlers
//
// Subcommands map one-to-one onto library operations:
// - save / update / delete / restore: lifecycle
// - search / suggest / show / list: retrieval
// - track / stats / prune: usage analytics
// - reindex: rebuild the vector index from the relational store
// - config: configuration management
//
// Every data command honors --json for machine-readable output.
// Exit codes: 0 success, 1 caller error (validation, not found),
// 2 internal failure (store, index, rolled-back transaction).

use crate::config::{Config, VERSION};
use crate::error::{LibResult, LibraryError};
use crate::library::PatternLibrary;
use crate::model::{Pattern, PatternChanges, PatternFields, SearchHit};
use clap::{Parser, Subcommand};
use std::time::Duration;

/// patternbank - reusable analysis pattern library
#[derive(Parser)]
#[command(name = "patternbank")]
#[command(version = VERSION)]
#[command(about = "Library of reusable analysis patterns with semantic suggestion", long_about = None)]
pub struct Cli {
    /// Emit machine-readable JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Save a new pattern
    Save {
        /// Human-readable pattern name
        #[arg(long)]
        name: String,

        /// Domain the pattern belongs to (e.g. servicedesk, finance)
        #[arg(long)]
        domain: String,

        /// Kind of question answered (e.g. aggregation, trend, ranking)
        #[arg(long = "question-type")]
        question_type: String,

        /// Natural-language description (this is what search matches on)
        #[arg(long)]
        description: String,

        /// SQL template with {{placeholder}} tokens
        #[arg(long)]
        template: String,

        /// Presentation format (table, chart, number)
        #[arg(long, default_value = "table")]
        format: String,

        /// Business context note
        #[arg(long, default_value = "")]
        context: String,

        /// Tag (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Search patterns by natural-language query
    Search {
        /// Query text; empty lists patterns by usage
        #[arg(default_value = "")]
        query: String,

        /// Restrict to one domain
        #[arg(long)]
        domain: Option<String>,

        /// Minimum similarity score (default: the configured medium threshold)
        #[arg(long)]
        threshold: Option<f64>,

        /// Maximum results
        #[arg(long)]
        limit: Option<usize>,
    },

    /// List active patterns, newest first
    List {
        /// Restrict to one domain
        #[arg(long)]
        domain: Option<String>,

        /// Maximum results
        #[arg(long)]
        limit: Option<usize>,

        /// Skip this many results
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },

    /// Show one pattern by id
    Show {
        /// Pattern id
        id: String,

        /// Also find archived patterns
        #[arg(long = "include-archived")]
        include_archived: bool,

        /// Show the full version history of the lineage
        #[arg(long)]
        history: bool,
    },

    /// Update a pattern, creating a new version
    Update {
        /// Pattern id (any version of the lineage)
        id: String,

        /// Reason for the change, stored on the new version
        #[arg(long)]
        note: String,

        #[arg(long)]
        name: Option<String>,

        #[arg(long = "question-type")]
        question_type: Option<String>,

        #[arg(long)]
        description: Option<String>,

        #[arg(long)]
        template: Option<String>,

        #[arg(long)]
        format: Option<String>,

        #[arg(long)]
        context: Option<String>,

        /// Replace the tag set (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Archive a pattern (or remove it permanently with --hard)
    Delete {
        /// Pattern id
        id: String,

        /// Permanently remove instead of archiving
        #[arg(long)]
        hard: bool,
    },

    /// Restore an archived pattern as a new active version
    Restore {
        /// Pattern id of the archived version
        id: String,
    },

    /// Suggest the best pattern for a question
    Suggest {
        /// The user's question
        question: String,

        /// Prefer patterns from this domain on ties
        #[arg(long)]
        domain: Option<String>,

        /// Allow high-confidence matches to return ready-to-run SQL
        #[arg(long = "auto-apply")]
        auto_apply: bool,
    },

    /// Record a usage attempt against a pattern
    Track {
        /// Pattern id
        id: String,

        /// The question that was asked
        #[arg(long)]
        question: String,

        /// Record the attempt as failed (default: success)
        #[arg(long)]
        failed: bool,

        /// Free-text feedback
        #[arg(long)]
        feedback: Option<String>,
    },

    /// Usage statistics
    Stats {
        /// Restrict to one pattern id
        #[arg(long)]
        pattern: Option<String>,

        /// Only show the top N patterns
        #[arg(long)]
        top: Option<usize>,
    },

    /// Rebuild the vector index from the relational store
    Reindex,

    /// Move usage records past the retention window to the archive
    Prune,

    /// Manage configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,

        /// Show config file path
        #[arg(long)]
        path: bool,

        /// Create the config template if missing
        #[arg(long)]
        init: bool,
    },
}

/// Dispatch a parsed command line
pub fn run(cli: Cli, config: &Config) -> LibResult<()> {
    // Config inspection works without touching the databases
    if let Commands::Config { show, path, init } = &cli.command {
        handle_config(*show, *path, *init, config);
        return Ok(());
    }

    let library = PatternLibrary::open(config)?;

    match cli.command {
        Commands::Save {
            name,
            domain,
            question_type,
            description,
            template,
            format,
            context,
            tags,
        } => {
            let pattern = library.save_pattern(&PatternFields {
                name,
                domain,
                question_type,
                description,
                query_template: template,
                presentation_format: format,
                business_context: context,
                tags,
            })?;
            if cli.json {
                print_json(&pattern);
            } else {
                println!("Saved {} (v{})", pattern.pattern_id, pattern.version);
            }
        }

        Commands::Search {
            query,
            domain,
            threshold,
            limit,
        } => {
            let limit = limit.unwrap_or(config.suggestion.default_limit);
            let hits = library.search_patterns(&query, domain.as_deref(), threshold, limit)?;
            if cli.json {
                print_json(&hits);
            } else if hits.is_empty() {
                println!("No matching patterns.");
            } else {
                for hit in &hits {
                    print_hit(hit);
                }
            }
        }

        Commands::List { domain, limit, offset } => {
            let limit = limit.unwrap_or(config.suggestion.default_limit);
            let (patterns, total) = library.list_patterns(domain.as_deref(), limit, offset)?;
            if cli.json {
                print_json(&serde_json::json!({ "total": total, "patterns": patterns }));
            } else {
                for pattern in &patterns {
                    print_pattern_line(pattern);
                }
                println!("{} of {} active patterns", patterns.len(), total);
            }
        }

        Commands::Show {
            id,
            include_archived,
            history,
        } => {
            if history {
                let versions = library.version_history(&id)?;
                if cli.json {
                    print_json(&versions);
                } else {
                    for version in &versions {
                        println!(
                            "v{} {} [{}] {}",
                            version.version,
                            version.pattern_id,
                            version.status,
                            version.change_note.as_deref().unwrap_or("-")
                        );
                    }
                }
            } else {
                let pattern = library
                    .get_pattern(&id, include_archived)?
                    .ok_or(LibraryError::NotFound(id))?;
                if cli.json {
                    print_json(&pattern);
                } else {
                    print_pattern_full(&pattern);
                }
            }
        }

        Commands::Update {
            id,
            note,
            name,
            question_type,
            description,
            template,
            format,
            context,
            tags,
        } => {
            let changes = PatternChanges {
                name,
                question_type,
                description,
                query_template: template,
                presentation_format: format,
                business_context: context,
                tags: if tags.is_empty() { None } else { Some(tags) },
            };
            let updated = library.update_pattern(&id, &changes, &note)?;
            if cli.json {
                print_json(&updated);
            } else if updated.pattern_id == id {
                println!("No changes; {} stays at v{}", id, updated.version);
            } else {
                println!("Updated to {} (v{})", updated.pattern_id, updated.version);
            }
        }

        Commands::Delete { id, hard } => {
            library.delete_pattern(&id, hard)?;
            if !cli.json {
                println!("{} {}", if hard { "Deleted" } else { "Archived" }, id);
            }
        }

        Commands::Restore { id } => {
            let restored = library.restore_pattern(&id)?;
            if cli.json {
                print_json(&restored);
            } else {
                println!("Restored as {} (v{})", restored.pattern_id, restored.version);
            }
        }

        Commands::Suggest {
            question,
            domain,
            auto_apply,
        } => {
            let result = library.suggest_pattern(&question, domain.as_deref(), auto_apply)?;
            if cli.json {
                print_json(&result);
            } else if !result.matched {
                println!("No pattern matched; proceed with ad-hoc analysis.");
            } else {
                let pattern = result.pattern.as_ref().map(|p| p.name.as_str()).unwrap_or("?");
                println!(
                    "{} ({:.0}% {:?})",
                    pattern,
                    result.confidence * 100.0,
                    result.band
                );
                if let Some(prepared) = &result.sql_ready {
                    println!("SQL: {}", prepared.sql);
                    for (param, value) in &prepared.params {
                        println!("  :{} = {:?}", param, value);
                    }
                }
                for alt in &result.alternatives {
                    println!(
                        "  also: {} [{}] ({:.0}%)",
                        alt.name,
                        alt.domain,
                        alt.score * 100.0
                    );
                }
            }
        }

        Commands::Track {
            id,
            question,
            failed,
            feedback,
        } => {
            let queued = library.track_usage(&id, &question, !failed, feedback);
            // CLI process exits right after, so wait for the write
            library.flush_usage(Duration::from_secs(5));
            if !cli.json {
                println!("{}", if queued { "Recorded." } else { "Dropped (queue full)." });
            }
        }

        Commands::Stats { pattern, top } => {
            let mut stats = library.get_stats(pattern.as_deref())?;
            if let Some(top) = top {
                stats.patterns.truncate(top);
            }
            if cli.json {
                print_json(&stats);
            } else {
                println!(
                    "{} patterns, {} uses, {:.0}% success",
                    stats.total_patterns,
                    stats.total_uses,
                    stats.overall_success_rate * 100.0
                );
                for p in &stats.patterns {
                    println!(
                        "  {} {} - {} uses, {:.0}% success",
                        p.pattern_id,
                        p.name,
                        p.total_uses,
                        p.success_rate * 100.0
                    );
                }
            }
        }

        Commands::Reindex => {
            let count = library.reindex()?;
            if !cli.json {
                println!("Reindexed {} patterns", count);
            }
        }

        Commands::Prune => {
            let moved = library.archive_old_usage(config.usage.retention_days)?;
            if !cli.json {
                println!(
                    "Archived {} usage records older than {} days",
                    moved, config.usage.retention_days
                );
            }
        }

        Commands::Config { .. } => unreachable!("handled above"),
    }

    Ok(())
}

fn handle_config(show: bool, path: bool, init: bool, config: &Config) {
    if path {
        match Config::config_path() {
            Some(p) => println!("{}", p.display()),
            None => eprintln!("Error: Could not determine config path"),
        }
    } else if init {
        Config::ensure_config_exists();
        if let Some(p) = Config::config_path() {
            println!("Config at {}", p.display());
        }
    } else if show {
        println!("# Effective configuration (env > file > defaults)");
        println!();
        println!("data_dir = {:?}", config.data_dir.display().to_string());
        println!();
        println!("[suggestion]");
        println!("high_threshold = {}", config.suggestion.high_threshold);
        println!("medium_threshold = {}", config.suggestion.medium_threshold);
        println!("tie_epsilon = {}", config.suggestion.tie_epsilon);
        println!("search_timeout_ms = {}", config.suggestion.search_timeout_ms);
        println!("suggest_timeout_ms = {}", config.suggestion.suggest_timeout_ms);
        println!("default_limit = {}", config.suggestion.default_limit);
        println!();
        println!("[usage]");
        println!("retention_days = {}", config.usage.retention_days);
        println!("queue_capacity = {}", config.usage.queue_capacity);
        println!();
        println!("[embedding]");
        println!("provider = \"{}\"", config.embedding.provider);
        println!("model = {:?}", config.embedding.model);
        println!();
        println!("[logging]");
        println!("level = {:?}", config.logging.level);
        if let Some(p) = Config::config_path() {
            println!();
            if p.exists() {
                println!("# Source: {}", p.display());
            } else {
                println!("# Source: defaults (no config file)");
            }
        }
    } else {
        println!("Usage: patternbank config [--show|--path|--init]");
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error serializing output: {}", e),
    }
}

fn print_hit(hit: &SearchHit) {
    match hit.score {
        Some(score) => println!(
            "{:.0}% {} [{}] {}",
            score * 100.0,
            hit.pattern.pattern_id,
            hit.pattern.domain,
            hit.pattern.name
        ),
        None => println!(
            " --  {} [{}] {} ({:?})",
            hit.pattern.pattern_id, hit.pattern.domain, hit.pattern.name, hit.matched_by
        ),
    }
}

fn print_pattern_line(pattern: &Pattern) {
    println!(
        "{} [{}] {} (v{})",
        pattern.pattern_id, pattern.domain, pattern.name, pattern.version
    );
}

fn print_pattern_full(pattern: &Pattern) {
    println!("{} (v{}, {})", pattern.name, pattern.version, pattern.status);
    println!("id:          {}", pattern.pattern_id);
    println!("lineage:     {}", pattern.lineage_id);
    println!("domain:      {}", pattern.domain);
    println!("type:        {}", pattern.question_type);
    println!("description: {}", pattern.description);
    println!("template:    {}", pattern.query_template);
    println!("format:      {}", pattern.presentation_format);
    if !pattern.business_context.is_empty() {
        println!("context:     {}", pattern.business_context);
    }
    if !pattern.tags.is_empty() {
        println!("tags:        {}", pattern.tags.join(", "));
    }
    if let Some(prev) = &pattern.previous_version_id {
        println!("supersedes:  {}", prev);
    }
    if let Some(note) = &pattern.change_note {
        println!("change:      {}", note);
    }
    println!("created:     {}", pattern.created_date.to_rfc3339());
    if let Some(last) = &pattern.last_used {
        println!("last used:   {}", last.to_rfc3339());
    }
}
