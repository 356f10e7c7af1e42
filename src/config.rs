// Configuration for the pattern library
//
// Configuration is loaded in order of precedence:
// 1. Environment variables (highest priority)
// 2. Config file (~/.config/patternbank/config.toml)
// 3. Built-in defaults (lowest priority)

use crate::embeddings::{EmbeddingConfig, ProviderType};
use serde::Deserialize;
use std::path::PathBuf;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Suggestion thresholds and limits
///
/// The bands are fixed behavior, not tuning knobs users should need to
/// touch, but the file keeps them adjustable for experimentation.
#[derive(Debug, Clone)]
pub struct SuggestionConfig {
    /// Similarity at or above which a match is high confidence
    /// (eligible for auto-apply)
    pub high_threshold: f64,

    /// Similarity at or above which a match is medium confidence
    /// (suggested, never auto-applied)
    pub medium_threshold: f64,

    /// Score gap within which candidates count as tied with the best
    pub tie_epsilon: f64,

    /// Budget for a single search call before degrading (milliseconds)
    pub search_timeout_ms: u64,

    /// Budget for a suggestion before failing open to no-match (milliseconds)
    pub suggest_timeout_ms: u64,

    /// Default result limit for search and list
    pub default_limit: usize,
}

impl Default for SuggestionConfig {
    fn default() -> Self {
        Self {
            high_threshold: 0.80,
            medium_threshold: 0.70,
            tie_epsilon: 0.02,
            search_timeout_ms: 200,
            suggest_timeout_ms: 500,
            default_limit: 5,
        }
    }
}

/// Usage history settings
#[derive(Debug, Clone)]
pub struct UsageConfig {
    /// Records older than this move to the archive table
    pub retention_days: u32,

    /// Bound on the fire-and-forget record queue
    pub queue_capacity: usize,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            retention_days: 365,
            queue_capacity: 256,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Optional file to append logs to (stderr only when unset)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            file: None,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding both database files
    pub data_dir: PathBuf,

    /// Suggestion thresholds and limits
    pub suggestion: SuggestionConfig,

    /// Usage history settings
    pub usage: UsageConfig,

    /// Embedding provider settings
    pub embedding: EmbeddingConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Suggestion settings as loaded from config file
#[derive(Debug, Deserialize, Default)]
struct FileSuggestion {
    high_threshold: Option<f64>,
    medium_threshold: Option<f64>,
    tie_epsilon: Option<f64>,
    search_timeout_ms: Option<u64>,
    suggest_timeout_ms: Option<u64>,
    default_limit: Option<usize>,
}

/// Usage settings as loaded from config file
#[derive(Debug, Deserialize, Default)]
struct FileUsage {
    retention_days: Option<u32>,
    queue_capacity: Option<usize>,
}

/// Embedding settings as loaded from config file
#[derive(Debug, Deserialize, Default)]
struct FileEmbedding {
    provider: Option<ProviderType>,
    model: Option<String>,
    api_base: Option<String>,
    timeout_secs: Option<u64>,
}

/// Logging settings as loaded from config file
#[derive(Debug, Deserialize, Default)]
struct FileLogging {
    level: Option<String>,
    file: Option<String>,
}

/// Config file structure (subset of Config that makes sense to persist)
#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    data_dir: Option<String>,

    /// Optional [suggestion] section
    suggestion: Option<FileSuggestion>,

    /// Optional [usage] section
    usage: Option<FileUsage>,

    /// Optional [embedding] section
    embedding: Option<FileEmbedding>,

    /// Optional [logging] section
    logging: Option<FileLogging>,
}

impl Config {
    /// Get the config file path: ~/.config/patternbank/config.toml
    /// Uses Unix-style ~/.config on all platforms for consistency
    pub fn config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|p| p.join(".config").join("patternbank").join("config.toml"))
    }

    /// Create config template if it doesn't exist
    /// Called during startup to help users discover configuration options
    pub fn ensure_config_exists() {
        let Some(path) = Self::config_path() else {
            return;
        };

        // Don't overwrite existing config
        if path.exists() {
            return;
        }

        // Create parent directory
        if let Some(parent) = path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return; // Silently fail - config is optional
            }
        }

        let template = r#"# patternbank configuration
# Uncomment and modify options as needed

# Directory holding patterns.db and vector_index.db
# (default: ~/.local/share/patternbank)
# data_dir = "~/.local/share/patternbank"

# Suggestion thresholds
# [suggestion]
# high_threshold = 0.80      # auto-apply eligible at or above this
# medium_threshold = 0.70    # suggested below high, nothing below this
# tie_epsilon = 0.02         # candidates within this of the top score are ties
# search_timeout_ms = 200
# suggest_timeout_ms = 500
# default_limit = 5

# Usage history
# [usage]
# retention_days = 365       # older records move to the archive table
# queue_capacity = 256       # in-flight usage record queue bound

# Embedding provider: hashed (default, no setup), local, remote, none
# [embedding]
# provider = "hashed"
# model = "all-MiniLM-L6-v2"           # local models; remote: text-embedding-3-small
# api_base = "https://api.openai.com/v1"  # remote only; key via OPENAI_API_KEY
# timeout_secs = 30

# Logging configuration
# [logging]
# level = "warn"  # trace, debug, info, warn, error (RUST_LOG env var overrides)
# file = "~/.local/share/patternbank/patternbank.log"
"#;

        // Write template (ignore errors - config is optional)
        let _ = std::fs::write(&path, template);
    }

    /// Load file config if it exists
    fn load_file_config() -> FileConfig {
        let Some(path) = Self::config_path() else {
            return FileConfig::default();
        };

        match std::fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                eprintln!("Warning: Failed to parse {}: {}", path.display(), e);
                FileConfig::default()
            }),
            Err(_) => FileConfig::default(), // File doesn't exist, use defaults
        }
    }

    /// Load configuration: env vars -> file -> defaults
    pub fn from_env() -> Self {
        let file = Self::load_file_config();

        // Data directory: env > file > default
        let data_dir = std::env::var("PATTERNBANK_DATA_DIR")
            .ok()
            .or(file.data_dir)
            .map(|p| expand_home(&p))
            .unwrap_or_else(Self::default_data_dir);

        let file_suggestion = file.suggestion.unwrap_or_default();
        let defaults = SuggestionConfig::default();
        let suggestion = SuggestionConfig {
            high_threshold: file_suggestion.high_threshold.unwrap_or(defaults.high_threshold),
            medium_threshold: file_suggestion
                .medium_threshold
                .unwrap_or(defaults.medium_threshold),
            tie_epsilon: file_suggestion.tie_epsilon.unwrap_or(defaults.tie_epsilon),
            search_timeout_ms: file_suggestion
                .search_timeout_ms
                .unwrap_or(defaults.search_timeout_ms),
            suggest_timeout_ms: file_suggestion
                .suggest_timeout_ms
                .unwrap_or(defaults.suggest_timeout_ms),
            default_limit: file_suggestion.default_limit.unwrap_or(defaults.default_limit),
        };

        let file_usage = file.usage.unwrap_or_default();
        let usage_defaults = UsageConfig::default();
        let usage = UsageConfig {
            retention_days: file_usage.retention_days.unwrap_or(usage_defaults.retention_days),
            queue_capacity: file_usage.queue_capacity.unwrap_or(usage_defaults.queue_capacity),
        };

        let file_embedding = file.embedding.unwrap_or_default();
        let embedding_defaults = EmbeddingConfig::default();
        // Provider: env > file > default
        let provider = std::env::var("PATTERNBANK_EMBEDDING_PROVIDER")
            .ok()
            .and_then(|v| match v.as_str() {
                "hashed" => Some(ProviderType::Hashed),
                "local" => Some(ProviderType::Local),
                "remote" => Some(ProviderType::Remote),
                "none" => Some(ProviderType::None),
                _ => None,
            })
            .or(file_embedding.provider)
            .unwrap_or(embedding_defaults.provider);
        let embedding = EmbeddingConfig {
            provider,
            model: std::env::var("PATTERNBANK_EMBEDDING_MODEL")
                .ok()
                .or(file_embedding.model)
                .unwrap_or(embedding_defaults.model),
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            api_base: file_embedding.api_base.or(embedding_defaults.api_base),
            timeout_secs: file_embedding
                .timeout_secs
                .unwrap_or(embedding_defaults.timeout_secs),
        };

        let file_logging = file.logging.unwrap_or_default();
        let logging = LoggingConfig {
            level: std::env::var("PATTERNBANK_LOG")
                .ok()
                .or(file_logging.level)
                .unwrap_or_else(|| LoggingConfig::default().level),
            file: std::env::var("PATTERNBANK_LOG_FILE")
                .ok()
                .or(file_logging.file)
                .map(|p| expand_home(&p)),
        };

        Self {
            data_dir,
            suggestion,
            usage,
            embedding,
            logging,
        }
    }

    /// Default data directory: ~/.local/share/patternbank
    fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("patternbank")
    }

    /// Path of the relational store database
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("patterns.db")
    }

    /// Path of the vector index database
    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join("vector_index.db")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: Self::default_data_dir(),
            suggestion: SuggestionConfig::default(),
            usage: UsageConfig::default(),
            embedding: EmbeddingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Expand a leading `~/` to the home directory
fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
