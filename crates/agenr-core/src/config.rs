//! Engine Configuration
//!
//! Process-wide configuration loaded from `~/.agenr/config.json`, plus the
//! layout of the data root (database, watcher state, ledgers). Every key is
//! optional; absent keys fall back to built-in defaults.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default embedding dimensionality (provider-dependent, fixed per database)
pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 1024;

// ============================================================================
// ERROR TYPE
// ============================================================================

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file exists but cannot be read
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// File path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },
    /// Config file exists but is not valid JSON
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// File path
        path: PathBuf,
        /// Underlying error
        source: serde_json::Error,
    },
    /// No home directory available to resolve the default data root
    #[error("could not determine home directory for data root")]
    NoHome,
}

// ============================================================================
// DATA ROOT
// ============================================================================

/// Layout of the on-disk data root (default `~/.agenr/`)
#[derive(Debug, Clone)]
pub struct DataRoot {
    root: PathBuf,
}

impl DataRoot {
    /// Use an explicit directory as the data root
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the default `~/.agenr/` root
    pub fn default_location() -> Result<Self, ConfigError> {
        let base = directories::BaseDirs::new().ok_or(ConfigError::NoHome)?;
        Ok(Self {
            root: base.home_dir().join(".agenr"),
        })
    }

    /// The root directory itself
    pub fn dir(&self) -> &Path {
        &self.root
    }

    /// Create the root directory if missing
    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)
    }

    /// The database file
    pub fn db_path(&self) -> PathBuf {
        self.root.join("knowledge.db")
    }

    /// Watcher byte-offset state
    pub fn watch_state_path(&self) -> PathBuf {
        self.root.join("watch-state.json")
    }

    /// Watcher PID lock
    pub fn watcher_pid_path(&self) -> PathBuf {
        self.root.join("watcher.pid")
    }

    /// Watcher heartbeat
    pub fn watcher_health_path(&self) -> PathBuf {
        self.root.join("watcher.health.json")
    }

    /// Retirement ledger
    pub fn retirements_path(&self) -> PathBuf {
        self.root.join("retirements.json")
    }

    /// Append-only access log
    pub fn access_log_path(&self) -> PathBuf {
        self.root.join("mcp-access.log")
    }

    /// Consolidation checkpoint (cluster cursor for resumable runs)
    pub fn consolidation_checkpoint_path(&self) -> PathBuf {
        self.root.join("consolidation-checkpoint.json")
    }

    /// Consolidator lock marker
    pub fn consolidation_lock_path(&self) -> PathBuf {
        self.root.join("consolidation.lock")
    }

    /// Config file
    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }
}

// ============================================================================
// CONFIG FILE SECTIONS
// ============================================================================

/// `db` section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DbSection {
    /// Database location override
    pub path: Option<PathBuf>,
}

/// `dedup` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DedupSection {
    /// Send more similarity bands through LLM classification
    pub aggressive: bool,
    /// Override for the LLM-dedup band floor (0..1)
    pub threshold: Option<f64>,
}

impl Default for DedupSection {
    fn default() -> Self {
        Self {
            aggressive: false,
            threshold: None,
        }
    }
}

/// `forgetting` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ForgettingSection {
    /// Whether the forgetting pass may delete entries
    pub enabled: bool,
    /// Forgetting-score threshold above which an entry is a candidate
    pub score_threshold: f64,
    /// Entries younger than this never score high enough to be forgotten
    pub max_age_days: i64,
    /// Subject substrings that are never forgotten
    pub protect: Vec<String>,
}

impl Default for ForgettingSection {
    fn default() -> Self {
        Self {
            enabled: false,
            score_threshold: 0.65,
            max_age_days: 180,
            protect: Vec::new(),
        }
    }
}

/// Signal gating knobs (flat keys in the config file)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SignalSettings {
    /// Master switch
    pub signals_enabled: bool,
    /// Minimum importance to surface as a signal
    pub signal_min_importance: i64,
    /// Max entries per signal batch
    pub signal_max_per_signal: usize,
    /// Minimum quiet period between signals in one session
    pub signal_cooldown_ms: u64,
    /// Max signals per session
    pub signal_max_per_session: usize,
    /// Only entries younger than this are signal-worthy
    pub signal_max_age_sec: i64,
}

impl Default for SignalSettings {
    fn default() -> Self {
        Self {
            signals_enabled: true,
            signal_min_importance: 8,
            signal_max_per_signal: 3,
            signal_cooldown_ms: 30_000,
            signal_max_per_session: 10,
            signal_max_age_sec: 300,
        }
    }
}

// ============================================================================
// ENGINE CONFIG
// ============================================================================

/// Process-wide engine configuration
///
/// Mirrors `config.json`; unknown keys in the file are ignored so older
/// engines can open configs written by newer ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// `db` section
    pub db: DbSection,
    /// `dedup` section
    pub dedup: DedupSection,
    /// Signal gating
    #[serde(flatten)]
    pub signals: SignalSettings,
    /// `forgetting` section
    pub forgetting: ForgettingSection,
    /// WAL checkpoint cadence for the watcher
    pub wal_checkpoint_interval_ms: u64,
    /// Session-label to project-slug mapping
    pub label_project_map: HashMap<String, String>,
    /// Embedding dimensionality; must match the provider
    pub embedding_dimensions: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db: DbSection::default(),
            dedup: DedupSection::default(),
            signals: SignalSettings::default(),
            forgetting: ForgettingSection::default(),
            wal_checkpoint_interval_ms: 30_000,
            label_project_map: HashMap::new(),
            embedding_dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl EngineConfig {
    /// Load from the data root's `config.json`; defaults when absent
    pub fn load(root: &DataRoot) -> Result<Self, ConfigError> {
        let path = root.config_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse { path, source })
    }

    /// Resolve the database path (config override, else root default)
    pub fn db_path(&self, root: &DataRoot) -> PathBuf {
        self.db.path.clone().unwrap_or_else(|| root.db_path())
    }

    /// Map a session label to a project slug via `labelProjectMap`
    pub fn project_for_label(&self, label: &str) -> Option<&str> {
        self.label_project_map.get(label).map(String::as_str)
    }
}

// ============================================================================
// TESTS
// ============================================================================
