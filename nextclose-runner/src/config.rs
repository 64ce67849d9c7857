//! Pipeline configuration, loaded from TOML.
//!
//! ```toml
//! universe = ["005930", "000660"]
//!
//! [store]
//! backend = "parquet"
//! root = "data/store"
//! timeout_ms = 30000
//!
//! [ingest]
//! backfill = { policy = "lookback", days = 1095 }
//! sources = [{ kind = "yahoo", suffix = ".KS" }, { kind = "csv", dir = "data/raw" }]
//!
//! [[models]]
//! name = "safe_ma_w5"
//! model = { family = "moving_average", window = 5 }
//!
//! [ensemble]
//! member_prefixes = ["safe_ma_", "safe_ses_", "safe_dl_"]
//!
//! [execution]
//! workers = 4
//! include_live = true
//! ```
//!
//! Every section has defaults; `[[models]]` falls back to the default registry.

use nextclose_core::data::{
    BackfillPolicy, CircuitBreaker, CsvSource, FetchError, PriceSource, SourceChain,
    SyntheticSource, YahooSource,
};
use nextclose_core::ensemble::EnsembleConfig;
use nextclose_core::models::{default_specs, ModelSpec};
use nextclose_core::store::{is_valid_entity_id, MemoryStore, ParquetStore, SeriesStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Entity ids processed by every stage.
    #[serde(default)]
    pub universe: Vec<String>,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default = "default_specs")]
    pub models: Vec<ModelSpec>,
    #[serde(default)]
    pub ensemble: EnsembleConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            universe: Vec::new(),
            store: StoreConfig::default(),
            ingest: IngestConfig::default(),
            models: default_specs(),
            ensemble: EnsembleConfig::default(),
            execution: ExecutionConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = BTreeSet::new();
        for id in &self.universe {
            if id.trim().is_empty() {
                return Err(ConfigError::Invalid("universe contains an empty entity id".into()));
            }
            if !is_valid_entity_id(id) {
                return Err(ConfigError::Invalid(format!(
                    "entity '{id}' cannot be stored: no path separators, '..' or control characters"
                )));
            }
            if !seen.insert(id.as_str()) {
                return Err(ConfigError::Invalid(format!("entity '{id}' listed twice")));
            }
        }
        if self.store.timeout_ms == 0 {
            return Err(ConfigError::Invalid("store.timeout_ms must be > 0".into()));
        }
        if self.execution.workers == 0 {
            return Err(ConfigError::Invalid("execution.workers must be >= 1".into()));
        }
        if self.ingest.sources.is_empty() {
            return Err(ConfigError::Invalid("ingest.sources is empty".into()));
        }
        if self.ensemble.member_prefixes.iter().any(|p| p.is_empty()) {
            return Err(ConfigError::Invalid(
                "ensemble.member_prefixes contains an empty prefix".into(),
            ));
        }
        for spec in &self.models {
            spec.validate()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        Ok(())
    }
}

// ── Store ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    Parquet,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Root directory for the Parquet backend.
    pub root: PathBuf,
    /// Per-call deadline.
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Parquet,
            root: PathBuf::from("data/store"),
            timeout_ms: 30_000,
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn open(&self) -> Arc<dyn SeriesStore> {
        match self.backend {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            StoreBackend::Parquet => Arc::new(ParquetStore::new(&self.root)),
        }
    }
}

// ── Ingest ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    Yahoo {
        /// Exchange suffix appended to the entity id, e.g. `.KS`.
        #[serde(default)]
        suffix: String,
        #[serde(default = "default_cooldown_secs")]
        cooldown_secs: u64,
    },
    Csv {
        dir: PathBuf,
    },
    Synthetic,
}

fn default_cooldown_secs() -> u64 {
    30 * 60
}

impl SourceConfig {
    pub fn build(&self) -> Result<Box<dyn PriceSource>, FetchError> {
        Ok(match self {
            Self::Yahoo {
                suffix,
                cooldown_secs,
            } => {
                let breaker = Arc::new(CircuitBreaker::new(Duration::from_secs(*cooldown_secs)));
                Box::new(YahooSource::new(breaker, suffix.clone())?)
            }
            Self::Csv { dir } => Box::new(CsvSource::new(dir)),
            Self::Synthetic => Box::new(SyntheticSource::new()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub backfill: BackfillPolicy,
    /// Tried in order until one returns rows.
    pub sources: Vec<SourceConfig>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            backfill: BackfillPolicy::default(),
            sources: vec![SourceConfig::Yahoo {
                suffix: String::new(),
                cooldown_secs: default_cooldown_secs(),
            }],
        }
    }
}

impl IngestConfig {
    pub fn build_chain(&self) -> Result<SourceChain, FetchError> {
        let sources = self
            .sources
            .iter()
            .map(SourceConfig::build)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SourceChain::new(sources))
    }
}

// ── Execution ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Size of the per-stage worker pool.
    pub workers: usize,
    /// Also forecast from the latest stored session (no truth yet).
    pub include_live: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            include_live: true,
        }
    }
}
