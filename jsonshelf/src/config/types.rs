use serde::{Deserialize, Serialize};

/// Store-wide settings, usually loaded from a YAML file next to the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Open the database read-only; every mutating call fails fast.
    pub read_only: bool,
    pub cache: CacheConfig,
    /// How `__id` is generated for documents saved without one.
    pub id_strategy: IdStrategy,
    /// Number of prepared statements kept by the connection.
    pub statement_cache_capacity: usize,
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            read_only: false,
            cache: CacheConfig::default(),
            id_strategy: IdStrategy::default(),
            statement_cache_capacity: 64,
            busy_timeout_ms: 5000,
        }
    }
}

/// Result cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Entry lifetime in seconds. 0 keeps entries until they are flushed.
    pub lifetime_secs: u64,
    /// Delete expired entries whenever a cache table is read.
    pub auto_prune: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            enabled: true,
            lifetime_secs: 0,
            auto_prune: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdStrategy {
    #[default]
    Uuid,
    Ulid,
    Nanoid,
}

impl IdStrategy {
    pub fn generate(&self) -> String {
        match self {
            IdStrategy::Uuid => uuid::Uuid::new_v4().to_string(),
            IdStrategy::Ulid => ulid::Ulid::new().to_string().to_lowercase(),
            IdStrategy::Nanoid => nanoid::nanoid!(),
        }
    }
}
