use crate::error::Result;
use super::types::StoreConfig;
use std::path::Path;

/// Parse a YAML config file into a StoreConfig
pub fn parse_config(path: &Path) -> Result<StoreConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_config_str(&content)
}

/// Parse a YAML config string into a StoreConfig. Missing keys take their defaults.
pub fn parse_config_str(content: &str) -> Result<StoreConfig> {
    if content.trim().is_empty() {
        return Ok(StoreConfig::default());
    }
    let config: StoreConfig = serde_yaml::from_str(content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdStrategy;

    #[test]
    fn test_parse_full_config() {
        let config = parse_config_str(
            r#"
read_only: true
id_strategy: ulid
statement_cache_capacity: 16
busy_timeout_ms: 250
cache:
  enabled: false
  lifetime_secs: 30
  auto_prune: false
"#,
        )
        .unwrap();

        assert!(config.read_only);
        assert_eq!(config.id_strategy, IdStrategy::Ulid);
        assert_eq!(config.statement_cache_capacity, 16);
        assert_eq!(config.busy_timeout_ms, 250);
        assert!(!config.cache.enabled);
        assert_eq!(config.cache.lifetime_secs, 30);
        assert!(!config.cache.auto_prune);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = parse_config_str("cache:\n  lifetime_secs: 60\n").unwrap();
        assert!(!config.read_only);
        assert!(config.cache.enabled);
        assert!(config.cache.auto_prune);
        assert_eq!(config.cache.lifetime_secs, 60);
        assert_eq!(config.id_strategy, IdStrategy::Uuid);
    }

    #[test]
    fn test_empty_config() {
        let config = parse_config_str("  \n").unwrap();
        assert_eq!(config.statement_cache_capacity, 64);
    }

    #[test]
    fn test_unknown_id_strategy_rejected() {
        assert!(parse_config_str("id_strategy: sequential").is_err());
    }

    #[test]
    fn test_parse_config_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("shelf.yaml");
        std::fs::write(&path, "id_strategy: nanoid\n").unwrap();
        let config = parse_config(&path).unwrap();
        assert_eq!(config.id_strategy, IdStrategy::Nanoid);
    }
}
