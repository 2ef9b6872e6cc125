use super::types::*;
use crate::config::{expand_env_vars, expand_tilde, ENV_VAR_PATTERN};
use crate::location::geohash::MAX_PRECISION;
use regex::Regex;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let yaml = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    parse_config(&yaml)
}

/// Parse, expand and validate a YAML config document.
pub fn parse_config(yaml: &str) -> Result<Config, ConfigError> {
    let yaml = expand_env_vars(yaml);
    check_unexpanded_vars(&yaml)?;

    let mut config: Config = serde_yaml::from_str(&yaml)?;
    config.storage.path = expand_tilde(&config.storage.path);

    validate_config(&config)?;
    Ok(config)
}

fn check_unexpanded_vars(yaml: &str) -> Result<(), ConfigError> {
    let re = Regex::new(ENV_VAR_PATTERN).map_err(|e| ConfigError::Validation(e.to_string()))?;
    let mut missing: Vec<&str> = re
        .captures_iter(yaml)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str()))
        .collect();

    if missing.is_empty() {
        return Ok(());
    }

    missing.sort();
    missing.dedup();
    Err(ConfigError::Validation(format!(
        "environment variables are not set: {}",
        missing.join(", ")
    )))
}

/// Collect every problem instead of stopping at the first.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    let batching = &config.batching;
    if batching.max_batch_size == 0 {
        errors.push("batching.max_batch_size must be at least 1".to_string());
    }
    if batching.max_batch_delay_ms == 0 {
        errors.push("batching.max_batch_delay_ms must be greater than 0".to_string());
    }
    if batching.priority_batch_delay_ms == 0 {
        errors.push("batching.priority_batch_delay_ms must be greater than 0".to_string());
    }
    if batching.priority_batch_delay_ms > batching.max_batch_delay_ms {
        errors.push(format!(
            "batching.priority_batch_delay_ms ({}) must not exceed batching.max_batch_delay_ms ({})",
            batching.priority_batch_delay_ms, batching.max_batch_delay_ms
        ));
    }
    if !(1..=MAX_PRECISION).contains(&batching.geohash_precision) {
        errors.push(format!(
            "batching.geohash_precision must be between 1 and {}",
            MAX_PRECISION
        ));
    }

    if config.queue.workers == 0 {
        errors.push("queue.workers must be at least 1".to_string());
    }
    if config.queue.capacity == Some(0) {
        errors.push("queue.capacity must be at least 1 when set".to_string());
    }

    if config.storage.path.as_os_str().is_empty() {
        errors.push("storage.path must not be empty".to_string());
    }
    if config.storage.expiry_horizon.is_zero() {
        errors.push("storage.expiry_horizon must be greater than 0".to_string());
    }
    if config.cache.driver_ttl.is_zero() {
        errors.push("cache.driver_ttl must be greater than 0".to_string());
    }

    let broadcast = &config.broadcast;
    for (name, value) in [
        ("emergency_channel", &broadcast.emergency_channel),
        ("bulk_channel", &broadcast.bulk_channel),
        ("geofence_channel", &broadcast.geofence_channel),
    ] {
        if value.trim().is_empty() {
            errors.push(format!("broadcast.{} must not be empty", name));
        }
    }
    if broadcast.emergency_channel == broadcast.bulk_channel {
        errors.push("broadcast.emergency_channel and broadcast.bulk_channel must differ".to_string());
    }

    let density = &config.triggers.demand_density;
    if density.enabled && !(1..=MAX_PRECISION).contains(&density.precision) {
        errors.push(format!(
            "triggers.demand_density.precision must be between 1 and {}",
            MAX_PRECISION
        ));
    }

    let mut fence_ids = std::collections::HashSet::new();
    for fence in &config.triggers.geofences {
        if !fence_ids.insert(fence.id.as_str()) {
            errors.push(format!("geofence '{}' is defined more than once", fence.id));
        }
        if fence.region_id.trim().is_empty() {
            errors.push(format!("geofence '{}' has an empty region_id", fence.id));
        }
        if !(-90.0..=90.0).contains(&fence.latitude) || !(-180.0..=180.0).contains(&fence.longitude) {
            errors.push(format!("geofence '{}' has invalid coordinates", fence.id));
        }
        if !(fence.radius_m > 0.0) {
            errors.push(format!("geofence '{}' radius_m must be positive", fence.id));
        }
    }

    if config.web.enabled && config.web.listen.trim().is_empty() {
        errors.push("web.listen must be set when the web server is enabled".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = parse_config("{}").unwrap();
        assert_eq!(config.batching.max_batch_size, 500);
        assert_eq!(config.batching.max_batch_delay_ms, 1000);
        assert_eq!(config.batching.priority_batch_delay_ms, 100);
        assert!(config.batching.enable_geospatial_optimization);
        assert_eq!(config.batching.geohash_precision, 6);
        assert_eq!(config.retry.retry_attempts, 3);
        assert_eq!(config.retry.retry_delay_ms, 1000);
        assert_eq!(config.storage.expiry_horizon, Duration::from_secs(86_400));
        assert_eq!(config.cache.driver_ttl, Duration::from_secs(3600));
        assert_eq!(config.queue.workers, 1);
        assert_eq!(config.queue.strategy, OverflowStrategy::WaitForever);
        assert_eq!(config.broadcast.bulk_channel, "driver:bulk_location_update");
    }

    #[test]
    fn test_camel_case_aliases() {
        let config = parse_config(
            "batching:\n  maxBatchSize: 50\n  enableGeospatialOptimization: false\nretry:\n  retryDelayMs: 10\n",
        )
        .unwrap();
        assert_eq!(config.batching.max_batch_size, 50);
        assert!(!config.batching.enable_geospatial_optimization);
        assert_eq!(config.retry.retry_delay_ms, 10);
    }

    #[test]
    fn test_humantime_durations() {
        let config = parse_config("storage:\n  path: /tmp/x.duckdb\n  expiry_horizon: 2h\ncache:\n  driver_ttl: 90s\n").unwrap();
        assert_eq!(config.storage.expiry_horizon, Duration::from_secs(7200));
        assert_eq!(config.cache.driver_ttl, Duration::from_secs(90));
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let yaml = r#"
batching:
  max_batch_size: 0
  max_batch_delay_ms: 50
  priority_batch_delay_ms: 100
queue:
  workers: 0
triggers:
  geofences:
    - id: airport
      region_id: nyc
      latitude: 40.64
      longitude: -73.78
      radius_m: 0
"#;
        match parse_config(yaml) {
            Err(ConfigError::ValidationList(errors)) => {
                assert_eq!(errors.len(), 4, "{:?}", errors);
                assert!(errors.iter().any(|e| e.contains("max_batch_size")));
                assert!(errors.iter().any(|e| e.contains("must not exceed")));
                assert!(errors.iter().any(|e| e.contains("queue.workers")));
                assert!(errors.iter().any(|e| e.contains("airport")));
            }
            other => panic!("expected validation errors, got {:?}", other),
        }
    }

    #[test]
    fn test_unset_env_var_is_reported() {
        let err = parse_config("storage:\n  path: $env{FLEETLINE_SURELY_UNSET_VAR}/db\n").unwrap_err();
        assert!(err.to_string().contains("FLEETLINE_SURELY_UNSET_VAR"));
    }

    #[test]
    fn test_env_var_expansion_in_paths() {
        std::env::set_var("FLEETLINE_TEST_DATA_DIR", "/var/lib/fleet");
        let config = parse_config("storage:\n  path: $env{FLEETLINE_TEST_DATA_DIR}/fleet.duckdb\n").unwrap();
        assert_eq!(config.storage.path, Path::new("/var/lib/fleet/fleet.duckdb"));
        std::env::remove_var("FLEETLINE_TEST_DATA_DIR");
    }

    #[test]
    fn test_invalid_yaml() {
        assert!(matches!(
            parse_config("batching: [1, 2"),
            Err(ConfigError::YamlParse(_))
        ));
    }
}
