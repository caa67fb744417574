//! Configuration schema and loading.

pub mod schema;

use std::path::Path;

use crate::error::ConfigError;

pub use schema::{
    BusConfig, Config, OcrConfig, RateLimitConfig, StageTimeouts, WebhookConfig, WorkerConfig,
};

/// Loads a config from a JSON file, validating it.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    let config: Config = serde_json::from_str(&contents)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.worker.worker_count == 0 {
        return Err(ConfigError::Validation {
            message: "worker_count must be at least 1".to_string(),
        });
    }
    if config.worker.max_attempts == 0 {
        return Err(ConfigError::Validation {
            message: "max_attempts must be at least 1".to_string(),
        });
    }
    if config.webhook.max_attempts == 0 {
        return Err(ConfigError::Validation {
            message: "webhook max_attempts must be at least 1".to_string(),
        });
    }
    if config.bus.capacity == 0 {
        return Err(ConfigError::Validation {
            message: "bus capacity must be at least 1".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::with_suffix(".json").unwrap();
        write!(file, r#"{{ "worker": {{ "worker_count": 4 }} }}"#).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.worker.worker_count, 4);
    }

    #[test]
    fn test_missing_file_error() {
        let result = load_config(Path::new("/nonexistent/config.json"));
        assert!(matches!(result, Err(ConfigError::ReadFile { .. })));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut file = tempfile::NamedTempFile::with_suffix(".json").unwrap();
        write!(file, r#"{{ "worker": {{ "worker_count": 0 }} }}"#).unwrap();

        let result = load_config(file.path());
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
    }
}
