//! Client configuration
//!
//! Loaded from a YAML file; environment variables override file values.
//! Transport and credentials are not configured here.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::retry::BackoffConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid value for {name}: {value}")]
    InvalidEnvVar { name: String, value: String },
}

/// Result reading configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadConfig {
    /// Ask for timestamps as int64 microseconds instead of float seconds.
    #[serde(default = "default_true")]
    pub use_int64_timestamp: bool,

    /// Rows per page on the polling path; server default when unset.
    #[serde(default)]
    pub page_size: Option<u32>,

    /// Concurrent read streams; defaults to the session's stream count.
    #[serde(default)]
    pub max_stream_workers: Option<usize>,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            use_int64_timestamp: true,
            page_size: None,
            max_stream_workers: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or module-specific
    pub level: String,

    /// Output format: pretty, json, compact
    pub format: String,

    /// Output destination: stdout, file, both
    pub output: String,

    /// Directory for log files
    pub directory: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            output: "stdout".to_string(),
            directory: "./logs".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub project_id: String,

    #[serde(default)]
    pub location: Option<String>,

    #[serde(default)]
    pub read: ReadConfig,

    /// Backoff between retries of a failed call.
    #[serde(default = "BackoffConfig::retry")]
    pub retry: BackoffConfig,

    /// Backoff between job completion polls.
    #[serde(default = "BackoffConfig::job_poll")]
    pub job_poll: BackoffConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ClientConfig {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            location: None,
            read: ReadConfig::default(),
            retry: BackoffConfig::retry(),
            job_poll: BackoffConfig::job_poll(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from YAML file with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: ClientConfig = serde_yaml::from_str(&contents)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `BQREAD_*` and logging environment overrides.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(project) = std::env::var("BQREAD_PROJECT_ID") {
            self.project_id = project;
        }
        if let Ok(location) = std::env::var("BQREAD_LOCATION") {
            self.location = Some(location);
        }
        if let Some(workers) = parse_env("BQREAD_MAX_STREAM_WORKERS")? {
            self.read.max_stream_workers = Some(workers);
        }
        if let Some(page_size) = parse_env("BQREAD_PAGE_SIZE")? {
            self.read.page_size = Some(page_size);
        }
        if let Some(enabled) = parse_env("BQREAD_USE_INT64_TIMESTAMP")? {
            self.read.use_int64_timestamp = enabled;
        }

        if let Ok(level) = std::env::var("RUST_LOG") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Ok(output) = std::env::var("LOG_OUTPUT") {
            self.logging.output = output;
        }
        if let Ok(dir) = std::env::var("LOG_DIR") {
            self.logging.directory = dir;
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnvVar {
                name: name.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // env overrides are process-wide
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_default_config() {
        let config = ClientConfig::new("my-project");
        assert_eq!(config.project_id, "my-project");
        assert!(config.read.use_int64_timestamp);
        assert!(config.read.max_stream_workers.is_none());
        assert_eq!(config.retry.initial_ms, 1_000);
        assert_eq!(config.job_poll.initial_ms, 50);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let config: ClientConfig = serde_yaml::from_str("project_id: p\n").unwrap();
        assert_eq!(config.project_id, "p");
        assert!(config.read.use_int64_timestamp);
        assert_eq!(config.retry, BackoffConfig::retry());
        assert_eq!(config.job_poll, BackoffConfig::job_poll());
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_env_var_override() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("BQREAD_MAX_STREAM_WORKERS", "4");
        std::env::set_var("BQREAD_LOCATION", "EU");

        let config_yaml = r#"
project_id: "from-file"
location: "US"
read:
  use_int64_timestamp: false
  page_size: 500
retry:
  initial_ms: 100
  multiplier: 2.0
  max_ms: 1000
"#;
        let temp_file = std::env::temp_dir().join("bqread_test_config.yaml");
        std::fs::write(&temp_file, config_yaml).unwrap();

        let config = ClientConfig::load(&temp_file).unwrap();
        assert_eq!(config.project_id, "from-file");
        assert_eq!(config.location.as_deref(), Some("EU")); // Overridden
        assert_eq!(config.read.max_stream_workers, Some(4)); // Overridden
        assert_eq!(config.read.page_size, Some(500));
        assert!(!config.read.use_int64_timestamp);
        assert_eq!(config.retry.max_ms, 1000);
        assert!(!config.retry.jitter);

        std::env::remove_var("BQREAD_MAX_STREAM_WORKERS");
        std::env::remove_var("BQREAD_LOCATION");
        std::fs::remove_file(temp_file).ok();
    }

    #[test]
    fn test_invalid_env_value() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("BQREAD_PAGE_SIZE", "lots");
        let mut config = ClientConfig::new("p");
        let err = config.apply_env().unwrap_err();
        std::env::remove_var("BQREAD_PAGE_SIZE");

        assert!(matches!(err, ConfigError::InvalidEnvVar { ref name, .. } if name == "BQREAD_PAGE_SIZE"));
    }
}
