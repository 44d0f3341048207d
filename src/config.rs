//! Agent configuration loaded from TOML
//!
//! # Example calltrack.toml
//!
//! ```toml
//! service_name = "checkout"
//! environment = "staging"
//! breakdown_metrics = true
//! transaction_max_spans = 200
//! server_timeout_ms = 10000
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_SERVICE_NAME: &str = "unknown-service";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Agent options relevant to call tracking and event sending
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub service_name: String,
    pub service_version: Option<String>,
    pub environment: Option<String>,

    /// Track self time and emit breakdown metric sets
    pub breakdown_metrics: bool,

    /// Spans started beyond this count per transaction are dropped
    pub transaction_max_spans: u32,

    pub server_timeout_ms: u64,

    /// Development option: discard every batch before it reaches the transport
    pub drop_events_before_send: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            service_version: None,
            environment: None,
            breakdown_metrics: true,
            transaction_max_spans: 500,
            server_timeout_ms: 30_000,
            drop_events_before_send: false,
        }
    }
}

impl AgentConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "service_name must not be empty".to_string(),
            ));
        }
        if self.server_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "server_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn server_timeout(&self) -> Duration {
        Duration::from_millis(self.server_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.service_name, "unknown-service");
        assert!(config.breakdown_metrics);
        assert_eq!(config.transaction_max_spans, 500);
        assert_eq!(config.server_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AgentConfig::from_toml_str(
            r#"
            service_name = "checkout"
            breakdown_metrics = false
            "#,
        )
        .unwrap();
        assert_eq!(config.service_name, "checkout");
        assert!(!config.breakdown_metrics);
        assert_eq!(config.server_timeout_ms, 30_000);
    }

    #[test]
    fn test_empty_service_name_rejected() {
        let err = AgentConfig::from_toml_str(r#"service_name = "  ""#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = AgentConfig::from_toml_str("server_timeout_ms = 0").unwrap_err();
        assert!(err.to_string().contains("server_timeout_ms"));
    }

    #[test]
    fn test_unknown_key_is_parse_error() {
        let err = AgentConfig::from_toml_str("sample_rate = 0.5").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "environment = \"staging\"").unwrap();
        let config = AgentConfig::from_file(file.path()).unwrap();
        assert_eq!(config.environment.as_deref(), Some("staging"));

        let err = AgentConfig::from_file("/nonexistent/calltrack.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
