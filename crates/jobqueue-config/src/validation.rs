//! Configuration validation module.
//!
//! Collects every problem in a configuration at once so a bad deployment
//! fails on load with the full list instead of one error per restart.

use crate::{AppConfig, DatabaseConfig, DemoConfig, LoggingConfig};
use jobqueue_core::ManagerConfig;
use std::fmt;
use url::Url;

/// Configuration validation error variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValidationError {
    /// Manager settings the job manager refuses to run with.
    InvalidManager { message: String },
    /// Pool size configuration is invalid (min must be <= max).
    InvalidPoolSize { min: u32, max: u32 },
    /// Pool size exceeds maximum allowed.
    PoolSizeTooLarge { value: u32, maximum: u32 },
    /// URL format is invalid.
    InvalidUrl { url_type: String, message: String },
    /// Timeout or interval must be positive.
    NonPositiveTimeout { name: String, value: u64 },
    /// A count that must be at least one is zero.
    ZeroCount { name: String },
    /// Topic list is empty or contains a blank topic.
    InvalidTopics { message: String },
    /// Failure rate must be between 0.0 and 1.0.
    InvalidFailureRate { value: f64 },
    /// Log level is invalid.
    InvalidLogLevel { value: String },
}

impl fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidManager { message } => write!(f, "Invalid manager settings: {message}"),
            Self::InvalidPoolSize { min, max } => {
                write!(
                    f,
                    "Invalid pool size: min ({min}) cannot be greater than max ({max})"
                )
            }
            Self::PoolSizeTooLarge { value, maximum } => {
                write!(f, "Pool size {value} exceeds maximum allowed ({maximum})")
            }
            Self::InvalidUrl { url_type, message } => {
                write!(f, "Invalid {url_type} URL: {message}")
            }
            Self::NonPositiveTimeout { name, value } => {
                write!(f, "Timeout '{name}' must be positive, got {value}")
            }
            Self::ZeroCount { name } => write!(f, "'{name}' must be at least 1"),
            Self::InvalidTopics { message } => write!(f, "Invalid demo topics: {message}"),
            Self::InvalidFailureRate { value } => {
                write!(
                    f,
                    "Invalid failure rate: {value} (must be between 0.0 and 1.0)"
                )
            }
            Self::InvalidLogLevel { value } => {
                write!(
                    f,
                    "Invalid log level: '{value}' (valid: off, trace, debug, info, warn, error)"
                )
            }
        }
    }
}

impl std::error::Error for ConfigValidationError {}

/// Result of configuration validation containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    errors: Vec<ConfigValidationError>,
}

impl ValidationResult {
    fn add_error(&mut self, error: ConfigValidationError) {
        self.errors.push(error);
    }

    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the validation errors.
    pub fn errors(&self) -> &[ConfigValidationError] {
        &self.errors
    }

    /// Converts to Result, returning Err with all errors if any exist.
    pub fn into_result(self) -> Result<(), Vec<ConfigValidationError>> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self.errors)
        }
    }
}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Maximum connection pool size.
    const MAX_POOL_SIZE: u32 = 1000;
    /// Valid log levels.
    const VALID_LOG_LEVELS: &'static [&'static str] =
        &["off", "trace", "debug", "info", "warn", "error"];

    /// Validates the entire application configuration.
    ///
    /// Returns Ok(()) if valid, or Err with all validation errors found.
    /// Database settings are only checked when the configured store needs
    /// them.
    pub fn validate(config: &AppConfig) -> Result<(), Vec<ConfigValidationError>> {
        let mut result = ValidationResult::default();

        Self::validate_manager(&config.manager, &mut result);
        if config.store.kind.is_persistent() {
            Self::validate_database(&config.store.database, &mut result);
        }
        Self::validate_demo(&config.demo, &mut result);
        Self::validate_logging(&config.logging, &mut result);

        result.into_result()
    }

    fn validate_manager(config: &ManagerConfig, result: &mut ValidationResult) {
        if let Err(e) = config.validate() {
            result.add_error(ConfigValidationError::InvalidManager {
                message: e.to_string(),
            });
        }
    }

    /// Validates database configuration.
    fn validate_database(config: &DatabaseConfig, result: &mut ValidationResult) {
        if config.url.is_empty() {
            result.add_error(ConfigValidationError::InvalidUrl {
                url_type: "database".to_string(),
                message: "URL cannot be empty".to_string(),
            });
        } else if !config.url.starts_with("mysql://") {
            result.add_error(ConfigValidationError::InvalidUrl {
                url_type: "database".to_string(),
                message: "URL must start with mysql://".to_string(),
            });
        } else if let Err(e) = Url::parse(&config.url) {
            result.add_error(ConfigValidationError::InvalidUrl {
                url_type: "database".to_string(),
                message: e.to_string(),
            });
        }

        if config.min_connections > config.max_connections {
            result.add_error(ConfigValidationError::InvalidPoolSize {
                min: config.min_connections,
                max: config.max_connections,
            });
        }
        if config.max_connections > Self::MAX_POOL_SIZE {
            result.add_error(ConfigValidationError::PoolSizeTooLarge {
                value: config.max_connections,
                maximum: Self::MAX_POOL_SIZE,
            });
        }

        if config.connect_timeout_secs == 0 {
            result.add_error(ConfigValidationError::NonPositiveTimeout {
                name: "store.database.connect_timeout_secs".to_string(),
                value: 0,
            });
        }
        if config.idle_timeout_secs == 0 {
            result.add_error(ConfigValidationError::NonPositiveTimeout {
                name: "store.database.idle_timeout_secs".to_string(),
                value: 0,
            });
        }
    }

    /// Validates demo driver configuration.
    fn validate_demo(config: &DemoConfig, result: &mut ValidationResult) {
        if config.ranks == 0 {
            result.add_error(ConfigValidationError::ZeroCount {
                name: "demo.ranks".to_string(),
            });
        }
        if config.concurrency == 0 {
            result.add_error(ConfigValidationError::ZeroCount {
                name: "demo.concurrency".to_string(),
            });
        }
        if config.log_interval_ms == 0 {
            result.add_error(ConfigValidationError::NonPositiveTimeout {
                name: "demo.log_interval_ms".to_string(),
                value: 0,
            });
        }

        if config.topics.is_empty() {
            result.add_error(ConfigValidationError::InvalidTopics {
                message: "at least one topic is required".to_string(),
            });
        } else if config.topics.iter().any(|t| t.trim().is_empty()) {
            result.add_error(ConfigValidationError::InvalidTopics {
                message: "topics cannot be blank".to_string(),
            });
        }

        if !(0.0..=1.0).contains(&config.failure_rate) {
            result.add_error(ConfigValidationError::InvalidFailureRate {
                value: config.failure_rate,
            });
        }
    }

    /// Validates the log filter. Each comma separated directive is either a
    /// bare level or `target=level`.
    fn validate_logging(config: &LoggingConfig, result: &mut ValidationResult) {
        let valid = config.level.split(',').all(|directive| {
            let level = directive
                .rsplit_once('=')
                .map_or(directive, |(_, level)| level)
                .trim()
                .to_lowercase();
            Self::VALID_LOG_LEVELS.contains(&level.as_str())
        });
        if !valid {
            result.add_error(ConfigValidationError::InvalidLogLevel {
                value: config.level.clone(),
            });
        }
    }
}

/// Formats validation errors for display.
pub fn format_validation_errors(errors: &[ConfigValidationError]) -> String {
    let mut output = String::from("Configuration validation failed:\n");
    for (i, error) in errors.iter().enumerate() {
        output.push_str(&format!("  {}. {}\n", i + 1, error));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreKind;

    fn mysql_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.store.kind = StoreKind::Mysql;
        config
    }

    #[test]
    fn test_default_config_passes() {
        assert!(ConfigValidator::validate(&AppConfig::default()).is_ok());
        assert!(ConfigValidator::validate(&mysql_config()).is_ok());
    }

    #[test]
    fn test_zero_rank_concurrency() {
        let mut config = AppConfig::default();
        config.manager.rank_concurrency.insert(2, 0);

        let errors = ConfigValidator::validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| matches!(
            e,
            ConfigValidationError::InvalidManager { message } if message.contains("rank 2")
        )));
    }

    #[test]
    fn test_database_ignored_for_memory_store() {
        let mut config = AppConfig::default();
        config.store.database.url = "not a url".to_string();
        assert!(ConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn test_invalid_database_url() {
        let mut config = mysql_config();
        config.store.database.url = "postgres://localhost/jobs".to_string();

        let errors = ConfigValidator::validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| matches!(
            e,
            ConfigValidationError::InvalidUrl { url_type, .. } if url_type == "database"
        )));
    }

    #[test]
    fn test_invalid_pool_size() {
        let mut config = mysql_config();
        config.store.database.min_connections = 100;
        config.store.database.max_connections = 10;

        let errors = ConfigValidator::validate(&config).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ConfigValidationError::InvalidPoolSize { .. })));
    }

    #[test]
    fn test_pool_size_too_large() {
        let mut config = mysql_config();
        config.store.database.max_connections = 2000;

        let errors = ConfigValidator::validate(&config).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ConfigValidationError::PoolSizeTooLarge { .. })));
    }

    #[test]
    fn test_demo_errors_are_collected() {
        let mut config = AppConfig::default();
        config.demo.ranks = 0;
        config.demo.topics = vec!["a".to_string(), " ".to_string()];
        config.demo.failure_rate = 1.5;

        let errors = ConfigValidator::validate(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.contains(&ConfigValidationError::ZeroCount {
            name: "demo.ranks".to_string()
        }));
        assert!(errors.contains(&ConfigValidationError::InvalidFailureRate { value: 1.5 }));
    }

    #[test]
    fn test_log_level_directives() {
        let mut config = AppConfig::default();
        config.logging.level = "warn,jobqueue_core=trace".to_string();
        assert!(ConfigValidator::validate(&config).is_ok());

        config.logging.level = "info,jobqueue=loud".to_string();
        let errors = ConfigValidator::validate(&config).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ConfigValidationError::InvalidLogLevel { .. })));
    }

    #[test]
    fn test_format_validation_errors() {
        let errors = vec![
            ConfigValidationError::ZeroCount {
                name: "demo.concurrency".to_string(),
            },
            ConfigValidationError::InvalidFailureRate { value: -0.1 },
        ];
        let output = format_validation_errors(&errors);
        assert!(output.contains("1. 'demo.concurrency' must be at least 1"));
        assert!(output.contains("2. Invalid failure rate"));
    }
}
