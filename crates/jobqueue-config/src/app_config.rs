//! Application configuration structures.

use jobqueue_core::ManagerConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application name and environment.
    #[serde(default)]
    pub app: AppMetadata,

    /// Job manager configuration.
    #[serde(default)]
    pub manager: ManagerConfig,

    /// Store selection and connection settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Demo driver settings.
    #[serde(default)]
    pub demo: DemoConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Application metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppMetadata {
    /// Application name.
    pub name: String,
    /// Environment (development, test, production).
    pub environment: String,
}

impl Default for AppMetadata {
    fn default() -> Self {
        Self {
            name: "jobqueue".to_string(),
            environment: "development".to_string(),
        }
    }
}

/// Storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Process-local store, lost on restart.
    #[default]
    Memory,
    /// MySQL 8 database.
    Mysql,
}

impl StoreKind {
    /// Returns true if the backend needs a database connection.
    #[must_use]
    pub const fn is_persistent(&self) -> bool {
        matches!(self, Self::Mysql)
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Mysql => write!(f, "mysql"),
        }
    }
}

impl FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "mysql" => Ok(Self::Mysql),
            other => Err(format!("unsupported store kind: {other} (use memory or mysql)")),
        }
    }
}

/// Store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend to use.
    #[serde(default)]
    pub kind: StoreKind,

    /// Connection settings, used by persistent backends.
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database URL.
    pub url: String,
    /// Minimum connections in pool.
    pub min_connections: u32,
    /// Maximum connections in pool.
    pub max_connections: u32,
    /// Connection timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Idle timeout in seconds.
    pub idle_timeout_secs: u64,
    /// Run migrations on connect.
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "mysql://root@localhost:3306/jobqueue".to_string(),
            min_connections: 1,
            max_connections: 10,
            connect_timeout_secs: 30,
            idle_timeout_secs: 600,
            run_migrations: true,
        }
    }
}

impl DatabaseConfig {
    /// Returns the connection timeout as a Duration.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Returns the idle timeout as a Duration.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Demo driver configuration.
///
/// The driver enqueues random jobs and logs stats until interrupted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Number of ranks; jobs get a random rank in `0..ranks`.
    pub ranks: u32,
    /// Concurrency of every demo rank.
    pub concurrency: usize,
    /// Upper bound of the random pause between two added jobs, in
    /// milliseconds.
    pub fill_time_ms: u64,
    /// Upper bound of a single job's random run time, in milliseconds.
    pub run_time_ms: u64,
    /// Interval between stats lines, in milliseconds.
    pub log_interval_ms: u64,
    /// Retry budget of every added job.
    pub max_retry: u32,
    /// Topics to register and enqueue.
    pub topics: Vec<String>,
    /// Probability in `[0.0, 1.0]` that an attempt fails.
    pub failure_rate: f64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            ranks: 1,
            concurrency: 2,
            fill_time_ms: 5_000,
            run_time_ms: 7_000,
            log_interval_ms: 1_000,
            max_retry: 2,
            topics: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            failure_rate: 0.05,
        }
    }
}

impl DemoConfig {
    /// Returns the fill time as a Duration.
    #[must_use]
    pub const fn fill_time(&self) -> Duration {
        Duration::from_millis(self.fill_time_ms)
    }

    /// Returns the run time as a Duration.
    #[must_use]
    pub const fn run_time(&self) -> Duration {
        Duration::from_millis(self.run_time_ms)
    }

    /// Returns the log interval as a Duration.
    #[must_use]
    pub const fn log_interval(&self) -> Duration {
        Duration::from_millis(self.log_interval_ms)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log filter used when `RUST_LOG` is not set.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info,jobqueue=debug".to_string(),
            json: false,
        }
    }
}
