use orchestrator::RulesConfig;
use serde::Deserialize;
use std::fs::File;
use std::path::Path;
use tracing_subscriber::EnvFilter;
use upstream::UpstreamConfig;

const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(#[from] ValidationError),
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("port cannot be 0")]
    InvalidPort,
    #[error("invalid log level {0:?}")]
    InvalidLogLevel(String),
    #[error("upstream: {0}")]
    Upstream(#[from] upstream::config::ValidationError),
    #[error("aggregation rules: {0}")]
    Rules(#[from] orchestrator::rules::ValidationError),
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Origin management server
    pub upstream: UpstreamConfig,
    /// Listener for the health, readiness and cache endpoints
    pub admin: Listener,
    /// Rules deriving the aggregation key of each request
    pub aggregation_rules: RulesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Statsd export is disabled when absent
    pub metrics: Option<MetricsConfig>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// `tracing-subscriber` filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,
    pub sentry_dsn: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            sentry_dsn: None,
        }
    }
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let config: Config = serde_yaml::from_reader(file)?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.upstream.validate()?;
        self.aggregation_rules.validate()?;

        if self.admin.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        if let Some(metrics) = &self.metrics {
            if metrics.statsd_port == 0 {
                return Err(ValidationError::InvalidPort);
            }
        }
        if EnvFilter::try_new(&self.logging.level).is_err() {
            return Err(ValidationError::InvalidLogLevel(self.logging.level.clone()));
        }

        Ok(())
    }
}
