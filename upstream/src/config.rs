use serde::Deserialize;
use std::time::Duration;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("upstream address cannot be empty")]
    EmptyAddress,

    #[error("upstream request timeout cannot be 0")]
    InvalidTimeout,
}

/// Origin server configuration.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct UpstreamConfig {
    /// `host:port` or a full URI of the management server
    pub address: String,
    /// Bounds stream establishment and every request sent on a stream
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

impl UpstreamConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.address.trim().is_empty() {
            return Err(ValidationError::EmptyAddress);
        }
        if self.request_timeout_secs == 0 {
            return Err(ValidationError::InvalidTimeout);
        }
        Ok(())
    }

    pub fn call_options(&self) -> CallOptions {
        CallOptions {
            timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }
}

/// Per-call settings applied to every stream opened by an `UpstreamClient`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CallOptions {
    pub timeout: Duration,
}

impl Default for CallOptions {
    fn default() -> Self {
        CallOptions {
            timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let config: UpstreamConfig = serde_yaml::from_str(
            r#"
address: 127.0.0.1:18000
request_timeout_secs: 5
"#,
        )
        .unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.call_options().timeout, Duration::from_secs(5));

        let config: UpstreamConfig = serde_yaml::from_str("address: xds.internal:443").unwrap();
        assert_eq!(config.request_timeout_secs, DEFAULT_REQUEST_TIMEOUT_SECS);
    }

    #[test]
    fn test_validation_errors() {
        let config = UpstreamConfig {
            address: " ".into(),
            request_timeout_secs: 1,
        };
        assert_eq!(config.validate(), Err(ValidationError::EmptyAddress));

        let config = UpstreamConfig {
            address: "127.0.0.1:18000".into(),
            request_timeout_secs: 0,
        };
        assert_eq!(config.validate(), Err(ValidationError::InvalidTimeout));
    }
}
