// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shipper configuration.
//!
//! Sources, later ones overriding earlier ones:
//!
//! 1. defaults
//! 2. `logs-shipper.yaml` in the configuration directory, if present
//! 3. `LOGS_SHIPPER_*` environment variables

pub mod log_level;

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::log_level::LogLevel;
use crate::constants::{
    DEFAULT_DEQUEUE_WAIT, DEFAULT_MAX_POLLING_INTERVAL, DEFAULT_MAX_TRANSPORT_RETRIES,
    DEFAULT_POLLING_INTERVAL, DEFAULT_QUEUE_CAPACITY, DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_STOP_POLICY_THRESHOLD, DEFAULT_STREAMING_INTERVAL,
};
use crate::publisher::PublisherConfig;
use crate::queue::{QueueConfig, QueueDestination};

pub const CONFIG_FILE_NAME: &str = "logs-shipper.yaml";
pub const ENV_PREFIX: &str = "LOGS_SHIPPER_";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Parse(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: LogLevel,
    /// Remote API endpoint; derived from `region` when unset.
    pub endpoint: Option<String>,
    pub region: String,
    pub log_group: String,
    /// Host identity, used as the primary stream name.
    pub instance_id: String,
    pub sharing_enabled: bool,
    /// `key::secret::group::stream`
    pub sharing_destination: String,
    pub queue_capacity: usize,
    pub polling_interval_ms: u64,
    pub dequeue_wait_ms: u64,
    pub max_polling_interval_ms: u64,
    pub request_timeout_secs: u64,
    pub max_transport_retries: u32,
    pub stop_policy_threshold: usize,
    pub streaming_interval_ms: u64,
    /// File streamed to `<instance_id>-file` next to the queue.
    pub stream_file: Option<PathBuf>,
    pub strip_control_characters: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            endpoint: None,
            region: "us-east-1".to_string(),
            log_group: String::new(),
            instance_id: String::new(),
            sharing_enabled: false,
            sharing_destination: String::new(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            polling_interval_ms: millis(DEFAULT_POLLING_INTERVAL),
            dequeue_wait_ms: millis(DEFAULT_DEQUEUE_WAIT),
            max_polling_interval_ms: millis(DEFAULT_MAX_POLLING_INTERVAL),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT.as_secs(),
            max_transport_retries: DEFAULT_MAX_TRANSPORT_RETRIES,
            stop_policy_threshold: DEFAULT_STOP_POLICY_THRESHOLD,
            streaming_interval_ms: millis(DEFAULT_STREAMING_INTERVAL),
            stream_file: None,
            strip_control_characters: true,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.polling_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "polling_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_polling_interval_ms < self.polling_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "max_polling_interval_ms ({}) is below polling_interval_ms ({})",
                self.max_polling_interval_ms, self.polling_interval_ms
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn endpoint(&self) -> String {
        match self.endpoint.as_deref().map(str::trim) {
            Some(endpoint) if !endpoint.is_empty() => {
                if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
                    endpoint.to_string()
                } else {
                    format!("https://{endpoint}")
                }
            }
            _ => format!("https://logs.{}.amazonaws.com", self.region),
        }
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub fn streaming_interval(&self) -> Duration {
        Duration::from_millis(self.streaming_interval_ms)
    }

    #[must_use]
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            capacity: self.queue_capacity,
            destination: QueueDestination {
                log_group: self.log_group.clone(),
                sharing_enabled: self.sharing_enabled,
                sharing_destination: self.sharing_destination.clone(),
            },
        }
    }

    #[must_use]
    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            instance_id: self.instance_id.clone(),
            polling_interval: Duration::from_millis(self.polling_interval_ms),
            dequeue_wait: Duration::from_millis(self.dequeue_wait_ms),
            max_polling_interval: Duration::from_millis(self.max_polling_interval_ms),
            stop_policy_threshold: self.stop_policy_threshold,
        }
    }
}

/// Loads and validates the configuration found in `config_directory` and
/// the environment.
pub fn get_config(config_directory: &Path) -> Result<Config, ConfigError> {
    let config: Config = Figment::from(Serialized::defaults(Config::default()))
        .merge(Yaml::file(config_directory.join(CONFIG_FILE_NAME)))
        .merge(Env::prefixed(ENV_PREFIX))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_sources() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            let config = get_config(Path::new("")).unwrap();
            assert_eq!(config, Config::default());
            assert_eq!(config.queue_capacity, 10_000);
            assert_eq!(config.polling_interval_ms, 1_000);
            assert_eq!(config.dequeue_wait_ms, 200);
            assert_eq!(config.max_polling_interval_ms, 30_000);
            assert_eq!(config.log_level, LogLevel::Warn);
            Ok(())
        });
    }

    #[test]
    fn yaml_file_overrides_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file(
                CONFIG_FILE_NAME,
                r#"
log_level: "debug"
log_group: "my-group"
instance_id: "i-0abc"
sharing_enabled: true
sharing_destination: "KeyID::Key::Group::Stream"
queue_capacity: 500
polling_interval_ms: 250
"#,
            )?;
            let config = get_config(Path::new("")).unwrap();
            assert_eq!(config.log_level, LogLevel::Debug);
            assert_eq!(config.log_group, "my-group");
            assert_eq!(config.instance_id, "i-0abc");
            assert!(config.sharing_enabled);
            assert_eq!(config.queue_capacity, 500);
            assert_eq!(config.polling_interval_ms, 250);
            assert_eq!(config.dequeue_wait_ms, 200);
            Ok(())
        });
    }

    #[test]
    fn env_overrides_yaml() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file(CONFIG_FILE_NAME, "log_group: from-yaml\nqueue_capacity: 5\n")?;
            jail.set_env("LOGS_SHIPPER_LOG_GROUP", "from-env");
            jail.set_env("LOGS_SHIPPER_LOG_LEVEL", "INFO");
            jail.set_env("LOGS_SHIPPER_STREAM_FILE", "/var/log/session.log");
            let config = get_config(Path::new("")).unwrap();
            assert_eq!(config.log_group, "from-env");
            assert_eq!(config.queue_capacity, 5);
            assert_eq!(config.log_level, LogLevel::Info);
            assert_eq!(
                config.stream_file,
                Some(PathBuf::from("/var/log/session.log"))
            );
            Ok(())
        });
    }

    #[test]
    fn invalid_values_are_rejected() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env("LOGS_SHIPPER_QUEUE_CAPACITY", "0");
            assert!(matches!(
                get_config(Path::new("")),
                Err(ConfigError::Invalid(_))
            ));
            Ok(())
        });
    }

    #[test]
    fn unparsable_values_are_parse_errors() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env("LOGS_SHIPPER_QUEUE_CAPACITY", "lots");
            assert!(matches!(
                get_config(Path::new("")),
                Err(ConfigError::Parse(_))
            ));
            Ok(())
        });
    }

    #[test]
    fn validate_checks_intervals() {
        let config = Config {
            polling_interval_ms: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            polling_interval_ms: 5_000,
            max_polling_interval_ms: 1_000,
            ..Config::default()
        };
        assert!(config.validate().is_err());
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn endpoint_is_derived_from_region() {
        let config = Config {
            region: "eu-west-1".to_string(),
            ..Config::default()
        };
        assert_eq!(config.endpoint(), "https://logs.eu-west-1.amazonaws.com");

        let config = Config {
            endpoint: Some("localhost:4566".to_string()),
            ..Config::default()
        };
        assert_eq!(config.endpoint(), "https://localhost:4566");

        let config = Config {
            endpoint: Some("http://127.0.0.1:9000".to_string()),
            ..Config::default()
        };
        assert_eq!(config.endpoint(), "http://127.0.0.1:9000");
    }

    #[test]
    fn derived_queue_and_publisher_settings() {
        let config = Config {
            log_group: "g".to_string(),
            instance_id: "i-1".to_string(),
            sharing_enabled: true,
            sharing_destination: "a::b::c::d".to_string(),
            queue_capacity: 42,
            ..Config::default()
        };
        let queue = config.queue_config();
        assert_eq!(queue.capacity, 42);
        assert_eq!(queue.destination.log_group, "g");
        assert!(queue.destination.sharing_enabled);

        let publisher = config.publisher_config();
        assert_eq!(publisher.instance_id, "i-1");
        assert_eq!(publisher.polling_interval, Duration::from_secs(1));
        assert_eq!(publisher.max_polling_interval, Duration::from_secs(30));
    }
}
