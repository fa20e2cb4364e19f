// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use exporter_queue::{ConcurrencyConfig, QueueConfig};

use crate::error::RelayError;
use crate::payload::Signal;

pub const ENV_LISTEN_ADDR: &str = "RELAY_LISTEN_ADDR";
pub const ENV_ENDPOINT: &str = "RELAY_ENDPOINT";
pub const ENV_STORAGE_PATH: &str = "RELAY_STORAGE_PATH";
pub const ENV_STORAGE_SYNC: &str = "RELAY_STORAGE_SYNC";
pub const ENV_QUEUE_NAME: &str = "RELAY_QUEUE_NAME";
pub const ENV_QUEUE_CAPACITY: &str = "RELAY_QUEUE_CAPACITY";
pub const ENV_NUM_CONSUMERS: &str = "RELAY_NUM_CONSUMERS";
pub const ENV_MAX_CONCURRENT: &str = "RELAY_MAX_CONCURRENT";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "RELAY_REQUEST_TIMEOUT_MS";
pub const ENV_SHUTDOWN_TIMEOUT_MS: &str = "RELAY_SHUTDOWN_TIMEOUT_MS";
pub const ENV_LOG_LEVEL: &str = "RELAY_LOG_LEVEL";

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:4320";
const DEFAULT_ENDPOINT: &str = "http://localhost:4318";
const DEFAULT_QUEUE_NAME: &str = "relay";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    pub listen_addr: String,
    /// Collector base URL; payloads go to `<endpoint>/v1/<signal>`.
    pub endpoint: String,
    /// Sled database directory. `None` keeps the queue in a temporary
    /// database that does not survive restarts.
    pub storage_path: Option<PathBuf>,
    pub storage_sync: bool,
    pub queue_name: String,
    pub queue_capacity: u64,
    pub num_consumers: usize,
    pub max_concurrent: usize,
    pub request_timeout: Duration,
    /// Time given to in-flight exports to finish on shutdown.
    pub shutdown_timeout: Duration,
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let queue = QueueConfig::default();
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            storage_path: None,
            storage_sync: false,
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            queue_capacity: queue.capacity,
            num_consumers: queue.num_consumers,
            max_concurrent: ConcurrencyConfig::default().max_concurrent,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        Self::from_env_iter(env::vars())
    }

    /// Builds the configuration from key/value pairs. Unset, blank or
    /// unparsable values fall back to the defaults.
    pub fn from_env_iter<I, K, V>(iter: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: HashMap<String, String> = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let value = |key: &str| map.get(key).and_then(|v| sanitize_non_empty(v));
        let defaults = Self::default();

        Self {
            listen_addr: value(ENV_LISTEN_ADDR).unwrap_or(defaults.listen_addr),
            endpoint: value(ENV_ENDPOINT)
                .map(|e| e.trim_end_matches('/').to_string())
                .unwrap_or(defaults.endpoint),
            storage_path: value(ENV_STORAGE_PATH).map(PathBuf::from),
            storage_sync: parse_bool(
                map.get(ENV_STORAGE_SYNC).map(String::as_str),
                defaults.storage_sync,
            ),
            queue_name: value(ENV_QUEUE_NAME).unwrap_or(defaults.queue_name),
            queue_capacity: parse_number(value(ENV_QUEUE_CAPACITY)).unwrap_or(defaults.queue_capacity),
            num_consumers: parse_number(value(ENV_NUM_CONSUMERS)).unwrap_or(defaults.num_consumers),
            max_concurrent: parse_number(value(ENV_MAX_CONCURRENT)).unwrap_or(defaults.max_concurrent),
            request_timeout: parse_number(value(ENV_REQUEST_TIMEOUT_MS))
                .map(Duration::from_millis)
                .unwrap_or(defaults.request_timeout),
            shutdown_timeout: parse_number(value(ENV_SHUTDOWN_TIMEOUT_MS))
                .map(Duration::from_millis)
                .unwrap_or(defaults.shutdown_timeout),
            log_level: value(ENV_LOG_LEVEL)
                .map(|level| level.to_lowercase())
                .unwrap_or(defaults.log_level),
        }
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            return Err(RelayError::InvalidConfig(format!(
                "endpoint '{}' must start with http:// or https://",
                self.endpoint
            )));
        }
        if self.request_timeout.is_zero() {
            return Err(RelayError::InvalidConfig(
                "request timeout must be greater than 0".to_string(),
            ));
        }
        for signal in Signal::ALL {
            self.queue_config(signal)
                .validate()
                .map_err(|err| RelayError::InvalidConfig(err.0))?;
        }
        self.concurrency_config()
            .validate()
            .map_err(|err| RelayError::InvalidConfig(err.0))
    }

    /// Each signal gets its own queue so a stalled signal cannot starve the
    /// others.
    pub fn queue_config(&self, signal: Signal) -> QueueConfig {
        QueueConfig {
            name: format!("{}-{}", self.queue_name, signal.path()),
            capacity: self.queue_capacity,
            num_consumers: self.num_consumers,
        }
    }

    pub fn concurrency_config(&self) -> ConcurrencyConfig {
        ConcurrencyConfig {
            max_concurrent: self.max_concurrent,
        }
    }
}

fn sanitize_non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_bool(value: Option<&str>, default: bool) -> bool {
    match value.map(|s| s.trim().to_ascii_lowercase()) {
        Some(ref v) if ["1", "true", "t", "yes", "y"].contains(&v.as_str()) => true,
        Some(ref v) if ["0", "false", "f", "no", "n"].contains(&v.as_str()) => false,
        _ => default,
    }
}

fn parse_number<T: std::str::FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|v| v.parse().ok())
}
