// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::ConfigError;

const DEFAULT_QUEUE_NAME: &str = "default";
const DEFAULT_QUEUE_CAPACITY: u64 = 1000;
const DEFAULT_NUM_CONSUMERS: usize = 10;
const DEFAULT_MAX_CONCURRENT: usize = 10;

/// Settings of one persistent queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Prefixes every storage key of the queue. Two queues open at the same
    /// time on one storage client must not share a name;
    /// [`crate::PersistentQueue::new`] refuses the second one.
    pub name: String,
    /// Maximum number of persisted-but-unread requests.
    pub capacity: u64,
    /// Number of consumer tasks draining the queue.
    pub num_consumers: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_QUEUE_NAME.to_string(),
            capacity: DEFAULT_QUEUE_CAPACITY,
            num_consumers: DEFAULT_NUM_CONSUMERS,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError("queue name cannot be empty".to_string()));
        }
        if self.name.contains('/') {
            return Err(ConfigError(format!(
                "queue name '{}' cannot contain '/'",
                self.name
            )));
        }
        if self.capacity == 0 {
            return Err(ConfigError(
                "queue capacity must be greater than 0".to_string(),
            ));
        }
        if self.num_consumers == 0 {
            return Err(ConfigError(
                "number of consumers must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Settings of the bounded-concurrency sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyConfig {
    /// Number of permits, i.e. the most requests forwarded at the same time.
    pub max_concurrent: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }
}

impl ConcurrencyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError(
                "max concurrent requests must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
