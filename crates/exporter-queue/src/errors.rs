// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use crate::context::ContextError;
use crate::storage::StorageError;

/// Failure to turn a request into bytes or back.
#[derive(Debug, thiserror::Error)]
#[error("codec error: {0}")]
pub struct CodecError(pub String);

/// Invalid queue or sender configuration, detected before the pipeline starts.
#[derive(Debug, thiserror::Error)]
#[error("Invalid configuration: {0}")]
pub struct ConfigError(pub String);

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("sending queue is full")]
    CapacityExceeded,
    #[error("queue is stopped")]
    Stopped,
    #[error("queue {0} is already open on this storage client")]
    NameInUse(String),
    #[error("no async runtime available: {0}")]
    Runtime(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Failure reported by a transport. Opaque to the queue and the concurrency limiter.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("permanent export failure: {0}")]
    Permanent(String),
    #[error("retryable export failure: {0}")]
    Retryable(String),
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

/// Every failure of a fan-out, in completion order.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<SendError>,
}

impl MultiError {
    pub fn push(&mut self, err: SendError) {
        self.errors.push(err);
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[SendError] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<SendError> {
        self.errors
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} requests failed", self.errors.len())?;
        for (i, err) in self.errors.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

/// Error returned by a [`crate::sender::Sender`] stage.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error(transparent)]
    Aggregate(#[from] MultiError),
    #[error("dispatch task failed: {0}")]
    Task(String),
}

impl SendError {
    /// True when the failure only means the caller's context ended.
    pub fn is_canceled(&self) -> bool {
        matches!(self, SendError::Context(_))
    }
}
