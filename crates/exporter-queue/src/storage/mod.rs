// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable key/value contract consumed by the persistent queue.
//!
//! The queue only needs atomic batches of get/set/delete operations over
//! string keys. Several queues may share one client; each scopes its keys with
//! its own name.

mod memory;
mod sled_store;

pub use memory::InMemoryClient;
pub use sled_store::SledClient;

/// Errors emitted by a storage [`Client`].
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Db(#[from] sled::Error),
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Get,
    Set,
    Delete,
}

/// One step of a storage batch. A `Get` has its `value` filled in by the
/// client (`None` when the key is absent).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub kind: OperationKind,
    pub key: String,
    pub value: Option<Vec<u8>>,
}

impl Operation {
    pub fn get(key: impl Into<String>) -> Self {
        Self {
            kind: OperationKind::Get,
            key: key.into(),
            value: None,
        }
    }

    pub fn set(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            kind: OperationKind::Set,
            key: key.into(),
            value: Some(value),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            kind: OperationKind::Delete,
            key: key.into(),
            value: None,
        }
    }

    /// Takes the value read by a `Get`.
    pub fn take_value(&mut self) -> Option<Vec<u8>> {
        self.value.take()
    }
}

/// Injected durable store.
pub trait Client: Send + Sync {
    /// Applies every operation atomically, in order.
    fn batch(&self, ops: &mut [Operation]) -> Result<(), StorageError>;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let mut ops = [Operation::get(key)];
        self.batch(&mut ops)?;
        Ok(ops[0].take_value())
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.batch(&mut [Operation::set(key, value)])
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.batch(&mut [Operation::delete(key)])
    }
}
