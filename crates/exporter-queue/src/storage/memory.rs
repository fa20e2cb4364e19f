// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::{Client, Operation, OperationKind, StorageError};

/// Map-backed client. Clones share the same map, so a queue rebuilt from a
/// clone sees everything a previous queue persisted.
#[derive(Debug, Clone, Default)]
pub struct InMemoryClient {
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    failures: Arc<AtomicUsize>,
    skipped: Arc<AtomicUsize>,
}

impl InMemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` batches fail with [`StorageError::Unavailable`]
    /// without applying any of their operations.
    pub fn fail_next_batches(&self, count: usize) {
        self.fail_batches_after(0, count);
    }

    /// Lets `skip` batches through, then fails the `count` after them.
    pub fn fail_batches_after(&self, skip: usize, count: usize) {
        self.skipped.store(skip, Ordering::SeqCst);
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    fn take_failure(&self) -> bool {
        if self.failures.load(Ordering::SeqCst) == 0 {
            return false;
        }
        let decrement = |left: usize| left.checked_sub(1);
        if self
            .skipped
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, decrement)
            .is_ok()
        {
            return false;
        }
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, decrement)
            .is_ok()
    }
}

impl Client for InMemoryClient {
    fn batch(&self, ops: &mut [Operation]) -> Result<(), StorageError> {
        if self.take_failure() {
            return Err(StorageError::Unavailable("injected failure".to_string()));
        }
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        for op in ops.iter_mut() {
            match op.kind {
                OperationKind::Get => op.value = entries.get(&op.key).cloned(),
                OperationKind::Set => {
                    let value = op.value.clone().unwrap_or_default();
                    entries.insert(op.key.clone(), value);
                }
                OperationKind::Delete => {
                    entries.remove(&op.key);
                }
            }
        }
        Ok(())
    }
}
