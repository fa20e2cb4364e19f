// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sled-backed storage client.

use std::fs;
use std::path::{Path, PathBuf};

use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use sled::{Config as SledConfig, Db, Tree};
use tracing::debug;

use super::{Client, Operation, OperationKind, StorageError};

/// Tree holding every queue record. Queue names keep their keys apart.
const QUEUE_TREE: &str = "exporter_queue";

/// A [`Client`] persisting to an embedded sled database.
///
/// Each batch runs as a single sled transaction over the queue tree, so the
/// reads and writes of one batch are applied atomically.
#[derive(Debug, Clone)]
pub struct SledClient {
    db: Db,
    tree: Tree,
    path: PathBuf,
    sync_on_write: bool,
}

impl SledClient {
    /// Opens (or creates) the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                // sled does not create intermediate directories automatically.
                fs::create_dir_all(parent)?;
            }
        }
        let db = sled_config(&path).open()?;
        debug!("Opened queue storage at {}", path.display());
        Self::from_db(db, path)
    }

    /// Opens a temporary database that is discarded when the last handle drops.
    pub fn open_ephemeral() -> Result<Self, StorageError> {
        let db = SledConfig::new().temporary(true).open()?;
        Self::from_db(db, PathBuf::new())
    }

    fn from_db(db: Db, path: PathBuf) -> Result<Self, StorageError> {
        let tree = db.open_tree(QUEUE_TREE)?;
        Ok(Self {
            db,
            tree,
            path,
            sync_on_write: false,
        })
    }

    /// When enabled, every batch containing a write is flushed to disk before
    /// returning. Otherwise sled flushes on its own schedule.
    pub fn sync_on_write(mut self, enabled: bool) -> Self {
        self.sync_on_write = enabled;
        self
    }

    /// Empty for ephemeral databases.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

impl Client for SledClient {
    fn batch(&self, ops: &mut [Operation]) -> Result<(), StorageError> {
        let plan: &[Operation] = ops;
        let result = self.tree.transaction(|tx: &TransactionalTree| {
            let mut values = Vec::with_capacity(plan.len());
            for op in plan {
                match op.kind {
                    OperationKind::Get => {
                        values.push(tx.get(op.key.as_bytes())?.map(|v| v.to_vec()));
                    }
                    OperationKind::Set => {
                        let value: &[u8] = op.value.as_deref().unwrap_or_default();
                        tx.insert(op.key.as_bytes(), value)?;
                        values.push(None);
                    }
                    OperationKind::Delete => {
                        tx.remove(op.key.as_bytes())?;
                        values.push(None);
                    }
                }
            }
            Ok::<_, ConflictableTransactionError<()>>(values)
        });

        let values = match result {
            Ok(values) => values,
            Err(TransactionError::Storage(err)) => return Err(StorageError::Db(err)),
            Err(TransactionError::Abort(())) => {
                return Err(StorageError::Unavailable("transaction aborted".to_string()))
            }
        };

        let mut wrote = false;
        for (op, value) in ops.iter_mut().zip(values) {
            match op.kind {
                OperationKind::Get => op.value = value,
                OperationKind::Set | OperationKind::Delete => wrote = true,
            }
        }
        if wrote && self.sync_on_write {
            self.tree.flush()?;
        }
        Ok(())
    }
}

fn sled_config(path: &Path) -> SledConfig {
    SledConfig::new()
        .path(path)
        .cache_capacity(16 * 1024 * 1024)
}
