// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Queue telemetry sinks.
//!
//! A [`QueueTelemetry`] implementation is handed to each queue at
//! construction and is notified whenever the queue size or the number of
//! in-flight items changes. Embedders expose the values through whatever
//! metrics backend they use; [`CountingTelemetry`] keeps them in atomics.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Hooks invoked by the persistent queue. All hooks default to no-ops.
pub trait QueueTelemetry: Send + Sync {
    /// Called with the new number of persisted-but-unread items.
    fn on_size_change(&self, _queue: &str, _size: u64) {}
    /// Called with the new number of dequeued-but-incomplete items.
    fn on_outstanding_change(&self, _queue: &str, _outstanding: u64) {}
    /// Called when an enqueue is refused because the queue is full.
    fn on_enqueue_rejected(&self, _queue: &str) {}
    /// Called once at startup with the number of in-flight items reclaimed
    /// from a previous run.
    fn on_recovered(&self, _queue: &str, _items: u64) {}
}

#[derive(Debug, Default)]
pub struct NoopTelemetry;

impl QueueTelemetry for NoopTelemetry {}

/// Gauges and counters updated with relaxed atomics.
#[derive(Debug, Default)]
pub struct TelemetryCounters {
    size: AtomicU64,
    outstanding: AtomicU64,
    rejected: AtomicU64,
    recovered: AtomicU64,
}

impl TelemetryCounters {
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            size: self.size.load(Ordering::Relaxed),
            outstanding: self.outstanding.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
        }
    }
}

/// Plain data view of [`TelemetryCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    /// Latest queue size.
    pub size: u64,
    /// Latest number of in-flight items.
    pub outstanding: u64,
    /// Enqueues refused because the queue was full.
    pub rejected: u64,
    /// Items reclaimed by recovery passes.
    pub recovered: u64,
}

impl fmt::Display for TelemetrySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "size={}, outstanding={}, rejected={}, recovered={}",
            self.size, self.outstanding, self.rejected, self.recovered
        )
    }
}

#[derive(Debug, Clone)]
pub struct CountingTelemetry {
    counters: Arc<TelemetryCounters>,
}

impl CountingTelemetry {
    pub fn new(counters: Arc<TelemetryCounters>) -> Self {
        Self { counters }
    }

    pub fn counters(&self) -> Arc<TelemetryCounters> {
        self.counters.clone()
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.counters.snapshot()
    }
}

impl Default for CountingTelemetry {
    fn default() -> Self {
        Self::new(Arc::new(TelemetryCounters::default()))
    }
}

impl QueueTelemetry for CountingTelemetry {
    fn on_size_change(&self, _queue: &str, size: u64) {
        self.counters.size.store(size, Ordering::Relaxed);
    }

    fn on_outstanding_change(&self, _queue: &str, outstanding: u64) {
        self.counters
            .outstanding
            .store(outstanding, Ordering::Relaxed);
    }

    fn on_enqueue_rejected(&self, _queue: &str) {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
    }

    fn on_recovered(&self, _queue: &str, items: u64) {
        self.counters.recovered.fetch_add(items, Ordering::Relaxed);
    }
}

/// Forwards every hook to each observer in order.
#[derive(Default)]
pub struct CompositeTelemetry {
    observers: Vec<Arc<dyn QueueTelemetry>>,
}

impl CompositeTelemetry {
    pub fn new(observers: Vec<Arc<dyn QueueTelemetry>>) -> Self {
        Self { observers }
    }

    pub fn push(&mut self, observer: Arc<dyn QueueTelemetry>) {
        self.observers.push(observer);
    }
}

impl fmt::Debug for CompositeTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeTelemetry")
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl QueueTelemetry for CompositeTelemetry {
    fn on_size_change(&self, queue: &str, size: u64) {
        for observer in &self.observers {
            observer.on_size_change(queue, size);
        }
    }

    fn on_outstanding_change(&self, queue: &str, outstanding: u64) {
        for observer in &self.observers {
            observer.on_outstanding_change(queue, outstanding);
        }
    }

    fn on_enqueue_rejected(&self, queue: &str) {
        for observer in &self.observers {
            observer.on_enqueue_rejected(queue);
        }
    }

    fn on_recovered(&self, queue: &str, items: u64) {
        for observer in &self.observers {
            observer.on_recovered(queue, items);
        }
    }
}
