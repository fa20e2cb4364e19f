// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Exporter reliability layer.
//!
//! Outbound telemetry batches are buffered in a crash-recoverable queue
//! ([`PersistentQueue`]) built on an injected key/value [`storage::Client`],
//! drained by [`QueueConsumers`] and forwarded through a chain of
//! [`Sender`] stages. The [`ConcurrencySender`] stage bounds how many
//! requests are in flight toward the transport at once.
//!
//! ```text
//! producer ──> QueueSender ──> PersistentQueue ──> QueueConsumers
//!                                   ^                    │
//!                                   │ complete()         v
//!                                   └──────────── ConcurrencySender ──> ExportSender ──> Transport
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod concurrency;
pub mod config;
pub mod consumers;
pub mod context;
pub mod errors;
pub mod persistent_queue;
pub mod request;
pub mod sender;
pub mod storage;
pub mod telemetry;

pub use concurrency::ConcurrencySender;
pub use config::{ConcurrencyConfig, QueueConfig};
pub use consumers::QueueConsumers;
pub use context::{Context, ContextError};
pub use errors::{CodecError, ConfigError, ExportError, MultiError, QueueError, SendError};
pub use persistent_queue::{Completion, Deliveries, Delivery, PersistentQueue};
pub use request::Request;
pub use sender::{ExportSender, QueueSender, Sender, Transport};
pub use storage::{Client, InMemoryClient, Operation, SledClient, StorageError};
pub use telemetry::{
    CompositeTelemetry, CountingTelemetry, NoopTelemetry, QueueTelemetry, TelemetryCounters,
    TelemetrySnapshot,
};
