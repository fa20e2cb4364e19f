// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::CodecError;

/// One outbound batch of telemetry.
///
/// The queue persists requests as opaque bytes, so every request type states
/// how to encode and decode itself. The network call lives on the terminal
/// [`crate::sender::Transport`] stage: a request rehydrated from storage
/// carries no live connection.
pub trait Request: Send + Sync + Sized + 'static {
    fn encode(&self) -> Result<Vec<u8>, CodecError>;

    fn decode(bytes: &[u8]) -> Result<Self, CodecError>;

    /// Empty requests are accepted and dropped by the queue without being persisted.
    fn is_empty(&self) -> bool {
        false
    }

    /// Number of telemetry items carried, for logging.
    fn items_count(&self) -> usize {
        1
    }
}
