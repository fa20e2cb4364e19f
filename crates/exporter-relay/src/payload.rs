// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Relay payloads.
//!
//! Datagrams and queue records share one layout: a one-byte signal tag
//! followed by the opaque body forwarded to the collector.

use std::fmt;

use exporter_queue::{CodecError, Request};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Traces,
    Metrics,
    Logs,
}

impl Signal {
    pub const ALL: [Signal; 3] = [Signal::Traces, Signal::Metrics, Signal::Logs];

    pub fn tag(self) -> u8 {
        match self {
            Signal::Traces => 1,
            Signal::Metrics => 2,
            Signal::Logs => 3,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Signal::Traces),
            2 => Some(Signal::Metrics),
            3 => Some(Signal::Logs),
            _ => None,
        }
    }

    /// Path segment of the collector endpoint, `/v1/<path>`.
    pub fn path(self) -> &'static str {
        match self {
            Signal::Traces => "traces",
            Signal::Metrics => "metrics",
            Signal::Logs => "logs",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub signal: Signal,
    pub body: Vec<u8>,
}

impl Payload {
    pub fn new(signal: Signal, body: impl Into<Vec<u8>>) -> Self {
        Self {
            signal,
            body: body.into(),
        }
    }
}

impl Request for Payload {
    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut bytes = Vec::with_capacity(self.body.len() + 1);
        bytes.push(self.signal.tag());
        bytes.extend_from_slice(&self.body);
        Ok(bytes)
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let (&tag, body) = bytes
            .split_first()
            .ok_or_else(|| CodecError("payload is empty".to_string()))?;
        let signal = Signal::from_tag(tag)
            .ok_or_else(|| CodecError(format!("unknown signal tag {tag}")))?;
        Ok(Self::new(signal, body))
    }

    fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}
