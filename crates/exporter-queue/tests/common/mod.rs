// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use exporter_queue::{CodecError, Context, ExportError, Request, Transport};

/// Batch of spans identified by a sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanBatch {
    pub seq: u64,
    pub spans: u32,
}

impl SpanBatch {
    pub fn new(seq: u64) -> Self {
        Self { seq, spans: 1 }
    }
}

impl Request for SpanBatch {
    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut bytes = self.seq.to_le_bytes().to_vec();
        bytes.extend_from_slice(&self.spans.to_le_bytes());
        Ok(bytes)
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() != 12 {
            return Err(CodecError(format!("expected 12 bytes, got {}", bytes.len())));
        }
        let mut seq = [0u8; 8];
        let mut spans = [0u8; 4];
        seq.copy_from_slice(&bytes[..8]);
        spans.copy_from_slice(&bytes[8..]);
        Ok(Self {
            seq: u64::from_le_bytes(seq),
            spans: u32::from_le_bytes(spans),
        })
    }

    fn is_empty(&self) -> bool {
        self.spans == 0
    }

    fn items_count(&self) -> usize {
        self.spans as usize
    }
}

/// Transport recording exported sequence numbers.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    exported: Arc<Mutex<Vec<u64>>>,
    delay: Duration,
}

impl MemoryTransport {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn exported(&self) -> Arc<Mutex<Vec<u64>>> {
        self.exported.clone()
    }
}

#[async_trait]
impl Transport<SpanBatch> for MemoryTransport {
    async fn export(&self, _ctx: &Context, request: &SpanBatch) -> Result<(), ExportError> {
        tokio::time::sleep(self.delay).await;
        self.exported.lock().unwrap().push(request.seq);
        Ok(())
    }
}

pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}
