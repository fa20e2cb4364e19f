// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use exporter_queue::{
    Client, ConcurrencySender, Context, CountingTelemetry, ExportSender, QueueSender, SendError,
    Sender,
};
use tracing::{debug, info};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::payload::{Payload, Signal};
use crate::transport::HttpTransport;

struct Pipeline {
    signal: Signal,
    sender: QueueSender<Payload>,
    telemetry: CountingTelemetry,
}

/// One sender chain per signal, all sharing the same storage client:
/// queue, then concurrency limiter, then HTTP export.
pub struct Pipelines {
    pipelines: Vec<Pipeline>,
}

impl Pipelines {
    pub fn new(
        config: &RelayConfig,
        client: Arc<dyn Client>,
        transport: HttpTransport,
    ) -> Result<Self, RelayError> {
        let mut pipelines = Vec::with_capacity(Signal::ALL.len());
        for signal in Signal::ALL {
            let export: Arc<dyn Sender<Payload>> = Arc::new(ExportSender::new(transport.clone()));
            let limiter = ConcurrencySender::new(config.concurrency_config(), export)
                .map_err(|err| RelayError::InvalidConfig(err.0))?;
            let telemetry = CountingTelemetry::default();
            let sender = QueueSender::from_config(
                config.queue_config(signal),
                Arc::clone(&client),
                Arc::new(telemetry.clone()),
                Arc::new(limiter),
            )?;
            pipelines.push(Pipeline {
                signal,
                sender,
                telemetry,
            });
        }
        Ok(Self { pipelines })
    }

    fn pipeline(&self, signal: Signal) -> Result<&Pipeline, SendError> {
        // Every signal gets a pipeline in `new`.
        self.pipelines
            .iter()
            .find(|p| p.signal == signal)
            .ok_or_else(|| SendError::Task(format!("no pipeline for {signal}")))
    }

    pub async fn start(&self, ctx: &Context) -> Result<(), RelayError> {
        for pipeline in &self.pipelines {
            pipeline.sender.start(ctx).await?;
            debug!("Started {} pipeline", pipeline.signal);
        }
        Ok(())
    }

    /// Stops every pipeline, even when an earlier one fails to stop, and
    /// returns the first error.
    pub async fn stop(&self, ctx: &Context) -> Result<(), RelayError> {
        let mut result = Ok(());
        for pipeline in &self.pipelines {
            if let Err(err) = pipeline.sender.stop(ctx).await {
                if result.is_ok() {
                    result = Err(err.into());
                }
            }
            info!(
                "Stopped {} pipeline with {} payloads queued: {}",
                pipeline.signal,
                pipeline.sender.queue().size(),
                pipeline.telemetry.snapshot()
            );
        }
        result
    }

    pub async fn forward(&self, ctx: &Context, payload: Payload) -> Result<(), SendError> {
        self.pipeline(payload.signal)?
            .sender
            .forward(ctx, payload)
            .await
    }
}
