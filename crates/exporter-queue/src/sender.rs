// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sender chain.
//!
//! Every stage implements [`Sender`] and owns the next stage. The chain is
//! started back to front and stopped front to back, so no stage receives
//! work before its downstream is ready.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error};

use crate::config::QueueConfig;
use crate::consumers::QueueConsumers;
use crate::context::Context;
use crate::errors::{ExportError, QueueError, SendError};
use crate::persistent_queue::PersistentQueue;
use crate::request::Request;
use crate::storage::Client;
use crate::telemetry::QueueTelemetry;

#[async_trait]
pub trait Sender<R: Send + 'static>: Send + Sync {
    async fn start(&self, _ctx: &Context) -> Result<(), SendError> {
        Ok(())
    }

    async fn stop(&self, _ctx: &Context) -> Result<(), SendError> {
        Ok(())
    }

    async fn forward(&self, ctx: &Context, request: R) -> Result<(), SendError>;
}

/// Performs the network call for one request.
#[async_trait]
pub trait Transport<R: Sync>: Send + Sync {
    async fn export(&self, ctx: &Context, request: &R) -> Result<(), ExportError>;
}

/// Terminal stage handing each request to a [`Transport`].
#[derive(Debug)]
pub struct ExportSender<T> {
    transport: T,
}

impl<T> ExportSender<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

#[async_trait]
impl<R, T> Sender<R> for ExportSender<T>
where
    R: Request,
    T: Transport<R>,
{
    async fn forward(&self, ctx: &Context, request: R) -> Result<(), SendError> {
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }
        tokio::select! {
            biased;
            err = ctx.done() => Err(err.into()),
            result = self.transport.export(ctx, &request) => {
                result?;
                debug!("Exported request with {} items", request.items_count());
                Ok(())
            }
        }
    }
}

/// Chain stage buffering requests in a [`PersistentQueue`] and draining it
/// into the next stage with [`QueueConsumers`].
pub struct QueueSender<R: Request> {
    queue: Arc<PersistentQueue<R>>,
    consumers: QueueConsumers<R>,
    next: Arc<dyn Sender<R>>,
}

impl<R: Request> QueueSender<R> {
    pub fn new(queue: PersistentQueue<R>, num_consumers: usize, next: Arc<dyn Sender<R>>) -> Self {
        let queue = Arc::new(queue);
        let consumers = QueueConsumers::new(Arc::clone(&queue), num_consumers, Arc::clone(&next));
        Self {
            queue,
            consumers,
            next,
        }
    }

    /// Builds the queue described by `config` on top of `client`.
    pub fn from_config(
        config: QueueConfig,
        client: Arc<dyn Client>,
        telemetry: Arc<dyn QueueTelemetry>,
        next: Arc<dyn Sender<R>>,
    ) -> Result<Self, QueueError> {
        let num_consumers = config.num_consumers;
        let queue = PersistentQueue::new(config, client, telemetry)?;
        Ok(Self::new(queue, num_consumers, next))
    }

    pub fn queue(&self) -> &PersistentQueue<R> {
        &self.queue
    }
}

#[async_trait]
impl<R: Request> Sender<R> for QueueSender<R> {
    async fn start(&self, ctx: &Context) -> Result<(), SendError> {
        self.next.start(ctx).await?;
        self.consumers.start();
        Ok(())
    }

    async fn stop(&self, ctx: &Context) -> Result<(), SendError> {
        self.consumers.shutdown(ctx).await;
        self.next.stop(ctx).await
    }

    async fn forward(&self, ctx: &Context, request: R) -> Result<(), SendError> {
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }
        let items = request.items_count();
        match self.queue.enqueue(request) {
            Ok(()) => Ok(()),
            Err(QueueError::CapacityExceeded) => {
                error!(
                    "Dropping data because sending queue {} is full, try increasing its capacity. dropped_items={items}",
                    self.queue.name()
                );
                Err(QueueError::CapacityExceeded.into())
            }
            Err(err) => {
                error!(
                    "Dropping data because it could not be enqueued to {}: {err}. dropped_items={items}",
                    self.queue.name()
                );
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::request::tests::Label;
    use crate::storage::InMemoryClient;
    use crate::telemetry::NoopTelemetry;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tracing_test::traced_test;

    /// Downstream stage recording what it receives.
    #[derive(Default)]
    pub(crate) struct RecordingSender {
        delay: Duration,
        fail_on: Vec<String>,
        forwarded: Mutex<Vec<Label>>,
        active: AtomicUsize,
        peak: AtomicUsize,
        started: AtomicBool,
        stopped: AtomicBool,
    }

    impl RecordingSender {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub(crate) fn failing_on(mut self, labels: &[&str]) -> Self {
            self.fail_on = labels.iter().map(|l| l.to_string()).collect();
            self
        }

        pub(crate) fn forwarded(&self) -> Vec<Label> {
            self.forwarded.lock().unwrap().clone()
        }

        /// Most forwards observed running at the same time.
        pub(crate) fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }

        pub(crate) fn is_started(&self) -> bool {
            self.started.load(Ordering::SeqCst)
        }

        pub(crate) fn is_stopped(&self) -> bool {
            self.stopped.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Sender<Label> for RecordingSender {
        async fn start(&self, _ctx: &Context) -> Result<(), SendError> {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self, _ctx: &Context) -> Result<(), SendError> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn forward(&self, ctx: &Context, request: Label) -> Result<(), SendError> {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(active, Ordering::SeqCst);
            let outcome = tokio::select! {
                err = ctx.done() => Err(SendError::from(err)),
                _ = tokio::time::sleep(self.delay) => Ok(()),
            };
            self.active.fetch_sub(1, Ordering::SeqCst);
            outcome?;

            let fail = self.fail_on.contains(&request.0);
            self.forwarded.lock().unwrap().push(request.clone());
            if fail {
                return Err(ExportError::Retryable(format!("rejected {}", request.0)).into());
            }
            Ok(())
        }
    }

    struct StaticTransport {
        outcome: fn(&Label) -> Result<(), ExportError>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport<Label> for StaticTransport {
        async fn export(&self, _ctx: &Context, request: &Label) -> Result<(), ExportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.outcome)(request)
        }
    }

    fn queue_sender(
        client: &InMemoryClient,
        capacity: u64,
        next: Arc<dyn Sender<Label>>,
    ) -> QueueSender<Label> {
        QueueSender::from_config(
            QueueConfig {
                name: "logs".to_string(),
                capacity,
                num_consumers: 2,
            },
            Arc::new(client.clone()),
            Arc::new(NoopTelemetry),
            next,
        )
        .unwrap()
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not met in time");
    }

    #[tokio::test]
    async fn export_sender_maps_transport_outcome() {
        let sender = ExportSender::new(StaticTransport {
            outcome: |label| match label.0.as_str() {
                "bad" => Err(ExportError::Permanent("400 Bad Request".into())),
                _ => Ok(()),
            },
            calls: AtomicUsize::new(0),
        });
        let ctx = Context::background();

        assert!(sender.forward(&ctx, Label::new("good")).await.is_ok());
        let err = sender.forward(&ctx, Label::new("bad")).await.unwrap_err();
        assert!(matches!(err, SendError::Export(ExportError::Permanent(_))));
        assert_eq!(sender.transport().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn export_sender_skips_transport_when_context_is_done() {
        let sender = ExportSender::new(StaticTransport {
            outcome: |_| Ok(()),
            calls: AtomicUsize::new(0),
        });
        let ctx = Context::background();
        ctx.cancel();

        let err = sender.forward(&ctx, Label::new("late")).await.unwrap_err();
        assert!(err.is_canceled());
        assert_eq!(sender.transport().calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn queue_sender_delivers_enqueued_requests_downstream() {
        let client = InMemoryClient::new();
        let next = Arc::new(RecordingSender::new());
        let sender = queue_sender(&client, 10, next.clone());
        let ctx = Context::background();

        sender.start(&ctx).await.unwrap();
        assert!(next.is_started());
        for label in ["a", "b", "c"] {
            sender.forward(&ctx, Label::new(label)).await.unwrap();
        }
        wait_for(|| next.forwarded().len() == 3).await;
        wait_for(|| sender.queue().outstanding() == 0).await;

        sender.stop(&ctx).await.unwrap();
        assert!(next.is_stopped());
        for record in ["logs/0", "logs/1", "logs/2"] {
            assert!(!client.contains_key(record));
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn full_queue_drops_and_reports() {
        let client = InMemoryClient::new();
        let sender = queue_sender(&client, 1, Arc::new(RecordingSender::new()));
        let ctx = Context::background();

        sender.forward(&ctx, Label::new("kept")).await.unwrap();
        let err = sender.forward(&ctx, Label::new("dropped")).await.unwrap_err();
        assert!(matches!(err, SendError::Queue(QueueError::CapacityExceeded)));
        assert!(logs_contain("Dropping data because sending queue logs is full"));
        sender.stop(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn stop_releases_abandoned_items_for_the_next_start() {
        let client = InMemoryClient::new();
        let slow = Arc::new(RecordingSender::new().with_delay(Duration::from_secs(60)));
        let sender = queue_sender(&client, 10, slow.clone());
        let ctx = Context::background();
        sender.start(&ctx).await.unwrap();
        sender.forward(&ctx, Label::new("stuck")).await.unwrap();
        wait_for(|| sender.queue().outstanding() == 1).await;

        let deadline = Context::background().with_timeout(Duration::from_millis(20));
        sender.stop(&deadline).await.unwrap();
        assert!(slow.forwarded().is_empty());
        drop(sender);

        let next = Arc::new(RecordingSender::new());
        let restarted = queue_sender(&client, 10, next.clone());
        restarted.start(&ctx).await.unwrap();
        wait_for(|| next.forwarded() == vec![Label::new("stuck")]).await;
        restarted.stop(&ctx).await.unwrap();
    }
}
