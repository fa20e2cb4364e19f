// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::context::Context;
use crate::persistent_queue::{Deliveries, PersistentQueue};
use crate::request::Request;
use crate::sender::Sender;

/// Pool of tasks draining a [`PersistentQueue`] into the next stage.
///
/// Every delivered item is completed once the next stage returns, whatever
/// the outcome. Retrying failed exports belongs downstream. Only items
/// abandoned because the pool is shutting down are released for redelivery.
pub struct QueueConsumers<R: Request> {
    queue: Arc<PersistentQueue<R>>,
    next: Arc<dyn Sender<R>>,
    num_consumers: usize,
    shutdown: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
}

impl<R: Request> QueueConsumers<R> {
    pub fn new(
        queue: Arc<PersistentQueue<R>>,
        num_consumers: usize,
        next: Arc<dyn Sender<R>>,
    ) -> Self {
        Self {
            queue,
            next,
            num_consumers,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Spawns the consumer tasks. Calling it again while they run is a no-op.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() || self.shutdown.is_cancelled() {
            return;
        }
        for id in 0..self.num_consumers {
            tasks.spawn(consume(
                id,
                self.queue.name().to_string(),
                self.queue.dequeue(),
                Arc::clone(&self.next),
                Context::from_token(self.shutdown.child_token()),
            ));
        }
        debug!(
            "Started {} consumers for queue {}",
            self.num_consumers,
            self.queue.name()
        );
    }

    /// Stops the queue and waits for the consumers. Forwards still running
    /// when `ctx` is done are canceled and their items left for recovery.
    pub async fn shutdown(&self, ctx: &Context) {
        self.queue.stop().await;
        let mut tasks =
            std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));

        let drained = tokio::select! {
            _ = join_all(&mut tasks) => true,
            _ = ctx.done() => false,
        };
        if !drained {
            debug!(
                "Canceling {} consumers of queue {} still forwarding",
                tasks.len(),
                self.queue.name()
            );
        }
        self.shutdown.cancel();
        join_all(&mut tasks).await;
    }
}

async fn join_all(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            error!("Queue consumer terminated abnormally: {err}");
        }
    }
}

async fn consume<R: Request>(
    id: usize,
    queue: String,
    deliveries: Deliveries<R>,
    next: Arc<dyn Sender<R>>,
    ctx: Context,
) {
    loop {
        let delivery = tokio::select! {
            biased;
            _ = ctx.done() => break,
            delivery = deliveries.recv() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };

        let (request, completion) = delivery.into_parts();
        let items = request.items_count();
        match next.forward(&ctx, request).await {
            Ok(()) => completion.complete(),
            Err(err) if err.is_canceled() && ctx.err().is_some() => {
                debug!(
                    "Consumer {id} of queue {queue} abandoned item {} on shutdown",
                    completion.index()
                );
                completion.release();
            }
            Err(err) => {
                error!(
                    "Exporting failed. Dropping data. queue={queue} dropped_items={items} error={err}"
                );
                completion.complete();
            }
        }
    }
    debug!("Consumer {id} of queue {queue} stopped");
}
