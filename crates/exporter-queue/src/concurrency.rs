// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::debug;

use crate::config::ConcurrencyConfig;
use crate::context::Context;
use crate::errors::{ConfigError, MultiError, SendError};
use crate::request::Request;
use crate::sender::Sender;

/// Chain stage bounding how many requests are forwarded at the same time.
///
/// Each forward holds one permit of a shared semaphore for its whole
/// duration, so the bound also holds across concurrent callers.
pub struct ConcurrencySender<R: Request> {
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    next: Arc<dyn Sender<R>>,
}

impl<R: Request> ConcurrencySender<R> {
    pub fn new(config: ConcurrencyConfig, next: Arc<dyn Sender<R>>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            permits: Arc::new(Semaphore::new(config.max_concurrent)),
            max_concurrent: config.max_concurrent,
            next,
        })
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    async fn acquire(&self, ctx: &Context) -> Result<OwnedSemaphorePermit, SendError> {
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }
        tokio::select! {
            biased;
            err = ctx.done() => Err(err.into()),
            permit = Arc::clone(&self.permits).acquire_owned() => {
                permit.map_err(|err| SendError::Task(err.to_string()))
            }
        }
    }

    /// Forwards every request to the next stage, at most `max_concurrent` at
    /// a time, and waits for all of them. This is the entry point for a stage
    /// that batches requests; the chain itself goes through
    /// [`Sender::forward`], one request per call.
    ///
    /// Failures are collected into a [`MultiError`]. If `ctx` finishes while
    /// waiting for a permit, the remaining requests are not dispatched and
    /// the context error is returned once the dispatched ones have finished.
    pub async fn send(&self, ctx: &Context, requests: Vec<R>) -> Result<(), SendError> {
        let total = requests.len();
        let mut tasks = JoinSet::new();
        let mut acquire_error = None;

        for request in requests {
            let permit = match self.acquire(ctx).await {
                Ok(permit) => permit,
                Err(err) => {
                    acquire_error = Some(err);
                    break;
                }
            };
            let next = Arc::clone(&self.next);
            let ctx = ctx.clone();
            tasks.spawn(async move {
                let result = next.forward(&ctx, request).await;
                drop(permit);
                result
            });
        }

        let mut errors = MultiError::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => errors.push(err),
                Err(err) => errors.push(SendError::Task(err.to_string())),
            }
        }

        if let Some(err) = acquire_error {
            debug!(
                "Stopped dispatching {total} requests: {err}, {} dispatched requests failed",
                errors.len()
            );
            return Err(err);
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.into())
        }
    }
}

#[async_trait]
impl<R: Request> Sender<R> for ConcurrencySender<R> {
    async fn start(&self, ctx: &Context) -> Result<(), SendError> {
        self.next.start(ctx).await
    }

    async fn stop(&self, ctx: &Context) -> Result<(), SendError> {
        self.next.stop(ctx).await
    }

    async fn forward(&self, ctx: &Context, request: R) -> Result<(), SendError> {
        let _permit = self.acquire(ctx).await?;
        self.next.forward(ctx, request).await
    }
}
