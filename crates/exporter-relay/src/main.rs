// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod config;
mod error;
mod payload;
mod pipeline;
mod receiver;
mod transport;

use std::sync::Arc;

use exporter_queue::{Context, SledClient};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::pipeline::Pipelines;
use crate::receiver::UdpReceiver;
use crate::transport::HttpTransport;

#[tokio::main]
pub async fn main() {
    let config = RelayConfig::from_env();

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", config.log_level);
    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    if let Err(err) = config.validate() {
        error!("{err}. Shutting down relay.");
        return;
    }

    if let Err(err) = run(config).await {
        error!("Relay stopped with an error: {err}");
    }
}

fn open_storage(config: &RelayConfig) -> Result<SledClient, RelayError> {
    match &config.storage_path {
        Some(path) => {
            let client = SledClient::open(path)?.sync_on_write(config.storage_sync);
            info!("Persisting queued payloads to {}", path.display());
            Ok(client)
        }
        None => {
            warn!("No storage path configured, queued payloads will not survive a restart");
            Ok(SledClient::open_ephemeral()?)
        }
    }
}

async fn run(config: RelayConfig) -> Result<(), RelayError> {
    let storage = open_storage(&config)?;
    let transport = HttpTransport::new(&config.endpoint, config.request_timeout)?;
    let pipelines = Arc::new(Pipelines::new(
        &config,
        Arc::new(storage.clone()),
        transport,
    )?);

    let ctx = Context::background();
    pipelines.start(&ctx).await?;

    let cancel_token = CancellationToken::new();
    let receiver = UdpReceiver::bind(&config.listen_addr, cancel_token.clone()).await?;
    info!(
        "Relay listening on {}, exporting to {}",
        receiver.local_addr()?,
        config.endpoint
    );
    let receiver_task = tokio::spawn(receiver.run(Arc::clone(&pipelines)));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(err) => error!("Unable to listen for shutdown signal: {err}"),
    }

    cancel_token.cancel();
    if let Err(err) = receiver_task.await {
        error!("UDP receiver terminated abnormally: {err}");
    }

    // Exports still running after the timeout are abandoned; their payloads
    // stay queued for the next start.
    let shutdown = Context::background().with_timeout(config.shutdown_timeout);
    let stopped = pipelines.stop(&shutdown).await;
    storage.flush()?;
    stopped
}
