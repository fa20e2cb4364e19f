// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::sync::Arc;

use exporter_queue::{Context, Request};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::error::RelayError;
use crate::payload::Payload;
use crate::pipeline::Pipelines;

const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Reads tagged datagrams and feeds them to the pipelines.
pub struct UdpReceiver {
    socket: UdpSocket,
    cancel_token: CancellationToken,
}

impl UdpReceiver {
    pub async fn bind(addr: &str, cancel_token: CancellationToken) -> Result<Self, RelayError> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket,
            cancel_token,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.socket.local_addr()?)
    }

    /// Runs until the cancel token fires.
    pub async fn run(self, pipelines: Arc<Pipelines>) {
        let ctx = Context::from_token(self.cancel_token.clone());
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let received = tokio::select! {
                _ = self.cancel_token.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };
            let (len, src) = match received {
                Ok(received) => received,
                Err(err) => {
                    error!("Failed to read datagram: {err}");
                    continue;
                }
            };

            let payload = match Payload::decode(&buf[..len]) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!("Dropping malformed datagram from {src}: {err}");
                    continue;
                }
            };
            trace!("Received {} payload of {} bytes from {src}", payload.signal, len);
            if let Err(err) = pipelines.forward(&ctx, payload).await {
                debug!("Payload from {src} not accepted: {err}");
            }
        }
        debug!("UDP receiver stopped");
    }
}
