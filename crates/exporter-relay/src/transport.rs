// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use async_trait::async_trait;
use exporter_queue::{Context, ExportError, Transport};
use reqwest::StatusCode;
use tracing::{debug, error};

use crate::error::RelayError;
use crate::payload::Payload;

const CONTENT_TYPE: &str = "application/x-protobuf";

/// Posts payload bodies to an OTLP/HTTP collector.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, payload: &Payload) -> String {
        format!("{}/v1/{}", self.endpoint, payload.signal.path())
    }
}

#[async_trait]
impl Transport<Payload> for HttpTransport {
    async fn export(&self, _ctx: &Context, payload: &Payload) -> Result<(), ExportError> {
        let url = self.url(payload);
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .body(payload.body.clone())
            .send()
            .await
            .map_err(|err| ExportError::Retryable(format!("failed to send to {url}: {err}")))?;

        let status = response.status();
        if status.is_success() {
            debug!("Exported {} bytes to {url}", payload.body.len());
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        error!("{status}: Failed to push {} to collector: {body:?}", payload.signal);
        Err(classify(status, body))
    }
}

/// 4xx responses will fail again on retry; anything else may not.
fn classify(status: StatusCode, body: String) -> ExportError {
    let message = format!("{status}: {body}");
    if status.is_client_error() {
        ExportError::Permanent(message)
    } else {
        ExportError::Retryable(message)
    }
}
