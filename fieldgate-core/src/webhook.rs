//! Webhook delivery worker.
//!
//! One worker per sink sends requests strictly in event order. A failed
//! request is logged and the worker moves on to the next one.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::dispatch::WebhookRequest;

/// Per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Spawn the worker that drains `requests` into HTTP calls to `url`.
pub fn spawn_worker(url: String, mut requests: mpsc::UnboundedReceiver<WebhookRequest>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let client = match reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build() {
            Ok(client) => client,
            Err(e) => {
                tracing::error!(error = %e, "Failed to build webhook client");
                return;
            }
        };

        tracing::info!(url = %url, "Webhook worker started");
        while let Some(request) = requests.recv().await {
            let result = match &request {
                WebhookRequest::Get => client.get(&url).send().await,
                WebhookRequest::Post(body) => client.post(&url).json(body).send().await,
            };

            match result.and_then(|response| response.error_for_status()) {
                Ok(response) => {
                    tracing::trace!(status = %response.status(), "Webhook delivered");
                }
                Err(e) => tracing::warn!(url = %url, error = %e, "Webhook delivery failed"),
            }
        }
        tracing::debug!("Webhook worker stopped");
    })
}
