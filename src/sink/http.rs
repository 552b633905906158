//! HTTP sink — fire-and-forget `POST` notifier, per spec.md §5/§6.
//!
//! Grounded in `original_source/identifier.py::run`'s bare
//! `requests.post('http://localhost:5000', json=data)` wrapped in a silent
//! `try/except`, generalized to a configurable URL and a short timeout
//! (spec.md §5: "Sink posts use a short timeout (~1 s default) and are
//! fire-and-forget"). Uses the teacher's `reqwest` client rather than a
//! hand-rolled HTTP client.

use std::time::Duration;

use reqwest::Client;
use tracing::warn;

use super::{Sink, SinkEvent};

/// POSTs every event to a fixed URL, swallowing failures (spec.md §7:
/// "Sink post failure: swallow"). Each post is spawned onto the runtime so
/// `emit` never blocks the ingest loop (spec.md §5).
pub struct HttpSink {
    client: Client,
    url: String,
}

impl HttpSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, url: url.into() }
    }
}

impl Sink for HttpSink {
    fn emit(&self, event: &SinkEvent) {
        let client = self.client.clone();
        let url = self.url.clone();
        let body = event.clone();
        tokio::spawn(async move {
            if let Err(e) = client.post(&url).json(&body).send().await {
                warn!(url = %url, error = %e, "Sink POST failed, dropping event");
            }
        });
    }
}
