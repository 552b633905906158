// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Broadcast server — the ambient axum HTTP surface backing the `POST /`
//! ingest / `GET /subscribe` SSE contract from spec.md §6.
//!
//! Grounded in the teacher's `api.rs` (`AppState`, `build_router`,
//! `start_server` shape: axum `Router`, `CorsLayer::permissive()`,
//! `tokio::net::TcpListener` + `axum::serve`) and in the original's
//! `app.py::Broadcaster` (a `Vec` of per-client bounded queues; full queues
//! are dropped rather than blocking the broadcaster — spec.md §5's "Full
//! subscribers are evicted on push failure (lossy backpressure)").

use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use super::{Sink, SinkEvent};

/// Capacity of each subscriber's message queue, matching the original's
/// `queue.Queue(maxsize=3)`.
const SUBSCRIBER_QUEUE_SIZE: usize = 3;

/// The process-global subscriber registry, encapsulated as an explicit
/// passed-in object per spec.md §9 ("encapsulate it as an explicit
/// passed-in object with well-defined lifecycle rather than a module
/// singleton") rather than a `static`/`lazy_static`.
#[derive(Default)]
pub struct Broadcaster {
    subscribers: Mutex<Vec<mpsc::Sender<SinkEvent>>>,
}

impl Broadcaster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn subscribe(&self) -> mpsc::Receiver<SinkEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_SIZE);
        self.subscribers.lock().push(tx);
        rx
    }

    /// Push `event` to every subscriber; a subscriber whose queue is full
    /// (not consuming messages) is dropped rather than allowed to block
    /// the broadcast (spec.md §5 lossy backpressure).
    fn broadcast(&self, event: SinkEvent) {
        let mut subs = self.subscribers.lock();
        subs.retain(|tx| tx.try_send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

/// Dispatches events both into the SSE broadcaster and (implicitly, via
/// `POST /`) accepts pushes from external notifiers, mirroring the
/// original's single Flask route handling both directions.
impl Sink for Broadcaster {
    fn emit(&self, event: &SinkEvent) {
        self.broadcast(event.clone());
    }
}

#[derive(Clone)]
struct AppState {
    broadcaster: Arc<Broadcaster>,
}

pub fn build_router(broadcaster: Arc<Broadcaster>) -> Router {
    let state = AppState { broadcaster };
    Router::new()
        .route("/", axum::routing::post(handle_ingest))
        .route("/subscribe", get(handle_subscribe))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the SSE broadcast server on `port`. Runs until the process exits
/// or the listener fails to bind.
pub async fn start_server(broadcaster: Arc<Broadcaster>, port: u16) {
    let app = build_router(broadcaster);
    let addr = format!("0.0.0.0:{port}");

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, addr = %addr, "Failed to bind sink broadcast server");
            return;
        }
    };
    info!(addr = %addr, "Sink broadcast server listening");

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "Sink broadcast server error");
    }
}

/// `POST /`: accepts an identification event from an external notifier and
/// fans it out to every SSE subscriber, per spec.md §6.
async fn handle_ingest(
    State(state): State<AppState>,
    Json(event): Json<SinkEvent>,
) -> impl IntoResponse {
    state.broadcaster.broadcast(event);
    Json(serde_json::json!({ "status": "ok" }))
}

/// `GET /subscribe`: a Server-Sent Events stream of every broadcast event,
/// one `data: <json>\n\n` message per event.
async fn handle_subscribe(State(state): State<AppState>) -> impl IntoResponse {
    let rx = state.broadcaster.subscribe();
    let stream = ReceiverStream::new(rx).map(|event| {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        Ok::<_, std::convert::Infallible>(Event::default().data(payload))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> SinkEvent {
        SinkEvent {
            ip_src: "10.0.0.1".into(),
            ip_dst: "10.0.0.2".into(),
            elapsed: 1.0,
            captured_segment: 1000,
            best_match: None,
            second_match: None,
            third_match: None,
            best_title: None,
            probability_pct: 0.0,
        }
    }

    #[tokio::test]
    async fn subscriber_receives_broadcast_event() {
        let broadcaster = Broadcaster::new();
        let mut rx = broadcaster.subscribe();
        broadcaster.broadcast(sample_event());
        let received = rx.recv().await.unwrap();
        assert_eq!(received.ip_src, "10.0.0.1");
    }

    #[tokio::test]
    async fn full_subscriber_is_evicted_not_blocked() {
        let broadcaster = Broadcaster::new();
        let _rx = broadcaster.subscribe();
        // Fill the queue past capacity without consuming.
        for _ in 0..(SUBSCRIBER_QUEUE_SIZE + 2) {
            broadcaster.broadcast(sample_event());
        }
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn sink_trait_object_can_be_constructed_from_broadcaster() {
        let broadcaster = Broadcaster::new();
        let _: Arc<dyn Sink> = broadcaster;
    }
}
