//! Fake aggregators for integration tests.
//!
//! [`FakeAggregatorServer`] is a minimal `axum` HTTP server on a random
//! 127.0.0.1 port that accepts the JSON batches `HttpAggregator` posts. It
//! can be told to answer `503` for a while to simulate an outage.
//!
//! [`FlakyAggregator`] is the in-process equivalent for tests that do not
//! need a socket.
//!
//! ```rust,no_run
//! let server = FakeAggregatorServer::start().await.unwrap();
//! server.fail_next(3).await;
//! let aggregator = HttpAggregator::new(&server.url(), Duration::from_secs(1)).unwrap();
//! ```

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use futures::future::BoxFuture;
use spewguard_core::error::TransportError;
use spewguard_core::{Aggregator, LogFrame, MemoryAggregator};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

// ---------------------------------------------------------------------------
// HTTP fake
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ServerState {
    frames: Vec<serde_json::Value>,
    batches: usize,
    fail_remaining: u32,
}

pub struct FakeAggregatorServer {
    addr: SocketAddr,
    state: Arc<Mutex<ServerState>>,
}

impl FakeAggregatorServer {
    /// Start on a random port. Returns once the listener is bound.
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(Mutex::new(ServerState::default()));

        let app = Router::new()
            .route("/ingest", post(ingest))
            .with_state(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Ok(Self { addr, state })
    }

    pub fn url(&self) -> String {
        format!("http://{}/ingest", self.addr)
    }

    /// Answer the next `n` batches with 503.
    pub async fn fail_next(&self, n: u32) {
        self.state.lock().await.fail_remaining = n;
    }

    /// Every accepted frame, in arrival order.
    pub async fn frames(&self) -> Vec<serde_json::Value> {
        self.state.lock().await.frames.clone()
    }

    pub async fn batches(&self) -> usize {
        self.state.lock().await.batches
    }

    /// Poll until at least `n` frames arrived or `timeout` elapses.
    pub async fn wait_for_frames(&self, n: usize, timeout: Duration) -> Vec<serde_json::Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let frames = self.frames().await;
            if frames.len() >= n || tokio::time::Instant::now() >= deadline {
                return frames;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn ingest(
    State(state): State<Arc<Mutex<ServerState>>>,
    Json(batch): Json<Vec<serde_json::Value>>,
) -> StatusCode {
    let mut state = state.lock().await;
    if state.fail_remaining > 0 {
        state.fail_remaining -= 1;
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    state.batches += 1;
    state.frames.extend(batch);
    StatusCode::ACCEPTED
}

// ---------------------------------------------------------------------------
// In-process fake
// ---------------------------------------------------------------------------

/// Fails while "down" or while a failure budget remains, otherwise records
/// into an inner [`MemoryAggregator`].
#[derive(Default)]
pub struct FlakyAggregator {
    down: AtomicBool,
    fail_remaining: AtomicU32,
    attempts: AtomicU32,
    pub memory: MemoryAggregator,
}

impl FlakyAggregator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn fail_next(&self, n: u32) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// Send attempts seen so far, failed or not.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Aggregator for FlakyAggregator {
    fn send<'a>(&'a self, frames: &'a [LogFrame]) -> BoxFuture<'a, Result<(), TransportError>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let budgeted = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if self.down.load(Ordering::SeqCst) || budgeted {
            return Box::pin(async { Err::<(), _>(TransportError::Rejected { status: 503 }) });
        }
        self.memory.send(frames)
    }
}
