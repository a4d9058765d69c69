//! HTTP aggregator: each batch is POSTed as a JSON array of frames.

use crate::FeedError;
use bytes::Bytes;
use futures::future::BoxFuture;
use http_body_util::{BodyExt, Full};
use hyper::{header, Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use spewguard_core::error::TransportError;
use spewguard_core::{Aggregator, LogFrame};
use std::time::Duration;

pub struct HttpAggregator {
    client: Client<HttpConnector, Full<Bytes>>,
    endpoint: Uri,
    timeout: Duration,
}

impl HttpAggregator {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, FeedError> {
        let uri = endpoint
            .parse::<Uri>()
            .map_err(|e| FeedError::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;
        if uri.scheme_str() != Some("http") {
            return Err(FeedError::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                reason: "only http:// endpoints are supported".into(),
            });
        }
        Ok(Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            endpoint: uri,
            timeout,
        })
    }

    pub fn endpoint(&self) -> &Uri {
        &self.endpoint
    }

    async fn post(&self, frames: &[LogFrame]) -> Result<(), TransportError> {
        let body = serde_json::to_vec(frames)?;
        let req = Request::post(self.endpoint.clone())
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;

        let res = tokio::time::timeout(self.timeout, self.client.request(req))
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))?
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;

        let status = res.status();
        // Drain the body so the connection can be reused.
        let _ = res.into_body().collect().await;
        if !status.is_success() {
            return Err(TransportError::Rejected {
                status: status.as_u16(),
            });
        }
        tracing::trace!(frames = frames.len(), %status, "http aggregator: batch accepted");
        Ok(())
    }
}

impl Aggregator for HttpAggregator {
    fn send<'a>(&'a self, frames: &'a [LogFrame]) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(self.post(frames))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use spewguard_core::{SourceId, StreamKind};
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    type Received = Arc<Mutex<Vec<serde_json::Value>>>;

    async fn serve(status: StatusCode) -> (String, Received) {
        async fn ingest(
            State((status, received)): State<(StatusCode, Received)>,
            Json(body): Json<serde_json::Value>,
        ) -> StatusCode {
            received.lock().unwrap().push(body);
            status
        }

        let received: Received = Arc::default();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new()
            .route("/ingest", post(ingest))
            .with_state((status, received.clone()));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/ingest"), received)
    }

    fn frame(seq: u64) -> LogFrame {
        LogFrame {
            source_id: SourceId::new("app1"),
            sequence: seq,
            stream: StreamKind::Stdout,
            payload: Bytes::from(format!("line {seq}")),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn posts_batch_as_json_array() {
        let (url, received) = serve(StatusCode::OK).await;
        let aggregator = HttpAggregator::new(&url, Duration::from_secs(5)).unwrap();

        aggregator.send(&[frame(0), frame(1)]).await.unwrap();

        let bodies = received.lock().unwrap().clone();
        assert_eq!(bodies.len(), 1);
        let seqs: Vec<u64> = bodies[0]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["sequence"].as_u64().unwrap())
            .collect();
        assert_eq!(seqs, vec![0, 1]);
        assert_eq!(bodies[0][1]["payload"], "line 1");
    }

    #[tokio::test]
    async fn error_status_is_rejected() {
        let (url, _) = serve(StatusCode::SERVICE_UNAVAILABLE).await;
        let aggregator = HttpAggregator::new(&url, Duration::from_secs(5)).unwrap();

        let err = aggregator.send(&[frame(0)]).await.unwrap_err();
        assert!(matches!(err, TransportError::Rejected { status: 503 }));
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let aggregator =
            HttpAggregator::new(&format!("http://{addr}/"), Duration::from_secs(5)).unwrap();

        let err = aggregator.send(&[frame(0)]).await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)));
    }

    #[test]
    fn rejects_non_http_endpoints() {
        assert!(HttpAggregator::new("ftp://example.com", Duration::from_secs(1)).is_err());
        assert!(HttpAggregator::new("not a uri", Duration::from_secs(1)).is_err());
    }
}
