use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use meterlink_core::{ReadingId, UploadBatch, UploadResponse};
use tracing::debug;

use crate::config::UplinkConfig;
use crate::resilience::{Classify, ErrorKind};
use crate::util::lock_or_recover;

#[derive(Debug, thiserror::Error)]
pub enum UplinkError {
    #[error("central system unreachable: {0}")]
    Unreachable(String),

    #[error("request to central system timed out")]
    Timeout,

    #[error("central system answered HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("invalid response from central system: {0}")]
    InvalidResponse(String),
}

impl UplinkError {
    /// The remote could not be reached at all, as opposed to answering
    /// with an error.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, UplinkError::Unreachable(_) | UplinkError::Timeout)
    }
}

impl Classify for UplinkError {
    fn kind(&self) -> ErrorKind {
        match self {
            UplinkError::Unreachable(_) => ErrorKind::ConnectionFailed,
            UplinkError::Timeout => ErrorKind::Timeout,
            UplinkError::Http { status: 429 | 503, .. } => ErrorKind::DeviceBusy,
            UplinkError::Http { status, .. } if *status >= 500 => ErrorKind::UnknownError,
            UplinkError::Http { .. } | UplinkError::InvalidResponse(_) => ErrorKind::ProtocolError,
        }
    }
}

impl From<reqwest::Error> for UplinkError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            UplinkError::Timeout
        } else if e.is_decode() {
            UplinkError::InvalidResponse(e.to_string())
        } else {
            UplinkError::Unreachable(e.to_string())
        }
    }
}

/// The central system readings are forwarded to.
#[async_trait]
pub trait UplinkClient: Send + Sync + 'static {
    /// Send one batch. A response with `success == false` is a rejection.
    async fn upload_batch(&self, batch: &UploadBatch) -> Result<UploadResponse, UplinkError>;

    /// Lightweight reachability probe.
    async fn health_check(&self) -> Result<(), UplinkError>;
}

/// JSON over HTTP client for the central system.
pub struct HttpUplinkClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpUplinkClient {
    pub fn new(config: &UplinkConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{path}", self.base_url));
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response, UplinkError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(UplinkError::Http {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl UplinkClient for HttpUplinkClient {
    async fn upload_batch(&self, batch: &UploadBatch) -> Result<UploadResponse, UplinkError> {
        let response = self
            .request(reqwest::Method::POST, "/readings/batch")
            .json(batch)
            .send()
            .await?;
        let response = error_for_status(response).await?;
        let body: UploadResponse = response.json().await?;

        debug!(
            batch_id = %batch.id.0,
            success = body.success,
            records_processed = body.records_processed,
            "Upload response received"
        );
        Ok(body)
    }

    async fn health_check(&self) -> Result<(), UplinkError> {
        let response = self
            .request(reqwest::Method::GET, "/health")
            .send()
            .await?;
        error_for_status(response).await?;
        Ok(())
    }
}

/// In-process stand-in for the central system.
#[derive(Default)]
pub struct MockUplink {
    unreachable: AtomicBool,
    rejecting: AtomicBool,
    failing_http: AtomicBool,
    latency_ms: AtomicU64,
    upload_calls: AtomicUsize,
    health_checks: AtomicUsize,
    accepted: Mutex<Vec<ReadingId>>,
}

impl MockUplink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Answer uploads with `success: false`.
    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    /// Answer uploads with HTTP 500.
    pub fn set_failing(&self, failing: bool) {
        self.failing_http.store(failing, Ordering::SeqCst);
    }

    /// Delay every upload answer by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn upload_calls(&self) -> usize {
        self.upload_calls.load(Ordering::SeqCst)
    }

    pub fn health_checks(&self) -> usize {
        self.health_checks.load(Ordering::SeqCst)
    }

    /// Every reading id accepted so far, duplicates included.
    pub fn accepted(&self) -> Vec<ReadingId> {
        lock_or_recover(&self.accepted).clone()
    }
}

#[async_trait]
impl UplinkClient for MockUplink {
    async fn upload_batch(&self, batch: &UploadBatch) -> Result<UploadResponse, UplinkError> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);

        let latency = Duration::from_millis(self.latency_ms.load(Ordering::SeqCst));
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if self.unreachable.load(Ordering::SeqCst) {
            return Err(UplinkError::Unreachable("connection refused".into()));
        }
        if self.failing_http.load(Ordering::SeqCst) {
            return Err(UplinkError::Http {
                status: 500,
                body: "internal error".into(),
            });
        }
        if self.rejecting.load(Ordering::SeqCst) {
            return Ok(UploadResponse {
                success: false,
                records_processed: 0,
                message: Some("batch rejected".into()),
            });
        }

        lock_or_recover(&self.accepted).extend(batch.readings.iter().map(|r| r.id));
        Ok(UploadResponse {
            success: true,
            records_processed: batch.readings.len(),
            message: None,
        })
    }

    async fn health_check(&self) -> Result<(), UplinkError> {
        self.health_checks.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            Err(UplinkError::Unreachable("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use meterlink_core::{BatchId, GatewayId, MeterId, QueuedReading};
    use tokio::net::TcpListener;
    use ulid::Ulid;

    use super::*;

    async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/api")
    }

    fn config(base_url: String) -> UplinkConfig {
        UplinkConfig {
            base_url,
            request_timeout_secs: 5,
            api_key: Some("secret".into()),
        }
    }

    fn batch() -> UploadBatch {
        UploadBatch {
            id: BatchId(Ulid::new()),
            gateway_id: GatewayId(Ulid::new()),
            readings: vec![QueuedReading::new(MeterId(Ulid::new()), "power", 12.0)]
                .into_boxed_slice(),
            timestamp: jiff::Timestamp::now(),
        }
    }

    #[tokio::test]
    async fn posts_batches_and_parses_response() {
        let app = Router::new().route(
            "/api/readings/batch",
            post(|Json(batch): Json<UploadBatch>| async move {
                Json(UploadResponse {
                    success: true,
                    records_processed: batch.readings.len(),
                    message: None,
                })
            }),
        );
        let client = HttpUplinkClient::new(&config(serve(app).await)).unwrap();

        let response = client.upload_batch(&batch()).await.unwrap();
        assert!(response.success);
        assert_eq!(response.records_processed, 1);
    }

    #[tokio::test]
    async fn health_check_reports_http_errors() {
        let app = Router::new().route(
            "/api/health",
            get(|| async { (axum::http::StatusCode::SERVICE_UNAVAILABLE, "maintenance") }),
        );
        let client = HttpUplinkClient::new(&config(serve(app).await)).unwrap();

        let err = client.health_check().await.unwrap_err();
        assert!(matches!(err, UplinkError::Http { status: 503, .. }));
        assert!(!err.is_unreachable());
        assert_eq!(err.kind(), ErrorKind::DeviceBusy);
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = HttpUplinkClient::new(&config(format!("http://{addr}"))).unwrap();
        let err = client.health_check().await.unwrap_err();
        assert!(err.is_unreachable());
        assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
    }
}
