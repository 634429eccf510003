use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use meterlink_core::{ConnectivityStatus, GatewayId, UploadStatus};
use serde::Serialize;
use tokio::time::Instant;

use crate::batch::{BatchSizeController, BatchSizeState};
use crate::collector::ProtocolPools;
use crate::connectivity::ConnectivityMonitor;
use crate::pool::PoolStats;
use crate::registry::DeviceRegistryCache;
use crate::resilience::{CircuitStatus, ErrorStatistics, RetryCoordinator};
use crate::storage::GatewayStore;
use crate::upload::UploadManager;

/// Everything the status endpoint reports on.
pub struct StatusContext<S> {
    pub gateway_id: GatewayId,
    pub upload: Arc<UploadManager<S>>,
    pub connectivity: Arc<ConnectivityMonitor>,
    pub retry: Arc<RetryCoordinator>,
    pub batch: Arc<BatchSizeController>,
    pub registry: Arc<DeviceRegistryCache>,
    pub pools: ProtocolPools,
}

#[derive(Debug, Serialize)]
pub struct BreakerView {
    pub device_id: String,
    pub status: CircuitStatus,
    pub failure_count: u32,
    /// Seconds until an open circuit admits a trial call.
    pub retry_in_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct GatewayStatus {
    pub gateway_id: GatewayId,
    pub upload: UploadStatus,
    pub connectivity: ConnectivityStatus,
    pub devices: usize,
    pub registry_loaded_at: Option<jiff::Timestamp>,
    pub pools: Vec<PoolStats>,
    pub circuit_breakers: Vec<BreakerView>,
    pub batch_sizes: Vec<BatchSizeState>,
    pub errors: ErrorStatistics,
}

pub fn router<S: GatewayStore>(context: Arc<StatusContext<S>>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler::<S>))
        .with_state(context)
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn status_handler<S: GatewayStore>(
    State(context): State<Arc<StatusContext<S>>>,
) -> Json<GatewayStatus> {
    let now = Instant::now();
    let mut circuit_breakers: Vec<BreakerView> = context
        .retry
        .breakers()
        .snapshot()
        .into_iter()
        .map(|(device_id, state)| BreakerView {
            device_id,
            status: state.status,
            failure_count: state.failure_count,
            retry_in_secs: state
                .next_attempt_at
                .filter(|_| state.status == CircuitStatus::Open)
                .map(|at| at.saturating_duration_since(now).as_secs()),
        })
        .collect();
    circuit_breakers.sort_by(|a, b| a.device_id.cmp(&b.device_id));

    Json(GatewayStatus {
        gateway_id: context.gateway_id,
        upload: context.upload.status().await,
        connectivity: context.connectivity.status(),
        devices: context.registry.len(),
        registry_loaded_at: context.registry.loaded_at(),
        pools: context.pools.stats(),
        circuit_breakers,
        batch_sizes: context.batch.snapshot(),
        errors: context.retry.statistics(),
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;
    use ulid::Ulid;

    use super::*;
    use crate::config::{BatchConfig, RetryConfig, UploadConfig};
    use crate::storage::MemoryStore;
    use crate::uplink::{MockUplink, UplinkClient};

    #[tokio::test]
    async fn serves_health_and_status() {
        let uplink: Arc<dyn UplinkClient> = Arc::new(MockUplink::new());
        let connectivity = Arc::new(ConnectivityMonitor::new(
            Arc::clone(&uplink),
            Duration::from_secs(30),
            Duration::from_secs(5),
        ));
        let gateway_id = GatewayId(Ulid::new());
        let upload = Arc::new(UploadManager::new(
            MemoryStore::default(),
            uplink,
            Arc::clone(&connectivity),
            gateway_id,
            UploadConfig::default(),
        ));
        let context = Arc::new(StatusContext {
            gateway_id,
            upload,
            connectivity,
            retry: Arc::new(RetryCoordinator::new(RetryConfig::default())),
            batch: Arc::new(BatchSizeController::new(BatchConfig::default())),
            registry: Arc::new(DeviceRegistryCache::new()),
            pools: ProtocolPools::new(),
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(context)).await.unwrap();
        });

        let health = reqwest::get(format!("http://{addr}/health")).await.unwrap();
        assert_eq!(health.text().await.unwrap(), "OK");

        let status: serde_json::Value = reqwest::get(format!("http://{addr}/status"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["upload"]["queue_size"], 0);
        assert_eq!(status["connectivity"]["is_connected"], false);
        assert_eq!(status["devices"], 0);
        assert!(status["circuit_breakers"].as_array().unwrap().is_empty());
    }
}
