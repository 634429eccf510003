use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::eyre;
use meterlink_core::{DeviceRecord, GatewayId, MeterId, Protocol};
use meterlink_gateway::config::DeviceSeed;
use meterlink_gateway::http::{self, StatusContext};
use meterlink_gateway::resilience::{ResilienceEvent, ResilienceEventKind};
use meterlink_gateway::{
    BatchSizeController, CollectionOrchestrator, Config, ConnectionPool, ConnectivityMonitor,
    DeviceDriver, DeviceRegistryCache, DriverConfig, GatewayStore, HttpUplinkClient, MemoryStore,
    MockDriver, ModbusTcpDriver, ProtocolPools, RetryCoordinator, SqliteStore, StorageConfig,
    UplinkClient, UploadManager,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Parser)]
#[command(name = "meterlink-gateway")]
#[command(about = "Meterlink metering gateway")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "meterlink.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "tracing=info,meterlink_gateway=info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        info!(path = ?cli.config, "Loading configuration");
        Config::load(&cli.config)?
    } else {
        info!("No configuration file found, using defaults");
        Config::default()
    };

    let gateway_id = GatewayId(
        config
            .gateway
            .id
            .parse()
            .map_err(|e| eyre!("invalid gateway ID '{}': {}", config.gateway.id, e))?,
    );

    info!(
        gateway_id = %gateway_id.0,
        http_addr = %config.server.http_addr,
        uplink = %config.uplink.base_url,
        "Starting meterlink-gateway"
    );

    match config.storage {
        StorageConfig::Memory => {
            info!("Using in-memory storage");
            run_gateway(config, MemoryStore::default(), gateway_id).await?;
        }
        StorageConfig::Sqlite { ref path } => {
            info!(path = ?path, "Using SQLite storage");
            let store = SqliteStore::new(path).await?;
            run_gateway(config, store, gateway_id).await?;
        }
    }

    Ok(())
}

fn build_pools(config: &Config) -> ProtocolPools {
    let drivers: Vec<Arc<dyn DeviceDriver>> = match config.driver {
        DriverConfig::Mock => {
            info!("Using simulated devices");
            vec![
                Arc::new(MockDriver::simulated(Protocol::ModbusTcp)) as Arc<dyn DeviceDriver>,
                Arc::new(MockDriver::simulated(Protocol::Bacnet)),
            ]
        }
        DriverConfig::Modbus => {
            info!("Using Modbus TCP driver");
            vec![Arc::new(ModbusTcpDriver::new()) as Arc<dyn DeviceDriver>]
        }
    };

    drivers.into_iter().fold(ProtocolPools::new(), |pools, driver| {
        pools.with_pool(ConnectionPool::new(driver, config.pool.clone()))
    })
}

async fn seed_devices<S: GatewayStore>(store: &S, seeds: &[DeviceSeed]) -> color_eyre::Result<()> {
    for seed in seeds {
        let id = MeterId(
            seed.id
                .parse()
                .map_err(|e| eyre!("invalid meter ID '{}': {}", seed.id, e))?,
        );
        store
            .upsert_device(DeviceRecord {
                id,
                name: seed.name.as_str().into(),
                host: seed.host.as_str().into(),
                port: seed.port,
                unit_id: seed.unit_id,
                protocol: seed.protocol,
                active: true,
                point_map: Some(seed.points.clone()),
            })
            .await?;
        debug!(meter_id = %id, name = %seed.name, "Seeded device");
    }

    if !seeds.is_empty() {
        info!(count = seeds.len(), "Seeded devices from configuration");
    }
    Ok(())
}

async fn run_gateway<S>(config: Config, store: S, gateway_id: GatewayId) -> color_eyre::Result<()>
where
    S: GatewayStore + Clone,
{
    seed_devices(&store, &config.devices).await?;

    let registry = Arc::new(DeviceRegistryCache::new());
    let report = registry.reload(&store).await?;
    info!(
        loaded = report.loaded,
        discarded = report.discarded,
        "Device registry ready"
    );

    let pools = build_pools(&config);
    let retry = Arc::new(RetryCoordinator::new(config.retry.clone()));
    let batch = Arc::new(BatchSizeController::new(config.batch.clone()));

    let uplink: Arc<dyn UplinkClient> = Arc::new(HttpUplinkClient::new(&config.uplink)?);
    let connectivity = Arc::new(ConnectivityMonitor::new(
        Arc::clone(&uplink),
        config.upload.connectivity_check_interval(),
        config.upload.connectivity_timeout(),
    ));
    let upload = Arc::new(UploadManager::new(
        store.clone(),
        uplink,
        Arc::clone(&connectivity),
        gateway_id,
        config.upload.clone(),
    ));
    let collector = CollectionOrchestrator::new(
        store.clone(),
        Arc::clone(&registry),
        pools.clone(),
        Arc::clone(&retry),
        Arc::clone(&batch),
        config.collection.clone(),
    );

    let cancel = CancellationToken::new();
    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    for pool in pools.iter() {
        let pool_for_maintenance = pool.clone();
        let cancel_for_maintenance = cancel.clone();
        handles.push(tokio::spawn(async move {
            pool_for_maintenance.run_maintenance(cancel_for_maintenance).await;
        }));
    }

    let retry_for_janitor = Arc::clone(&retry);
    let cancel_for_janitor = cancel.clone();
    handles.push(tokio::spawn(async move {
        retry_for_janitor.run_context_janitor(cancel_for_janitor).await;
    }));

    let events = retry.subscribe();
    let cancel_for_events = cancel.clone();
    handles.push(tokio::spawn(async move {
        log_resilience_events(events, cancel_for_events).await;
    }));

    let connectivity_for_monitor = Arc::clone(&connectivity);
    let cancel_for_monitor = cancel.clone();
    handles.push(tokio::spawn(async move {
        connectivity_for_monitor.run(cancel_for_monitor).await;
    }));

    let upload_for_uploader = Arc::clone(&upload);
    let cancel_for_uploader = cancel.clone();
    handles.push(tokio::spawn(async move {
        upload_for_uploader.run(cancel_for_uploader).await;
    }));

    let collector_for_task = collector.clone();
    let cancel_for_collector = cancel.clone();
    handles.push(tokio::spawn(async move {
        collector_for_task.run(cancel_for_collector).await;
    }));

    let store_for_retention = store.clone();
    let cancel_for_retention = cancel.clone();
    let retention = config.collection.retention();
    handles.push(tokio::spawn(async move {
        run_retention(store_for_retention, retention, cancel_for_retention).await;
    }));

    // HTTP server
    let http_addr = config.server.http_addr;
    let axum_app = http::router(Arc::new(StatusContext {
        gateway_id,
        upload,
        connectivity,
        retry,
        batch,
        registry,
        pools,
    }));
    let axum_listener = TcpListener::bind(http_addr).await?;
    info!(%http_addr, "HTTP server listening");

    let cancel_for_http = cancel.clone();
    tokio::select! {
        result = axum::serve(axum_listener, axum_app).with_graceful_shutdown(async move {
            cancel_for_http.cancelled().await;
        }) => {
            if let Err(e) = result {
                error!(error = ?e, "HTTP server error");
            }
            info!("HTTP server shut down");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }
    cancel.cancel();

    // Wait for background tasks to complete
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }
    collector.shutdown().await;

    info!("meterlink-gateway shut down complete");
    Ok(())
}

async fn log_resilience_events(
    mut events: broadcast::Receiver<ResilienceEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(event) => match event.kind {
                ResilienceEventKind::RetryScheduled {
                    operation,
                    attempt,
                    delay,
                    error,
                } => debug!(
                    device_id = %event.device_id,
                    %operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    %error,
                    "Retry scheduled"
                ),
                ResilienceEventKind::CircuitOpened => {
                    warn!(device_id = %event.device_id, "Circuit opened")
                }
                ResilienceEventKind::CircuitHalfOpen => {
                    info!(device_id = %event.device_id, "Circuit half-open, trying device")
                }
                ResilienceEventKind::CircuitClosed => {
                    info!(device_id = %event.device_id, "Circuit closed")
                }
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Resilience event log lagging");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn run_retention<S: GatewayStore>(store: S, retention: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
    info!(retention_hours = retention.as_secs() / 3600, "Retention sweeper started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Retention sweeper shutting down");
                break;
            }
            _ = interval.tick() => {
                match store.cleanup_synchronized(retention).await {
                    Ok(0) => {}
                    Ok(deleted) => info!(deleted, "Purged synchronized readings"),
                    Err(e) => error!(error = %e, "Retention cleanup failed"),
                }
            }
        }
    }
}
