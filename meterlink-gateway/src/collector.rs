use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use meterlink_core::{
    CachedDevice, DeviceEndpoint, MeterId, PointDefinition, Protocol, QueuedReading,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::batch::BatchSizeController;
use crate::config::CollectionConfig;
use crate::driver::{ChunkDescriptor, DriverError, combine_words};
use crate::pool::{ConnectionPool, PoolError, PoolStats, PooledConnection};
use crate::registry::DeviceRegistryCache;
use crate::resilience::{Classify, ErrorKind, RetryCoordinator, RetryError};
use crate::storage::GatewayStore;

const READ_OPERATION: &str = "read_registers";

/// One connection pool per device protocol.
#[derive(Clone, Default)]
pub struct ProtocolPools {
    pools: HashMap<Protocol, ConnectionPool>,
}

impl ProtocolPools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pool(mut self, pool: ConnectionPool) -> Self {
        self.pools.insert(pool.protocol(), pool);
        self
    }

    pub fn get(&self, protocol: Protocol) -> Option<&ConnectionPool> {
        self.pools.get(&protocol)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionPool> {
        self.pools.values()
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        self.pools.values().map(ConnectionPool::stats).collect()
    }

    pub async fn shutdown(&self) {
        for pool in self.pools.values() {
            pool.shutdown().await;
        }
    }
}

/// A failure seen during a cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleError {
    pub meter_id: MeterId,
    /// Register range that failed, if the failure was tied to one.
    pub chunk: Option<(u16, u16)>,
    /// Points left without a reading this cycle. Empty for errors that were
    /// recovered from.
    pub points: Vec<Box<str>>,
    pub kind: ErrorKind,
    pub message: String,
    pub terminal: bool,
}

/// Outcome of one pass over every cached device.
#[derive(Debug, Clone, Serialize)]
pub struct CycleResult {
    pub started_at: jiff::Timestamp,
    pub duration: Duration,
    pub meters_processed: usize,
    pub readings_collected: usize,
    pub errors: Vec<CycleError>,
}

impl CycleResult {
    pub fn terminal_errors(&self) -> impl Iterator<Item = &CycleError> {
        self.errors.iter().filter(|e| e.terminal)
    }
}

#[derive(Debug, thiserror::Error)]
enum ReadError {
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl Classify for ReadError {
    fn kind(&self) -> ErrorKind {
        match self {
            ReadError::Driver(e) => e.kind(),
            ReadError::Pool(e) => e.kind(),
        }
    }
}

/// Maximal run of adjacent or overlapping points, read as one register range
/// split into chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    start: u32,
    end: u32,
    /// Indexes into the device's sorted point list.
    points: Range<usize>,
}

fn plan_segments(points: &[PointDefinition]) -> Vec<Segment> {
    let mut segments: Vec<Segment> = Vec::new();
    for (index, point) in points.iter().enumerate() {
        match segments.last_mut() {
            Some(last) if point.address as u32 <= last.end => {
                last.end = last.end.max(point.end());
                last.points.end = index + 1;
            }
            _ => segments.push(Segment {
                start: point.address as u32,
                end: point.end(),
                points: index..index + 1,
            }),
        }
    }
    segments
}

#[derive(Default)]
struct DeviceReport {
    readings: usize,
    errors: Vec<CycleError>,
}

/// Per-device state for one collection pass.
struct DeviceRead<'a> {
    device: &'a CachedDevice,
    pool: &'a ConnectionPool,
    conn: Mutex<Option<PooledConnection>>,
    retry_key: String,
    report: DeviceReport,
}

/// Polls every cached device each cycle and queues the readings.
pub struct CollectionOrchestrator<S> {
    store: S,
    registry: Arc<DeviceRegistryCache>,
    pools: ProtocolPools,
    retry: Arc<RetryCoordinator>,
    batch: Arc<BatchSizeController>,
    config: CollectionConfig,
}

impl<S: Clone> Clone for CollectionOrchestrator<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            registry: Arc::clone(&self.registry),
            pools: self.pools.clone(),
            retry: Arc::clone(&self.retry),
            batch: Arc::clone(&self.batch),
            config: self.config.clone(),
        }
    }
}

impl<S> CollectionOrchestrator<S>
where
    S: GatewayStore + Clone,
{
    pub fn new(
        store: S,
        registry: Arc<DeviceRegistryCache>,
        pools: ProtocolPools,
        retry: Arc<RetryCoordinator>,
        batch: Arc<BatchSizeController>,
        config: CollectionConfig,
    ) -> Self {
        Self {
            store,
            registry,
            pools,
            retry,
            batch,
            config,
        }
    }

    pub fn pools(&self) -> &ProtocolPools {
        &self.pools
    }

    /// Poll every device in the registry snapshot once.
    ///
    /// Devices are read concurrently. A failing device or point only adds to
    /// the error list; it never aborts the cycle.
    #[instrument(name = "collection_cycle", skip_all)]
    pub async fn run_cycle(&self) -> CycleResult {
        let started_at = jiff::Timestamp::now();
        let started = Instant::now();
        let devices = self.registry.get_all();

        let mut tasks = JoinSet::new();
        for device in &devices {
            let this = self.clone();
            let device = Arc::clone(device);
            tasks.spawn(async move { this.collect_device(&device).await });
        }

        let mut result = CycleResult {
            started_at,
            duration: Duration::ZERO,
            meters_processed: 0,
            readings_collected: 0,
            errors: Vec::new(),
        };

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => {
                    result.meters_processed += 1;
                    result.readings_collected += report.readings;
                    result.errors.extend(report.errors);
                }
                Err(e) => error!(error = %e, "Device collection task failed"),
            }
        }

        result.duration = started.elapsed();
        info!(
            meters = result.meters_processed,
            readings = result.readings_collected,
            errors = result.errors.len(),
            duration_ms = result.duration.as_millis() as u64,
            "Collection cycle finished"
        );
        result
    }

    #[instrument(name = "collect_device", skip_all, fields(meter_id = %device.id, name = %device.name))]
    async fn collect_device(&self, device: &CachedDevice) -> DeviceReport {
        let Some(pool) = self.pools.get(device.protocol) else {
            let error = DriverError::Unsupported(device.protocol);
            warn!(error = %error, "Skipping device");
            return DeviceReport {
                readings: 0,
                errors: vec![CycleError {
                    meter_id: device.id,
                    chunk: None,
                    points: device.points.iter().map(|p| p.name.clone()).collect(),
                    kind: error.kind(),
                    message: error.to_string(),
                    terminal: true,
                }],
            };
        };

        let mut read = DeviceRead {
            device,
            pool,
            conn: Mutex::new(None),
            retry_key: device.id.to_string(),
            report: DeviceReport::default(),
        };

        let mut readings = Vec::new();
        for segment in plan_segments(&device.points) {
            match self.read_segment(&mut read, &segment).await {
                Ok(words) => {
                    readings.extend(assemble_readings(device, &segment, &words));
                }
                Err(abort) => {
                    // The device is unusable for the rest of this cycle.
                    let remaining: Vec<Box<str>> = device.points[segment.points.start..]
                        .iter()
                        .map(|p| p.name.clone())
                        .collect();
                    read.report.errors.push(CycleError {
                        meter_id: device.id,
                        chunk: None,
                        points: remaining,
                        kind: abort.kind(),
                        message: abort.to_string(),
                        terminal: true,
                    });
                    break;
                }
            }
        }

        // Hand the session back before touching the store.
        drop(read.conn.into_inner());
        let mut report = read.report;

        let count = readings.len();
        if count > 0 {
            match self.store.insert_readings(readings).await {
                Ok(()) => report.readings = count,
                Err(e) => {
                    error!(error = %e, "Failed to queue readings");
                    report.errors.push(CycleError {
                        meter_id: device.id,
                        chunk: None,
                        points: Vec::new(),
                        kind: ErrorKind::UnknownError,
                        message: format!("failed to queue readings: {e}"),
                        terminal: true,
                    });
                }
            }
        }

        debug!(readings = report.readings, errors = report.errors.len(), "Device collected");
        report
    }

    /// Read one segment chunk by chunk. Registers that could not be read are
    /// `None`. Errors that make the device unusable end the read early.
    async fn read_segment(
        &self,
        read: &mut DeviceRead<'_>,
        segment: &Segment,
    ) -> Result<Vec<Option<u16>>, RetryError<ReadError>> {
        let device = read.device;
        let total = device.total_registers();
        let max_request = read.pool.max_registers_per_request().max(1) as usize;
        let mut words = vec![None; (segment.end - segment.start) as usize];
        let mut offset = segment.start;

        while offset < segment.end {
            let size = self.batch.batch_size(device.id, total).min(max_request).max(1);
            let count = (size as u32).min(segment.end - offset);
            let chunk = ChunkDescriptor::new(offset as u16, count as u16);

            let result = self.read_chunk(read, chunk).await;
            match result {
                Ok(values) => {
                    self.batch.record_success(device.id);
                    let base = (offset - segment.start) as usize;
                    for (slot, value) in words[base..].iter_mut().zip(values) {
                        *slot = Some(value);
                    }
                    offset += count;
                }
                Err(e) if e.kind() == ErrorKind::Timeout => {
                    // A chunk clipped to the segment end can be shorter than the
                    // meter size, so only the floor decides when to give up.
                    let floor = self.batch.min_size(device.id).unwrap_or(1);
                    let reduced = self.batch.record_timeout(device.id);
                    let terminal = reduced.is_none() || count as usize <= floor;
                    if terminal {
                        warn!(start = chunk.start, count = chunk.count, error = %e, "Chunk timed out at minimum size");
                    } else {
                        debug!(start = chunk.start, count = chunk.count, reduced, "Chunk timed out, splitting");
                    }
                    read.report.errors.push(chunk_error(device, segment, chunk, &e, terminal));
                    if terminal {
                        offset += count;
                    }
                }
                Err(e) if matches!(e.kind(), ErrorKind::ProtocolError | ErrorKind::InvalidRegister) => {
                    warn!(start = chunk.start, count = chunk.count, error = %e, "Chunk rejected by device");
                    read.report.errors.push(chunk_error(device, segment, chunk, &e, true));
                    offset += count;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(words)
    }

    async fn read_chunk(
        &self,
        read: &DeviceRead<'_>,
        chunk: ChunkDescriptor,
    ) -> Result<Vec<u16>, RetryError<ReadError>> {
        let conn = &read.conn;
        let pool = read.pool;
        let endpoint = &read.device.endpoint;
        let timeout = self.config.device_timeout();

        self.retry
            .run(&read.retry_key, READ_OPERATION, move || {
                read_once(conn, pool, endpoint, chunk, timeout)
            })
            .await
    }

    /// Run collection cycles every poll interval until cancelled, reloading
    /// the device registry every refresh interval.
    #[instrument(name = "collection_orchestrator", skip_all)]
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut refresh = tokio::time::interval(self.config.registry_refresh());
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            poll_interval_secs = self.config.poll_interval().as_secs(),
            registry_refresh_secs = self.config.registry_refresh().as_secs(),
            "Collection orchestrator started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = refresh.tick() => {
                    self.refresh_registry().await;
                    continue;
                }
                _ = interval.tick() => {}
            }

            if !self.registry.is_valid() {
                warn!("Device registry not loaded yet, skipping cycle");
                continue;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Collection cancelled mid-cycle");
                    break;
                }
                result = self.run_cycle() => {
                    for e in result.terminal_errors() {
                        warn!(meter_id = %e.meter_id, kind = %e.kind, error = %e.message, "Points not collected");
                    }
                }
            }
        }

        info!("Collection orchestrator shutting down");
    }

    /// Reload the registry from the store. A failed reload keeps the
    /// previous snapshot.
    pub async fn refresh_registry(&self) {
        if let Err(e) = self.registry.reload(&self.store).await {
            error!(error = %e, "Device registry reload failed, keeping previous snapshot");
        }
    }

    /// Drain every pool.
    pub async fn shutdown(&self) {
        self.pools.shutdown().await;
    }
}

/// One attempt at a chunk, opening a fresh session when the held one is
/// missing or broken.
async fn read_once(
    conn: &Mutex<Option<PooledConnection>>,
    pool: &ConnectionPool,
    endpoint: &DeviceEndpoint,
    chunk: ChunkDescriptor,
    timeout: Duration,
) -> Result<Vec<u16>, ReadError> {
    let mut slot = conn.lock().await;
    if slot.as_ref().is_none_or(PooledConnection::is_broken) {
        // Release a broken session before asking for a new one.
        *slot = None;
        *slot = Some(pool.acquire(endpoint).await?);
    }
    let Some(session) = slot.as_mut() else {
        return Err(ReadError::Driver(DriverError::Closed));
    };

    match tokio::time::timeout(timeout, session.read_points(chunk, timeout)).await {
        Ok(result) => Ok(result?),
        Err(_) => {
            // The response may still arrive; never reuse this session.
            session.mark_broken();
            Err(ReadError::Driver(DriverError::Timeout(timeout)))
        }
    }
}

fn chunk_error(
    device: &CachedDevice,
    segment: &Segment,
    chunk: ChunkDescriptor,
    error: &RetryError<ReadError>,
    terminal: bool,
) -> CycleError {
    let points = if terminal {
        device.points[segment.points.clone()]
            .iter()
            .filter(|p| (p.address as u32) < chunk.end() && p.end() > chunk.start as u32)
            .map(|p| p.name.clone())
            .collect()
    } else {
        Vec::new()
    };

    CycleError {
        meter_id: device.id,
        chunk: Some((chunk.start, chunk.count)),
        points,
        kind: error.kind(),
        message: error.to_string(),
        terminal,
    }
}

/// Build readings for every point of `segment` whose registers were all read.
fn assemble_readings(device: &CachedDevice, segment: &Segment, words: &[Option<u16>]) -> Vec<QueuedReading> {
    device.points[segment.points.clone()]
        .iter()
        .filter_map(|point| {
            let from = (point.address as u32 - segment.start) as usize;
            let raw: Option<Vec<u16>> = words
                .get(from..from + point.count as usize)?
                .iter()
                .copied()
                .collect();
            let value = combine_words(&raw?);
            Some(QueuedReading::new(device.id, point.name.clone(), value).with_unit(point.unit.clone()))
        })
        .collect()
}
