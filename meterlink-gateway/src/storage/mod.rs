pub mod memory;
pub mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use meterlink_core::{DeviceRecord, QueuedReading, ReadingId};
use serde::Serialize;

pub use memory::{MemoryStore, MemoryStoreError};
pub use sqlite::{SqliteStore, SqliteStoreError};

/// Local persistence for device configuration and the reading queue.
///
/// Readings are only ever flipped to synchronized or have their retry count
/// bumped by the uploader. Deleting them is left to
/// [`cleanup_synchronized`](GatewayStore::cleanup_synchronized).
#[async_trait]
pub trait GatewayStore: Send + Sync + 'static {
    /// Error type specific to this storage implementation
    type Error: std::error::Error + Send + Sync + 'static;

    /// All devices flagged active.
    async fn active_devices(&self) -> Result<Vec<DeviceRecord>, Self::Error>;

    /// Insert or replace a device by id.
    async fn upsert_device(&self, device: DeviceRecord) -> Result<(), Self::Error>;

    async fn insert_reading(&self, reading: QueuedReading) -> Result<(), Self::Error>;

    /// Insert many readings at once.
    async fn insert_readings(&self, readings: Vec<QueuedReading>) -> Result<(), Self::Error>;

    /// Up to `limit` unsynchronized readings, oldest first.
    async fn unsynchronized_readings(&self, limit: usize)
    -> Result<Vec<QueuedReading>, Self::Error>;

    /// Flag readings as accepted upstream. Unknown or already synchronized
    /// ids are ignored.
    async fn mark_synchronized(&self, ids: &[ReadingId]) -> Result<(), Self::Error>;

    async fn increment_retry_count(&self, ids: &[ReadingId]) -> Result<(), Self::Error>;

    /// Append an entry to the upload audit log.
    async fn log_sync_operation(
        &self,
        batch_size: usize,
        success: bool,
        error: Option<&str>,
    ) -> Result<(), Self::Error>;

    /// Most recent audit log entries, newest first.
    async fn sync_log(&self, limit: usize) -> Result<Vec<SyncLogEntry>, Self::Error>;

    /// Number of readings still waiting for upload.
    async fn pending_count(&self) -> Result<usize, Self::Error>;

    /// Delete synchronized readings taken more than `older_than` ago.
    async fn cleanup_synchronized(&self, older_than: Duration) -> Result<usize, Self::Error>;
}

/// One upload attempt as recorded in the audit log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncLogEntry {
    pub at: jiff::Timestamp,
    pub batch_size: usize,
    pub success: bool,
    pub error: Option<String>,
}

/// Millisecond cutoff for retention cleanup.
fn retention_cutoff_ms(older_than: Duration) -> i64 {
    let older_than = older_than.as_millis().min(i64::MAX as u128) as i64;
    jiff::Timestamp::now().as_millisecond().saturating_sub(older_than)
}
