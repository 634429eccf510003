use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use meterlink_core::{DeviceRecord, MeterId, QueuedReading, ReadingId};

use super::{GatewayStore, SyncLogEntry, retention_cutoff_ms};
use crate::util::lock_or_recover;

/// In-memory store.
/// This is primarily intended for testing and for running the gateway
/// without a database file.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    devices: HashMap<MeterId, DeviceRecord>,
    readings: HashMap<ReadingId, QueuedReading>,
    sync_log: Vec<SyncLogEntry>,
}

#[derive(Debug, thiserror::Error)]
pub enum MemoryStoreError {
    #[error("reading {0} already stored")]
    DuplicateReading(ReadingId),
}

#[async_trait]
impl GatewayStore for MemoryStore {
    type Error = MemoryStoreError;

    async fn active_devices(&self) -> Result<Vec<DeviceRecord>, Self::Error> {
        let inner = lock_or_recover(&self.inner);
        let mut devices: Vec<_> = inner
            .devices
            .values()
            .filter(|d| d.active)
            .cloned()
            .collect();
        devices.sort_by_key(|d| d.id);
        Ok(devices)
    }

    async fn upsert_device(&self, device: DeviceRecord) -> Result<(), Self::Error> {
        lock_or_recover(&self.inner).devices.insert(device.id, device);
        Ok(())
    }

    async fn insert_reading(&self, reading: QueuedReading) -> Result<(), Self::Error> {
        self.insert_readings(vec![reading]).await
    }

    async fn insert_readings(&self, readings: Vec<QueuedReading>) -> Result<(), Self::Error> {
        let mut inner = lock_or_recover(&self.inner);
        if let Some(dup) = readings.iter().find(|r| inner.readings.contains_key(&r.id)) {
            return Err(MemoryStoreError::DuplicateReading(dup.id));
        }
        for reading in readings {
            inner.readings.insert(reading.id, reading);
        }
        Ok(())
    }

    async fn unsynchronized_readings(
        &self,
        limit: usize,
    ) -> Result<Vec<QueuedReading>, Self::Error> {
        let inner = lock_or_recover(&self.inner);
        let mut pending: Vec<_> = inner
            .readings
            .values()
            .filter(|r| !r.is_synchronized)
            .cloned()
            .collect();
        pending.sort_by_key(|r| (r.timestamp, r.id));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn mark_synchronized(&self, ids: &[ReadingId]) -> Result<(), Self::Error> {
        let mut inner = lock_or_recover(&self.inner);
        for id in ids {
            if let Some(reading) = inner.readings.get_mut(id) {
                reading.is_synchronized = true;
            }
        }
        Ok(())
    }

    async fn increment_retry_count(&self, ids: &[ReadingId]) -> Result<(), Self::Error> {
        let mut inner = lock_or_recover(&self.inner);
        for id in ids {
            if let Some(reading) = inner.readings.get_mut(id) {
                reading.retry_count = reading.retry_count.saturating_add(1);
            }
        }
        Ok(())
    }

    async fn log_sync_operation(
        &self,
        batch_size: usize,
        success: bool,
        error: Option<&str>,
    ) -> Result<(), Self::Error> {
        lock_or_recover(&self.inner).sync_log.push(SyncLogEntry {
            at: jiff::Timestamp::now(),
            batch_size,
            success,
            error: error.map(str::to_string),
        });
        Ok(())
    }

    async fn sync_log(&self, limit: usize) -> Result<Vec<SyncLogEntry>, Self::Error> {
        let inner = lock_or_recover(&self.inner);
        Ok(inner.sync_log.iter().rev().take(limit).cloned().collect())
    }

    async fn pending_count(&self) -> Result<usize, Self::Error> {
        let inner = lock_or_recover(&self.inner);
        Ok(inner.readings.values().filter(|r| !r.is_synchronized).count())
    }

    async fn cleanup_synchronized(&self, older_than: Duration) -> Result<usize, Self::Error> {
        let cutoff = retention_cutoff_ms(older_than);
        let mut inner = lock_or_recover(&self.inner);
        let before = inner.readings.len();
        inner
            .readings
            .retain(|_, r| !(r.is_synchronized && r.timestamp.as_millisecond() < cutoff));
        Ok(before - inner.readings.len())
    }
}
