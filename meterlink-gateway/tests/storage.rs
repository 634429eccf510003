use std::time::Duration;

use meterlink_core::{DeviceRecord, MeterId, Protocol, QueuedReading};
use meterlink_gateway::GatewayStore;
use meterlink_gateway::storage::{MemoryStore, MemoryStoreError, SqliteStore, SqliteStoreError};
use serde_json::json;
use tempfile::NamedTempFile;
use ulid::Ulid;

fn dummy_device(active: bool) -> DeviceRecord {
    DeviceRecord {
        id: MeterId(Ulid::new()),
        name: "feeder 3".into(),
        host: "10.0.0.30".into(),
        port: 502,
        unit_id: 4,
        protocol: Protocol::ModbusTcp,
        active,
        point_map: Some(json!({ "power": { "address": 100, "count": 2, "unit": "kW" } })),
    }
}

fn reading_at(meter_id: MeterId, millis_ago: i64) -> QueuedReading {
    let mut reading = QueuedReading::new(meter_id, "power", 42.5).with_unit(Some("kW".into()));
    reading.timestamp = jiff::Timestamp::from_millisecond(
        jiff::Timestamp::now().as_millisecond() - millis_ago,
    )
    .unwrap();
    reading
}

/// memory store tests
#[tokio::test]
async fn memory_reading_lifecycle() -> Result<(), MemoryStoreError> {
    let store = MemoryStore::default();
    let meter = MeterId(Ulid::new());

    let reading = reading_at(meter, 0);
    let reading_id = reading.id;
    store.insert_reading(reading).await?;
    assert_eq!(store.pending_count().await?, 1);

    store.mark_synchronized(&[reading_id]).await?;
    assert_eq!(store.pending_count().await?, 0);
    assert!(store.unsynchronized_readings(10).await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn memory_pending_readings_are_oldest_first() -> Result<(), MemoryStoreError> {
    let store = MemoryStore::default();
    let meter = MeterId(Ulid::new());

    let newest = reading_at(meter, 0);
    let oldest = reading_at(meter, 20_000);
    let middle = reading_at(meter, 10_000);
    let expected = [oldest.id, middle.id];
    store.insert_readings(vec![newest, oldest, middle]).await?;

    let pending = store.unsynchronized_readings(2).await?;
    let ids: Vec<_> = pending.iter().map(|r| r.id).collect();
    assert_eq!(ids, expected);

    Ok(())
}

#[tokio::test]
async fn memory_marking_twice_is_harmless() -> Result<(), MemoryStoreError> {
    let store = MemoryStore::default();
    let meter = MeterId(Ulid::new());

    let first = reading_at(meter, 0);
    let second = reading_at(meter, 0);
    let first_id = first.id;
    store.insert_readings(vec![first, second]).await?;

    store.mark_synchronized(&[first_id]).await?;
    store.mark_synchronized(&[first_id]).await?;
    assert_eq!(store.pending_count().await?, 1);

    Ok(())
}

#[tokio::test]
async fn memory_rejects_duplicate_readings() -> Result<(), MemoryStoreError> {
    let store = MemoryStore::default();
    let reading = reading_at(MeterId(Ulid::new()), 0);

    store.insert_reading(reading.clone()).await?;
    let err = store.insert_reading(reading).await.unwrap_err();
    assert!(matches!(err, MemoryStoreError::DuplicateReading(_)));
    assert_eq!(store.pending_count().await?, 1);

    Ok(())
}

#[tokio::test]
async fn memory_cleanup_only_touches_old_synchronized() -> Result<(), MemoryStoreError> {
    let store = MemoryStore::default();
    let meter = MeterId(Ulid::new());

    let old_synced = reading_at(meter, 3_600_000);
    let old_pending = reading_at(meter, 3_600_000);
    let fresh_synced = reading_at(meter, 0);
    let synced = [old_synced.id, fresh_synced.id];
    store
        .insert_readings(vec![old_synced, old_pending, fresh_synced])
        .await?;
    store.mark_synchronized(&synced).await?;

    let deleted = store.cleanup_synchronized(Duration::from_secs(60)).await?;
    assert_eq!(deleted, 1);
    assert_eq!(store.pending_count().await?, 1);

    Ok(())
}

/// sqlite store tests
#[tokio::test]
async fn sqlite_reading_lifecycle() -> Result<(), SqliteStoreError> {
    let temp_file = NamedTempFile::new().unwrap();
    let store = SqliteStore::new(temp_file.path()).await?;
    let meter = MeterId(Ulid::new());

    let reading = reading_at(meter, 0);
    let reading_id = reading.id;
    store.insert_reading(reading).await?;

    let pending = store.unsynchronized_readings(10).await?;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, reading_id);
    assert_eq!(pending[0].meter_id, meter);
    assert_eq!(pending[0].value, 42.5);
    assert_eq!(pending[0].unit.as_deref(), Some("kW"));
    assert_eq!(pending[0].retry_count, 0);

    store.mark_synchronized(&[reading_id]).await?;
    store.mark_synchronized(&[reading_id]).await?;
    assert_eq!(store.pending_count().await?, 0);

    Ok(())
}

#[tokio::test]
async fn sqlite_retry_counts_accumulate() -> Result<(), SqliteStoreError> {
    let temp_file = NamedTempFile::new().unwrap();
    let store = SqliteStore::new(temp_file.path()).await?;
    let meter = MeterId(Ulid::new());

    let readings = vec![reading_at(meter, 2_000), reading_at(meter, 1_000)];
    let ids: Vec<_> = readings.iter().map(|r| r.id).collect();
    store.insert_readings(readings).await?;

    store.increment_retry_count(&ids).await?;
    store.increment_retry_count(&ids[..1]).await?;

    let pending = store.unsynchronized_readings(10).await?;
    assert_eq!(pending[0].id, ids[0]);
    assert_eq!(pending[0].retry_count, 2);
    assert_eq!(pending[1].retry_count, 1);

    Ok(())
}

#[tokio::test]
async fn sqlite_persistence_across_instances() -> Result<(), SqliteStoreError> {
    let temp_file = NamedTempFile::new().unwrap();
    let meter = MeterId(Ulid::new());

    {
        let store = SqliteStore::new(temp_file.path()).await?;
        store.insert_readings(vec![reading_at(meter, 0), reading_at(meter, 0)]).await?;
    }

    let store = SqliteStore::new(temp_file.path()).await?;
    assert_eq!(store.pending_count().await?, 2);

    Ok(())
}

#[tokio::test]
async fn sqlite_empty_ids_handling() -> Result<(), SqliteStoreError> {
    let temp_file = NamedTempFile::new().unwrap();
    let store = SqliteStore::new(temp_file.path()).await?;

    store.mark_synchronized(&[]).await?;
    store.increment_retry_count(&[]).await?;
    store.insert_readings(Vec::new()).await?;
    assert_eq!(store.pending_count().await?, 0);

    Ok(())
}

#[tokio::test]
async fn sqlite_devices_round_trip_active_only() -> Result<(), SqliteStoreError> {
    let temp_file = NamedTempFile::new().unwrap();
    let store = SqliteStore::new(temp_file.path()).await?;

    let active = dummy_device(true);
    let active_id = active.id;
    store.upsert_device(active).await?;
    store.upsert_device(dummy_device(false)).await?;

    let devices = store.active_devices().await?;
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].id, active_id);
    assert_eq!(devices[0].unit_id, 4);
    assert_eq!(devices[0].point_map.as_ref().unwrap()["power"]["address"], 100);

    // Upsert replaces in place.
    let mut renamed = devices[0].clone();
    renamed.name = "feeder 3b".into();
    store.upsert_device(renamed).await?;
    let devices = store.active_devices().await?;
    assert_eq!(devices.len(), 1);
    assert_eq!(&*devices[0].name, "feeder 3b");

    Ok(())
}

#[tokio::test]
async fn sqlite_sync_log_is_newest_first() -> Result<(), SqliteStoreError> {
    let temp_file = NamedTempFile::new().unwrap();
    let store = SqliteStore::new(temp_file.path()).await?;

    store.log_sync_operation(10, true, None).await?;
    store.log_sync_operation(7, false, Some("connection refused")).await?;

    let log = store.sync_log(10).await?;
    assert_eq!(log.len(), 2);
    assert!(!log[0].success);
    assert_eq!(log[0].batch_size, 7);
    assert_eq!(log[0].error.as_deref(), Some("connection refused"));
    assert!(log[1].success);

    Ok(())
}

#[tokio::test]
async fn sqlite_cleanup_only_touches_old_synchronized() -> Result<(), SqliteStoreError> {
    let temp_file = NamedTempFile::new().unwrap();
    let store = SqliteStore::new(temp_file.path()).await?;
    let meter = MeterId(Ulid::new());

    let old_synced = reading_at(meter, 3_600_000);
    let old_pending = reading_at(meter, 3_600_000);
    let synced = [old_synced.id];
    store.insert_readings(vec![old_synced, old_pending]).await?;
    store.mark_synchronized(&synced).await?;

    assert_eq!(store.cleanup_synchronized(Duration::from_secs(60)).await?, 1);
    assert_eq!(store.pending_count().await?, 1);

    Ok(())
}
