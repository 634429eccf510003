use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use meterlink_core::{DeviceRecord, MeterId, Protocol, QueuedReading, ReadingId};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::warn;
use ulid::Ulid;

use super::{GatewayStore, SyncLogEntry, retention_cutoff_ms};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, thiserror::Error)]
pub enum SqliteStoreError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(i64),
}

/// SQLite-backed store; survives restarts, so queued readings do too.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens or creates a SQLite database at the given path.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, SqliteStoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }
}

fn protocol_name(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::ModbusTcp => "modbus_tcp",
        Protocol::Bacnet => "bacnet",
    }
}

fn parse_protocol(name: &str) -> Option<Protocol> {
    match name {
        "modbus_tcp" => Some(Protocol::ModbusTcp),
        "bacnet" => Some(Protocol::Bacnet),
        _ => None,
    }
}

fn parse_ulid(value: String) -> Result<Ulid, SqliteStoreError> {
    Ulid::from_str(&value).map_err(|_| SqliteStoreError::InvalidUlid(value))
}

fn map_row_to_device(r: &SqliteRow) -> Result<Option<DeviceRecord>, SqliteStoreError> {
    let id = MeterId(parse_ulid(r.try_get("id")?)?);

    let protocol_str: String = r.try_get("protocol")?;
    let Some(protocol) = parse_protocol(&protocol_str) else {
        warn!(meter_id = %id, protocol = %protocol_str, "Skipping device with unknown protocol");
        return Ok(None);
    };

    // Unparseable JSON is kept as a string so the registry rejects it.
    let point_map: Option<String> = r.try_get("point_map")?;
    let point_map = point_map.map(|raw| {
        serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw))
    });

    let name: String = r.try_get("name")?;
    let host: String = r.try_get("host")?;
    let port: i64 = r.try_get("port")?;
    let unit_id: i64 = r.try_get("unit_id")?;
    let active: bool = r.try_get("active")?;

    Ok(Some(DeviceRecord {
        id,
        name: name.into(),
        host: host.into(),
        port: port as u16,
        unit_id: unit_id as u8,
        protocol,
        active,
        point_map,
    }))
}

fn map_row_to_reading(r: &SqliteRow) -> Result<QueuedReading, SqliteStoreError> {
    let id = ReadingId(parse_ulid(r.try_get("id")?)?);
    let meter_id = MeterId(parse_ulid(r.try_get("meter_id")?)?);

    let timestamp_ms: i64 = r.try_get("timestamp")?;
    let timestamp = jiff::Timestamp::from_millisecond(timestamp_ms)
        .map_err(|_| SqliteStoreError::InvalidTimestamp(timestamp_ms))?;

    let data_point: String = r.try_get("data_point")?;
    let unit: Option<String> = r.try_get("unit")?;
    let retry_count: i64 = r.try_get("retry_count")?;

    Ok(QueuedReading {
        id,
        meter_id,
        timestamp,
        data_point: data_point.into(),
        value: r.try_get("value")?,
        unit: unit.map(Into::into),
        is_synchronized: r.try_get("is_synchronized")?,
        retry_count: retry_count.clamp(0, u32::MAX as i64) as u32,
    })
}

/// Bind `ids` as a parenthesized `IN` list.
fn push_id_list<'a, T: std::fmt::Display>(builder: &mut QueryBuilder<'a, Sqlite>, ids: &[T]) {
    builder.push(" (");
    let mut separated = builder.separated(", ");
    for id in ids {
        separated.push_bind(id.to_string());
    }
    separated.push_unseparated(")");
}

#[async_trait]
impl GatewayStore for SqliteStore {
    type Error = SqliteStoreError;

    async fn active_devices(&self) -> Result<Vec<DeviceRecord>, Self::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, host, port, unit_id, protocol, active, point_map
            FROM devices WHERE active = 1 ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut devices = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(device) = map_row_to_device(row)? {
                devices.push(device);
            }
        }
        Ok(devices)
    }

    async fn upsert_device(&self, device: DeviceRecord) -> Result<(), Self::Error> {
        let point_map = device.point_map.as_ref().map(|v| v.to_string());

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO devices (id, name, host, port, unit_id, protocol, active, point_map)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(device.id.0.to_string())
        .bind(device.name.as_ref())
        .bind(device.host.as_ref())
        .bind(device.port as i64)
        .bind(device.unit_id as i64)
        .bind(protocol_name(device.protocol))
        .bind(device.active)
        .bind(point_map)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_reading(&self, reading: QueuedReading) -> Result<(), Self::Error> {
        self.insert_readings(vec![reading]).await
    }

    async fn insert_readings(&self, readings: Vec<QueuedReading>) -> Result<(), Self::Error> {
        if readings.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for reading in readings {
            sqlx::query(
                r#"
                INSERT INTO readings (id, meter_id, timestamp, data_point, value, unit, is_synchronized, retry_count)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(reading.id.0.to_string())
            .bind(reading.meter_id.0.to_string())
            .bind(reading.timestamp.as_millisecond())
            .bind(reading.data_point.as_ref())
            .bind(reading.value)
            .bind(reading.unit.as_deref())
            .bind(reading.is_synchronized)
            .bind(reading.retry_count as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn unsynchronized_readings(
        &self,
        limit: usize,
    ) -> Result<Vec<QueuedReading>, Self::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, meter_id, timestamp, data_point, value, unit, is_synchronized, retry_count
            FROM readings
            WHERE is_synchronized = 0
            ORDER BY timestamp ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_row_to_reading).collect()
    }

    async fn mark_synchronized(&self, ids: &[ReadingId]) -> Result<(), Self::Error> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut builder = QueryBuilder::<Sqlite>::new(
            "UPDATE readings SET is_synchronized = 1 WHERE id IN",
        );
        push_id_list(&mut builder, ids);
        builder.build().execute(&self.pool).await?;

        Ok(())
    }

    async fn increment_retry_count(&self, ids: &[ReadingId]) -> Result<(), Self::Error> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut builder = QueryBuilder::<Sqlite>::new(
            "UPDATE readings SET retry_count = retry_count + 1 WHERE id IN",
        );
        push_id_list(&mut builder, ids);
        builder.build().execute(&self.pool).await?;

        Ok(())
    }

    async fn log_sync_operation(
        &self,
        batch_size: usize,
        success: bool,
        error: Option<&str>,
    ) -> Result<(), Self::Error> {
        sqlx::query("INSERT INTO sync_log (at, batch_size, success, error) VALUES (?, ?, ?, ?)")
            .bind(jiff::Timestamp::now().as_millisecond())
            .bind(batch_size as i64)
            .bind(success)
            .bind(error)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn sync_log(&self, limit: usize) -> Result<Vec<SyncLogEntry>, Self::Error> {
        let rows = sqlx::query(
            "SELECT at, batch_size, success, error FROM sync_log ORDER BY id DESC LIMIT ?",
        )
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| -> Result<SyncLogEntry, SqliteStoreError> {
                let at_ms: i64 = r.try_get("at")?;
                let at = jiff::Timestamp::from_millisecond(at_ms)
                    .map_err(|_| SqliteStoreError::InvalidTimestamp(at_ms))?;
                let batch_size: i64 = r.try_get("batch_size")?;
                Ok(SyncLogEntry {
                    at,
                    batch_size: batch_size.max(0) as usize,
                    success: r.try_get("success")?,
                    error: r.try_get("error")?,
                })
            })
            .collect()
    }

    async fn pending_count(&self) -> Result<usize, Self::Error> {
        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM readings WHERE is_synchronized = 0")
            .fetch_one(&self.pool)
            .await?
            .try_get("n")?;

        Ok(count.max(0) as usize)
    }

    async fn cleanup_synchronized(&self, older_than: Duration) -> Result<usize, Self::Error> {
        let result =
            sqlx::query("DELETE FROM readings WHERE is_synchronized = 1 AND timestamp < ?")
                .bind(retention_cutoff_ms(older_than))
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() as usize)
    }
}
