use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

// We use `Box<str>` and `Box<[T]>` for structures that don't need to be
// dynamically sized. This helps us keep allocations compact and avoid
// accidental cloning of large values.
type BoxStr = Box<str>;
type BoxList<T> = Box<[T]>;

/// Unique identifier for a configured meter (one polled field device).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MeterId(pub Ulid);

/// Unique identifier for a queued reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReadingId(pub Ulid);

/// Unique identifier for the gateway itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GatewayId(pub Ulid);

/// Unique identifier for an upload batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchId(pub Ulid);

impl fmt::Display for MeterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for ReadingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Network identity of a field device. Pooled connections are keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceEndpoint {
    pub host: BoxStr,
    pub port: u16,
    /// Modbus unit (slave) id, or the BACnet device instance low byte.
    pub unit_id: u8,
}

impl DeviceEndpoint {
    pub fn new(host: impl Into<BoxStr>, port: u16, unit_id: u8) -> Self {
        Self {
            host: host.into(),
            port,
            unit_id,
        }
    }

    /// Identity string used as the pool key: `host:port:unit`.
    pub fn pool_key(&self) -> String {
        format!("{}:{}:{}", self.host, self.port, self.unit_id)
    }

    /// `host:port`, suitable for dialing.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for DeviceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.port, self.unit_id)
    }
}

/// Field protocol spoken by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    ModbusTcp,
    Bacnet,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::ModbusTcp => f.write_str("modbus_tcp"),
            Protocol::Bacnet => f.write_str("bacnet"),
        }
    }
}

/// A device row as stored by the configuration store.
///
/// The point map is kept untyped here; it is validated when the registry
/// cache turns records into [`CachedDevice`] snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: MeterId,
    pub name: BoxStr,
    pub host: BoxStr,
    pub port: u16,
    pub unit_id: u8,
    pub protocol: Protocol,
    pub active: bool,
    pub point_map: Option<serde_json::Value>,
}

/// One named register range on a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointDefinition {
    /// Data point name, e.g. `active_energy_import`.
    pub name: BoxStr,
    /// First register address.
    pub address: u16,
    /// Number of consecutive registers that make up the point.
    pub count: u16,
    /// Engineering unit label carried through to the reading.
    pub unit: Option<BoxStr>,
}

impl PointDefinition {
    /// One past the last register address covered by this point.
    pub fn end(&self) -> u32 {
        self.address as u32 + self.count as u32
    }
}

/// Immutable snapshot of a device's configuration.
#[derive(Debug, Clone, Serialize)]
pub struct CachedDevice {
    pub id: MeterId,
    pub name: BoxStr,
    pub endpoint: DeviceEndpoint,
    pub protocol: Protocol,
    /// Points sorted by register address.
    pub points: BoxList<PointDefinition>,
}

impl CachedDevice {
    /// Total registers this device exposes across all points.
    pub fn total_registers(&self) -> usize {
        self.points.iter().map(|p| p.count as usize).sum()
    }
}

/// A reading waiting (or no longer waiting) to be forwarded upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedReading {
    pub id: ReadingId,
    pub meter_id: MeterId,
    pub timestamp: jiff::Timestamp,
    pub data_point: BoxStr,
    pub value: f64,
    pub unit: Option<BoxStr>,
    pub is_synchronized: bool,
    pub retry_count: u32,
}

impl QueuedReading {
    /// A fresh, unsynchronized reading taken now.
    pub fn new(meter_id: MeterId, data_point: impl Into<BoxStr>, value: f64) -> Self {
        Self {
            id: ReadingId(Ulid::new()),
            meter_id,
            timestamp: jiff::Timestamp::now(),
            data_point: data_point.into(),
            value,
            unit: None,
            is_synchronized: false,
            retry_count: 0,
        }
    }

    pub fn with_unit(mut self, unit: Option<BoxStr>) -> Self {
        self.unit = unit;
        self
    }
}

/// A batch of readings sent to the central system in one call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadBatch {
    /// Unique id for this batch.
    pub id: BatchId,
    /// Gateway that created and is uploading this batch.
    pub gateway_id: GatewayId,
    /// Readings included in this batch, oldest first.
    pub readings: BoxList<QueuedReading>,
    /// Timestamp when the batch was assembled.
    pub timestamp: jiff::Timestamp,
}

/// The central system's verdict on a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub success: bool,
    pub records_processed: usize,
    #[serde(default)]
    pub message: Option<String>,
}

/// Link state towards the central system.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectivityStatus {
    pub is_connected: bool,
    pub last_check_at: Option<jiff::Timestamp>,
    pub last_success_at: Option<jiff::Timestamp>,
    pub last_failure_at: Option<jiff::Timestamp>,
    pub consecutive_failures: u32,
    pub uptime_seconds: u64,
    pub downtime_seconds: u64,
}

/// Snapshot of the uploader, as exposed by the status endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UploadStatus {
    pub is_running: bool,
    pub last_upload_at: Option<jiff::Timestamp>,
    pub last_success: Option<bool>,
    pub last_error: Option<String>,
    pub queue_size: usize,
    pub total_uploaded: u64,
    pub total_failed: u64,
    pub is_remote_connected: bool,
}
