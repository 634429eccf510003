use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use meterlink_core::{CachedDevice, DeviceEndpoint, DeviceRecord, MeterId, PointDefinition};
use serde_json::Value;
use tracing::{info, warn};

use crate::driver::MODBUS_MAX_REGISTERS;
use crate::storage::GatewayStore;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PointMapError {
    #[error("point map is missing")]
    Missing,
    #[error("point map is not an object")]
    NotAnObject,
    #[error("point map is empty")]
    Empty,
    #[error("point {name}: {reason}")]
    InvalidPoint { name: String, reason: &'static str },
}

/// Parse a point map of the form
/// `{"voltage": {"address": 0, "count": 2, "unit": "V"}, ...}`.
///
/// `count` defaults to 1 and `unit` is optional. Points come back sorted by
/// address.
pub fn parse_point_map(map: Option<&Value>) -> Result<Vec<PointDefinition>, PointMapError> {
    let map = map.ok_or(PointMapError::Missing)?;
    let entries = map.as_object().ok_or(PointMapError::NotAnObject)?;
    if entries.is_empty() {
        return Err(PointMapError::Empty);
    }

    let mut points = Vec::with_capacity(entries.len());
    for (name, entry) in entries {
        let invalid = |reason| PointMapError::InvalidPoint {
            name: name.clone(),
            reason,
        };
        let entry = entry.as_object().ok_or_else(|| invalid("not an object"))?;

        let address = entry
            .get("address")
            .and_then(Value::as_u64)
            .ok_or_else(|| invalid("address must be a non-negative integer"))?;
        let address = u16::try_from(address).map_err(|_| invalid("address out of range"))?;

        let count = match entry.get("count") {
            None => 1,
            Some(count) => count
                .as_u64()
                .filter(|c| (1..=MODBUS_MAX_REGISTERS as u64).contains(c))
                .ok_or_else(|| invalid("count must be between 1 and 125"))?
                as u16,
        };
        if address as u32 + count as u32 > u16::MAX as u32 + 1 {
            return Err(invalid("register range exceeds address space"));
        }

        let unit = match entry.get("unit") {
            None | Some(Value::Null) => None,
            Some(Value::String(unit)) => Some(unit.as_str().into()),
            Some(_) => return Err(invalid("unit must be a string")),
        };

        points.push(PointDefinition {
            name: name.as_str().into(),
            address,
            count,
            unit,
        });
    }

    points.sort_by_key(|p| (p.address, p.count));
    Ok(points)
}

/// Turn a store record into a cache entry, validating its point map.
pub fn cache_device(record: &DeviceRecord) -> Result<CachedDevice, PointMapError> {
    let points = parse_point_map(record.point_map.as_ref())?;
    Ok(CachedDevice {
        id: record.id,
        name: record.name.clone(),
        endpoint: DeviceEndpoint::new(record.host.clone(), record.port, record.unit_id),
        protocol: record.protocol,
        points: points.into_boxed_slice(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadReport {
    pub loaded: usize,
    pub discarded: usize,
}

#[derive(Default)]
struct Snapshot {
    devices: Vec<Arc<CachedDevice>>,
    by_id: HashMap<MeterId, Arc<CachedDevice>>,
    loaded_at: Option<jiff::Timestamp>,
}

/// In-memory mirror of the active devices in the store.
///
/// Readers see an immutable snapshot; [`reload`](Self::reload) builds a new
/// one and swaps it in atomically.
pub struct DeviceRegistryCache {
    snapshot: ArcSwap<Snapshot>,
}

impl Default for DeviceRegistryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistryCache {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Snapshot::default()),
        }
    }

    pub async fn reload<S: GatewayStore>(&self, store: &S) -> Result<ReloadReport, S::Error> {
        let records = store.active_devices().await?;

        let mut devices = Vec::with_capacity(records.len());
        let mut discarded = 0;
        for record in &records {
            match cache_device(record) {
                Ok(device) => devices.push(Arc::new(device)),
                Err(e) => {
                    warn!(meter_id = %record.id, name = %record.name, error = %e, "Discarding device with invalid point map");
                    discarded += 1;
                }
            }
        }

        let by_id = devices.iter().map(|d| (d.id, Arc::clone(d))).collect();
        let report = ReloadReport {
            loaded: devices.len(),
            discarded,
        };

        self.snapshot.store(Arc::new(Snapshot {
            devices,
            by_id,
            loaded_at: Some(jiff::Timestamp::now()),
        }));

        info!(loaded = report.loaded, discarded, "Device registry reloaded");
        Ok(report)
    }

    pub fn get_all(&self) -> Vec<Arc<CachedDevice>> {
        self.snapshot.load().devices.clone()
    }

    pub fn get_by_id(&self, id: MeterId) -> Option<Arc<CachedDevice>> {
        self.snapshot.load().by_id.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// At least one reload has succeeded.
    pub fn is_valid(&self) -> bool {
        self.snapshot.load().loaded_at.is_some()
    }

    pub fn loaded_at(&self) -> Option<jiff::Timestamp> {
        self.snapshot.load().loaded_at
    }
}
