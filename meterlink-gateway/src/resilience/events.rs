use std::time::Duration;

use serde::Serialize;

use super::ErrorKind;

/// Notification published by the retry path.
#[derive(Debug, Clone, Serialize)]
pub struct ResilienceEvent {
    pub device_id: String,
    pub at: jiff::Timestamp,
    pub kind: ResilienceEventKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResilienceEventKind {
    /// An attempt failed and another follows after `delay`.
    RetryScheduled {
        operation: String,
        attempt: u32,
        delay: Duration,
        error: ErrorKind,
    },
    CircuitOpened,
    CircuitHalfOpen,
    CircuitClosed,
}

impl ResilienceEvent {
    pub fn new(device_id: &str, kind: ResilienceEventKind) -> Self {
        Self {
            device_id: device_id.to_string(),
            at: jiff::Timestamp::now(),
            kind,
        }
    }
}
