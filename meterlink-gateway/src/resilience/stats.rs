use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::Serialize;

use super::ErrorKind;

/// Capacity of the recent-error ring buffer.
pub const RECENT_ERRORS_CAPACITY: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub at: jiff::Timestamp,
    pub device_id: String,
    pub operation: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// Process-wide failure counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorStatistics {
    pub total_count: u64,
    pub count_by_kind: BTreeMap<ErrorKind, u64>,
    pub count_by_device: HashMap<String, u64>,
    pub recent: VecDeque<ErrorRecord>,
}

impl ErrorStatistics {
    pub fn record(&mut self, device_id: &str, operation: &str, kind: ErrorKind, message: String) {
        self.total_count += 1;
        *self.count_by_kind.entry(kind).or_default() += 1;
        *self.count_by_device.entry(device_id.to_string()).or_default() += 1;

        if self.recent.len() == RECENT_ERRORS_CAPACITY {
            self.recent.pop_front();
        }
        self.recent.push_back(ErrorRecord {
            at: jiff::Timestamp::now(),
            device_id: device_id.to_string(),
            operation: operation.to_string(),
            kind,
            message,
        });
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_keeps_latest_hundred() {
        let mut stats = ErrorStatistics::default();
        for i in 0..150 {
            stats.record("m1", "read", ErrorKind::Timeout, format!("error {i}"));
        }

        assert_eq!(stats.total_count, 150);
        assert_eq!(stats.recent.len(), RECENT_ERRORS_CAPACITY);
        assert_eq!(stats.recent.front().unwrap().message, "error 50");
        assert_eq!(stats.recent.back().unwrap().message, "error 149");
    }

    #[test]
    fn counts_by_kind_and_device() {
        let mut stats = ErrorStatistics::default();
        stats.record("m1", "read", ErrorKind::Timeout, "t".into());
        stats.record("m2", "read", ErrorKind::Timeout, "t".into());
        stats.record("m2", "read", ErrorKind::ProtocolError, "p".into());

        assert_eq!(stats.count_by_kind[&ErrorKind::Timeout], 2);
        assert_eq!(stats.count_by_kind[&ErrorKind::ProtocolError], 1);
        assert_eq!(stats.count_by_device["m2"], 2);

        stats.reset();
        assert_eq!(stats.total_count, 0);
        assert!(stats.recent.is_empty());
    }
}
