use dashmap::DashMap;
use meterlink_core::MeterId;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{BatchConfig, InitialBatchSize};

/// Adaptive chunk size of one meter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSizeState {
    pub meter_id: MeterId,
    pub current_size: usize,
    pub total_registers: usize,
    pub consecutive_successes: u32,
    pub consecutive_timeouts: u32,
    pub last_successful_size: Option<usize>,
    pub last_updated_at: jiff::Timestamp,
    /// Lower bound for this meter: the configured minimum, or the meter's
    /// register total when that is smaller.
    min_size: usize,
}

/// Per-meter request sizing.
///
/// Sizes only ever shrink: a timeout cuts the chunk by the reduction
/// factor, a success keeps it. Growing back requires [`reset`](Self::reset).
pub struct BatchSizeController {
    config: BatchConfig,
    states: DashMap<MeterId, BatchSizeState>,
}

impl BatchSizeController {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            states: DashMap::new(),
        }
    }

    /// Current chunk size for `meter_id`, initializing it on first use.
    pub fn batch_size(&self, meter_id: MeterId, total_registers: usize) -> usize {
        self.states
            .entry(meter_id)
            .or_insert_with(|| self.initial_state(meter_id, total_registers))
            .current_size
    }

    fn initial_state(&self, meter_id: MeterId, total_registers: usize) -> BatchSizeState {
        let total = total_registers.max(1);
        let min_size = self.config.min_batch_size.max(1).min(total);
        let initial = match self.config.initial_batch_size {
            InitialBatchSize::All(_) => total,
            InitialBatchSize::Size(size) => size,
        };
        let current_size = initial.clamp(min_size, total);

        debug!(%meter_id, current_size, total, "Initialized batch size");

        BatchSizeState {
            meter_id,
            current_size,
            total_registers: total,
            consecutive_successes: 0,
            consecutive_timeouts: 0,
            last_successful_size: None,
            last_updated_at: jiff::Timestamp::now(),
            min_size,
        }
    }

    pub fn record_success(&self, meter_id: MeterId) {
        let Some(mut state) = self.states.get_mut(&meter_id) else {
            warn!(%meter_id, "Success recorded for meter without batch state");
            return;
        };
        state.consecutive_successes = state.consecutive_successes.saturating_add(1);
        state.consecutive_timeouts = 0;
        state.last_successful_size = Some(state.current_size);
        state.last_updated_at = jiff::Timestamp::now();
    }

    /// Shrink the chunk size after a timeout. Returns the new size.
    pub fn record_timeout(&self, meter_id: MeterId) -> Option<usize> {
        let Some(mut state) = self.states.get_mut(&meter_id) else {
            warn!(%meter_id, "Timeout recorded for meter without batch state");
            return None;
        };

        let previous = state.current_size;
        let reduced = (previous as f64 * self.config.reduction_factor).floor() as usize;
        state.current_size = reduced.max(state.min_size);
        state.consecutive_successes = 0;
        state.consecutive_timeouts = state.consecutive_timeouts.saturating_add(1);
        state.last_updated_at = jiff::Timestamp::now();

        if state.current_size < previous {
            info!(
                %meter_id,
                previous,
                current = state.current_size,
                "Reduced batch size after timeout"
            );
        }
        Some(state.current_size)
    }

    /// Whether the meter is already at its smallest chunk size.
    pub fn at_minimum(&self, meter_id: MeterId) -> bool {
        self.states
            .get(&meter_id)
            .is_some_and(|s| s.current_size <= s.min_size)
    }

    /// Smallest chunk size the meter may shrink to.
    pub fn min_size(&self, meter_id: MeterId) -> Option<usize> {
        self.states.get(&meter_id).map(|s| s.min_size)
    }

    /// Forget the meter's state; the next cycle starts from the initial size.
    pub fn reset(&self, meter_id: MeterId) {
        if self.states.remove(&meter_id).is_some() {
            info!(%meter_id, "Batch size reset");
        }
    }

    pub fn state(&self, meter_id: MeterId) -> Option<BatchSizeState> {
        self.states.get(&meter_id).map(|s| s.clone())
    }

    pub fn snapshot(&self) -> Vec<BatchSizeState> {
        self.states.iter().map(|s| s.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use ulid::Ulid;

    use super::*;
    use crate::config::AllRegisters;

    fn controller(initial: InitialBatchSize) -> BatchSizeController {
        BatchSizeController::new(BatchConfig {
            initial_batch_size: initial,
            min_batch_size: 1,
            reduction_factor: 0.5,
        })
    }

    #[test]
    fn halves_down_to_the_minimum() {
        let batches = controller(InitialBatchSize::Size(100));
        let meter = MeterId(Ulid::new());
        assert_eq!(batches.batch_size(meter, 200), 100);

        assert_eq!(batches.record_timeout(meter), Some(50));
        for _ in 0..5 {
            batches.record_timeout(meter);
        }
        assert_eq!(batches.batch_size(meter, 200), 1);
        assert!(batches.at_minimum(meter));

        assert_eq!(batches.record_timeout(meter), Some(1));
        assert_eq!(batches.state(meter).unwrap().consecutive_timeouts, 7);
    }

    #[test]
    fn success_never_changes_size() {
        let batches = controller(InitialBatchSize::Size(100));
        let meter = MeterId(Ulid::new());
        batches.batch_size(meter, 100);
        batches.record_timeout(meter);

        for _ in 0..1_000 {
            batches.record_success(meter);
        }

        let state = batches.state(meter).unwrap();
        assert_eq!(state.current_size, 50);
        assert_eq!(state.consecutive_successes, 1_000);
        assert_eq!(state.consecutive_timeouts, 0);
        assert_eq!(state.last_successful_size, Some(50));
    }

    #[test]
    fn all_starts_at_register_total() {
        let batches = controller(InitialBatchSize::All(AllRegisters::All));
        let meter = MeterId(Ulid::new());
        assert_eq!(batches.batch_size(meter, 37), 37);
        assert_eq!(batches.state(meter).unwrap().total_registers, 37);
    }

    #[test]
    fn initial_size_is_clamped_to_register_total() {
        let batches = controller(InitialBatchSize::Size(100));
        let meter = MeterId(Ulid::new());
        assert_eq!(batches.batch_size(meter, 10), 10);
    }

    #[test]
    fn floor_is_capped_by_register_total() {
        let batches = BatchSizeController::new(BatchConfig {
            initial_batch_size: InitialBatchSize::Size(100),
            min_batch_size: 8,
            reduction_factor: 0.5,
        });
        let small = MeterId(Ulid::new());
        let large = MeterId(Ulid::new());
        batches.batch_size(small, 3);
        batches.batch_size(large, 50);

        assert_eq!(batches.min_size(small), Some(3));
        assert_eq!(batches.min_size(large), Some(8));
        assert_eq!(batches.min_size(MeterId(Ulid::new())), None);
    }

    #[test]
    fn reset_restores_initial_size() {
        let batches = controller(InitialBatchSize::Size(100));
        let meter = MeterId(Ulid::new());
        batches.batch_size(meter, 100);
        batches.record_timeout(meter);
        batches.reset(meter);
        assert!(batches.state(meter).is_none());
        assert_eq!(batches.batch_size(meter, 100), 100);
    }

    #[test]
    fn unknown_meter_is_a_no_op() {
        let batches = controller(InitialBatchSize::Size(100));
        let meter = MeterId(Ulid::new());
        batches.record_success(meter);
        assert_eq!(batches.record_timeout(meter), None);
        assert!(batches.state(meter).is_none());
    }
}
