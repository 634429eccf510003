use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    /// Calls flow normally.
    Closed,
    /// Calls fail fast until the cooldown elapses.
    Open,
    /// One trial operation is allowed through.
    HalfOpen,
}

/// Breaker bookkeeping for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerState {
    pub status: CircuitStatus,
    pub failure_count: u32,
    pub last_failure_at: Option<Instant>,
    pub next_attempt_at: Option<Instant>,
    trial_in_flight: bool,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self {
            status: CircuitStatus::Closed,
            failure_count: 0,
            last_failure_at: None,
            next_attempt_at: None,
            trial_in_flight: false,
        }
    }
}

/// State change caused by a check or a recorded outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Opened,
    HalfOpened,
    Closed,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("circuit open for device {device_id}, next attempt in {retry_after:?}")]
pub struct CircuitOpenError {
    pub device_id: String,
    pub retry_after: Duration,
}

/// Per-device CLOSED / OPEN / HALF_OPEN state machines.
pub struct CircuitBreakerRegistry {
    threshold: u32,
    cooldown: Duration,
    states: DashMap<String, CircuitBreakerState>,
}

impl CircuitBreakerRegistry {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            states: DashMap::new(),
        }
    }

    /// Gate an operation for `device_id`.
    ///
    /// An open circuit whose cooldown has elapsed moves to half-open here and
    /// lets exactly one operation through; further calls are rejected until
    /// that trial records its outcome.
    pub fn check(&self, device_id: &str) -> Result<Option<Transition>, CircuitOpenError> {
        let Some(mut state) = self.states.get_mut(device_id) else {
            return Ok(None);
        };
        let now = Instant::now();

        match state.status {
            CircuitStatus::Closed => Ok(None),
            CircuitStatus::Open => {
                let next = state.next_attempt_at.unwrap_or(now);
                if now >= next {
                    state.status = CircuitStatus::HalfOpen;
                    state.trial_in_flight = true;
                    info!(device_id, "Circuit half-open, allowing trial call");
                    Ok(Some(Transition::HalfOpened))
                } else {
                    Err(CircuitOpenError {
                        device_id: device_id.to_string(),
                        retry_after: next - now,
                    })
                }
            }
            CircuitStatus::HalfOpen => {
                if state.trial_in_flight {
                    Err(CircuitOpenError {
                        device_id: device_id.to_string(),
                        retry_after: Duration::ZERO,
                    })
                } else {
                    state.trial_in_flight = true;
                    Ok(None)
                }
            }
        }
    }

    pub fn record_success(&self, device_id: &str) -> Option<Transition> {
        let mut state = self.states.get_mut(device_id)?;
        state.trial_in_flight = false;

        match state.status {
            CircuitStatus::HalfOpen => {
                state.status = CircuitStatus::Closed;
                state.failure_count = 0;
                state.next_attempt_at = None;
                info!(device_id, "Circuit closed after successful trial");
                Some(Transition::Closed)
            }
            // Isolated blips decay instead of accumulating towards the threshold.
            CircuitStatus::Closed => {
                state.failure_count = state.failure_count.saturating_sub(1);
                None
            }
            CircuitStatus::Open => None,
        }
    }

    pub fn record_failure(&self, device_id: &str) -> Option<Transition> {
        let now = Instant::now();
        let mut state = self.states.entry(device_id.to_string()).or_default();
        state.trial_in_flight = false;
        state.failure_count = state.failure_count.saturating_add(1);
        state.last_failure_at = Some(now);

        match state.status {
            CircuitStatus::Closed if state.failure_count >= self.threshold => {
                state.status = CircuitStatus::Open;
                state.next_attempt_at = Some(now + self.cooldown);
                warn!(
                    device_id,
                    failures = state.failure_count,
                    cooldown_secs = self.cooldown.as_secs(),
                    "Circuit opened"
                );
                Some(Transition::Opened)
            }
            CircuitStatus::Closed => None,
            CircuitStatus::HalfOpen => {
                state.status = CircuitStatus::Open;
                state.next_attempt_at = Some(now + self.cooldown);
                warn!(device_id, "Trial call failed, circuit re-opened");
                Some(Transition::Opened)
            }
            CircuitStatus::Open => {
                state.next_attempt_at = Some(now + self.cooldown);
                None
            }
        }
    }

    /// Release a half-open trial slot whose operation never reported back.
    pub fn abandon_trial(&self, device_id: &str) {
        if let Some(mut state) = self.states.get_mut(device_id) {
            state.trial_in_flight = false;
        }
    }

    /// Current state, `Closed` with no failures for unseen devices.
    pub fn state(&self, device_id: &str) -> CircuitBreakerState {
        self.states
            .get(device_id)
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn reset(&self, device_id: &str) {
        self.states.remove(device_id);
    }

    pub fn snapshot(&self) -> Vec<(String, CircuitBreakerState)> {
        self.states
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COOLDOWN: Duration = Duration::from_secs(30);

    #[tokio::test(start_paused = true)]
    async fn opens_after_exactly_threshold_failures() {
        let breakers = CircuitBreakerRegistry::new(3, COOLDOWN);

        assert_eq!(breakers.record_failure("m1"), None);
        assert_eq!(breakers.record_failure("m1"), None);
        assert!(breakers.check("m1").is_ok());
        assert_eq!(breakers.record_failure("m1"), Some(Transition::Opened));

        let state = breakers.state("m1");
        assert_eq!(state.status, CircuitStatus::Open);
        assert_eq!(state.failure_count, 3);
        assert!(breakers.check("m1").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stays_open_until_cooldown_then_half_opens() {
        let breakers = CircuitBreakerRegistry::new(1, COOLDOWN);
        breakers.record_failure("m1");

        tokio::time::advance(COOLDOWN - Duration::from_millis(1)).await;
        let err = breakers.check("m1").unwrap_err();
        assert_eq!(err.retry_after, Duration::from_millis(1));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(breakers.check("m1").unwrap(), Some(Transition::HalfOpened));
        assert_eq!(breakers.state("m1").status, CircuitStatus::HalfOpen);

        // Only one trial at a time.
        assert!(breakers.check("m1").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn successful_trial_closes_and_resets() {
        let breakers = CircuitBreakerRegistry::new(2, COOLDOWN);
        breakers.record_failure("m1");
        breakers.record_failure("m1");
        tokio::time::advance(COOLDOWN).await;
        breakers.check("m1").unwrap();

        assert_eq!(breakers.record_success("m1"), Some(Transition::Closed));
        let state = breakers.state("m1");
        assert_eq!(state.status, CircuitStatus::Closed);
        assert_eq!(state.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens_with_fresh_cooldown() {
        let breakers = CircuitBreakerRegistry::new(1, COOLDOWN);
        breakers.record_failure("m1");
        tokio::time::advance(COOLDOWN).await;
        breakers.check("m1").unwrap();

        assert_eq!(breakers.record_failure("m1"), Some(Transition::Opened));
        let err = breakers.check("m1").unwrap_err();
        assert_eq!(err.retry_after, COOLDOWN);
    }

    #[tokio::test(start_paused = true)]
    async fn success_while_closed_decays_failures() {
        let breakers = CircuitBreakerRegistry::new(3, COOLDOWN);
        breakers.record_failure("m1");
        breakers.record_failure("m1");
        breakers.record_success("m1");
        assert_eq!(breakers.state("m1").failure_count, 1);

        breakers.record_success("m1");
        breakers.record_success("m1");
        assert_eq!(breakers.state("m1").failure_count, 0);

        // Two more failures do not reach the threshold of three.
        breakers.record_failure("m1");
        breakers.record_failure("m1");
        assert_eq!(breakers.state("m1").status, CircuitStatus::Closed);
    }

    #[test]
    fn devices_are_independent() {
        let breakers = CircuitBreakerRegistry::new(1, COOLDOWN);
        breakers.record_failure("m1");
        assert!(breakers.check("m1").is_err());
        assert!(breakers.check("m2").is_ok());
        breakers.reset("m1");
        assert!(breakers.check("m1").is_ok());
    }
}
