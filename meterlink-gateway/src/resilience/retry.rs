use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::breaker::{CircuitBreakerRegistry, Transition};
use super::events::{ResilienceEvent, ResilienceEventKind};
use super::stats::ErrorStatistics;
use super::{Classify, ErrorKind};
use crate::config::RetryConfig;
use crate::util::lock_or_recover;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const MAX_JITTER: f64 = 0.1;

/// Terminal outcome of [`RetryCoordinator::run`].
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("circuit open for device {device_id}, next attempt in {retry_after:?}")]
    CircuitOpen {
        device_id: String,
        retry_after: Duration,
    },

    #[error("{kind}: {source}")]
    NonRetryable {
        kind: ErrorKind,
        #[source]
        source: E,
    },

    #[error("giving up after {attempts} attempts ({kind}): {source}")]
    Exhausted {
        attempts: u32,
        kind: ErrorKind,
        #[source]
        source: E,
    },
}

impl<E> RetryError<E> {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RetryError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            RetryError::NonRetryable { kind, .. } | RetryError::Exhausted { kind, .. } => *kind,
        }
    }

    /// Number of attempts actually made against the device.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::CircuitOpen { .. } => 0,
            RetryError::NonRetryable { .. } => 1,
            RetryError::Exhausted { attempts, .. } => *attempts,
        }
    }
}

/// Bookkeeping for one in-flight retried operation.
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub attempt: u32,
    pub max_attempts: u32,
    pub device_id: String,
    pub operation: String,
    pub started_at: Instant,
    pub touched_at: Instant,
}

type ContextKey = (String, String);

/// Runs device operations with classified retries, exponential backoff and
/// per-device circuit breaking.
pub struct RetryCoordinator {
    config: RetryConfig,
    breakers: CircuitBreakerRegistry,
    contexts: Mutex<HashMap<ContextKey, RetryContext>>,
    stats: Mutex<ErrorStatistics>,
    events: broadcast::Sender<ResilienceEvent>,
}

impl RetryCoordinator {
    pub fn new(config: RetryConfig) -> Self {
        let breakers = CircuitBreakerRegistry::new(
            config.circuit_breaker_threshold,
            config.circuit_breaker_timeout(),
        );
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            config,
            breakers,
            contexts: Mutex::new(HashMap::new()),
            stats: Mutex::new(ErrorStatistics::default()),
            events,
        }
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResilienceEvent> {
        self.events.subscribe()
    }

    pub fn statistics(&self) -> ErrorStatistics {
        lock_or_recover(&self.stats).clone()
    }

    pub fn reset_statistics(&self) {
        lock_or_recover(&self.stats).reset();
    }

    /// Live retry contexts, for diagnostics.
    pub fn active_contexts(&self) -> Vec<RetryContext> {
        lock_or_recover(&self.contexts).values().cloned().collect()
    }

    /// Backoff before attempt `attempt + 1`, where `attempt` is 1-based.
    pub fn calculate_retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let max = self.config.max_delay_ms as f64;
        let mut delay =
            (self.config.base_delay_ms as f64 * self.config.backoff_multiplier.powi(exponent))
                .min(max);

        if self.config.jitter_enabled {
            let jitter = rand::rng().random_range(0.0..=MAX_JITTER);
            delay = (delay * (1.0 + jitter)).min(max);
        }

        Duration::from_millis(delay.round() as u64)
    }

    /// Run `op` against `device_id`, retrying transient failures.
    ///
    /// A failed operation counts once against the device's circuit breaker,
    /// however many attempts it took.
    pub async fn run<T, E, F, Fut>(
        &self,
        device_id: &str,
        operation: &str,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        match self.breakers.check(device_id) {
            Ok(transition) => self.publish_transition(device_id, transition),
            Err(open) => {
                self.record_error(device_id, operation, ErrorKind::CircuitOpen, open.to_string());
                return Err(RetryError::CircuitOpen {
                    device_id: open.device_id,
                    retry_after: open.retry_after,
                });
            }
        }

        let max_attempts = self.config.max_retries.saturating_add(1);
        let mut guard = ContextGuard::begin(self, device_id, operation, max_attempts);
        let mut attempt = 1;

        loop {
            guard.touch(attempt);

            let error = match op().await {
                Ok(value) => {
                    guard.settle();
                    let transition = self.breakers.record_success(device_id);
                    self.publish_transition(device_id, transition);
                    return Ok(value);
                }
                Err(error) => error,
            };

            let kind = error.kind();
            self.record_error(device_id, operation, kind, error.to_string());

            if !kind.is_retryable() {
                guard.settle();
                self.record_failure(device_id);
                debug!(device_id, operation, %kind, error = %error, "Non-retryable failure");
                return Err(RetryError::NonRetryable {
                    kind,
                    source: error,
                });
            }

            if attempt >= max_attempts {
                guard.settle();
                self.record_failure(device_id);
                warn!(
                    device_id,
                    operation,
                    attempts = attempt,
                    %kind,
                    error = %error,
                    "Retries exhausted"
                );
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    kind,
                    source: error,
                });
            }

            let delay = self.calculate_retry_delay(attempt);
            debug!(
                device_id,
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                %kind,
                "Retrying after failure"
            );
            self.publish(ResilienceEvent::new(
                device_id,
                ResilienceEventKind::RetryScheduled {
                    operation: operation.to_string(),
                    attempt,
                    delay,
                    error: kind,
                },
            ));

            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Drop retry contexts untouched for longer than the stale threshold.
    pub fn purge_stale_contexts(&self) -> usize {
        let stale_after = self.config.stale_context_after();
        let now = Instant::now();
        let mut contexts = lock_or_recover(&self.contexts);
        let before = contexts.len();
        contexts.retain(|_, ctx| now.duration_since(ctx.touched_at) < stale_after);
        before - contexts.len()
    }

    /// Periodically purge stale retry contexts until cancelled.
    pub async fn run_context_janitor(&self, cancel: CancellationToken) {
        let period = (self.config.stale_context_after() / 2).max(Duration::from_secs(1));
        let mut interval = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Retry context janitor shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let purged = self.purge_stale_contexts();
                    if purged > 0 {
                        warn!(purged, "Purged stale retry contexts");
                    }
                }
            }
        }
    }

    fn record_failure(&self, device_id: &str) {
        let transition = self.breakers.record_failure(device_id);
        self.publish_transition(device_id, transition);
    }

    fn record_error(&self, device_id: &str, operation: &str, kind: ErrorKind, message: String) {
        lock_or_recover(&self.stats).record(device_id, operation, kind, message);
    }

    fn publish_transition(&self, device_id: &str, transition: Option<Transition>) {
        let kind = match transition {
            Some(Transition::Opened) => ResilienceEventKind::CircuitOpened,
            Some(Transition::HalfOpened) => ResilienceEventKind::CircuitHalfOpen,
            Some(Transition::Closed) => ResilienceEventKind::CircuitClosed,
            None => return,
        };
        self.publish(ResilienceEvent::new(device_id, kind));
    }

    fn publish(&self, event: ResilienceEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Removes the retry context when the operation ends, however it ends.
struct ContextGuard<'a> {
    coordinator: &'a RetryCoordinator,
    key: ContextKey,
    settled: bool,
}

impl<'a> ContextGuard<'a> {
    fn begin(
        coordinator: &'a RetryCoordinator,
        device_id: &str,
        operation: &str,
        max_attempts: u32,
    ) -> Self {
        let key = (device_id.to_string(), operation.to_string());
        let now = Instant::now();
        lock_or_recover(&coordinator.contexts).insert(
            key.clone(),
            RetryContext {
                attempt: 0,
                max_attempts,
                device_id: device_id.to_string(),
                operation: operation.to_string(),
                started_at: now,
                touched_at: now,
            },
        );

        Self {
            coordinator,
            key,
            settled: false,
        }
    }

    fn touch(&self, attempt: u32) {
        if let Some(ctx) = lock_or_recover(&self.coordinator.contexts).get_mut(&self.key) {
            ctx.attempt = attempt;
            ctx.touched_at = Instant::now();
        }
    }

    /// The breaker has been told the outcome.
    fn settle(&mut self) {
        self.settled = true;
    }
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        lock_or_recover(&self.coordinator.contexts).remove(&self.key);
        if !self.settled {
            // Cancelled mid-flight: free a half-open trial slot we may hold.
            self.coordinator.breakers.abandon_trial(&self.key.0);
        }
    }
}
