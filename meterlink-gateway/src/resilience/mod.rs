//! Failure handling shared by every device operation: classification,
//! per-device circuit breaking and retry with exponential backoff.

pub mod breaker;
pub mod classify;
pub mod events;
pub mod retry;
pub mod stats;

pub use breaker::{CircuitBreakerRegistry, CircuitBreakerState, CircuitStatus, Transition};
pub use classify::{Classify, ErrorKind, classify};
pub use events::{ResilienceEvent, ResilienceEventKind};
pub use retry::{RetryContext, RetryCoordinator, RetryError};
pub use stats::{ErrorRecord, ErrorStatistics};
