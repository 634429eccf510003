use std::sync::{Mutex, MutexGuard};

use tracing::warn;

/// Lock a mutex, recovering from poisoning if necessary.
///
/// If a task panicked while holding the lock, logs a warning and recovers
/// the data so the gateway keeps running.
pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("Mutex poisoned (previous holder panicked), recovering");
            poisoned.into_inner()
        }
    }
}
