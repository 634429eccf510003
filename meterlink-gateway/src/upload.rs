use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use meterlink_core::{BatchId, GatewayId, ReadingId, UploadBatch, UploadResponse, UploadStatus};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use ulid::Ulid;

use crate::config::UploadConfig;
use crate::connectivity::{ConnectivityEvent, ConnectivityEventKind, ConnectivityMonitor};
use crate::resilience::Classify;
use crate::storage::GatewayStore;
use crate::uplink::{UplinkClient, UplinkError};
use crate::util::lock_or_recover;

/// Pause between quick retries of a single upload call, multiplied by the
/// attempt number.
const QUICK_RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_UPLOAD_BACKOFF: Duration = Duration::from_secs(8 * 60 * 60);

/// Why an upload attempt did not send anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyRunning,
    Disconnected,
    EmptyQueue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    /// False only when a batch was sent and not accepted.
    pub success: bool,
    pub processed: usize,
    pub skipped: Option<SkipReason>,
    pub error: Option<String>,
}

impl UploadOutcome {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            success: true,
            processed: 0,
            skipped: Some(reason),
            error: None,
        }
    }
}

/// Delay before the next scheduled upload after `retry_count` consecutive
/// failures: `2^(retry_count + 1)` minutes, at most eight hours.
pub fn next_upload_delay(retry_count: u32) -> Duration {
    let minutes = 1u64.checked_shl(retry_count.saturating_add(1)).unwrap_or(u64::MAX);
    Duration::from_secs(minutes.saturating_mul(60)).min(MAX_UPLOAD_BACKOFF)
}

#[derive(Default)]
struct Progress {
    last_upload_at: Option<jiff::Timestamp>,
    last_success: Option<bool>,
    last_error: Option<String>,
    total_uploaded: u64,
    total_failed: u64,
    consecutive_failures: u32,
    remote_connected: bool,
    queue_size: usize,
}

/// Clears the busy flag when the attempt ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Forwards queued readings to the central system, one batch at a time.
///
/// Readings leave the queue only after the remote accepted them; every other
/// outcome keeps them for a later attempt, so delivery is at least once.
pub struct UploadManager<S> {
    store: S,
    uplink: Arc<dyn UplinkClient>,
    monitor: Arc<ConnectivityMonitor>,
    gateway_id: GatewayId,
    config: UploadConfig,
    busy: AtomicBool,
    progress: Mutex<Progress>,
}

impl<S: GatewayStore> UploadManager<S> {
    pub fn new(
        store: S,
        uplink: Arc<dyn UplinkClient>,
        monitor: Arc<ConnectivityMonitor>,
        gateway_id: GatewayId,
        config: UploadConfig,
    ) -> Self {
        Self {
            store,
            uplink,
            monitor,
            gateway_id,
            config,
            busy: AtomicBool::new(false),
            progress: Mutex::new(Progress::default()),
        }
    }

    /// Upload the oldest batch of queued readings.
    ///
    /// A call made while another is in flight returns immediately with
    /// [`SkipReason::AlreadyRunning`].
    pub async fn perform_upload(&self) -> Result<UploadOutcome, S::Error> {
        let Some(_busy) = BusyGuard::try_acquire(&self.busy) else {
            debug!("Upload already in progress");
            return Ok(UploadOutcome::skipped(SkipReason::AlreadyRunning));
        };

        let connected = self.monitor.force_check().await;
        lock_or_recover(&self.progress).remote_connected = connected;
        if !connected {
            debug!("Central system unreachable, keeping queue");
            let pending = self.store.pending_count().await?;
            self.record_skip(pending);
            return Ok(UploadOutcome::skipped(SkipReason::Disconnected));
        }

        let readings = self
            .store
            .unsynchronized_readings(self.config.batch_size)
            .await?;
        if readings.is_empty() {
            self.record_skip(0);
            return Ok(UploadOutcome::skipped(SkipReason::EmptyQueue));
        }

        let ids: Vec<ReadingId> = readings.iter().map(|r| r.id).collect();
        let batch = UploadBatch {
            id: BatchId(Ulid::new()),
            gateway_id: self.gateway_id,
            readings: readings.into_boxed_slice(),
            timestamp: jiff::Timestamp::now(),
        };

        match self.send(&batch).await {
            Ok(response) if response.success => self.accepted(&batch, &ids).await,
            Ok(response) => {
                let message = response
                    .message
                    .unwrap_or_else(|| "batch rejected by central system".to_string());
                self.failed(&batch, &ids, message).await
            }
            Err(e) => {
                if e.is_unreachable() {
                    lock_or_recover(&self.progress).remote_connected = false;
                }
                self.failed(&batch, &ids, e.to_string()).await
            }
        }
    }

    /// One upload call with a few quick retries. Unreachable and permanent
    /// failures end the attempt early.
    async fn send(&self, batch: &UploadBatch) -> Result<UploadResponse, UplinkError> {
        let max_attempts = self.config.max_retries.saturating_add(1);
        let mut attempt = 1;

        loop {
            let error = match self.uplink.upload_batch(batch).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };

            if error.is_unreachable() || !error.kind().is_retryable() || attempt >= max_attempts {
                return Err(error);
            }

            debug!(
                batch_id = %batch.id.0,
                attempt,
                error = %error,
                "Upload call failed, retrying"
            );
            tokio::time::sleep(QUICK_RETRY_DELAY * attempt).await;
            attempt += 1;
        }
    }

    /// A skipped attempt is a successful no-op. Backoff from earlier
    /// failures is left alone.
    fn record_skip(&self, queue_size: usize) {
        let mut progress = lock_or_recover(&self.progress);
        progress.last_upload_at = Some(jiff::Timestamp::now());
        progress.last_success = Some(true);
        progress.last_error = None;
        progress.queue_size = queue_size;
    }

    async fn accepted(&self, batch: &UploadBatch, ids: &[ReadingId]) -> Result<UploadOutcome, S::Error> {
        self.store.mark_synchronized(ids).await?;
        self.store.log_sync_operation(ids.len(), true, None).await?;

        {
            let mut progress = lock_or_recover(&self.progress);
            progress.last_upload_at = Some(jiff::Timestamp::now());
            progress.last_success = Some(true);
            progress.last_error = None;
            progress.total_uploaded += ids.len() as u64;
            progress.consecutive_failures = 0;
        }

        info!(batch_id = %batch.id.0, readings = ids.len(), "Batch uploaded");
        Ok(UploadOutcome {
            success: true,
            processed: ids.len(),
            skipped: None,
            error: None,
        })
    }

    async fn failed(
        &self,
        batch: &UploadBatch,
        ids: &[ReadingId],
        message: String,
    ) -> Result<UploadOutcome, S::Error> {
        self.store.increment_retry_count(ids).await?;
        self.store
            .log_sync_operation(ids.len(), false, Some(&message))
            .await?;

        let failures = {
            let mut progress = lock_or_recover(&self.progress);
            progress.last_upload_at = Some(jiff::Timestamp::now());
            progress.last_success = Some(false);
            progress.last_error = Some(message.clone());
            progress.total_failed += ids.len() as u64;
            progress.consecutive_failures = progress.consecutive_failures.saturating_add(1);
            progress.consecutive_failures
        };

        warn!(
            batch_id = %batch.id.0,
            readings = ids.len(),
            consecutive_failures = failures,
            error = %message,
            "Batch upload failed, readings stay queued"
        );
        Ok(UploadOutcome {
            success: false,
            processed: 0,
            skipped: None,
            error: Some(message),
        })
    }

    /// Delay until the next scheduled attempt.
    pub fn next_delay(&self) -> Duration {
        match lock_or_recover(&self.progress).consecutive_failures {
            0 => self.config.upload_interval(),
            failures => next_upload_delay(failures),
        }
    }

    pub async fn status(&self) -> UploadStatus {
        match self.store.pending_count().await {
            Ok(count) => lock_or_recover(&self.progress).queue_size = count,
            Err(e) => warn!(error = %e, "Could not count pending readings"),
        }

        let progress = lock_or_recover(&self.progress);
        UploadStatus {
            is_running: self.busy.load(Ordering::Acquire),
            last_upload_at: progress.last_upload_at,
            last_success: progress.last_success,
            last_error: progress.last_error.clone(),
            queue_size: progress.queue_size,
            total_uploaded: progress.total_uploaded,
            total_failed: progress.total_failed,
            is_remote_connected: progress.remote_connected,
        }
    }

    /// Upload on schedule until cancelled. Regaining connectivity triggers
    /// an upload right away.
    #[instrument(name = "upload_manager", skip_all)]
    pub async fn run(&self, cancel: CancellationToken) {
        let mut events = Some(self.monitor.subscribe());
        let mut delay = self.config.upload_interval();
        info!(
            interval_secs = delay.as_secs(),
            batch_size = self.config.batch_size,
            "Upload manager started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Upload manager shutting down");
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
                reconnected = next_reconnect(&mut events) => {
                    if !reconnected {
                        continue;
                    }
                    info!("Connectivity restored, uploading now");
                }
            }

            if let Err(e) = self.perform_upload().await {
                error!(error = %e, "Upload attempt failed on store access");
            }
            delay = self.next_delay();
        }
    }
}

/// Wait for the next connectivity event; true when it is a reconnect.
/// Pends forever once the channel is gone.
async fn next_reconnect(events: &mut Option<broadcast::Receiver<ConnectivityEvent>>) -> bool {
    let Some(rx) = events else {
        return std::future::pending().await;
    };

    match rx.recv().await {
        Ok(event) => event.kind == ConnectivityEventKind::Connected,
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            debug!(skipped, "Missed connectivity events");
            false
        }
        Err(broadcast::error::RecvError::Closed) => {
            *events = None;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_backoff_doubles_in_minutes() {
        assert_eq!(next_upload_delay(0), Duration::from_secs(2 * 60));
        assert_eq!(next_upload_delay(1), Duration::from_secs(4 * 60));
        assert_eq!(next_upload_delay(4), Duration::from_secs(32 * 60));
    }

    #[test]
    fn upload_backoff_caps_at_eight_hours() {
        assert_eq!(next_upload_delay(8), MAX_UPLOAD_BACKOFF);
        assert_eq!(next_upload_delay(63), MAX_UPLOAD_BACKOFF);
        assert_eq!(next_upload_delay(u32::MAX), MAX_UPLOAD_BACKOFF);
    }

    #[test]
    fn busy_guard_is_exclusive() {
        let flag = AtomicBool::new(false);
        let guard = BusyGuard::try_acquire(&flag).unwrap();
        assert!(BusyGuard::try_acquire(&flag).is_none());
        drop(guard);
        assert!(BusyGuard::try_acquire(&flag).is_some());
    }
}
