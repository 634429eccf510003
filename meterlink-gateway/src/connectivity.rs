use std::sync::{Arc, Mutex};
use std::time::Duration;

use meterlink_core::ConnectivityStatus;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::uplink::UplinkClient;
use crate::util::lock_or_recover;

const EVENT_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEventKind {
    Connected,
    Disconnected,
}

/// Emitted on every change of the link state.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectivityEvent {
    pub kind: ConnectivityEventKind,
    pub at: jiff::Timestamp,
}

struct MonitorState {
    status: ConnectivityStatus,
    last_transition: Instant,
}

/// Tracks whether the central system is reachable.
///
/// Starts out disconnected; the first successful probe emits
/// [`ConnectivityEventKind::Connected`].
pub struct ConnectivityMonitor {
    uplink: Arc<dyn UplinkClient>,
    check_interval: Duration,
    probe_timeout: Duration,
    state: Mutex<MonitorState>,
    events: broadcast::Sender<ConnectivityEvent>,
}

impl ConnectivityMonitor {
    pub fn new(uplink: Arc<dyn UplinkClient>, check_interval: Duration, probe_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            uplink,
            check_interval,
            probe_timeout,
            state: Mutex::new(MonitorState {
                status: ConnectivityStatus::default(),
                last_transition: Instant::now(),
            }),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        lock_or_recover(&self.state).status.is_connected
    }

    /// Current status with uptime or downtime measured up to now.
    pub fn status(&self) -> ConnectivityStatus {
        let state = lock_or_recover(&self.state);
        let mut status = state.status.clone();
        let elapsed = state.last_transition.elapsed().as_secs();
        if status.is_connected {
            status.uptime_seconds = elapsed;
            status.downtime_seconds = 0;
        } else {
            status.uptime_seconds = 0;
            status.downtime_seconds = elapsed;
        }
        status
    }

    /// Probe the remote now and return whether it is reachable.
    pub async fn force_check(&self) -> bool {
        let reachable = match tokio::time::timeout(self.probe_timeout, self.uplink.health_check()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!(error = %e, "Health probe failed");
                false
            }
            Err(_) => {
                debug!(timeout_ms = self.probe_timeout.as_millis() as u64, "Health probe timed out");
                false
            }
        };

        self.apply(reachable);
        reachable
    }

    fn apply(&self, reachable: bool) {
        let now = jiff::Timestamp::now();
        let event = {
            let mut state = lock_or_recover(&self.state);
            state.status.last_check_at = Some(now);

            if reachable {
                state.status.last_success_at = Some(now);
                state.status.consecutive_failures = 0;
            } else {
                state.status.last_failure_at = Some(now);
                state.status.consecutive_failures = state.status.consecutive_failures.saturating_add(1);
            }

            if state.status.is_connected == reachable {
                None
            } else {
                state.status.is_connected = reachable;
                state.last_transition = Instant::now();
                Some(ConnectivityEvent {
                    kind: if reachable {
                        ConnectivityEventKind::Connected
                    } else {
                        ConnectivityEventKind::Disconnected
                    },
                    at: now,
                })
            }
        };

        if let Some(event) = event {
            match event.kind {
                ConnectivityEventKind::Connected => info!("Central system reachable"),
                ConnectivityEventKind::Disconnected => warn!("Central system unreachable"),
            }
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }

    /// Probe on every tick until cancelled.
    #[instrument(name = "connectivity_monitor", skip_all)]
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.check_interval);
        info!(
            interval_secs = self.check_interval.as_secs(),
            "Connectivity monitor started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Connectivity monitor shutting down");
                    break;
                }
                _ = interval.tick() => {
                    self.force_check().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uplink::MockUplink;

    fn monitor(uplink: &Arc<MockUplink>) -> ConnectivityMonitor {
        ConnectivityMonitor::new(
            Arc::clone(uplink) as Arc<dyn UplinkClient>,
            Duration::from_secs(30),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn starts_disconnected_and_emits_on_transitions() {
        let uplink = Arc::new(MockUplink::new());
        let monitor = monitor(&uplink);
        let mut events = monitor.subscribe();
        assert!(!monitor.is_connected());

        assert!(monitor.force_check().await);
        assert_eq!(events.recv().await.unwrap().kind, ConnectivityEventKind::Connected);

        // Staying connected is not a transition.
        assert!(monitor.force_check().await);
        assert!(events.try_recv().is_err());

        uplink.set_reachable(false);
        assert!(!monitor.force_check().await);
        assert_eq!(events.recv().await.unwrap().kind, ConnectivityEventKind::Disconnected);
    }

    #[tokio::test]
    async fn counts_consecutive_failures() {
        let uplink = Arc::new(MockUplink::new());
        uplink.set_reachable(false);
        let monitor = monitor(&uplink);
        let mut events = monitor.subscribe();

        monitor.force_check().await;
        monitor.force_check().await;
        let status = monitor.status();
        assert_eq!(status.consecutive_failures, 2);
        assert!(status.last_failure_at.is_some());
        assert!(status.last_success_at.is_none());
        // Already disconnected at start, so no event.
        assert!(events.try_recv().is_err());

        uplink.set_reachable(true);
        monitor.force_check().await;
        assert_eq!(monitor.status().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn uptime_and_downtime_track_the_last_transition() {
        let uplink = Arc::new(MockUplink::new());
        let monitor = monitor(&uplink);

        tokio::time::advance(Duration::from_secs(7)).await;
        let status = monitor.status();
        assert_eq!(status.downtime_seconds, 7);
        assert_eq!(status.uptime_seconds, 0);

        monitor.force_check().await;
        tokio::time::advance(Duration::from_secs(12)).await;
        let status = monitor.status();
        assert!(status.is_connected);
        assert_eq!(status.uptime_seconds, 12);
        assert_eq!(status.downtime_seconds, 0);
    }

    #[tokio::test]
    async fn run_probes_until_cancelled() {
        let uplink = Arc::new(MockUplink::new());
        let monitor = Arc::new(monitor(&uplink));
        let cancel = CancellationToken::new();

        let monitor_for_task = Arc::clone(&monitor);
        let cancel_for_task = cancel.clone();
        let handle = tokio::spawn(async move { monitor_for_task.run(cancel_for_task).await });

        // The first tick fires immediately.
        let mut events = monitor.subscribe();
        if !monitor.is_connected() {
            events.recv().await.unwrap();
        }
        assert!(uplink.health_checks() >= 1);

        cancel.cancel();
        handle.await.unwrap();
    }
}
