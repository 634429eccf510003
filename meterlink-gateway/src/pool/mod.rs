//! Bounded, protocol-agnostic pool of device sessions keyed by endpoint.

mod connection;

pub use connection::PooledConnection;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use meterlink_core::{DeviceEndpoint, Protocol};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::PoolConfig;
use crate::driver::{DeviceDriver, DriverError};
use crate::resilience::{Classify, ErrorKind};
use crate::util::lock_or_recover;
use connection::Connection;

/// Consecutive failed probes after which an idle connection is evicted.
pub const HEALTH_FAILURE_LIMIT: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool exhausted: acquire timed out after {waited:?} for {key}")]
    Exhausted { key: String, waited: Duration },

    #[error("connection pool is shutting down")]
    ShuttingDown,

    #[error("failed to open session with {key}: {source}")]
    Connect {
        key: String,
        #[source]
        source: DriverError,
    },
}

impl Classify for PoolError {
    fn kind(&self) -> ErrorKind {
        match self {
            PoolError::Exhausted { .. } | PoolError::ShuttingDown => ErrorKind::PoolExhausted,
            PoolError::Connect { source, .. } => source.kind(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub protocol: Protocol,
    pub max_connections: usize,
    pub live: usize,
    pub idle: usize,
    pub in_use: usize,
    pub pending: usize,
    pub total_created: u64,
    /// Sessions closed by the idle sweep or failed health checks.
    pub total_evicted: u64,
}

type Grant = Result<PooledConnection, PoolError>;

struct Waiter {
    id: u64,
    key: String,
    endpoint: DeviceEndpoint,
    deadline: Instant,
    tx: oneshot::Sender<Grant>,
}

#[derive(Default)]
struct PoolState {
    /// Idle sessions per endpoint key, most recently returned last.
    idle: HashMap<String, Vec<Connection>>,
    /// Open sessions plus slots reserved for sessions being opened.
    live: usize,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
    draining: bool,
}

impl PoolState {
    fn take_idle(&mut self, key: &str) -> Option<Connection> {
        let conns = self.idle.get_mut(key)?;
        let conn = conns.pop();
        if conns.is_empty() {
            self.idle.remove(key);
        }
        conn
    }

    /// Remove the least recently used idle session of any device.
    fn take_oldest_idle(&mut self) -> Option<Connection> {
        let key = self
            .idle
            .iter()
            .filter_map(|(key, conns)| conns.first().map(|c| (key, c.last_used_at)))
            .min_by_key(|(_, used)| *used)
            .map(|(key, _)| key.clone())?;

        let conns = self.idle.get_mut(&key)?;
        let conn = conns.remove(0);
        if conns.is_empty() {
            self.idle.remove(&key);
        }
        Some(conn)
    }

    fn take_idle_by_id(&mut self, id: u64) -> Option<Connection> {
        let (key, pos) = self.idle.iter().find_map(|(key, conns)| {
            conns.iter().position(|c| c.id == id).map(|pos| (key.clone(), pos))
        })?;
        let conns = self.idle.get_mut(&key)?;
        let conn = conns.remove(pos);
        if conns.is_empty() {
            self.idle.remove(&key);
        }
        Some(conn)
    }

    fn idle_count(&self) -> usize {
        self.idle.values().map(Vec::len).sum()
    }

    /// Oldest waiter still listening.
    fn next_waiter(&mut self) -> Option<Waiter> {
        while let Some(waiter) = self.waiters.pop_front() {
            if !waiter.tx.is_closed() {
                return Some(waiter);
            }
        }
        None
    }

    /// Oldest waiter still listening for `key`.
    fn next_waiter_for(&mut self, key: &str) -> Option<Waiter> {
        loop {
            let pos = self.waiters.iter().position(|w| w.key == key)?;
            let waiter = self.waiters.remove(pos)?;
            if !waiter.tx.is_closed() {
                return Some(waiter);
            }
        }
    }

    fn remove_waiter(&mut self, id: u64) -> bool {
        match self.waiters.iter().position(|w| w.id == id) {
            Some(pos) => self.waiters.remove(pos).is_some(),
            None => false,
        }
    }
}

pub(crate) struct Shared {
    driver: Arc<dyn DeviceDriver>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    next_connection_id: AtomicU64,
    total_created: AtomicU64,
    total_evicted: AtomicU64,
    in_use: AtomicUsize,
}

impl Shared {
    /// Open a session on a slot the caller has already counted in `live`.
    async fn open(
        self: &Arc<Self>,
        endpoint: DeviceEndpoint,
        deadline: Instant,
    ) -> Result<PooledConnection, PoolError> {
        let slot = SlotReservation {
            pool: self,
            armed: true,
        };
        let timeout = self
            .config
            .connect_timeout()
            .min(deadline.saturating_duration_since(Instant::now()));

        match self.driver.connect(&endpoint, timeout).await {
            Ok(handle) => {
                slot.commit();
                let id = self.next_connection_id.fetch_add(1, Ordering::SeqCst);
                self.total_created.fetch_add(1, Ordering::SeqCst);
                debug!(connection_id = id, %endpoint, "Opened device session");
                Ok(PooledConnection::lend(
                    self,
                    Connection::new(id, endpoint, handle),
                ))
            }
            Err(source) => {
                warn!(%endpoint, error = %source, "Failed to open device session");
                Err(PoolError::Connect {
                    key: endpoint.pool_key(),
                    source,
                })
            }
        }
    }

    /// Return a session to the pool, or close it when `evict` is set.
    fn checkin(self: &Arc<Self>, conn: Connection, evict: bool) {
        let mut state = lock_or_recover(&self.state);

        if evict || state.draining {
            state.live = state.live.saturating_sub(1);
            let next = if state.draining {
                None
            } else {
                state.next_waiter()
            };
            if next.is_some() {
                state.live += 1;
            }
            drop(state);

            self.close_in_background(conn);
            if let Some(waiter) = next {
                self.serve_waiter(waiter);
            }
            return;
        }

        let mut conn = conn;
        while let Some(waiter) = state.next_waiter_for(&conn.key) {
            let grant = PooledConnection::lend(self, conn);
            match waiter.tx.send(Ok(grant)) {
                Ok(()) => {
                    debug!(key = %waiter.key, "Handed released session to waiter");
                    return;
                }
                Err(Ok(returned)) => match returned.into_connection() {
                    Some(c) => conn = c,
                    None => return,
                },
                Err(Err(_)) => return,
            }
        }

        // Only other devices are waiting: recycle the slot for the oldest.
        if let Some(waiter) = state.next_waiter() {
            drop(state);
            self.close_in_background(conn);
            self.serve_waiter(waiter);
            return;
        }

        state.idle.entry(conn.key.clone()).or_default().push(conn);
    }

    /// Open a session for a waiter on a slot already reserved for it.
    fn serve_waiter(self: &Arc<Self>, waiter: Waiter) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            lock_or_recover(&self.state).live -= 1;
            return;
        };

        let pool = Arc::clone(self);
        runtime.spawn(async move {
            let grant = pool.open(waiter.endpoint.clone(), waiter.deadline).await;
            // A waiter that gave up drops the grant, which returns it.
            let _ = waiter.tx.send(grant);
        });
    }

    fn free_slot(self: &Arc<Self>) {
        let mut state = lock_or_recover(&self.state);
        state.live = state.live.saturating_sub(1);
        let next = if state.draining {
            None
        } else {
            state.next_waiter()
        };
        if next.is_some() {
            state.live += 1;
        }
        drop(state);

        if let Some(waiter) = next {
            self.serve_waiter(waiter);
        }
    }

    fn close_in_background(&self, mut conn: Connection) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        runtime.spawn(async move {
            if let Err(e) = conn.handle.close().await {
                warn!(connection_id = conn.id, error = %e, "Error closing device session");
            } else {
                debug!(connection_id = conn.id, "Closed device session");
            }
        });
    }
}

/// A counted slot for a session still being opened.
struct SlotReservation<'a> {
    pool: &'a Arc<Shared>,
    armed: bool,
}

impl SlotReservation<'_> {
    fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.free_slot();
        }
    }
}

enum Plan {
    Reuse(Connection),
    Open,
    Recycle(Connection),
    Wait(u64, oneshot::Receiver<Grant>),
}

/// Sessions for one protocol driver, capped at `max_connections` live.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<Shared>,
}

impl ConnectionPool {
    pub fn new(driver: Arc<dyn DeviceDriver>, config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                driver,
                config,
                state: Mutex::new(PoolState::default()),
                next_connection_id: AtomicU64::new(1),
                total_created: AtomicU64::new(0),
                total_evicted: AtomicU64::new(0),
                in_use: AtomicUsize::new(0),
            }),
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.shared.driver.protocol()
    }

    pub fn max_registers_per_request(&self) -> u16 {
        self.shared.driver.max_registers_per_request()
    }

    /// Borrow a session with `endpoint`.
    ///
    /// Reuses an idle session for the same device, opens a new one while
    /// under capacity, and otherwise queues until a session frees up or the
    /// acquire timeout passes.
    #[instrument(name = "pool_acquire", skip_all, fields(endpoint = %endpoint))]
    pub async fn acquire(&self, endpoint: &DeviceEndpoint) -> Result<PooledConnection, PoolError> {
        let key = endpoint.pool_key();
        let waited = self.shared.config.acquire_timeout();
        let deadline = Instant::now() + waited;

        let plan = {
            let mut state = lock_or_recover(&self.shared.state);
            if state.draining {
                return Err(PoolError::ShuttingDown);
            }

            if let Some(conn) = state.take_idle(&key) {
                Plan::Reuse(conn)
            } else if state.live < self.shared.config.max_connections {
                state.live += 1;
                Plan::Open
            } else if let Some(victim) = state.take_oldest_idle() {
                Plan::Recycle(victim)
            } else {
                let (tx, rx) = oneshot::channel();
                let id = state.next_waiter_id;
                state.next_waiter_id += 1;
                state.waiters.push_back(Waiter {
                    id,
                    key: key.clone(),
                    endpoint: endpoint.clone(),
                    deadline,
                    tx,
                });
                debug!(pending = state.waiters.len(), "Pool saturated, queueing");
                Plan::Wait(id, rx)
            }
        };

        match plan {
            Plan::Reuse(conn) => {
                debug!(connection_id = conn.id, "Reusing idle session");
                Ok(PooledConnection::lend(&self.shared, conn))
            }
            Plan::Open => self.shared.open(endpoint.clone(), deadline).await,
            Plan::Recycle(victim) => {
                debug!(
                    connection_id = victim.id,
                    "Closing idle session of another device to make room"
                );
                self.shared.close_in_background(victim);
                self.shared.open(endpoint.clone(), deadline).await
            }
            Plan::Wait(id, mut rx) => match tokio::time::timeout_at(deadline, &mut rx).await {
                Ok(Ok(grant)) => grant,
                Ok(Err(_)) => Err(PoolError::Exhausted { key, waited }),
                Err(_) => {
                    lock_or_recover(&self.shared.state).remove_waiter(id);
                    // A handoff may have raced the deadline.
                    if let Ok(grant) = rx.try_recv() {
                        return grant;
                    }
                    warn!(waited_ms = waited.as_millis() as u64, "Acquire timed out");
                    Err(PoolError::Exhausted { key, waited })
                }
            },
        }
    }

    /// Hand a session back. Equivalent to dropping it.
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    /// Probe every idle session; evict those failing
    /// [`HEALTH_FAILURE_LIMIT`] probes in a row. Returns the number evicted.
    ///
    /// Sessions leave the idle set one at a time, so acquires during a sweep
    /// still find the others.
    pub async fn check_health(&self) -> usize {
        let ids: Vec<u64> = {
            let state = lock_or_recover(&self.shared.state);
            state.idle.values().flatten().map(|c| c.id).collect()
        };

        let mut evicted = 0;
        for id in ids {
            // Lent out or closed since the snapshot.
            let taken = lock_or_recover(&self.shared.state).take_idle_by_id(id);
            let Some(mut conn) = taken else {
                continue;
            };

            if conn.handle.probe().await {
                conn.health_failures = 0;
            } else {
                conn.health_failures += 1;
                warn!(
                    connection_id = conn.id,
                    endpoint = %conn.endpoint,
                    failures = conn.health_failures,
                    "Health probe failed"
                );
            }

            let evict = conn.health_failures >= HEALTH_FAILURE_LIMIT;
            if evict {
                evicted += 1;
                info!(connection_id = conn.id, endpoint = %conn.endpoint, "Evicting unhealthy session");
            }
            self.shared.checkin(conn, evict);
        }
        self.shared
            .total_evicted
            .fetch_add(evicted as u64, Ordering::SeqCst);
        evicted
    }

    /// Close sessions idle for at least the idle timeout. Returns the number
    /// evicted.
    pub fn evict_idle(&self) -> usize {
        let idle_timeout = self.shared.config.idle_timeout();
        let now = Instant::now();

        let (expired, waiters) = {
            let mut state = lock_or_recover(&self.shared.state);
            let mut expired = Vec::new();
            for conns in state.idle.values_mut() {
                let (keep, stale): (Vec<_>, Vec<_>) = std::mem::take(conns)
                    .into_iter()
                    .partition(|c| now.duration_since(c.last_used_at) < idle_timeout);
                *conns = keep;
                expired.extend(stale);
            }
            state.idle.retain(|_, conns| !conns.is_empty());
            state.live = state.live.saturating_sub(expired.len());

            let mut waiters = Vec::new();
            while state.live < self.shared.config.max_connections {
                match state.next_waiter() {
                    Some(waiter) => {
                        state.live += 1;
                        waiters.push(waiter);
                    }
                    None => break,
                }
            }
            (expired, waiters)
        };

        let evicted = expired.len();
        self.shared
            .total_evicted
            .fetch_add(evicted as u64, Ordering::SeqCst);
        for conn in expired {
            debug!(connection_id = conn.id, endpoint = %conn.endpoint, "Evicting idle session");
            self.shared.close_in_background(conn);
        }
        for waiter in waiters {
            self.shared.serve_waiter(waiter);
        }
        if evicted > 0 {
            info!(evicted, "Evicted idle sessions");
        }
        evicted
    }

    /// Run health checks and idle sweeps until cancelled.
    pub async fn run_maintenance(&self, cancel: CancellationToken) {
        let protocol = self.protocol();
        let mut health = tokio::time::interval(self.shared.config.health_check_interval());
        let sweep_period = (self.shared.config.idle_timeout() / 2).max(Duration::from_secs(1));
        let mut sweep = tokio::time::interval(sweep_period);

        info!(%protocol, sweep_secs = sweep_period.as_secs(), "Pool maintenance started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(%protocol, "Pool maintenance shutting down");
                    break;
                }
                _ = health.tick() => {
                    self.check_health().await;
                }
                _ = sweep.tick() => {
                    self.evict_idle();
                }
            }
        }
    }

    /// Reject pending and future acquires and close every idle session.
    /// Sessions on loan are closed when they come back.
    pub async fn shutdown(&self) {
        let (waiters, idle) = {
            let mut state = lock_or_recover(&self.shared.state);
            state.draining = true;
            let waiters: Vec<Waiter> = state.waiters.drain(..).collect();
            let idle: Vec<Connection> = state.idle.drain().flat_map(|(_, conns)| conns).collect();
            state.live = state.live.saturating_sub(idle.len());
            (waiters, idle)
        };

        for waiter in waiters {
            let _ = waiter.tx.send(Err(PoolError::ShuttingDown));
        }

        let mut closing = JoinSet::new();
        for mut conn in idle {
            closing.spawn(async move { (conn.id, conn.handle.close().await) });
        }
        while let Some(joined) = closing.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((connection_id, Err(e))) => {
                    warn!(connection_id, error = %e, "Error closing session during shutdown");
                }
                Err(e) => warn!(error = %e, "Close task failed during shutdown"),
            }
        }

        info!(protocol = %self.protocol(), "Connection pool drained");
    }

    pub fn stats(&self) -> PoolStats {
        let state = lock_or_recover(&self.shared.state);
        PoolStats {
            protocol: self.protocol(),
            max_connections: self.shared.config.max_connections,
            live: state.live,
            idle: state.idle_count(),
            in_use: self.shared.in_use.load(Ordering::SeqCst),
            pending: state.waiters.len(),
            total_created: self.shared.total_created.load(Ordering::SeqCst),
            total_evicted: self.shared.total_evicted.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::{MockDevice, MockDriver};

    fn config(max_connections: usize) -> PoolConfig {
        PoolConfig {
            max_connections,
            idle_timeout_secs: 10,
            acquire_timeout_ms: 500,
            health_check_interval_secs: 60,
            connect_timeout_ms: 100,
        }
    }

    fn endpoint(host: &str) -> DeviceEndpoint {
        DeviceEndpoint::new(host, 502, 1)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn reuses_idle_session_for_same_device() {
        let driver = MockDriver::new(Protocol::ModbusTcp);
        let pool = ConnectionPool::new(Arc::new(driver.clone()), config(2));

        let first = pool.acquire(&endpoint("a")).await.unwrap();
        let id = first.id();
        pool.release(first);

        let second = pool.acquire(&endpoint("a")).await.unwrap();
        assert_eq!(second.id(), id);
        assert_eq!(second.usage_count(), 2);
        assert_eq!(driver.counters().connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_max_connections() {
        let driver = MockDriver::new(Protocol::ModbusTcp);
        let pool = ConnectionPool::new(Arc::new(driver.clone()), config(2));

        let _a = pool.acquire(&endpoint("a")).await.unwrap();
        let _b = pool.acquire(&endpoint("b")).await.unwrap();
        let err = pool.acquire(&endpoint("c")).await.unwrap_err();

        assert!(matches!(err, PoolError::Exhausted { .. }));
        assert_eq!(err.kind(), ErrorKind::PoolExhausted);
        assert_eq!(pool.stats().live, 2);
        assert_eq!(pool.stats().pending, 0);
        assert_eq!(driver.counters().connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn release_hands_session_to_matching_waiter() {
        let driver = MockDriver::new(Protocol::ModbusTcp);
        let pool = ConnectionPool::new(Arc::new(driver.clone()), config(1));

        let held = pool.acquire(&endpoint("a")).await.unwrap();
        let held_id = held.id();

        let waiting = pool.clone();
        let waiter =
            tokio::spawn(async move { waiting.acquire(&endpoint("a")).await.map(|c| c.id()) });
        settle().await;
        assert_eq!(pool.stats().pending, 1);

        pool.release(held);
        assert_eq!(waiter.await.unwrap().unwrap(), held_id);
        assert_eq!(driver.counters().connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_for_other_device_is_not_starved() {
        let driver = MockDriver::new(Protocol::ModbusTcp);
        let pool = ConnectionPool::new(Arc::new(driver.clone()), config(1));

        let held = pool.acquire(&endpoint("a")).await.unwrap();
        let waiting = pool.clone();
        let waiter = tokio::spawn(async move {
            let conn = waiting.acquire(&endpoint("b")).await?;
            Ok::<_, PoolError>(conn.endpoint().cloned())
        });
        settle().await;

        pool.release(held);
        let served = waiter.await.unwrap().unwrap();
        assert_eq!(served, Some(endpoint("b")));
        settle().await;

        assert_eq!(driver.counters().connects(), 2);
        assert_eq!(driver.counters().closes(), 1);
        assert_eq!(pool.stats().live, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_pool_recycles_idle_session_of_other_device() {
        let driver = MockDriver::new(Protocol::ModbusTcp);
        let pool = ConnectionPool::new(Arc::new(driver.clone()), config(1));

        pool.release(pool.acquire(&endpoint("a")).await.unwrap());
        let b = pool.acquire(&endpoint("b")).await.unwrap();
        assert_eq!(b.endpoint(), Some(&endpoint("b")));
        settle().await;

        assert_eq!(driver.counters().closes(), 1);
        assert_eq!(pool.stats().live, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_are_evicted_after_timeout() {
        let driver = MockDriver::new(Protocol::ModbusTcp);
        let pool = ConnectionPool::new(Arc::new(driver.clone()), config(2));
        pool.release(pool.acquire(&endpoint("a")).await.unwrap());

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(pool.evict_idle(), 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(pool.evict_idle(), 1);
        settle().await;

        assert_eq!(pool.stats().live, 0);
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().total_evicted, 1);
        assert_eq!(driver.counters().closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_probe_failures_evict() {
        let a = endpoint("a");
        let driver = MockDriver::new(Protocol::ModbusTcp)
            .with_device(&a, MockDevice::new().with_failing_probe());
        let pool = ConnectionPool::new(Arc::new(driver.clone()), config(2));
        pool.release(pool.acquire(&a).await.unwrap());

        assert_eq!(pool.check_health().await, 0);
        assert_eq!(pool.check_health().await, 0);
        assert_eq!(pool.stats().idle, 1);
        assert_eq!(pool.check_health().await, 1);
        settle().await;

        assert_eq!(pool.stats().live, 0);
        assert_eq!(driver.counters().closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn health_sweep_probes_one_session_at_a_time() {
        let slow = MockDevice::new().with_probe_delay(Duration::from_secs(1));
        let driver = MockDriver::new(Protocol::ModbusTcp)
            .with_device(&endpoint("a"), slow.clone())
            .with_device(&endpoint("b"), slow);
        let pool = ConnectionPool::new(Arc::new(driver.clone()), config(2));
        let a = pool.acquire(&endpoint("a")).await.unwrap();
        let b = pool.acquire(&endpoint("b")).await.unwrap();
        pool.release(a);
        pool.release(b);

        let sweeping = pool.clone();
        let sweep = tokio::spawn(async move { sweeping.check_health().await });
        settle().await;
        assert_eq!(pool.stats().idle, 1);

        assert_eq!(sweep.await.unwrap(), 0);
        assert_eq!(pool.stats().idle, 2);
        assert_eq!(driver.counters().connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn broken_sessions_are_not_reused() {
        let driver = MockDriver::new(Protocol::ModbusTcp);
        let pool = ConnectionPool::new(Arc::new(driver.clone()), config(2));

        let mut conn = pool.acquire(&endpoint("a")).await.unwrap();
        conn.mark_broken();
        pool.release(conn);
        settle().await;

        let _again = pool.acquire(&endpoint("a")).await.unwrap();
        assert_eq!(driver.counters().connects(), 2);
        assert_eq!(pool.stats().live, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_frees_the_slot() {
        let a = endpoint("a");
        let driver = MockDriver::new(Protocol::ModbusTcp)
            .with_device(&a, MockDevice::new().refusing_connections());
        let pool = ConnectionPool::new(Arc::new(driver), config(1));

        let err = pool.acquire(&a).await.unwrap_err();
        assert!(matches!(err, PoolError::Connect { .. }));
        assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
        assert_eq!(pool.stats().live, 0);

        assert!(pool.acquire(&endpoint("b")).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_rejects_waiters_and_new_acquires() {
        let driver = MockDriver::new(Protocol::ModbusTcp);
        let pool = ConnectionPool::new(Arc::new(driver.clone()), config(1));

        let held = pool.acquire(&endpoint("a")).await.unwrap();
        let waiting = pool.clone();
        let waiter = tokio::spawn(async move { waiting.acquire(&endpoint("a")).await });
        settle().await;

        pool.shutdown().await;
        assert!(matches!(
            waiter.await.unwrap(),
            Err(PoolError::ShuttingDown)
        ));
        assert!(matches!(
            pool.acquire(&endpoint("a")).await,
            Err(PoolError::ShuttingDown)
        ));

        pool.release(held);
        settle().await;
        assert_eq!(driver.counters().closes(), 1);
        assert_eq!(pool.stats().live, 0);
    }
}
