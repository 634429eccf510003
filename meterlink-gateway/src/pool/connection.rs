use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use meterlink_core::DeviceEndpoint;
use tokio::time::Instant;

use super::Shared;
use crate::driver::{ChunkDescriptor, DeviceHandle, DriverError};

/// A live device session owned by the pool.
pub(super) struct Connection {
    pub(super) id: u64,
    pub(super) key: String,
    pub(super) endpoint: DeviceEndpoint,
    pub(super) handle: Box<dyn DeviceHandle>,
    pub(super) created_at: Instant,
    pub(super) last_used_at: Instant,
    pub(super) usage_count: u64,
    pub(super) health_failures: u32,
}

impl Connection {
    pub(super) fn new(id: u64, endpoint: DeviceEndpoint, handle: Box<dyn DeviceHandle>) -> Self {
        let now = Instant::now();
        Self {
            id,
            key: endpoint.pool_key(),
            endpoint,
            handle,
            created_at: now,
            last_used_at: now,
            usage_count: 0,
            health_failures: 0,
        }
    }
}

/// A connection on loan from the pool.
///
/// Dropping it hands the session back: to a waiter for the same device if
/// there is one, otherwise to the idle set. A connection marked broken is
/// closed instead.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<Shared>,
    broken: bool,
}

impl PooledConnection {
    pub(super) fn lend(pool: &Arc<Shared>, mut conn: Connection) -> Self {
        conn.usage_count += 1;
        conn.last_used_at = Instant::now();
        pool.in_use.fetch_add(1, Ordering::SeqCst);

        Self {
            conn: Some(conn),
            pool: Arc::clone(pool),
            broken: false,
        }
    }

    /// Take the session back without returning it through `Drop`.
    pub(super) fn into_connection(mut self) -> Option<Connection> {
        let mut conn = self.conn.take()?;
        conn.usage_count = conn.usage_count.saturating_sub(1);
        self.pool.in_use.fetch_sub(1, Ordering::SeqCst);
        Some(conn)
    }

    pub fn id(&self) -> u64 {
        self.conn.as_ref().map(|c| c.id).unwrap_or_default()
    }

    pub fn endpoint(&self) -> Option<&DeviceEndpoint> {
        self.conn.as_ref().map(|c| &c.endpoint)
    }

    /// Times this session has been lent out, this loan included.
    pub fn usage_count(&self) -> u64 {
        self.conn.as_ref().map(|c| c.usage_count).unwrap_or_default()
    }

    pub fn age(&self) -> Duration {
        self.conn
            .as_ref()
            .map(|c| c.created_at.elapsed())
            .unwrap_or_default()
    }

    /// Close the session on release instead of reusing it.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub async fn read_points(
        &mut self,
        chunk: ChunkDescriptor,
        timeout: Duration,
    ) -> Result<Vec<u16>, DriverError> {
        let conn = self.conn.as_mut().ok_or(DriverError::Closed)?;
        let result = conn.handle.read_points(chunk, timeout).await;

        // After a timeout or a garbled frame the stream position is unknown.
        if let Err(
            DriverError::Timeout(_) | DriverError::Malformed(_) | DriverError::Closed | DriverError::Io(_),
        ) = &result
        {
            self.broken = true;
        }
        result
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.last_used_at = Instant::now();
            self.pool.in_use.fetch_sub(1, Ordering::SeqCst);
            self.pool.checkin(conn, self.broken);
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id())
            .field("endpoint", &self.endpoint())
            .field("broken", &self.broken)
            .finish()
    }
}
