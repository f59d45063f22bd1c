//! Bounded pool of store sessions.
//!
//! Sessions are validated with a PING when borrowed from the idle set and
//! again before being put back. A session that saw a connection-level
//! failure is closed instead of returned.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::Client;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, trace, warn};

use crate::config::StoreConfig;
use crate::error::StoreError;

/// Sizing and validation settings for a [`SessionPool`].
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Maximum number of concurrently borrowed sessions
    pub max_size: usize,
    /// Sessions opened by [`SessionPool::warm`]
    pub min_idle: usize,
    /// Bound on waiting for a slot, connecting, and probing
    pub timeout: Duration,
    pub test_on_borrow: bool,
    pub test_on_return: bool,
}

impl From<&StoreConfig> for PoolSettings {
    fn from(config: &StoreConfig) -> Self {
        Self {
            max_size: config.pool_size,
            min_idle: config.min_idle,
            timeout: config.timeout(),
            test_on_borrow: config.test_on_borrow,
            test_on_return: config.test_on_return,
        }
    }
}

/// A pool of multiplexed Redis connections.
pub struct SessionPool {
    client: Client,
    idle: Mutex<Vec<MultiplexedConnection>>,
    permits: Semaphore,
    settings: PoolSettings,
    closed: AtomicBool,
}

impl SessionPool {
    /// Create an empty pool. No connection is opened until one is needed.
    pub fn new(client: Client, settings: PoolSettings) -> Self {
        Self {
            client,
            idle: Mutex::new(Vec::with_capacity(settings.max_size)),
            permits: Semaphore::new(settings.max_size),
            settings,
            closed: AtomicBool::new(false),
        }
    }

    /// Open up to `min_idle` sessions ahead of demand.
    ///
    /// Stops at the first failure and returns how many were opened.
    pub async fn warm(&self) -> Result<usize, StoreError> {
        let mut opened = 0;
        while opened < self.settings.min_idle {
            let conn = self.connect().await?;
            self.put_back(conn);
            opened += 1;
        }
        debug!(opened = opened, "Session pool warmed");
        Ok(opened)
    }

    /// Borrow a session, waiting up to the pool timeout for a free slot.
    pub async fn get(&self) -> Result<PooledSession<'_>, StoreError> {
        let permit = match tokio::time::timeout(self.settings.timeout, self.permits.acquire()).await
        {
            Err(_) => return Err(StoreError::Timeout(self.settings.timeout)),
            Ok(Err(_)) => return Err(StoreError::PoolClosed),
            Ok(Ok(permit)) => permit,
        };

        let reused = self.idle.lock().pop();
        let conn = match reused {
            Some(mut conn) if self.settings.test_on_borrow => match self.probe(&mut conn).await {
                Ok(()) => conn,
                Err(e) => {
                    debug!(error = %e, "Idle session failed validation, reconnecting");
                    self.connect().await?
                }
            },
            Some(conn) => conn,
            None => self.connect().await?,
        };

        Ok(PooledSession {
            conn,
            pool: self,
            broken: false,
            validated: false,
            _permit: permit,
        })
    }

    /// PING a connection, bounded by the pool timeout.
    pub async fn probe(&self, conn: &mut MultiplexedConnection) -> Result<(), StoreError> {
        let reply: String = tokio::time::timeout(
            self.settings.timeout,
            redis::cmd("PING").query_async(conn),
        )
        .await
        .map_err(|_| StoreError::Timeout(self.settings.timeout))??;

        if reply == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Reply(format!("expected PONG, got {}", reply)))
        }
    }

    async fn connect(&self) -> Result<MultiplexedConnection, StoreError> {
        let conn = tokio::time::timeout(
            self.settings.timeout,
            self.client.get_multiplexed_tokio_connection(),
        )
        .await
        .map_err(|_| StoreError::Timeout(self.settings.timeout))??;
        trace!("Opened store session");
        Ok(conn)
    }

    fn put_back(&self, conn: MultiplexedConnection) {
        let mut idle = self.idle.lock();
        // Checked under the lock so a concurrent close() cannot clear the
        // idle set between the check and the push.
        if self.is_closed() {
            return;
        }
        if idle.len() < self.settings.max_size {
            idle.push(conn);
        }
    }

    /// Close the pool: drop idle sessions and refuse further borrows.
    ///
    /// Returns `false` if the pool was already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.permits.close();
        let dropped = {
            let mut idle = self.idle.lock();
            let count = idle.len();
            idle.clear();
            count
        };
        debug!(dropped = dropped, "Session pool closed");
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Sessions currently waiting in the idle set.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Sessions that could be borrowed right now without waiting.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }
}

/// A borrowed session.
///
/// Dropping the guard frees its pool slot on every path. The connection
/// itself goes back to the idle set only if it is known to be healthy:
/// never after a connection-level failure, and, when `test_on_return` is
/// set, only after [`PooledSession::release`] has validated it.
pub struct PooledSession<'a> {
    conn: MultiplexedConnection,
    pool: &'a SessionPool,
    broken: bool,
    validated: bool,
    _permit: SemaphorePermit<'a>,
}

impl PooledSession<'_> {
    pub fn connection(&mut self) -> &mut MultiplexedConnection {
        &mut self.conn
    }

    /// Record the result of a command; connection-level failures poison the session.
    pub fn observe<T>(&mut self, result: &Result<T, StoreError>) {
        if let Err(e) = result {
            if e.is_connection_error() {
                warn!(error = %e, "Discarding store session after connection failure");
                self.broken = true;
            }
        }
    }

    /// Validate the session (if configured) and hand it back to the pool.
    pub async fn release(mut self) {
        if !self.broken && self.pool.settings.test_on_return {
            match self.pool.probe(&mut self.conn).await {
                Ok(()) => self.validated = true,
                Err(e) => {
                    debug!(error = %e, "Session failed validation on return");
                    self.broken = true;
                }
            }
        }
    }
}

impl Drop for PooledSession<'_> {
    fn drop(&mut self) {
        let healthy = !self.broken && (self.validated || !self.pool.settings.test_on_return);
        if healthy {
            self.pool.put_back(self.conn.clone());
        }
    }
}
