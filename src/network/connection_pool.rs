//! Connection pool with bounded concurrency

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Connection pool that enforces a maximum number of concurrent connections
///
/// Shared by the HTTP and HTTPS listeners.
#[derive(Clone)]
pub struct ConnectionPool {
    semaphore: Arc<Semaphore>,
    active_count: Arc<AtomicUsize>,
    max_connections: usize,
}

impl ConnectionPool {
    /// Create a new connection pool
    ///
    /// # Panics
    ///
    /// Panics if `max_connections` is 0
    #[must_use]
    pub fn new(max_connections: usize) -> Self {
        assert!(max_connections > 0, "max_connections must be > 0");

        Self {
            semaphore: Arc::new(Semaphore::new(max_connections)),
            active_count: Arc::new(AtomicUsize::new(0)),
            max_connections,
        }
    }

    /// Try to acquire a connection permit
    ///
    /// Returns `None` if the pool is full
    pub fn try_acquire(&self) -> Option<ConnectionGuard> {
        let permit = Arc::clone(&self.semaphore).try_acquire_owned().ok()?;
        self.active_count.fetch_add(1, Ordering::Relaxed);

        Some(ConnectionGuard {
            _permit: permit,
            active_count: Arc::clone(&self.active_count),
        })
    }

    /// Get the current number of active connections
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }

    /// Get the maximum number of connections
    #[must_use]
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// Guard that releases a connection permit when dropped
pub struct ConnectionGuard {
    _permit: OwnedSemaphorePermit,
    active_count: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active_count.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_pool_basic() {
        let pool = ConnectionPool::new(2);

        assert_eq!(pool.active_connections(), 0);
        assert_eq!(pool.max_connections(), 2);
    }

    #[test]
    fn test_connection_pool_full() {
        let pool = ConnectionPool::new(1);

        let _guard = pool.try_acquire().unwrap();
        assert_eq!(pool.active_connections(), 1);

        assert!(pool.try_acquire().is_none());
    }

    #[test]
    fn test_connection_pool_release() {
        let pool = ConnectionPool::new(2);

        {
            let _guard1 = pool.try_acquire().unwrap();
            let _guard2 = pool.try_acquire().unwrap();
            assert_eq!(pool.active_connections(), 2);
        }

        assert_eq!(pool.active_connections(), 0);
        assert!(pool.try_acquire().is_some());
    }

    #[test]
    fn test_clones_share_capacity() {
        let pool = ConnectionPool::new(1);
        let other = pool.clone();

        let _guard = pool.try_acquire().unwrap();
        assert!(other.try_acquire().is_none());
    }

    #[test]
    #[should_panic(expected = "max_connections must be > 0")]
    fn test_connection_pool_zero_panic() {
        let _ = ConnectionPool::new(0);
    }
}
