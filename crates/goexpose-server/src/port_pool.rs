//! Shared pool of relay ports
//!
//! The pool is the only state shared between concurrent sessions. Every
//! checkout and return happens under one mutex so each operation is atomic
//! with respect to the others.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortPoolError {
    #[error("Invalid port range: base {base}, amount {amount}")]
    InvalidRange { base: u16, amount: u16 },

    #[error("Port {0} is not checked out")]
    NotCheckedOut(u16),

    #[error("Port {0} does not belong to the pool")]
    UnknownPort(u16),
}

/// Trait for relay port allocation
pub trait PortAllocator: Send + Sync {
    /// Take a free port out of the pool, or None when every port is checked out
    fn acquire(&self) -> Option<u16>;
    /// Return a previously acquired port
    fn release(&self, port: u16) -> Result<(), PortPoolError>;
    /// Number of ports currently free
    fn available(&self) -> usize;
    /// Total number of ports managed by the allocator
    fn capacity(&self) -> usize;
}

struct PoolState {
    free: VecDeque<u16>,
    checked_out: HashSet<u16>,
}

/// Fixed set of ports, partitioned into free and checked-out
pub struct PortPool {
    state: Mutex<PoolState>,
    capacity: usize,
}

impl PortPool {
    /// Pool over `[base, base + amount)`
    pub fn new(base: u16, amount: u16) -> Result<Self, PortPoolError> {
        if amount == 0 || u32::from(base) + u32::from(amount) > u32::from(u16::MAX) + 1 {
            return Err(PortPoolError::InvalidRange { base, amount });
        }

        let end = u32::from(base) + u32::from(amount);
        Ok(Self::from_ports(
            (u32::from(base)..end).map(|port| port as u16),
        ))
    }

    /// Pool over an explicit set of ports; duplicates are ignored
    pub fn from_ports<I>(ports: I) -> Self
    where
        I: IntoIterator<Item = u16>,
    {
        let mut seen = HashSet::new();
        let free: VecDeque<u16> = ports.into_iter().filter(|p| seen.insert(*p)).collect();
        let capacity = free.len();

        Self {
            state: Mutex::new(PoolState {
                free,
                checked_out: HashSet::with_capacity(capacity),
            }),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `port` is currently checked out
    pub fn is_checked_out(&self, port: u16) -> bool {
        self.lock().checked_out.contains(&port)
    }
}

impl PortAllocator for PortPool {
    fn acquire(&self) -> Option<u16> {
        let mut state = self.lock();
        let port = state.free.pop_front()?;
        state.checked_out.insert(port);
        debug!(
            "Acquired relay port {} ({} of {} free)",
            port,
            state.free.len(),
            self.capacity
        );
        Some(port)
    }

    fn release(&self, port: u16) -> Result<(), PortPoolError> {
        let mut state = self.lock();

        if state.checked_out.remove(&port) {
            // Back of the queue, so a port that just failed to bind is tried last
            state.free.push_back(port);
            debug!(
                "Released relay port {} ({} of {} free)",
                port,
                state.free.len(),
                self.capacity
            );
            return Ok(());
        }

        let err = if state.free.contains(&port) {
            PortPoolError::NotCheckedOut(port)
        } else {
            PortPoolError::UnknownPort(port)
        };
        warn!("Refusing to release port {}: {}", port, err);
        Err(err)
    }

    fn available(&self) -> usize {
        self.lock().free.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A checked-out port that goes back to its allocator when dropped
pub struct PortLease {
    port: u16,
    allocator: Arc<dyn PortAllocator>,
}

impl PortLease {
    pub fn acquire(allocator: &Arc<dyn PortAllocator>) -> Option<Self> {
        allocator.acquire().map(|port| Self {
            port,
            allocator: allocator.clone(),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl std::fmt::Debug for PortLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortLease").field("port", &self.port).finish()
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        // release() already logs misuse
        let _ = self.allocator.release(self.port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_new_covers_range() {
        let pool = PortPool::new(47923, 10).unwrap();
        assert_eq!(pool.capacity(), 10);
        assert_eq!(pool.available(), 10);

        let mut ports: Vec<u16> = std::iter::from_fn(|| pool.acquire()).collect();
        ports.sort_unstable();
        assert_eq!(ports, (47923..47933).collect::<Vec<_>>());
    }

    #[test]
    fn test_invalid_ranges() {
        assert_eq!(
            PortPool::new(47923, 0).err(),
            Some(PortPoolError::InvalidRange {
                base: 47923,
                amount: 0
            })
        );
        assert!(PortPool::new(65530, 10).is_err());
        assert_eq!(PortPool::new(65535, 1).unwrap().capacity(), 1);
    }

    #[test]
    fn test_exhaustion_never_duplicates() {
        let pool = PortPool::new(40000, 2).unwrap();

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a, b);

        for _ in 0..5 {
            assert_eq!(pool.acquire(), None);
        }
        assert_eq!(pool.available(), 0);

        pool.release(a).unwrap();
        assert_eq!(pool.acquire(), Some(a));
    }

    #[test]
    fn test_release_errors() {
        let pool = PortPool::new(40000, 2).unwrap();

        assert_eq!(pool.release(40000), Err(PortPoolError::NotCheckedOut(40000)));
        assert_eq!(pool.release(1234), Err(PortPoolError::UnknownPort(1234)));

        let port = pool.acquire().unwrap();
        pool.release(port).unwrap();
        assert_eq!(pool.release(port), Err(PortPoolError::NotCheckedOut(port)));
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_released_port_goes_to_back() {
        let pool = PortPool::from_ports([1000, 1001, 1002]);

        let first = pool.acquire().unwrap();
        assert_eq!(first, 1000);
        pool.release(first).unwrap();

        assert_eq!(pool.acquire(), Some(1001));
        assert_eq!(pool.acquire(), Some(1002));
        assert_eq!(pool.acquire(), Some(1000));
    }

    #[test]
    fn test_from_ports_ignores_duplicates() {
        let pool = PortPool::from_ports([5000, 5000, 5001]);
        assert_eq!(pool.capacity(), 2);
    }

    #[test]
    fn test_lease_returns_port_on_drop() {
        let allocator: Arc<dyn PortAllocator> = Arc::new(PortPool::new(41000, 1).unwrap());

        let lease = PortLease::acquire(&allocator).unwrap();
        assert_eq!(lease.port(), 41000);
        assert!(PortLease::acquire(&allocator).is_none());

        drop(lease);
        assert_eq!(allocator.available(), 1);
    }

    #[test]
    fn test_concurrent_acquire_release_unique() {
        let pool = Arc::new(PortPool::new(42000, 8).unwrap());
        let mut handles = Vec::new();

        for _ in 0..16 {
            let pool = pool.clone();
            handles.push(thread::spawn(move || {
                let mut held = Vec::new();
                for i in 0..500 {
                    if i % 3 == 2 {
                        if let Some(port) = held.pop() {
                            pool.release(port).unwrap();
                        }
                    } else if let Some(port) = pool.acquire() {
                        assert!(pool.is_checked_out(port));
                        held.push(port);
                    }
                }
                held
            }));
        }

        let mut still_held: Vec<u16> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        let total = still_held.len();
        still_held.sort_unstable();
        still_held.dedup();
        assert_eq!(still_held.len(), total, "a port was held twice");
        assert_eq!(pool.available() + total, pool.capacity());
    }
}
