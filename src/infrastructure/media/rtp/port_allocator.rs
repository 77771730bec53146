//! RTP port allocation
//!
//! Ports come from a range that several server processes share, so the claim
//! itself lives in a [`PortStore`]. Each allocator also remembers what it
//! claimed locally so a release happens once and `release_all` only returns
//! this process's ports to the pool.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocatorError {
    #[error("Port allocator not initialized")]
    NotInitialized,

    #[error("No RTP ports available in range {start}-{end}")]
    Exhausted { start: u16, end: u16 },

    #[error("Invalid RTP port range {start}-{end}")]
    InvalidRange { start: u16, end: u16 },

    #[error("Port store error: {0}")]
    Store(String),
}

/// Shared key space for port claims
///
/// Implementations must make `try_claim` atomic across every process that
/// shares the store (a `SET NX` style operation).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PortStore: Send + Sync {
    /// Claim `port` for `owner`; `Ok(false)` when someone else holds it
    async fn try_claim(&self, port: u16, owner: &str) -> Result<bool, AllocatorError>;

    /// Drop the claim if `owner` still holds it
    async fn release(&self, port: u16, owner: &str) -> Result<(), AllocatorError>;

    /// Drop every claim held by `owner`, returning the freed ports
    async fn release_owner(&self, owner: &str) -> Result<Vec<u16>, AllocatorError>;

    /// Shared, monotonically increasing scan cursor
    async fn next_cursor(&self) -> Result<u64, AllocatorError>;
}

/// In-memory store; clones share one pool
#[derive(Clone, Default)]
pub struct MemoryPortStore {
    claims: Arc<Mutex<HashMap<u16, String>>>,
    cursor: Arc<AtomicU64>,
}

impl MemoryPortStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn claimed(&self) -> usize {
        self.claims.lock().await.len()
    }
}

#[async_trait]
impl PortStore for MemoryPortStore {
    async fn try_claim(&self, port: u16, owner: &str) -> Result<bool, AllocatorError> {
        let mut claims = self.claims.lock().await;
        if claims.contains_key(&port) {
            return Ok(false);
        }
        claims.insert(port, owner.to_string());
        Ok(true)
    }

    async fn release(&self, port: u16, owner: &str) -> Result<(), AllocatorError> {
        let mut claims = self.claims.lock().await;
        if claims.get(&port).map(String::as_str) == Some(owner) {
            claims.remove(&port);
        }
        Ok(())
    }

    async fn release_owner(&self, owner: &str) -> Result<Vec<u16>, AllocatorError> {
        let mut claims = self.claims.lock().await;
        let ports: Vec<u16> = claims
            .iter()
            .filter(|(_, o)| o.as_str() == owner)
            .map(|(p, _)| *p)
            .collect();
        for port in &ports {
            claims.remove(port);
        }
        Ok(ports)
    }

    async fn next_cursor(&self) -> Result<u64, AllocatorError> {
        Ok(self.cursor.fetch_add(1, Ordering::SeqCst))
    }
}

/// Hands out even ports from `[start, end)`
pub struct PortAllocator {
    store: Arc<dyn PortStore>,
    owner: String,
    first_even: u16,
    slots: u16,
    start: u16,
    end: u16,
    initialized: AtomicBool,
    held: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(store: Arc<dyn PortStore>, start: u16, end: u16) -> Result<Self, AllocatorError> {
        let first_even = start.saturating_add(start % 2);
        if start >= end || first_even >= end {
            return Err(AllocatorError::InvalidRange { start, end });
        }
        // u32 so the full 0..=65535 range does not overflow
        let slots = ((u32::from(end) - u32::from(first_even) + 1) / 2) as u16;

        Ok(Self {
            store,
            owner: uuid::Uuid::new_v4().to_string(),
            first_even,
            slots,
            start,
            end,
            initialized: AtomicBool::new(false),
            held: Mutex::new(HashSet::new()),
        })
    }

    /// Claim ports under a stable id instead of a fresh UUID
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Must run before the first `allocate`
    ///
    /// Drops any claims still recorded under this owner, which is how a
    /// restarted instance with a stable id gets back ports from a crashed run.
    pub async fn init(&self) -> Result<(), AllocatorError> {
        let stale = self.store.release_owner(&self.owner).await?;
        if !stale.is_empty() {
            warn!(owner = %self.owner, reclaimed = stale.len(), "Reclaimed RTP ports from a previous run");
        }
        self.initialized.store(true, Ordering::SeqCst);
        info!(
            owner = %self.owner,
            start = self.start,
            end = self.end,
            slots = self.slots,
            "RTP port allocator initialized"
        );
        Ok(())
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn capacity(&self) -> u16 {
        self.slots
    }

    pub async fn allocate(&self) -> Result<u16, AllocatorError> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(AllocatorError::NotInitialized);
        }

        let start_slot = (self.store.next_cursor().await? % self.slots as u64) as u16;
        for i in 0..self.slots {
            let slot = (start_slot + i) % self.slots;
            let port = self.first_even + slot * 2;
            if self.store.try_claim(port, &self.owner).await? {
                self.held.lock().await.insert(port);
                metrics::gauge!("voxsip_rtp_ports_allocated").increment(1.0);
                debug!(port, "RTP port allocated");
                return Ok(port);
            }
        }

        warn!(start = self.start, end = self.end, "RTP port range exhausted");
        Err(AllocatorError::Exhausted {
            start: self.start,
            end: self.end,
        })
    }

    /// Return a port to the pool; releasing a port twice is a no-op
    pub async fn release(&self, port: u16) {
        if !self.held.lock().await.remove(&port) {
            return;
        }
        metrics::gauge!("voxsip_rtp_ports_allocated").decrement(1.0);
        match self.store.release(port, &self.owner).await {
            Ok(()) => debug!(port, "RTP port released"),
            Err(e) => warn!(port, error = %e, "Failed to release RTP port"),
        }
    }

    /// Release everything this process holds (graceful shutdown)
    pub async fn release_all(&self) {
        let held: Vec<u16> = self.held.lock().await.drain().collect();
        metrics::gauge!("voxsip_rtp_ports_allocated").decrement(held.len() as f64);
        match self.store.release_owner(&self.owner).await {
            Ok(ports) => info!(released = ports.len(), "Released all RTP ports"),
            Err(e) => warn!(error = %e, "Failed to release RTP ports"),
        }
    }

    pub async fn held_count(&self) -> usize {
        self.held.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;

    async fn allocator(store: &MemoryPortStore, start: u16, end: u16) -> PortAllocator {
        let alloc = PortAllocator::new(Arc::new(store.clone()), start, end).unwrap();
        alloc.init().await.unwrap();
        alloc
    }

    #[tokio::test]
    async fn test_allocate_requires_init() {
        let alloc = PortAllocator::new(Arc::new(MemoryPortStore::new()), 10000, 10010).unwrap();
        assert_eq!(alloc.allocate().await, Err(AllocatorError::NotInitialized));
    }

    #[tokio::test]
    async fn test_allocates_even_ports_in_range() {
        let store = MemoryPortStore::new();
        let alloc = allocator(&store, 10001, 10010).await;
        assert_eq!(alloc.capacity(), 4);

        let mut ports = Vec::new();
        for _ in 0..4 {
            ports.push(alloc.allocate().await.unwrap());
        }
        ports.sort();
        assert_eq!(ports, vec![10002, 10004, 10006, 10008]);
        assert!(matches!(
            alloc.allocate().await,
            Err(AllocatorError::Exhausted { .. })
        ));
    }

    #[tokio::test]
    async fn test_processes_sharing_a_store_never_collide() {
        let store = MemoryPortStore::new();
        let a = Arc::new(allocator(&store, 20000, 20100).await);
        let b = Arc::new(allocator(&store, 20000, 20100).await);

        let tasks = (0..50).map(|i| {
            let alloc = if i % 2 == 0 { a.clone() } else { b.clone() };
            tokio::spawn(async move { alloc.allocate().await.unwrap() })
        });
        let mut ports: Vec<u16> = join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        ports.sort();
        ports.dedup();

        assert_eq!(ports.len(), 50);
        assert!(ports.iter().all(|p| p % 2 == 0 && (20000..20100).contains(p)));
    }

    #[tokio::test]
    async fn test_release_allows_reuse() {
        let store = MemoryPortStore::new();
        let alloc = allocator(&store, 30000, 30002).await;

        let port = alloc.allocate().await.unwrap();
        assert!(alloc.allocate().await.is_err());

        alloc.release(port).await;
        alloc.release(port).await;
        assert_eq!(alloc.allocate().await.unwrap(), port);
    }

    #[tokio::test]
    async fn test_release_all_only_frees_own_ports() {
        let store = MemoryPortStore::new();
        let a = allocator(&store, 40000, 40010).await;
        let b = allocator(&store, 40000, 40010).await;

        a.allocate().await.unwrap();
        a.allocate().await.unwrap();
        b.allocate().await.unwrap();
        assert_eq!(store.claimed().await, 3);

        a.release_all().await;
        assert_eq!(store.claimed().await, 1);
        assert_eq!(a.held_count().await, 0);
        assert_eq!(b.held_count().await, 1);
    }

    #[test]
    fn test_invalid_ranges() {
        let store: Arc<dyn PortStore> = Arc::new(MemoryPortStore::new());
        assert!(PortAllocator::new(store.clone(), 5000, 5000).is_err());
        assert!(PortAllocator::new(store.clone(), 6000, 5000).is_err());
        // [5001, 5002) holds no even port
        assert!(PortAllocator::new(store, 5001, 5002).is_err());
    }

    #[test]
    fn test_full_port_range() {
        let alloc = PortAllocator::new(Arc::new(MemoryPortStore::new()), 0, 65535).unwrap();
        assert_eq!(alloc.capacity(), 32768);
    }

    #[tokio::test]
    async fn test_restart_with_stable_owner_reclaims_ports() {
        let store = MemoryPortStore::new();
        let crashed = PortAllocator::new(Arc::new(store.clone()), 41000, 41010)
            .unwrap()
            .with_owner("media-node-1");
        crashed.init().await.unwrap();
        crashed.allocate().await.unwrap();
        crashed.allocate().await.unwrap();
        // no release_all: the process died
        drop(crashed);
        assert_eq!(store.claimed().await, 2);

        let other = allocator(&store, 41000, 41010).await;
        other.allocate().await.unwrap();

        let restarted = PortAllocator::new(Arc::new(store.clone()), 41000, 41010)
            .unwrap()
            .with_owner("media-node-1");
        assert_eq!(restarted.owner(), "media-node-1");
        restarted.init().await.unwrap();
        assert_eq!(store.claimed().await, 1);
        assert_eq!(other.held_count().await, 1);
    }

    #[tokio::test]
    async fn test_store_errors_propagate() {
        let mut store = MockPortStore::new();
        store.expect_release_owner().returning(|_| Ok(Vec::new()));
        store.expect_next_cursor().returning(|| Ok(0));
        store
            .expect_try_claim()
            .returning(|_, _| Err(AllocatorError::Store("connection refused".into())));

        let alloc = PortAllocator::new(Arc::new(store), 10000, 10004).unwrap();
        alloc.init().await.unwrap();
        assert_eq!(
            alloc.allocate().await,
            Err(AllocatorError::Store("connection refused".into()))
        );
    }
}
