//! Host port pool allocation.
//!
//! Two disjoint pools: one for the agent API port, one for the preview/code
//! port. A lease is bookkeeping, not a socket bind, so the allocator probes
//! the host before handing out a port that some other process already holds.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use super::{SandboxError, SandboxResult};

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PortRange {
    pub lo: u16,
    pub hi: u16,
}

impl PortRange {
    pub fn new(lo: u16, hi: u16) -> Self {
        Self { lo, hi }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.lo..=self.hi).contains(&port)
    }

    pub fn overlaps(&self, other: &PortRange) -> bool {
        self.lo <= other.hi && other.lo <= self.hi
    }

    pub fn len(&self) -> usize {
        (self.hi as usize).saturating_sub(self.lo as usize) + 1
    }
}

/// One bounded pool of host ports.
#[derive(Debug)]
struct PortPool {
    name: &'static str,
    range: PortRange,
    leased: HashSet<u16>,
}

impl PortPool {
    fn new(name: &'static str, range: PortRange) -> Self {
        Self {
            name,
            range,
            leased: HashSet::new(),
        }
    }
}

/// Allocator over both port pools.
///
/// All access to the leased sets goes through one mutex, so two concurrent
/// leases always return distinct ports.
#[derive(Debug)]
pub struct PortAllocator {
    api: Mutex<PortPool>,
    code: Mutex<PortPool>,
    probe_timeout: Duration,
}

/// Which pool a lease belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Api,
    Code,
}

impl PoolKind {
    pub fn name(&self) -> &'static str {
        match self {
            PoolKind::Api => "api",
            PoolKind::Code => "code",
        }
    }
}

impl PortAllocator {
    /// Create an allocator over the two configured ranges.
    pub fn new(api_range: PortRange, code_range: PortRange) -> Self {
        Self {
            api: Mutex::new(PortPool::new("api", api_range)),
            code: Mutex::new(PortPool::new("code", code_range)),
            probe_timeout: Duration::from_millis(200),
        }
    }

    /// Lease a port from the given pool.
    ///
    /// Scans sequentially from the low end, skipping leased ports and ports a
    /// live host socket currently holds. Fails with `PoolExhausted` when no
    /// port in the range passes.
    pub async fn lease(&self, pool: PoolKind) -> SandboxResult<u16> {
        let mut guard = self.pool(pool).lock().await;
        let range = guard.range;

        for port in range.lo..=range.hi {
            if guard.leased.contains(&port) {
                continue;
            }
            if self.is_bound_on_host(port).await {
                debug!(pool = guard.name, port, "skipping port held by host socket");
                continue;
            }
            guard.leased.insert(port);
            debug!(pool = guard.name, port, "leased port");
            return Ok(port);
        }

        Err(SandboxError::PoolExhausted(guard.name))
    }

    /// Release a lease. No host-level action; unknown ports are ignored.
    pub async fn release(&self, pool: PoolKind, port: u16) {
        let mut guard = self.pool(pool).lock().await;
        if guard.leased.remove(&port) {
            debug!(pool = guard.name, port, "released port");
        }
    }

    /// Whether the allocator currently holds a lease on the port.
    pub async fn is_leased(&self, pool: PoolKind, port: u16) -> bool {
        self.pool(pool).lock().await.leased.contains(&port)
    }

    /// Number of outstanding leases in a pool.
    pub async fn leased_count(&self, pool: PoolKind) -> usize {
        self.pool(pool).lock().await.leased.len()
    }

    fn pool(&self, pool: PoolKind) -> &Mutex<PortPool> {
        match pool {
            PoolKind::Api => &self.api,
            PoolKind::Code => &self.code,
        }
    }

    /// Probe whether a live socket on the host loopback holds the port.
    ///
    /// A successful connect means something is listening there; connection
    /// refused (or timeout) means the port is free to map.
    async fn is_bound_on_host(&self, port: u16) -> bool {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        matches!(
            tokio::time::timeout(self.probe_timeout, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Find a contiguous run of currently-free ports for a test range.
    fn free_range(len: u16, search_from: u16) -> PortRange {
        let mut base = search_from;
        for _ in 0..5000 {
            let all_free = (0..len)
                .all(|i| std::net::TcpListener::bind(("127.0.0.1", base + i)).is_ok());
            if all_free {
                return PortRange::new(base, base + len - 1);
            }
            base += len;
        }
        panic!("no free port range of {len} found");
    }

    fn allocator(api_len: u16, code_len: u16) -> (PortAllocator, PortRange, PortRange) {
        let api = free_range(api_len, 41000);
        let code = free_range(code_len, api.hi + 1);
        (PortAllocator::new(api, code), api, code)
    }

    #[tokio::test]
    async fn test_lease_returns_distinct_ports() {
        let (alloc, _, _) = allocator(10, 10);
        let a = alloc.lease(PoolKind::Api).await.unwrap();
        let b = alloc.lease(PoolKind::Api).await.unwrap();
        assert_ne!(a, b);
        assert!(alloc.is_leased(PoolKind::Api, a).await);
        assert!(alloc.is_leased(PoolKind::Api, b).await);
    }

    #[tokio::test]
    async fn test_pools_are_disjoint() {
        let (alloc, api_range, code_range) = allocator(2, 2);
        let api = alloc.lease(PoolKind::Api).await.unwrap();
        let code = alloc.lease(PoolKind::Code).await.unwrap();
        assert!(api_range.contains(api));
        assert!(code_range.contains(code));
        assert!(!api_range.overlaps(&code_range));
    }

    #[tokio::test]
    async fn test_pool_exhaustion() {
        let (alloc, _, _) = allocator(2, 2);
        alloc.lease(PoolKind::Api).await.unwrap();
        alloc.lease(PoolKind::Api).await.unwrap();
        let err = alloc.lease(PoolKind::Api).await.unwrap_err();
        assert!(matches!(err, SandboxError::PoolExhausted("api")));
    }

    #[tokio::test]
    async fn test_release_makes_port_reusable() {
        let (alloc, _, _) = allocator(1, 1);
        let port = alloc.lease(PoolKind::Api).await.unwrap();
        assert!(alloc.lease(PoolKind::Api).await.is_err());

        alloc.release(PoolKind::Api, port).await;
        assert!(!alloc.is_leased(PoolKind::Api, port).await);
        assert_eq!(alloc.lease(PoolKind::Api).await.unwrap(), port);
    }

    #[tokio::test]
    async fn test_probe_skips_bound_port() {
        // Bind a port, then offer the allocator a range containing only that
        // port; it must skip it even though it holds no lease.
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let bound = listener.local_addr().unwrap().port();

        let code = free_range(1, 41000);
        let alloc = PortAllocator::new(PortRange::new(bound, bound), code);
        let err = alloc.lease(PoolKind::Api).await.unwrap_err();
        assert!(matches!(err, SandboxError::PoolExhausted("api")));
        drop(listener);
    }

    #[tokio::test]
    async fn test_concurrent_leases_are_unique() {
        let (alloc, _, _) = allocator(8, 1);
        let alloc = std::sync::Arc::new(alloc);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let alloc = alloc.clone();
            handles.push(tokio::spawn(
                async move { alloc.lease(PoolKind::Api).await },
            ));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            let port = handle.await.unwrap().unwrap();
            assert!(seen.insert(port), "duplicate lease for port {port}");
        }
    }
}
