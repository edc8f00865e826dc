//! Upstream endpoint resolution.
//!
//! Directory listings of candidate upstreams are stale by the time they are
//! used: server load and status change continuously. Instead of a
//! background health-checker, [`PoolResolver`] keeps a cached pool of
//! candidate hostnames, samples one uniformly at random, and runs a cheap
//! bounded liveness probe before handing the address out. Candidates that
//! fail the probe are evicted permanently; the pool is refetched from the
//! [`Discover`] source only once it runs empty.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::socks::normalize_upstream_addr;

/// How long a liveness probe may take before the candidate is written off.
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors from upstream resolution.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// The candidate source failed to produce a listing.
    #[error("candidate lookup failed: {0}")]
    Lookup(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Every candidate was evicted and the pool cannot be refilled.
    #[error("no reachable upstream candidate")]
    NoUpstreamAvailable,
}

/// Source of candidate upstream hostnames.
///
/// Implementations are free to hit the network; the resolver calls this
/// only when its cached pool is empty.
#[async_trait]
pub trait Discover: Send + Sync {
    async fn candidates(
        &self,
    ) -> std::result::Result<Vec<String>, Box<dyn std::error::Error + Send + Sync>>;
}

/// Capability producing a live, dialable upstream `host:port`.
///
/// The lifecycle manager treats this as opaque, so hosts can swap in a
/// static address or any custom selection policy.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve(&self) -> std::result::Result<String, ResolveError>;
}

/// Default resolver: cached candidate pool with probing and eviction.
///
/// The pool lives behind a mutex that is held across the whole
/// refresh-sample-probe-evict cycle, so concurrent connections resolve one
/// at a time; each probe is bounded by the probe timeout.
pub struct PoolResolver {
    discover: Box<dyn Discover>,
    pool: Mutex<Vec<String>>,
    probe_timeout: Duration,
}

impl PoolResolver {
    pub fn new(discover: impl Discover + 'static) -> Self {
        Self {
            discover: Box::new(discover),
            pool: Mutex::new(Vec::new()),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Number of candidates currently cached.
    pub async fn pool_len(&self) -> usize {
        self.pool.lock().await.len()
    }

    /// Probe `addr` for reachability. The probe connection is dropped
    /// immediately and never reused for the session.
    async fn probe(&self, addr: &str) -> bool {
        matches!(
            tokio::time::timeout(self.probe_timeout, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }
}

#[async_trait]
impl Resolve for PoolResolver {
    async fn resolve(&self) -> std::result::Result<String, ResolveError> {
        let mut pool = self.pool.lock().await;

        if pool.is_empty() {
            *pool = self
                .discover
                .candidates()
                .await
                .map_err(ResolveError::Lookup)?;
            debug!(candidates = pool.len(), "candidate pool refreshed");
        }

        loop {
            if pool.is_empty() {
                return Err(ResolveError::NoUpstreamAvailable);
            }

            let idx = rand::thread_rng().gen_range(0..pool.len());
            let addr = normalize_upstream_addr(&pool[idx]);

            if self.probe(&addr).await {
                return Ok(addr);
            }

            // Order does not matter, so eviction is a constant-time swap.
            let evicted = pool.swap_remove(idx);
            debug!(candidate = %evicted, remaining = pool.len(), "evicted dead candidate");
        }
    }
}
