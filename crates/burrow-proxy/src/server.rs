//! Connection lifecycle manager.
//!
//! Owns the listening socket, bounds concurrent connections, and drives
//! each accepted client through the protocol engine against an upstream
//! obtained from the configured static host or the installed resolver.
//!
//! # Lifecycle
//!
//! ```text
//! ProxyServer::new(config)
//!       |
//!       v
//! ProxyServer::start() --> ProxyHandle
//!       |                       |
//!       v                       |
//! accept loop                   |
//!   acquire slot (if capped)    |
//!   spawn connection task       v
//!   fire hooks          ProxyHandle::shutdown()
//!       |                       |
//!       v                       v
//! Graceful shutdown <-----------+
//! ```
//!
//! Hooks always run on their own task so a slow callback can never stall
//! the accept loop or a relay.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::resolver::Resolve;
use crate::socks::UpstreamAuth;
use crate::{relay, socks, ProxyError, Result};

/// Configuration for the forwarding proxy server.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to bind the listener to.
    /// Default: `127.0.0.1:1080`
    pub listen_addr: SocketAddr,

    /// Static upstream SOCKS5 server (`host`, `host:port`, or
    /// `socks5://host`). `None` asks the installed resolver once per
    /// connection.
    pub upstream_host: Option<String>,

    /// Credentials presented to the upstream server.
    pub upstream_auth: UpstreamAuth,

    /// Ceiling on concurrently open client connections.
    /// `0` means unbounded.
    pub max_open_connections: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:1080".parse().expect("hardcoded loopback address"),
            upstream_host: None,
            upstream_auth: UpstreamAuth::new("", ""),
            max_open_connections: 0,
        }
    }
}

type LifecycleHook = Arc<dyn Fn(u64, SocketAddr) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(u64, Option<SocketAddr>, Arc<ProxyError>) + Send + Sync>;

/// Lifecycle hooks, each fired on its own task.
#[derive(Clone, Default)]
struct Hooks {
    on_connect: Option<LifecycleHook>,
    on_disconnect: Option<LifecycleHook>,
    on_error: Option<ErrorHook>,
}

impl Hooks {
    fn fire_connect(&self, id: u64, peer: SocketAddr) {
        if let Some(hook) = &self.on_connect {
            let hook = Arc::clone(hook);
            tokio::spawn(async move { hook(id, peer) });
        }
    }

    fn fire_disconnect(&self, id: u64, peer: SocketAddr) {
        if let Some(hook) = &self.on_disconnect {
            let hook = Arc::clone(hook);
            tokio::spawn(async move { hook(id, peer) });
        }
    }

    fn fire_error(&self, id: u64, peer: Option<SocketAddr>, err: Arc<ProxyError>) {
        if let Some(hook) = &self.on_error {
            let hook = Arc::clone(hook);
            tokio::spawn(async move { hook(id, peer, err) });
        }
    }
}

/// Counters shared between the server, its handle, and connection tasks.
#[derive(Debug, Default)]
struct ServerState {
    /// Monotonically increasing connection id; never reused.
    conn_seq: AtomicU64,
    /// Currently open client connections.
    open_connections: AtomicUsize,
}

/// Where a connection's upstream comes from.
#[derive(Clone)]
enum Upstream {
    Static(String),
    Dynamic(Arc<dyn Resolve>),
}

/// SOCKS5-to-SOCKS5 forwarding proxy server.
pub struct ProxyServer {
    config: ProxyConfig,
    resolver: Option<Arc<dyn Resolve>>,
    hooks: Hooks,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
}

impl ProxyServer {
    /// Create a new server from the given configuration.
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            resolver: None,
            hooks: Hooks::default(),
            state: Arc::new(ServerState::default()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Install the resolver consulted when no static upstream is set.
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolve>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Called when a connection is accepted, with its id and peer address.
    pub fn with_on_connect(
        mut self,
        hook: impl Fn(u64, SocketAddr) + Send + Sync + 'static,
    ) -> Self {
        self.hooks.on_connect = Some(Arc::new(hook));
        self
    }

    /// Called when a connection has been torn down.
    pub fn with_on_disconnect(
        mut self,
        hook: impl Fn(u64, SocketAddr) + Send + Sync + 'static,
    ) -> Self {
        self.hooks.on_disconnect = Some(Arc::new(hook));
        self
    }

    /// Called when a connection fails. Accept failures report id `0` and
    /// no peer address.
    pub fn with_on_error(
        mut self,
        hook: impl Fn(u64, Option<SocketAddr>, Arc<ProxyError>) + Send + Sync + 'static,
    ) -> Self {
        self.hooks.on_error = Some(Arc::new(hook));
        self
    }

    /// Currently open client connections.
    pub fn open_connections(&self) -> usize {
        self.state.open_connections.load(Ordering::Relaxed)
    }

    fn upstream(&self) -> Result<Upstream> {
        if let Some(host) = &self.config.upstream_host {
            Ok(Upstream::Static(host.clone()))
        } else if let Some(resolver) = &self.resolver {
            Ok(Upstream::Dynamic(Arc::clone(resolver)))
        } else {
            Err(ProxyError::UpstreamNotConfigured)
        }
    }

    async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind(self.config.listen_addr)
            .await
            .map_err(|e| ProxyError::Bind {
                addr: self.config.listen_addr,
                source: e,
            })
    }

    /// Start the server on a background task.
    ///
    /// Pre-binds the listener so the OS-assigned port is known immediately,
    /// then returns a handle for inspecting and stopping the server.
    ///
    /// # Errors
    /// * [`ProxyError::UpstreamNotConfigured`] - neither a static host nor
    ///   a resolver is available.
    /// * [`ProxyError::Bind`] - binding the listen address failed.
    pub async fn start(self) -> Result<ProxyHandle> {
        let upstream = self.upstream()?;
        let listener = self.bind().await?;
        let local_addr = listener.local_addr().map_err(|e| ProxyError::Bind {
            addr: self.config.listen_addr,
            source: e,
        })?;

        let shutdown = self.shutdown.clone();
        let state = Arc::clone(&self.state);
        let join_handle = tokio::spawn(self.run_on(listener, upstream));

        Ok(ProxyHandle {
            shutdown,
            join_handle: Some(join_handle),
            local_addr,
            state,
        })
    }

    /// Bind and serve until the shutdown token fires.
    ///
    /// Alternative to [`ProxyServer::start`] for blocking operation.
    pub async fn run(self) -> Result<()> {
        let upstream = self.upstream()?;
        let listener = self.bind().await?;
        self.run_on(listener, upstream).await
    }

    async fn run_on(self, listener: TcpListener, upstream: Upstream) -> Result<()> {
        // Warm the candidate cache before the first client arrives.
        if let Upstream::Dynamic(resolver) = &upstream {
            let resolver = Arc::clone(resolver);
            tokio::spawn(async move {
                let _ = resolver.resolve().await;
            });
        }

        let semaphore = (self.config.max_open_connections > 0)
            .then(|| Arc::new(Semaphore::new(self.config.max_open_connections)));

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted,
            };

            let (client, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    self.hooks.fire_error(0, None, Arc::new(ProxyError::Io(e)));
                    continue;
                }
            };

            // Admission control: at the ceiling, the accept loop itself
            // stalls here until a running connection releases its slot.
            let permit = match &semaphore {
                Some(semaphore) => Some(
                    Arc::clone(semaphore)
                        .acquire_owned()
                        .await
                        .expect("connection semaphore is never closed"),
                ),
                None => None,
            };

            let id = self.state.conn_seq.fetch_add(1, Ordering::Relaxed) + 1;
            self.state.open_connections.fetch_add(1, Ordering::Relaxed);
            self.hooks.fire_connect(id, peer);

            let conn_token = self.shutdown.child_token();
            let upstream = upstream.clone();
            let auth = self.config.upstream_auth.clone();
            let hooks = self.hooks.clone();
            let state = Arc::clone(&self.state);

            tokio::spawn(async move {
                // Cancellation drops the in-flight future, which closes
                // both sockets and unblocks any pending read.
                let result = tokio::select! {
                    _ = conn_token.cancelled() => Ok(()),
                    r = handle_connection(client, upstream, auth) => r,
                };

                if let Err(e) = result {
                    debug!(id, peer = %peer, error = %e, "connection failed");
                    hooks.fire_error(id, Some(peer), Arc::new(e));
                }

                hooks.fire_disconnect(id, peer);
                state.open_connections.fetch_sub(1, Ordering::Relaxed);
                drop(permit);
            });
        }
    }
}

/// Drive one client connection through the five protocol stages.
///
/// Any stage failure aborts the whole connection; nothing is retried
/// within a session. Both sockets are closed by the time this returns.
async fn handle_connection(
    mut client: TcpStream,
    upstream: Upstream,
    auth: UpstreamAuth,
) -> Result<()> {
    socks::greet_client(&mut client).await?;

    let host = match &upstream {
        Upstream::Static(host) => host.clone(),
        Upstream::Dynamic(resolver) => resolver.resolve().await?,
    };
    let addr = socks::normalize_upstream_addr(&host);

    let mut upstream_conn = socks::connect_upstream(&addr).await?;
    socks::authenticate_upstream(&mut upstream_conn, &auth).await?;
    socks::forward_connect(&mut client, &mut upstream_conn).await?;

    relay::relay(client, upstream_conn).await
}

/// Handle for controlling a running proxy server.
#[derive(Debug)]
pub struct ProxyHandle {
    shutdown: CancellationToken,
    join_handle: Option<tokio::task::JoinHandle<Result<()>>>,
    local_addr: SocketAddr,
    state: Arc<ServerState>,
}

impl ProxyHandle {
    /// The address the listener is actually bound to. With a `:0` listen
    /// address this carries the OS-assigned port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Check if the server task is still running.
    pub fn is_running(&self) -> bool {
        self.join_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Currently open client connections.
    pub fn open_connections(&self) -> usize {
        self.state.open_connections.load(Ordering::Relaxed)
    }

    /// Total connections accepted over the server's lifetime.
    pub fn total_connections(&self) -> u64 {
        self.state.conn_seq.load(Ordering::Relaxed)
    }

    /// Shut down the server and its in-flight connections.
    ///
    /// Cancels the root token (which propagates to every connection's
    /// sub-scope) and waits briefly for the accept loop to exit.
    pub async fn shutdown(mut self) -> Result<()> {
        self.shutdown.cancel();

        if let Some(handle) = self.join_handle.take() {
            match tokio::time::timeout(std::time::Duration::from_secs(2), handle).await {
                Ok(Ok(result)) => result?,
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(_)) => {} // task panicked, already logged
                Err(_) => {
                    // The accept loop observes cancellation at the next
                    // iteration boundary; let it finish on its own.
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{Discover, PoolResolver};
    use crate::ReplyCode;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const SUCCESS_REPLY: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];

    /// Scripted upstream SOCKS5 server.
    ///
    /// Accepts any number of connections; on each it selects
    /// username/password auth, answers the subnegotiation with
    /// `auth_status`, replies to the CONNECT with `reply`, then echoes.
    /// Liveness probes (connect-and-drop) are tolerated.
    async fn spawn_stub_upstream(auth_status: u8, reply: Vec<u8>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((mut conn, _)) = listener.accept().await else {
                    break;
                };
                let reply = reply.clone();
                tokio::spawn(async move {
                    let mut offer = [0u8; 3];
                    if conn.read_exact(&mut offer).await.is_err() {
                        return; // probe connection
                    }
                    assert_eq!(offer, [0x05, 0x01, 0x02]);
                    conn.write_all(&[0x05, 0x02]).await.unwrap();

                    let mut head = [0u8; 2];
                    conn.read_exact(&mut head).await.unwrap();
                    assert_eq!(head[0], 0x01);
                    let mut username = vec![0u8; head[1] as usize];
                    conn.read_exact(&mut username).await.unwrap();
                    let mut plen = [0u8; 1];
                    conn.read_exact(&mut plen).await.unwrap();
                    let mut password = vec![0u8; plen[0] as usize];
                    conn.read_exact(&mut password).await.unwrap();
                    conn.write_all(&[0x01, auth_status]).await.unwrap();
                    if auth_status != 0 {
                        return;
                    }

                    let mut request = [0u8; 10]; // IPv4 CONNECT
                    conn.read_exact(&mut request).await.unwrap();
                    conn.write_all(&reply).await.unwrap();
                    if reply[1] != 0 {
                        return;
                    }

                    let mut buf = [0u8; 4096];
                    loop {
                        match conn.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if conn.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });

        addr
    }

    fn test_config(upstream: SocketAddr) -> ProxyConfig {
        ProxyConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            upstream_host: Some(upstream.to_string()),
            upstream_auth: UpstreamAuth::new("user", "secret"),
            max_open_connections: 0,
        }
    }

    /// Connect to the proxy and complete the no-auth greeting.
    async fn greeted_client(proxy: SocketAddr) -> TcpStream {
        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);
        client
    }

    // ========================================================================
    // Configuration Tests
    // ========================================================================

    #[test]
    fn test_config_default() {
        let config = ProxyConfig::default();
        assert_eq!(config.listen_addr.port(), 1080);
        assert!(config.listen_addr.ip().is_loopback());
        assert!(config.upstream_host.is_none());
        assert_eq!(config.max_open_connections, 0);
    }

    #[tokio::test]
    async fn test_start_without_upstream_or_resolver_fails() {
        let config = ProxyConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let err = ProxyServer::new(config).start().await.unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamNotConfigured));
    }

    #[tokio::test]
    async fn test_start_bind_conflict_fails() {
        let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ProxyConfig {
            listen_addr: blocker.local_addr().unwrap(),
            upstream_host: Some("127.0.0.1:1".to_string()),
            ..Default::default()
        };
        let err = ProxyServer::new(config).start().await.unwrap_err();
        assert!(matches!(err, ProxyError::Bind { .. }));
    }

    // ========================================================================
    // Handle Lifecycle Tests
    // ========================================================================

    #[tokio::test]
    async fn test_start_reports_bound_address() {
        let upstream = spawn_stub_upstream(0, SUCCESS_REPLY.to_vec()).await;
        let handle = ProxyServer::new(test_config(upstream)).start().await.unwrap();

        assert_ne!(handle.local_addr().port(), 0);
        assert!(handle.is_running());

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_releases_port() {
        let upstream = spawn_stub_upstream(0, SUCCESS_REPLY.to_vec()).await;
        let handle = ProxyServer::new(test_config(upstream)).start().await.unwrap();
        let addr = handle.local_addr();

        handle.shutdown().await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(TcpListener::bind(addr).await.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_open_connections() {
        let upstream = spawn_stub_upstream(0, SUCCESS_REPLY.to_vec()).await;
        let handle = ProxyServer::new(test_config(upstream)).start().await.unwrap();
        let proxy = handle.local_addr();

        let mut client = greeted_client(proxy).await;
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();

        handle.shutdown().await.unwrap();

        // The connection's sub-scope was cancelled; the relay socket is
        // closed and the client sees EOF.
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    // ========================================================================
    // End-to-End Forwarding Tests
    // ========================================================================

    #[tokio::test]
    async fn test_end_to_end_connect_and_relay() {
        // Full session: greeting, CONNECT to 93.184.216.34:80, then the
        // success reply and relayed bytes round-trip unmodified.
        let reply = [0x05, 0x00, 0x00, 0x01, 93, 184, 216, 34, 0x00, 0x50];
        let upstream = spawn_stub_upstream(0, reply.to_vec()).await;
        let handle = ProxyServer::new(test_config(upstream)).start().await.unwrap();

        let mut client = greeted_client(handle.local_addr()).await;

        let request = [0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0x00, 0x50];
        client.write_all(&request).await.unwrap();

        let mut got = [0u8; 10];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(got, reply, "reply must be forwarded byte-for-byte");

        // The stub echoes: bytes written by the client come back verbatim.
        client.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
        let mut echoed = [0u8; 18];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"GET / HTTP/1.0\r\n\r\n");

        drop(client);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_upstream_auth_rejected_closes_without_reply() {
        let upstream = spawn_stub_upstream(0x01, SUCCESS_REPLY.to_vec()).await;
        let handle = ProxyServer::new(test_config(upstream)).start().await.unwrap();

        let mut client = greeted_client(handle.local_addr()).await;

        // Resolver exhaustion and auth failures have no defined SOCKS5
        // reply; the client connection is simply closed.
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_upstream_failure_reply_mirrored_to_client() {
        let reply = [0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0]; // host unreachable
        let upstream = spawn_stub_upstream(0, reply.to_vec()).await;

        let errors: Arc<tokio::sync::Mutex<Vec<Arc<ProxyError>>>> = Arc::default();
        let errors_sink = Arc::clone(&errors);
        let handle = ProxyServer::new(test_config(upstream))
            .with_on_error(move |_id, _peer, err| {
                errors_sink.try_lock().unwrap().push(err);
            })
            .start()
            .await
            .unwrap();

        let mut client = greeted_client(handle.local_addr()).await;
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 1, 0x00, 0x50])
            .await
            .unwrap();

        let mut got = [0u8; 10];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(got[..2], [0x05, 0x04]);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let errors = errors.lock().await;
        assert!(errors.iter().any(|e| matches!(
            **e,
            ProxyError::UpstreamReply(ReplyCode::HostUnreachable)
        )));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_greeting_without_no_auth_rejected() {
        let upstream = spawn_stub_upstream(0, SUCCESS_REPLY.to_vec()).await;
        let handle = ProxyServer::new(test_config(upstream)).start().await.unwrap();

        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0xFF]);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_upstream_fails_connection() {
        // Dead upstream: bind, note the port, drop.
        let dead = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let handle = ProxyServer::new(test_config(dead)).start().await.unwrap();

        let mut client = greeted_client(handle.local_addr()).await;
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        handle.shutdown().await.unwrap();
    }

    // ========================================================================
    // Hook Tests
    // ========================================================================

    #[tokio::test]
    async fn test_hooks_fire_with_matching_ids() {
        let upstream = spawn_stub_upstream(0, SUCCESS_REPLY.to_vec()).await;

        let (connect_tx, mut connect_rx) = tokio::sync::mpsc::unbounded_channel();
        let (disconnect_tx, mut disconnect_rx) = tokio::sync::mpsc::unbounded_channel();

        let handle = ProxyServer::new(test_config(upstream))
            .with_on_connect(move |id, peer| {
                connect_tx.send((id, peer)).unwrap();
            })
            .with_on_disconnect(move |id, peer| {
                disconnect_tx.send((id, peer)).unwrap();
            })
            .start()
            .await
            .unwrap();

        let client = greeted_client(handle.local_addr()).await;
        let (connect_id, connect_peer) = connect_rx.recv().await.unwrap();
        assert_eq!(connect_id, 1);

        drop(client);
        let (disconnect_id, disconnect_peer) = disconnect_rx.recv().await.unwrap();
        assert_eq!(disconnect_id, 1);
        assert_eq!(connect_peer, disconnect_peer);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_ids_increase_monotonically() {
        let upstream = spawn_stub_upstream(0, SUCCESS_REPLY.to_vec()).await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = ProxyServer::new(test_config(upstream))
            .with_on_connect(move |id, _| {
                tx.send(id).unwrap();
            })
            .start()
            .await
            .unwrap();

        for _ in 0..3 {
            let client = greeted_client(handle.local_addr()).await;
            drop(client);
        }

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(rx.recv().await.unwrap());
        }
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(handle.total_connections(), 3);

        handle.shutdown().await.unwrap();
    }

    // ========================================================================
    // Admission Control Tests
    // ========================================================================

    #[tokio::test]
    async fn test_connection_ceiling_stalls_excess_client() {
        let upstream = spawn_stub_upstream(0, SUCCESS_REPLY.to_vec()).await;
        let mut config = test_config(upstream);
        config.max_open_connections = 1;
        let handle = ProxyServer::new(config).start().await.unwrap();
        let proxy = handle.local_addr();

        // First client occupies the only slot and keeps its session open.
        let mut first = greeted_client(proxy).await;
        first
            .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        first.read_exact(&mut reply).await.unwrap();

        // Second client connects at the OS level but its greeting must not
        // be answered while the slot is taken.
        let mut second = TcpStream::connect(proxy).await.unwrap();
        second.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut buf = [0u8; 2];
        let stalled =
            tokio::time::timeout(Duration::from_millis(300), second.read_exact(&mut buf)).await;
        assert!(stalled.is_err(), "handshake must stall at the ceiling");

        // Releasing the first slot lets the second handshake complete.
        drop(first);
        let reply = tokio::time::timeout(Duration::from_secs(2), second.read_exact(&mut buf))
            .await
            .expect("handshake must proceed after a slot frees");
        reply.unwrap();
        assert_eq!(buf, [0x05, 0x00]);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_connection_gauge() {
        let upstream = spawn_stub_upstream(0, SUCCESS_REPLY.to_vec()).await;
        let handle = ProxyServer::new(test_config(upstream)).start().await.unwrap();

        assert_eq!(handle.open_connections(), 0);

        let client = greeted_client(handle.local_addr()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.open_connections(), 1);

        drop(client);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handle.open_connections(), 0);

        handle.shutdown().await.unwrap();
    }

    // ========================================================================
    // Resolver Integration Tests
    // ========================================================================

    struct StaticDiscovery(Vec<String>);

    #[async_trait]
    impl Discover for StaticDiscovery {
        async fn candidates(
            &self,
        ) -> std::result::Result<Vec<String>, Box<dyn std::error::Error + Send + Sync>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_resolver_driven_upstream() {
        let upstream = spawn_stub_upstream(0, SUCCESS_REPLY.to_vec()).await;

        let config = ProxyConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            upstream_host: None,
            upstream_auth: UpstreamAuth::new("user", "secret"),
            max_open_connections: 0,
        };
        let resolver = Arc::new(PoolResolver::new(StaticDiscovery(vec![
            upstream.to_string()
        ])));
        let handle = ProxyServer::new(config)
            .with_resolver(resolver)
            .start()
            .await
            .unwrap();

        let mut client = greeted_client(handle.local_addr()).await;
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, SUCCESS_REPLY);

        handle.shutdown().await.unwrap();
    }
}
