//! Authenticated SOCKS5 forwarding proxy.
//!
//! `burrow-proxy` accepts plain (unauthenticated) SOCKS5 clients and relays
//! them through a remote SOCKS5 server that requires username/password
//! authentication. The remote server is either configured statically or
//! picked per connection by a pluggable resolver.
//!
//! # Architecture
//!
//! ```text
//! SOCKS5 client (no auth)
//!       |
//!       v
//! ProxyServer (accept loop, connection cap, lifecycle hooks)
//!       |
//!       +-- Resolve::resolve() --> live upstream host:port
//!       |        |
//!       |        +-- PoolResolver: cached candidates, random sample,
//!       |            liveness probe, eviction of dead entries
//!       |
//!       +-- greet client, dial + authenticate upstream (RFC 1929)
//!       |
//!       +-- forward CONNECT request/reply byte-for-byte
//!       |
//!       +-- relay both directions until either side closes
//! ```
//!
//! # Components
//!
//! - [`ProxyServer`]: owns the listener, bounds concurrency, fires hooks
//! - [`Resolve`]: capability producing a reachable upstream address
//! - [`PoolResolver`]: default resolver over a [`Discover`] candidate source
//! - [`ReplyCode`]: RFC 1928 reply codes mirrored from the upstream
//!
//! # Usage
//!
//! ```ignore
//! use burrow_proxy::{ProxyConfig, ProxyServer, UpstreamAuth};
//!
//! let config = ProxyConfig {
//!     upstream_host: Some("proxy.example.net".to_string()),
//!     upstream_auth: UpstreamAuth::new("user", "secret"),
//!     ..Default::default()
//! };
//! let handle = ProxyServer::new(config).start().await?;
//! println!("listening on {}", handle.local_addr());
//! handle.shutdown().await?;
//! ```
//!
//! # Trust model
//!
//! The listening socket is the trust boundary: clients are never asked for
//! credentials. The configured username/password are only ever sent to the
//! upstream server, inside the RFC 1929 subnegotiation.

mod relay;
mod resolver;
mod server;
mod socks;

pub use resolver::{Discover, PoolResolver, Resolve, ResolveError};
pub use server::{ProxyConfig, ProxyHandle, ProxyServer};
pub use socks::{ReplyCode, UpstreamAuth};

use std::net::SocketAddr;

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors that can occur while serving a connection or running the server.
///
/// Per-connection variants surface through the on-error hook and abort only
/// the connection that produced them; `Bind` and `UpstreamNotConfigured`
/// are startup failures.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Failed to bind the listening socket.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Neither a static upstream host nor a resolver was configured.
    #[error("no upstream host configured and no resolver installed")]
    UpstreamNotConfigured,

    /// The client spoke a SOCKS version other than 5.
    #[error("unsupported SOCKS version: 0x{0:02x}")]
    UnsupportedVersion(u8),

    /// The client did not offer the no-authentication method.
    #[error("client offered no acceptable authentication method")]
    NoAcceptableAuthMethod,

    /// The resolver could not produce a reachable upstream.
    #[error("upstream resolution failed: {0}")]
    UpstreamResolution(#[from] ResolveError),

    /// Dialing the upstream server failed.
    #[error("upstream {host} unreachable: {source}")]
    UpstreamUnreachable {
        host: String,
        #[source]
        source: std::io::Error,
    },

    /// The upstream selected an authentication method other than
    /// username/password.
    #[error("upstream selected auth method 0x{0:02x} instead of username/password")]
    UpstreamAuthMethodMismatch(u8),

    /// The upstream rejected the configured credentials.
    #[error("upstream rejected the configured credentials")]
    UpstreamAuthRejected,

    /// Username or password exceeds the 255-byte limit imposed by the
    /// RFC 1929 length-prefix fields.
    #[error("username and password must each fit in 255 bytes")]
    CredentialsTooLong,

    /// The client requested a command other than CONNECT.
    #[error("unsupported SOCKS command: 0x{0:02x}")]
    UnsupportedCommand(u8),

    /// The client request carried an unknown address type.
    #[error("unsupported address type: 0x{0:02x}")]
    UnsupportedAddressType(u8),

    /// The upstream answered the CONNECT with a failure reply.
    #[error("upstream refused CONNECT: {0}")]
    UpstreamReply(ReplyCode),

    /// Plain I/O failure during the handshake or relay.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
