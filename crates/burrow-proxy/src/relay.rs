//! Bidirectional byte relay between client and upstream.
//!
//! Two copy directions run concurrently; whichever terminates first wins
//! and both sockets are closed before the function returns. An abrupt
//! client disconnect (connection reset) is a normal close, not an error.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::Result;

/// Relay bytes in both directions until either side closes.
///
/// The first direction to finish (graceful EOF, reset, or any other I/O
/// outcome) decides the result; the losing direction is cancelled and
/// both streams are dropped (closed) on return.
pub(crate) async fn relay<C, U>(client: C, upstream: U) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let first = tokio::select! {
        r = tokio::io::copy(&mut client_read, &mut upstream_write) => r,
        r = tokio::io::copy(&mut upstream_read, &mut client_write) => r,
    };

    match first {
        Ok(bytes) => {
            debug!(bytes, "relay finished");
            Ok(())
        }
        Err(e)
            if e.kind() == std::io::ErrorKind::ConnectionReset
                || e.kind() == std::io::ErrorKind::BrokenPipe =>
        {
            // Abrupt peer disconnects are common and not protocol errors.
            debug!("relay closed by peer reset");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
