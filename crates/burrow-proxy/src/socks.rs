//! SOCKS5 protocol engine.
//!
//! Implements both sides of the forwarding handshake as plain
//! request/response transformations over byte streams:
//!
//! - the client-facing greeting (RFC 1928 §3, no-authentication only),
//! - the upstream-facing method selection and username/password
//!   subnegotiation (RFC 1929),
//! - the CONNECT request/reply exchange, copied byte-for-byte between
//!   client and upstream (RFC 1928 §4 through §6).
//!
//! Every address-typed field is fully sized by its leading type/length
//! byte before the remaining bytes are read; nothing is read speculatively.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::{ProxyError, Result};

// +----+----------+----------+
// |VER | NMETHODS | METHODS  |
// +----+----------+----------+
// | 1  |    1     | 1 to 255 |
// +----+----------+----------+
//
// +----+-----+-------+------+----------+----------+
// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
// +----+-----+-------+------+----------+----------+
// | 1  |  1  | X'00' |  1   | Variable |    2     |
// +----+-----+-------+------+----------+----------+

pub(crate) const SOCKS_VERSION: u8 = 0x05;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USERNAME_PASSWORD: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

const AUTH_VERSION: u8 = 0x01;
const AUTH_SUCCESS: u8 = 0x00;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// Default SOCKS5 port, appended to upstream hosts that carry none.
const DEFAULT_SOCKS_PORT: u16 = 1080;

/// Connect timeout for the upstream session socket.
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// RFC 1928 CONNECT reply codes as answered by the upstream server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    GeneralFailure,
    RulesetDenied,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddressTypeNotSupported,
    /// A reply byte outside the range defined by RFC 1928.
    Unknown(u8),
}

impl ReplyCode {
    pub(crate) fn from_byte(byte: u8) -> Self {
        match byte {
            0x01 => ReplyCode::GeneralFailure,
            0x02 => ReplyCode::RulesetDenied,
            0x03 => ReplyCode::NetworkUnreachable,
            0x04 => ReplyCode::HostUnreachable,
            0x05 => ReplyCode::ConnectionRefused,
            0x06 => ReplyCode::TtlExpired,
            0x07 => ReplyCode::CommandNotSupported,
            0x08 => ReplyCode::AddressTypeNotSupported,
            other => ReplyCode::Unknown(other),
        }
    }

    /// The byte echoed to the client. Codes RFC 1928 does not define are
    /// reported as a general failure.
    pub(crate) fn client_reply_byte(self) -> u8 {
        match self {
            ReplyCode::GeneralFailure => 0x01,
            ReplyCode::RulesetDenied => 0x02,
            ReplyCode::NetworkUnreachable => 0x03,
            ReplyCode::HostUnreachable => 0x04,
            ReplyCode::ConnectionRefused => 0x05,
            ReplyCode::TtlExpired => 0x06,
            ReplyCode::CommandNotSupported => 0x07,
            ReplyCode::AddressTypeNotSupported => 0x08,
            ReplyCode::Unknown(_) => REP_GENERAL_FAILURE,
        }
    }
}

impl std::fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplyCode::GeneralFailure => write!(f, "general SOCKS server failure"),
            ReplyCode::RulesetDenied => write!(f, "connection not allowed by ruleset"),
            ReplyCode::NetworkUnreachable => write!(f, "network unreachable"),
            ReplyCode::HostUnreachable => write!(f, "host unreachable"),
            ReplyCode::ConnectionRefused => write!(f, "connection refused"),
            ReplyCode::TtlExpired => write!(f, "TTL expired"),
            ReplyCode::CommandNotSupported => write!(f, "command not supported"),
            ReplyCode::AddressTypeNotSupported => write!(f, "address type not supported"),
            ReplyCode::Unknown(byte) => write!(f, "unknown reply 0x{byte:02x}"),
        }
    }
}

/// Credentials presented to the upstream server (RFC 1929).
#[derive(Debug, Clone)]
pub struct UpstreamAuth {
    pub username: String,
    pub password: String,
}

impl UpstreamAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Full failure reply with a zero IPv4 bound address.
fn error_reply(code: u8) -> [u8; 10] {
    [
        SOCKS_VERSION,
        code,
        0x00,      // reserved
        ATYP_IPV4, // address type
        0, 0, 0, 0, // 0.0.0.0
        0, 0, // port 0
    ]
}

/// Negotiate the client greeting (RFC 1928 §3).
///
/// The proxy never asks clients for credentials; the listening socket is
/// the trust boundary. Clients that do not offer the no-authentication
/// method are refused with `0xFF` and the connection fails.
pub(crate) async fn greet_client<S>(client: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    client.read_exact(&mut header).await?;

    if header[0] != SOCKS_VERSION {
        return Err(ProxyError::UnsupportedVersion(header[0]));
    }

    let mut methods = vec![0u8; header[1] as usize];
    client.read_exact(&mut methods).await?;

    if !methods.contains(&METHOD_NO_AUTH) {
        client
            .write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE])
            .await?;
        return Err(ProxyError::NoAcceptableAuthMethod);
    }

    client.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;
    Ok(())
}

/// Normalize an upstream host into a dialable `host:port`.
///
/// Strips a leading `socks5://` scheme and appends the default SOCKS port
/// when the host carries none. Hosts that already name a port (including
/// candidates produced by a resolver) pass through unchanged.
pub(crate) fn normalize_upstream_addr(host: &str) -> String {
    let host = host.strip_prefix("socks5://").unwrap_or(host);
    if host.contains(':') {
        host.to_string()
    } else {
        format!("{host}:{DEFAULT_SOCKS_PORT}")
    }
}

/// Open the TCP session to the upstream server.
pub(crate) async fn connect_upstream(addr: &str) -> Result<TcpStream> {
    let connect = TcpStream::connect(addr);
    match tokio::time::timeout(UPSTREAM_CONNECT_TIMEOUT, connect).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(ProxyError::UpstreamUnreachable {
            host: addr.to_string(),
            source,
        }),
        Err(_) => Err(ProxyError::UpstreamUnreachable {
            host: addr.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
        }),
    }
}

/// Authenticate to the upstream server with username/password (RFC 1929).
///
/// Offers only the username/password method; any other selection is a
/// protocol mismatch and aborts the connection.
pub(crate) async fn authenticate_upstream<S>(upstream: &mut S, auth: &UpstreamAuth) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // The RFC 1929 length prefixes are single bytes.
    if auth.username.len() > 255 || auth.password.len() > 255 {
        return Err(ProxyError::CredentialsTooLong);
    }

    upstream
        .write_all(&[SOCKS_VERSION, 0x01, METHOD_USERNAME_PASSWORD])
        .await?;

    let mut selection = [0u8; 2];
    upstream.read_exact(&mut selection).await?;
    if selection[1] != METHOD_USERNAME_PASSWORD {
        return Err(ProxyError::UpstreamAuthMethodMismatch(selection[1]));
    }

    let mut request = Vec::with_capacity(3 + auth.username.len() + auth.password.len());
    request.push(AUTH_VERSION);
    request.push(auth.username.len() as u8);
    request.extend_from_slice(auth.username.as_bytes());
    request.push(auth.password.len() as u8);
    request.extend_from_slice(auth.password.as_bytes());
    upstream.write_all(&request).await?;

    let mut status = [0u8; 2];
    upstream.read_exact(&mut status).await?;
    if status[1] != AUTH_SUCCESS {
        return Err(ProxyError::UpstreamAuthRejected);
    }

    Ok(())
}

/// Forward the CONNECT exchange between client and upstream.
///
/// The client request is read with exact framing and written to the
/// upstream verbatim; the upstream reply is read the same way and written
/// back verbatim. A failure reply from the upstream is both surfaced as
/// [`ProxyError::UpstreamReply`] and echoed to the client with the
/// matching reply code.
pub(crate) async fn forward_connect<C, U>(client: &mut C, upstream: &mut U) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let request = read_connect_request(client).await?;
    upstream.write_all(&request).await?;

    let reply = read_connect_reply(upstream, client).await?;
    client.write_all(&reply).await?;

    Ok(())
}

/// Read the client's CONNECT request, returning the raw bytes.
///
/// Unsupported commands and address types are answered with the matching
/// full SOCKS5 failure reply before the error is returned.
async fn read_connect_request<C>(client: &mut C) -> Result<Vec<u8>>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 4];
    client.read_exact(&mut header).await?;

    if header[0] != SOCKS_VERSION {
        return Err(ProxyError::UnsupportedVersion(header[0]));
    }
    if header[1] != CMD_CONNECT {
        // Best-effort reply; the client sees a drop if the write fails.
        client
            .write_all(&error_reply(REP_COMMAND_NOT_SUPPORTED))
            .await
            .ok();
        return Err(ProxyError::UnsupportedCommand(header[1]));
    }

    let mut request = header.to_vec();
    let addr_len = match header[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            client.read_exact(&mut len).await?;
            request.push(len[0]);
            len[0] as usize
        }
        other => {
            client
                .write_all(&error_reply(REP_ADDRESS_TYPE_NOT_SUPPORTED))
                .await
                .ok();
            return Err(ProxyError::UnsupportedAddressType(other));
        }
    };

    let mut rest = vec![0u8; addr_len + 2]; // address + port
    client.read_exact(&mut rest).await?;
    request.extend_from_slice(&rest);

    Ok(request)
}

/// Read the upstream's CONNECT reply, returning the raw bytes.
///
/// Non-success reply codes are echoed to the client and surfaced as
/// [`ProxyError::UpstreamReply`].
async fn read_connect_reply<U, C>(upstream: &mut U, client: &mut C) -> Result<Vec<u8>>
where
    U: AsyncRead + AsyncWrite + Unpin,
    C: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 4];
    upstream.read_exact(&mut header).await?;

    if header[0] != SOCKS_VERSION {
        client.write_all(&error_reply(REP_GENERAL_FAILURE)).await.ok();
        return Err(ProxyError::UnsupportedVersion(header[0]));
    }

    if header[1] != REP_SUCCESS {
        let code = ReplyCode::from_byte(header[1]);
        client
            .write_all(&error_reply(code.client_reply_byte()))
            .await
            .ok();
        return Err(ProxyError::UpstreamReply(code));
    }

    let mut reply = header.to_vec();
    let addr_len = match header[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            upstream.read_exact(&mut len).await?;
            reply.push(len[0]);
            len[0] as usize
        }
        other => {
            client
                .write_all(&error_reply(REP_ADDRESS_TYPE_NOT_SUPPORTED))
                .await
                .ok();
            return Err(ProxyError::UnsupportedAddressType(other));
        }
    };

    let mut rest = vec![0u8; addr_len + 2];
    upstream.read_exact(&mut rest).await?;
    reply.extend_from_slice(&rest);

    Ok(reply)
}
