//! Directory lookup for SOCKS5-capable VPN servers.
//!
//! `burrow-discovery` asks a public server directory for its current
//! listing, filters it down to servers that actually speak SOCKS5 and have
//! headroom, and returns their hostnames. Callers feed the result into a
//! candidate pool; this crate makes no liveness promises, and entries are
//! stale the moment the directory answers.
//!
//! The default directory is the NordVPN server catalogue, which exposes an
//! unauthenticated JSON listing of every server with its load, status, and
//! supported technologies.

use serde::Deserialize;
use tracing::debug;

/// Default directory endpoint. `limit=0` asks for the full listing.
pub const DEFAULT_DIRECTORY_URL: &str = "https://api.nordvpn.com/v1/servers?limit=0";

/// Technology id the directory uses for SOCKS5 proxy support.
const SOCKS_TECHNOLOGY_ID: u32 = 7;

/// Servers above this load fraction are skipped.
const DEFAULT_MAX_LOAD: u8 = 80;

/// The directory endpoint answers browser user agents more reliably than
/// bare client libraries.
const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:86.0) Gecko/20100101 Firefox/86.0";

/// Errors from directory lookups.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// Transport failure or undecodable response body.
    #[error("directory request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The directory answered with a non-success status code.
    #[error("directory returned status {0}")]
    Status(reqwest::StatusCode),
}

/// One server entry as published by the directory.
///
/// Only the fields the filter needs are modelled; everything else in the
/// listing is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryServer {
    pub hostname: String,
    #[serde(default)]
    pub station: String,
    #[serde(default)]
    pub load: u8,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub technologies: Vec<Technology>,
}

impl DirectoryServer {
    fn supports_socks(&self) -> bool {
        self.technologies.iter().any(|t| t.id == SOCKS_TECHNOLOGY_ID)
    }
}

/// A technology tag attached to a server entry.
#[derive(Debug, Clone, Deserialize)]
pub struct Technology {
    pub id: u32,
    #[serde(default)]
    pub identifier: String,
}

/// Client for the server directory.
pub struct DirectoryClient {
    http: reqwest::Client,
    url: String,
    max_load: u8,
}

impl DirectoryClient {
    /// Create a client against the default directory.
    ///
    /// # Errors
    /// * [`DiscoveryError::Http`] - the underlying HTTP client could not
    ///   be constructed (TLS backend initialization).
    pub fn new() -> Result<Self, DiscoveryError> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            http,
            url: DEFAULT_DIRECTORY_URL.to_string(),
            max_load: DEFAULT_MAX_LOAD,
        })
    }

    /// Point the client at a different directory endpoint.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Adjust the load cutoff used when filtering the listing.
    pub fn with_max_load(mut self, max_load: u8) -> Self {
        self.max_load = max_load;
        self
    }

    /// Fetch the listing and return the hostnames of SOCKS5-capable,
    /// online, not-overloaded servers.
    ///
    /// # Errors
    /// * [`DiscoveryError::Status`] - non-2xx answer from the directory.
    /// * [`DiscoveryError::Http`] - transport or decode failure.
    pub async fn socks_hosts(&self) -> Result<Vec<String>, DiscoveryError> {
        let response = self
            .http
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DiscoveryError::Status(status));
        }

        let servers: Vec<DirectoryServer> = response.json().await?;
        let hosts = filter_socks_servers(servers, self.max_load);
        debug!(count = hosts.len(), "directory listing filtered");
        Ok(hosts)
    }
}

/// Keep servers that are online, under the load cutoff, and tagged with
/// SOCKS5 support; return their hostnames.
pub fn filter_socks_servers(servers: Vec<DirectoryServer>, max_load: u8) -> Vec<String> {
    servers
        .into_iter()
        .filter(|s| s.status == "online")
        .filter(|s| s.load <= max_load)
        .filter(DirectoryServer::supports_socks)
        .map(|s| s.hostname)
        .collect()
}
