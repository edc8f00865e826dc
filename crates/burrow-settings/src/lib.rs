//! Layered TOML configuration for the burrow proxy.
//!
//! Loads configuration from two locations:
//! - Global config: `~/.config/burrow/burrow.toml`
//! - Local config: `<cwd>/.burrow/burrow.toml`
//!
//! Local values take precedence field by field; unset fields fall through
//! to the global file and finally to built-in defaults.
//!
//! # Example
//!
//! ```no_run
//! use burrow_settings::ConfigLoader;
//!
//! let config = ConfigLoader::load(std::path::Path::new("."));
//! println!("{:?}", config.upstream.host);
//! ```

mod loader;

pub use loader::ConfigLoader;

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Errors from settings operations.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// TOML deserialization failed.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization failed.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// I/O error reading or writing a config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level burrow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BurrowConfig {
    /// Listen address for the proxy, e.g. `127.0.0.1:1080`.
    #[serde(default)]
    pub listen: Option<String>,

    #[serde(default)]
    pub upstream: UpstreamSettings,

    #[serde(default)]
    pub limits: LimitSettings,

    #[serde(default)]
    pub discovery: DiscoverySettings,
}

/// The remote SOCKS5 server and its credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamSettings {
    /// Static upstream host. Unset means "pick one via discovery".
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

/// Resource ceilings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitSettings {
    /// Maximum concurrently open client connections. `0` or unset means
    /// unbounded.
    #[serde(default)]
    pub max_open_connections: Option<usize>,
}

/// Server-directory lookup tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoverySettings {
    /// Directory endpoint override.
    #[serde(default)]
    pub url: Option<String>,

    /// Load cutoff override (percent).
    #[serde(default)]
    pub max_load: Option<u8>,
}

impl BurrowConfig {
    /// Load a config from a single TOML file.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Write the config to a TOML file, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Merge `other` on top of `self`; fields set in `other` win.
    pub fn merge(self, other: Self) -> Self {
        Self {
            listen: other.listen.or(self.listen),
            upstream: UpstreamSettings {
                host: other.upstream.host.or(self.upstream.host),
                username: other.upstream.username.or(self.upstream.username),
                password: other.upstream.password.or(self.upstream.password),
            },
            limits: LimitSettings {
                max_open_connections: other
                    .limits
                    .max_open_connections
                    .or(self.limits.max_open_connections),
            },
            discovery: DiscoverySettings {
                url: other.discovery.url.or(self.discovery.url),
                max_load: other.discovery.max_load.or(self.discovery.max_load),
            },
        }
    }
}
