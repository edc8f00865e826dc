#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Proxy(#[from] burrow_proxy::ProxyError),

    #[error("{0}")]
    Settings(#[from] burrow_settings::SettingsError),

    #[error("{0}")]
    Discovery(#[from] burrow_discovery::DiscoveryError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}
