mod cli;
mod error;

use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use burrow_discovery::DirectoryClient;
use burrow_proxy::{Discover, PoolResolver, ProxyConfig, ProxyServer, UpstreamAuth};
use burrow_settings::{BurrowConfig, ConfigLoader};
use cli::Cli;
use error::CliError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    setup_tracing(cli.verbose);

    if let Err(e) = serve(cli).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn setup_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = std::env::var("BURROW_LOG").unwrap_or_else(|_| level.to_string());

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();
}

async fn serve(cli: Cli) -> Result<(), CliError> {
    // 1. Load and merge config.
    // --no-config skips global/local config files but --config <extra> still applies.
    let cwd = std::env::current_dir()?;
    let mut config = if cli.no_config {
        BurrowConfig::default()
    } else {
        ConfigLoader::load(&cwd)
    };
    if let Some(ref extra) = cli.extra_config {
        config = config.merge(BurrowConfig::load(extra)?);
    }

    // 2. Merge CLI overrides into config.
    if cli.listen.is_some() {
        config.listen = cli.listen;
    }
    if cli.upstream.is_some() {
        config.upstream.host = cli.upstream;
    }
    if cli.username.is_some() {
        config.upstream.username = cli.username;
    }
    if cli.password.is_some() {
        config.upstream.password = cli.password;
    }
    if cli.max_connections.is_some() {
        config.limits.max_open_connections = cli.max_connections;
    }
    if cli.directory_url.is_some() {
        config.discovery.url = cli.directory_url;
    }

    // 3. Build the proxy configuration.
    let listen_addr = config
        .listen
        .as_deref()
        .unwrap_or("127.0.0.1:1080")
        .parse()
        .map_err(|e| CliError::Other(format!("invalid listen address: {e}")))?;

    let username = config.upstream.username.clone().ok_or_else(|| {
        CliError::Other("upstream username is required (--username or [upstream] username)".into())
    })?;
    let password = config.upstream.password.clone().ok_or_else(|| {
        CliError::Other("upstream password is required (--password or [upstream] password)".into())
    })?;

    let proxy_config = ProxyConfig {
        listen_addr,
        upstream_host: config.upstream.host.clone(),
        upstream_auth: UpstreamAuth::new(username, password),
        max_open_connections: config.limits.max_open_connections.unwrap_or(0),
    };

    // 4. Wire lifecycle hooks to structured logging.
    let mut server = ProxyServer::new(proxy_config)
        .with_on_connect(|id, peer| info!(id, %peer, "client connected"))
        .with_on_disconnect(|id, peer| info!(id, %peer, "client disconnected"))
        .with_on_error(|id, peer, err| match peer {
            Some(peer) => warn!(id, %peer, error = %err, "connection failed"),
            None => warn!(error = %err, "accept failed"),
        });

    // 5. Without a static upstream, resolve one per connection from the
    // server directory.
    if config.upstream.host.is_none() {
        let mut directory = DirectoryClient::new()?;
        if let Some(ref url) = config.discovery.url {
            directory = directory.with_url(url.clone());
        }
        if let Some(max_load) = config.discovery.max_load {
            directory = directory.with_max_load(max_load);
        }
        server = server.with_resolver(Arc::new(PoolResolver::new(DirectoryDiscovery(directory))));
    }

    // 6. Serve until interrupted.
    let handle = server.start().await?;
    info!(addr = %handle.local_addr(), "proxy listening");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    handle.shutdown().await?;
    Ok(())
}

/// Adapts the directory client to the resolver's candidate source.
struct DirectoryDiscovery(DirectoryClient);

#[async_trait::async_trait]
impl Discover for DirectoryDiscovery {
    async fn candidates(
        &self,
    ) -> Result<Vec<String>, Box<dyn std::error::Error + Send + Sync>> {
        Ok(self.0.socks_hosts().await?)
    }
}
