use std::path::PathBuf;

use clap::{ArgAction, Parser};

#[derive(Parser)]
#[command(
    name = "burrow",
    about = "Forward local SOCKS5 clients through an authenticated upstream SOCKS5 server"
)]
pub struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Listen address (host:port)
    #[arg(short, long, value_name = "ADDR")]
    pub listen: Option<String>,

    /// Static upstream SOCKS5 server (host, host:port, or socks5://host);
    /// omit to pick one from the server directory per connection
    #[arg(long, value_name = "HOST")]
    pub upstream: Option<String>,

    /// Username for upstream authentication
    #[arg(short, long)]
    pub username: Option<String>,

    /// Password for upstream authentication
    #[arg(short, long)]
    pub password: Option<String>,

    /// Maximum concurrently open client connections (0 = unbounded)
    #[arg(long, value_name = "N")]
    pub max_connections: Option<usize>,

    /// Server-directory endpoint override
    #[arg(long, value_name = "URL")]
    pub directory_url: Option<String>,

    /// Load an additional config file on top of defaults
    #[arg(long = "config", value_name = "PATH")]
    pub extra_config: Option<PathBuf>,

    /// Ignore global and local config files; use only CLI flags
    #[arg(long)]
    pub no_config: bool,
}
