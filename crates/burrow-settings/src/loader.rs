//! Layered configuration loading.
//!
//! Loads and merges configuration from two locations:
//! 1. Global: `~/.config/burrow/burrow.toml`
//! 2. Local: `<cwd>/.burrow/burrow.toml`
//!
//! Local values take precedence field by field. Missing files are silently
//! skipped; a malformed file emits a warning to stderr and is treated as
//! absent.

use crate::BurrowConfig;
use std::path::{Path, PathBuf};

/// Loads and merges `BurrowConfig` from global and local files.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load the merged configuration for the given working directory.
    pub fn load(cwd: &Path) -> BurrowConfig {
        let global = Self::load_optional(&Self::global_config_path());
        let local = Self::load_optional(&Self::local_config_path(cwd));
        global.merge(local)
    }

    /// Absolute path to the global config file.
    pub fn global_config_path() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("burrow"))
            .unwrap_or_else(|| PathBuf::from(".burrow"))
            .join("burrow.toml")
    }

    /// Path to the local config file under the given working directory.
    pub fn local_config_path(cwd: &Path) -> PathBuf {
        cwd.join(".burrow").join("burrow.toml")
    }

    fn load_optional(path: &Path) -> BurrowConfig {
        if !path.exists() {
            return BurrowConfig::default();
        }
        match BurrowConfig::load(path) {
            Ok(config) => config,
            Err(err) => {
                // Warn but don't fail: a malformed config shouldn't block startup.
                eprintln!("burrow-settings: warning: failed to parse {path:?}: {err}");
                BurrowConfig::default()
            }
        }
    }
}
