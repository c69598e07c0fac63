use std::path::Path;
use std::time::Duration;
use std::{fs, io};

use color_eyre::eyre::WrapErr;

use crate::cache::CacheConfig;
use crate::chunking::ChunkingOptions;

/// Settings for every component, read from TOML. Every section and key is optional.
#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub cache: CacheConfig,
    pub chunking: ChunkingOptions,
    pub invoker: InvokerConfig,
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct InvokerConfig {
    /// Used for invocations that don't set their own timeout.
    pub default_timeout_secs: u64,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        InvokerConfig {
            default_timeout_secs: 10,
        }
    }
}

impl InvokerConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

/// Read the config from `path`, or from stdin if `path` is `-`.
///
/// NOTE: uses blocking I/O internally.
pub fn read(path: &Path) -> crate::Result<Config> {
    let config_toml = if path == Path::new("-") {
        io::read_to_string(io::stdin().lock()).wrap_err("error reading from stdin")?
    } else {
        fs::read_to_string(path)
            .wrap_err_with(|| format!("error reading from {}", path.display()))?
    };

    parse(&config_toml).wrap_err_with(|| format!("error parsing config from {}", path.display()))
}

fn parse(config_toml: &str) -> crate::Result<Config> {
    Ok(toml::from_str(config_toml)?)
}
