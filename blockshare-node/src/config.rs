//! Load node settings from file and environment.

use std::path::PathBuf;
use std::time::Duration;

use blockshare_core::config as defaults;
use serde::Deserialize;
use tracing::warn;

/// File: ~/.config/blockshare/config.toml or /etc/blockshare/config.toml.
/// Env overrides: BLOCKSHARE_HOST, BLOCKSHARE_BLOCK_SIZE, BLOCKSHARE_CACHE_FILES.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Host name other nodes use to reach this one (default "localhost").
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_block_size")]
    pub block_size: u64,
    #[serde(default = "default_block_cache_files")]
    pub block_cache_files: usize,
    #[serde(default = "default_serve_workers")]
    pub serve_workers: usize,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_dispatch_timeout_secs")]
    pub dispatch_timeout_secs: u64,
}

fn default_host() -> String {
    "localhost".to_owned()
}
fn default_block_size() -> u64 {
    blockshare_core::DEFAULT_BLOCK_SIZE
}
fn default_block_cache_files() -> usize {
    defaults::DEFAULT_BLOCK_CACHE_FILES
}
fn default_serve_workers() -> usize {
    defaults::DEFAULT_SERVE_WORKERS
}
fn default_handshake_timeout_ms() -> u64 {
    defaults::DEFAULT_HANDSHAKE_TIMEOUT.as_millis() as u64
}
fn default_dispatch_timeout_secs() -> u64 {
    defaults::DEFAULT_DISPATCH_TIMEOUT.as_secs()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            block_size: default_block_size(),
            block_cache_files: default_block_cache_files(),
            serve_workers: default_serve_workers(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            dispatch_timeout_secs: default_dispatch_timeout_secs(),
        }
    }
}

impl Config {
    /// Tunables handed to the catalog and node.
    pub fn core(&self) -> blockshare_core::Config {
        blockshare_core::Config {
            block_size: self.block_size,
            block_cache_files: self.block_cache_files,
            serve_workers: self.serve_workers,
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            dispatch_timeout: Duration::from_secs(self.dispatch_timeout_secs),
            ..blockshare_core::Config::default()
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let c = load_file().unwrap_or_default();
    apply_overrides(c, |k| std::env::var(k).ok())
}

/// Apply `BLOCKSHARE_*` overrides looked up through `get`. Unparsable values are ignored.
pub fn apply_overrides(mut c: Config, get: impl Fn(&str) -> Option<String>) -> Config {
    if let Some(h) = get("BLOCKSHARE_HOST").filter(|h| !h.is_empty()) {
        c.host = h;
    }
    if let Some(s) = get("BLOCKSHARE_BLOCK_SIZE") {
        match s.parse::<u64>() {
            Ok(n) if n > 0 => c.block_size = n,
            _ => warn!(value = %s, "ignoring BLOCKSHARE_BLOCK_SIZE"),
        }
    }
    if let Some(s) = get("BLOCKSHARE_CACHE_FILES") {
        match s.parse::<usize>() {
            Ok(n) => c.block_cache_files = n,
            Err(_) => warn!(value = %s, "ignoring BLOCKSHARE_CACHE_FILES"),
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/blockshare/config.toml"));
    }
    out.push(PathBuf::from("/etc/blockshare/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    let text = match std::fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read config file");
            return None;
        }
    };
    parse(&text)
        .map_err(|e| warn!(path = %path.display(), error = %e, "invalid config file"))
        .ok()
}

fn parse(text: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_gives_defaults() {
        assert_eq!(parse("").unwrap(), Config::default());
        assert_eq!(Config::default().core(), blockshare_core::Config::default());
    }

    #[test]
    fn file_values_are_read() {
        let c = parse("host = \"10.0.0.5\"\nblock_size = 4096\ndispatch_timeout_secs = 5\n").unwrap();
        assert_eq!(c.host, "10.0.0.5");
        assert_eq!(c.core().block_size, 4096);
        assert_eq!(c.core().dispatch_timeout, Duration::from_secs(5));
        assert_eq!(c.serve_workers, defaults::DEFAULT_SERVE_WORKERS);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(parse("proxy_port = 3128\n").is_err());
    }

    #[test]
    fn env_overrides_win_and_bad_values_are_ignored() {
        let env: HashMap<&str, &str> = [
            ("BLOCKSHARE_HOST", "node-b"),
            ("BLOCKSHARE_BLOCK_SIZE", "zero"),
            ("BLOCKSHARE_CACHE_FILES", "0"),
        ]
        .into();
        let c = apply_overrides(Config::default(), |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.host, "node-b");
        assert_eq!(c.block_size, blockshare_core::DEFAULT_BLOCK_SIZE);
        assert_eq!(c.block_cache_files, 0);
    }
}
