//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

/// Daemon configuration. File: ~/.config/swarmcast/config.toml or
/// /etc/swarmcast/config.toml.
/// Env overrides: SWARMCAST_DISCOVERY_PORT, SWARMCAST_ROOT, SWARMCAST_BUFFER.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Discovery UDP port (default 50000). All peers must agree on it.
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Shared folder to index and serve (default /data).
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Buffer folder downloads are written to (default <root>/downloads).
    #[serde(default)]
    pub buffer: Option<PathBuf>,
}

fn default_discovery_port() -> u16 {
    50000
}

fn default_root() -> PathBuf {
    PathBuf::from("/data")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            root: default_root(),
            buffer: None,
        }
    }
}

impl Config {
    pub fn buffer_dir(&self) -> PathBuf {
        self.buffer
            .clone()
            .unwrap_or_else(|| self.root.join("downloads"))
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("SWARMCAST_DISCOVERY_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.discovery_port = p;
        }
    }
    if let Ok(s) = std::env::var("SWARMCAST_ROOT") {
        c.root = PathBuf::from(s);
    }
    if let Ok(s) = std::env::var("SWARMCAST_BUFFER") {
        c.buffer = Some(PathBuf::from(s));
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/swarmcast/config.toml"));
    }
    out.push(PathBuf::from("/etc/swarmcast/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}
