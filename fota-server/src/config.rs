//! Load config from file and environment.

use serde::Deserialize;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};

use fota_core::{ServerOptions, DEFAULT_PORT, MAX_REQUESTS};
use tracing::warn;

/// Server configuration. File: ~/.config/fota/server.toml or /etc/fota/server.toml.
/// Env overrides: FOTA_PORT, FOTA_BIND, FOTA_REPOSITORY, FOTA_UPSTREAM, FOTA_MAX_SESSIONS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// UDP listen port (default 8888).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Listen address (default `::`).
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    /// Directory holding `repository.repo` and the artifacts (default `firmwares`).
    #[serde(default = "default_repository_root")]
    pub repository_root: PathBuf,
    /// Concurrent sessions (default 20).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Repository asked for artifacts missing from the manifest.
    #[serde(default)]
    pub upstream: Option<SocketAddr>,
    /// Port nodes listen on for location answers (default: same as `port`).
    #[serde(default)]
    pub node_port: Option<u16>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind_address() -> IpAddr {
    IpAddr::V6(Ipv6Addr::UNSPECIFIED)
}
fn default_repository_root() -> PathBuf {
    PathBuf::from("firmwares")
}
fn default_max_sessions() -> usize {
    MAX_REQUESTS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
            repository_root: default_repository_root(),
            max_sessions: default_max_sessions(),
            upstream: None,
            node_port: None,
        }
    }
}

impl Config {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            max_sessions: self.max_sessions,
            upstream: self.upstream,
            node_port: self.node_port.unwrap_or(self.port),
        }
    }
}

/// Load config: defaults, then the config file (explicit path or the first one found), then env vars.
pub fn load(explicit: Option<&Path>) -> Config {
    let mut c = match explicit {
        Some(p) => load_path(p),
        None => load_file(),
    }
    .unwrap_or_default();
    if let Ok(s) = std::env::var("FOTA_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.port = p;
        }
    }
    if let Ok(s) = std::env::var("FOTA_BIND") {
        if let Ok(a) = s.parse::<IpAddr>() {
            c.bind_address = a;
        }
    }
    if let Ok(s) = std::env::var("FOTA_REPOSITORY") {
        c.repository_root = PathBuf::from(s);
    }
    if let Ok(s) = std::env::var("FOTA_UPSTREAM") {
        if let Ok(a) = s.parse::<SocketAddr>() {
            c.upstream = Some(a);
        }
    }
    if let Ok(s) = std::env::var("FOTA_MAX_SESSIONS") {
        if let Ok(n) = s.parse::<usize>() {
            c.max_sessions = n;
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/fota/server.toml"));
    }
    out.push(PathBuf::from("/etc/fota/server.toml"));
    out
}

fn load_file() -> Option<Config> {
    config_paths()
        .into_iter()
        .find(|p| p.exists())
        .and_then(|p| load_path(&p))
}

fn load_path(path: &Path) -> Option<Config> {
    let s = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read config, using defaults");
            return None;
        }
    };
    match parse(&s) {
        Ok(c) => Some(c),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "invalid config, using defaults");
            None
        }
    }
}

pub fn parse(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let c = parse("").unwrap();
        assert_eq!(c.port, 8888);
        assert_eq!(c.listen_addr(), "[::]:8888".parse().unwrap());
        assert_eq!(c.repository_root, PathBuf::from("firmwares"));
        assert_eq!(c.server_options().max_sessions, 20);
        assert_eq!(c.server_options().node_port, 8888);
    }

    #[test]
    fn full_file() {
        let c = parse(
            r#"
port = 9000
bind_address = "::1"
repository_root = "/srv/fw"
max_sessions = 4
upstream = "[2001:db8::1]:8888"
node_port = 8888
"#,
        )
        .unwrap();
        assert_eq!(c.listen_addr(), "[::1]:9000".parse().unwrap());
        let opts = c.server_options();
        assert_eq!(opts.max_sessions, 4);
        assert_eq!(opts.upstream, Some("[2001:db8::1]:8888".parse().unwrap()));
        assert_eq!(opts.node_port, 8888);
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(parse("proxy_port = 3128").is_err());
    }
}
