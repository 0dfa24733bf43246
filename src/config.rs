//! On-disk YAML configuration: outer `Config`, per-node `NodeConfig`.
//!
//! Mirrors the original Go service's schema (`addr`, `http`, `socks5`, each
//! node carrying `ssh`, `anonymous`, `matches`) but keeps match tables in a
//! `BTreeMap` so iteration order is sorted-by-bridge-address rather than the
//! original's unspecified hash-map order (see DESIGN.md).

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default number of SSH sessions kept open in an HTTP node's tunnel pool.
pub const DEFAULT_POOL_SIZE: usize = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("node {node}: listen address {addr:?} is invalid")]
    BadListenAddr { node: String, addr: String },
    #[error("node {node}: ssh.url must be in the form user@host:port")]
    BadSshUrl { node: String },
    #[error("node {node}: pool_size must be greater than zero")]
    BadPoolSize { node: String },
}

/// `user@host:port` SSH endpoint plus the identity file used to authenticate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Scheme-less `user@host:port`, e.g. `goway@jump.example.com:22`.
    pub url: String,
    pub identity_file: PathBuf,
}

impl SshConfig {
    /// Split `url` into `(user, host, port)`.
    pub fn parse(&self) -> Result<(String, String, u16), ()> {
        let (user, rest) = self.url.split_once('@').ok_or(())?;
        let (host, port) = rest.rsplit_once(':').ok_or(())?;
        let port: u16 = port.parse().map_err(|_| ())?;
        if user.is_empty() || host.is_empty() {
            return Err(());
        }
        Ok((user.to_string(), host.to_string(), port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub addr: String,
    pub ssh: SshConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anonymous: Option<String>,
    #[serde(default)]
    pub matches: BTreeMap<String, Vec<String>>,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

impl NodeConfig {
    /// Parses `addr`, accepting the Go-style `:PORT` shorthand (bind all
    /// interfaces) in addition to a fully-qualified `host:port`.
    pub fn listen_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        match self.addr.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{port}").parse(),
            None => self.addr.parse(),
        }
    }

    /// Validate the fields the core actually depends on; called once per
    /// node at startup so bad config fails fast (`ConfigInvalid`, §7).
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.listen_addr().is_err() {
            return Err(ConfigError::BadListenAddr {
                node: name.to_string(),
                addr: self.addr.clone(),
            });
        }
        self.ssh.parse().map_err(|_| ConfigError::BadSshUrl {
            node: name.to_string(),
        })?;
        if self.pool_size == 0 {
            return Err(ConfigError::BadPoolSize {
                node: name.to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub addr: String,
    #[serde(default)]
    pub http: BTreeMap<String, NodeConfig>,
    #[serde(default)]
    pub socks5: BTreeMap<String, NodeConfig>,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, node) in &self.http {
            node.validate(name)?;
        }
        for (name, node) in &self.socks5 {
            node.validate(&format!("socks5/{name}"))?;
        }
        Ok(())
    }
}

/// Load and validate a config file.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    cfg.validate()?;
    Ok(cfg)
}

/// Write a starter config, mirroring the original's `config.Default`.
pub fn write_default(path: &Path) -> Result<(), ConfigError> {
    let mut cfg = Config {
        addr: ":8000".to_string(),
        ..Default::default()
    };

    let mut matches = BTreeMap::new();
    matches.insert(
        "us1.example.com:3128".to_string(),
        vec!["*.openai.com".to_string()],
    );

    cfg.http.insert(
        "hk1".to_string(),
        NodeConfig {
            addr: ":8001".to_string(),
            ssh: SshConfig {
                url: "goway@localhost:22".to_string(),
                identity_file: PathBuf::from("./id_goway"),
            },
            anonymous: Some("127.0.0.1:3128".to_string()),
            matches,
            pool_size: DEFAULT_POOL_SIZE,
        },
    );

    let text = serde_yaml::to_string(&cfg).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(path, text).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssh_url_parses_user_host_port() {
        let ssh = SshConfig {
            url: "goway@jump.example.com:2222".to_string(),
            identity_file: PathBuf::from("id"),
        };
        let (user, host, port) = ssh.parse().unwrap();
        assert_eq!(user, "goway");
        assert_eq!(host, "jump.example.com");
        assert_eq!(port, 2222);
    }

    #[test]
    fn ssh_url_rejects_missing_user() {
        let ssh = SshConfig {
            url: "jump.example.com:22".to_string(),
            identity_file: PathBuf::from("id"),
        };
        assert!(ssh.parse().is_err());
    }

    #[test]
    fn node_validate_rejects_zero_pool_size() {
        let node = NodeConfig {
            addr: "127.0.0.1:8001".to_string(),
            ssh: SshConfig {
                url: "goway@localhost:22".to_string(),
                identity_file: PathBuf::from("id"),
            },
            anonymous: None,
            matches: BTreeMap::new(),
            pool_size: 0,
        };
        assert!(matches!(
            node.validate("n"),
            Err(ConfigError::BadPoolSize { .. })
        ));
    }
}
