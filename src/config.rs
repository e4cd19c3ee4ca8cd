use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use tokio::fs;

use crate::cluster::SeedAddr;

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 1_000;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    clusters: Vec<ClusterConfig>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file {}", path.display()))?;

        let cfg: Config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        cfg.ensure_valid()?;
        Ok(cfg)
    }

    /// Ensure configuration correctness.
    pub fn ensure_valid(&self) -> Result<()> {
        if self.clusters.is_empty() {
            bail!("configuration must declare at least one cluster");
        }

        let mut names = HashSet::new();
        for cluster in &self.clusters {
            cluster.ensure_valid()?;
            if !names.insert(cluster.name.to_lowercase()) {
                bail!("duplicate cluster name detected: {}", cluster.name);
            }
        }
        Ok(())
    }

    /// All configured clusters.
    pub fn clusters(&self) -> &[ClusterConfig] {
        &self.clusters
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    /// Seed nodes, `host:port` pairs or absolute Unix socket paths.
    #[serde(default)]
    pub servers: Vec<String>,
    /// Pre-shared secret sent as `AUTH <secret>` before any other command.
    #[serde(default)]
    pub auth: Option<String>,
    /// Worker threads owning private cluster views.
    #[serde(default)]
    pub thread: Option<usize>,
    /// Connect timeout for node sockets, in milliseconds.
    #[serde(default)]
    pub connect_timeout: Option<u64>,
}

impl ClusterConfig {
    /// Validate consistency of a cluster configuration.
    pub fn ensure_valid(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("cluster name cannot be empty");
        }
        if self.servers.is_empty() {
            bail!("cluster {} must provide at least one seed node", self.name);
        }
        self.seeds().map(|_| ())
    }

    /// Seed addresses for the initial topology fetch.
    pub fn seeds(&self) -> Result<Vec<SeedAddr>> {
        self.servers
            .iter()
            .map(|server| parse_seed(server))
            .collect()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS))
    }
}

fn parse_seed(server: &str) -> Result<SeedAddr> {
    #[cfg(unix)]
    if server.starts_with('/') {
        return Ok(SeedAddr::Unix(server.into()));
    }

    let (ip, port_str) = server
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("invalid seed address {server}"))?;
    let port = port_str
        .trim()
        .parse::<u16>()
        .with_context(|| format!("invalid port in seed address {server}"))?;
    Ok(SeedAddr::Tcp {
        ip: ip.to_string(),
        port,
    })
}
