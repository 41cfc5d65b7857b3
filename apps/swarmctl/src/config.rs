use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "swarmctl.toml";
pub const CONFIG_ENV: &str = "SWARMCTL_CONFIG";

pub fn resolve_config_path(path: Option<PathBuf>) -> PathBuf {
    path.or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Only connect to hosts already present in known_hosts.
    Strict,
    /// Trust and record unknown host keys, refuse changed ones.
    #[default]
    AcceptNew,
    /// Skip host key verification entirely.
    Off,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_known_hosts() -> String {
    std::env::var("HOME")
        .map(|home| format!("{home}/.ssh/known_hosts"))
        .unwrap_or_else(|_| ".ssh/known_hosts".to_string())
}

fn default_probe_timeout_secs() -> u64 {
    3
}

fn default_concurrency() -> usize {
    16
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_step_timeout_secs() -> u64 {
    600
}

fn default_packages() -> Vec<String> {
    vec!["docker.io".to_string(), "glusterfs-client".to_string()]
}

fn default_volume() -> String {
    "piswarm-data".to_string()
}

fn default_mount_point() -> String {
    "/mnt/piswarm".to_string()
}

fn default_swarm_port() -> u16 {
    2377
}

fn default_validity_days() -> u32 {
    365
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshSettings {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default = "default_known_hosts")]
    pub known_hosts: String,
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            user: None,
            password: None,
            key_path: None,
            port: default_ssh_port(),
            known_hosts: default_known_hosts(),
            host_key_policy: HostKeyPolicy::default(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct InventorySettings {
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub subnet: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeSettingsConfig {
    #[serde(default = "default_probe_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for ProbeSettingsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_probe_timeout_secs(),
            concurrency: default_concurrency(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapSettings {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    #[serde(default = "default_packages")]
    pub packages: Vec<String>,
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            step_timeout_secs: default_step_timeout_secs(),
            packages: default_packages(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSettings {
    /// GlusterFS server to mount from. Falls back to the swarm manager.
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default = "default_volume")]
    pub volume: String,
    #[serde(default = "default_mount_point")]
    pub mount_point: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            server: None,
            volume: default_volume(),
            mount_point: default_mount_point(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwarmSettings {
    #[serde(default)]
    pub manager: Option<String>,
    #[serde(default)]
    pub join_token: Option<String>,
    #[serde(default = "default_swarm_port")]
    pub port: u16,
}

impl Default for SwarmSettings {
    fn default() -> Self {
        Self {
            manager: None,
            join_token: None,
            port: default_swarm_port(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateSettings {
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    /// File stem under /etc/ssl/piswarm. Defaults to the domain.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_validity_days")]
    pub validity_days: u32,
}

impl Default for CertificateSettings {
    fn default() -> Self {
        Self {
            domain: None,
            email: None,
            name: None,
            validity_days: default_validity_days(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SwarmConfig {
    #[serde(default)]
    pub ssh: SshSettings,
    #[serde(default)]
    pub inventory: InventorySettings,
    #[serde(default)]
    pub probe: ProbeSettingsConfig,
    #[serde(default)]
    pub bootstrap: BootstrapSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub swarm: SwarmSettings,
    #[serde(default)]
    pub certificate: CertificateSettings,
}

impl SwarmConfig {
    pub fn storage_server(&self) -> Option<&str> {
        self.storage
            .server
            .as_deref()
            .or(self.swarm.manager.as_deref())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

pub fn parse_config(contents: &str) -> Result<SwarmConfig> {
    let mut config: SwarmConfig = toml::from_str(contents)?;
    normalize(&mut config);
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<SwarmConfig> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "config file not found; using defaults");
        return Ok(SwarmConfig::default());
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config at {}", path.display()))?;
    parse_config(&contents).with_context(|| format!("Failed to parse config at {}", path.display()))
}

fn normalize(config: &mut SwarmConfig) {
    if config.ssh.port == 0 {
        config.ssh.port = default_ssh_port();
    }
    if config.ssh.known_hosts.trim().is_empty() {
        config.ssh.known_hosts = default_known_hosts();
    }
    if config.ssh.connect_timeout_secs == 0 {
        config.ssh.connect_timeout_secs = default_connect_timeout_secs();
    }
    if config.probe.timeout_secs == 0 {
        config.probe.timeout_secs = default_probe_timeout_secs();
    }
    config.probe.timeout_secs = config.probe.timeout_secs.clamp(1, 5);
    if config.probe.concurrency == 0 {
        config.probe.concurrency = default_concurrency();
    }
    if config.bootstrap.concurrency == 0 {
        config.bootstrap.concurrency = default_concurrency();
    }
    if config.bootstrap.step_timeout_secs == 0 {
        config.bootstrap.step_timeout_secs = default_step_timeout_secs();
    }
    if config.swarm.port == 0 {
        config.swarm.port = default_swarm_port();
    }
    if config.certificate.validity_days == 0 {
        config.certificate.validity_days = default_validity_days();
    }
    if config.storage.volume.trim().is_empty() {
        config.storage.volume = default_volume();
    }
    if config.storage.mount_point.trim().is_empty() {
        config.storage.mount_point = default_mount_point();
    }
    config.bootstrap.packages.retain(|pkg| !pkg.trim().is_empty());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = parse_config("").expect("parse");
        assert_eq!(config.ssh.port, 22);
        assert_eq!(config.probe.timeout_secs, 3);
        assert_eq!(config.bootstrap.concurrency, 16);
        assert_eq!(config.bootstrap.packages, vec!["docker.io", "glusterfs-client"]);
        assert_eq!(config.ssh.host_key_policy, HostKeyPolicy::AcceptNew);
        assert!(config.ssh.password.is_none());
    }

    #[test]
    fn sections_override_defaults_and_zeroes_are_normalized() {
        let config = parse_config(
            r#"
[ssh]
user = "ops"
port = 0
host_key_policy = "strict"

[inventory]
hosts = ["10.0.0.2", "10.0.0.3"]

[probe]
timeout_secs = 30
concurrency = 0

[storage]
volume = "shared"

[swarm]
manager = "10.0.0.2"
"#,
        )
        .expect("parse");
        assert_eq!(config.ssh.user.as_deref(), Some("ops"));
        assert_eq!(config.ssh.port, 22);
        assert_eq!(config.ssh.host_key_policy, HostKeyPolicy::Strict);
        assert_eq!(config.inventory.hosts.len(), 2);
        assert_eq!(config.probe.timeout_secs, 5);
        assert_eq!(config.probe.concurrency, 16);
        assert_eq!(config.storage.volume, "shared");
        assert_eq!(config.storage_server(), Some("10.0.0.2"));
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_config(&dir.path().join("absent.toml")).expect("load");
        assert_eq!(config, SwarmConfig::default());
    }

    #[test]
    fn malformed_file_reports_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("swarmctl.toml");
        std::fs::write(&path, "[ssh\nuser=").expect("write");
        let err = load_config(&path).expect_err("should fail");
        assert!(format!("{err:#}").contains("swarmctl.toml"));
    }
}
