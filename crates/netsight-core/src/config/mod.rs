use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::mitm::Authority;

/// Top-level configuration for netsight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Tunnel device and outward socket settings.
    #[serde(default)]
    pub vpn: VpnConfig,

    /// TLS interception settings.
    #[serde(default)]
    pub mitm: MitmConfig,

    /// Which applications are monitored and how.
    #[serde(default)]
    pub monitoring: MonitoringConfig,

    /// Where observed metadata goes.
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Optional tracker host list (one host per line).
    #[serde(default)]
    pub trackers: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpnConfig {
    /// Name of the TUN device.
    #[serde(default = "default_device_name")]
    pub device_name: String,

    /// Address assigned to the TUN device.
    #[serde(default = "default_vpn_address")]
    pub address: String,

    /// Prefix length of the tunnel subnet.
    #[serde(default = "default_prefix_len")]
    pub prefix_len: u8,

    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// Upstream resolver for queries addressed to the tunnel itself.
    #[serde(default = "default_dns_server")]
    pub dns_server: String,

    /// `SO_MARK` applied to outward sockets so they skip the tunnel route.
    #[serde(default)]
    pub socket_mark: Option<u32>,

    /// Capacity of the frame queue feeding the device writer.
    #[serde(default = "default_write_queue_capacity")]
    pub write_queue_capacity: usize,
}

impl Default for VpnConfig {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            address: default_vpn_address(),
            prefix_len: default_prefix_len(),
            mtu: default_mtu(),
            dns_server: default_dns_server(),
            socket_mark: None,
            write_queue_capacity: default_write_queue_capacity(),
        }
    }
}

fn default_device_name() -> String {
    "nsight0".to_string()
}

fn default_vpn_address() -> String {
    "10.120.0.1".to_string()
}

fn default_prefix_len() -> u8 {
    24
}

fn default_mtu() -> u16 {
    1500
}

fn default_dns_server() -> String {
    "1.1.1.1".to_string()
}

fn default_write_queue_capacity() -> usize {
    1024
}

impl VpnConfig {
    /// Tunnel network, falling back to the default subnet when the configured
    /// address or prefix cannot be parsed.
    pub fn network(&self) -> Ipv4Net {
        let fallback = || {
            let address = Ipv4Addr::new(10, 120, 0, 1);
            Ipv4Net::new(address, 24).unwrap_or_else(|_| Ipv4Net::from(address))
        };

        let address: Ipv4Addr = match self.address.parse() {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(address = %self.address, error = %e, "invalid VPN address, using default");
                return fallback();
            }
        };

        match Ipv4Net::new(address, self.prefix_len) {
            Ok(net) => net,
            Err(e) => {
                tracing::warn!(prefix_len = self.prefix_len, error = %e, "invalid VPN prefix length, using default");
                fallback()
            }
        }
    }

    /// Upstream DNS server as `ip` or `ip:port` (port 53 when omitted),
    /// falling back to 1.1.1.1:53.
    pub fn dns_server(&self) -> SocketAddr {
        if let Ok(addr) = self.dns_server.parse::<SocketAddr>() {
            return addr;
        }
        match self.dns_server.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, 53),
            Err(e) => {
                tracing::warn!(dns_server = %self.dns_server, error = %e, "invalid DNS server, using default");
                SocketAddr::from(([1, 1, 1, 1], 53))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MitmConfig {
    /// Whether TLS flows are intercepted at all.
    #[serde(default)]
    pub enabled: bool,

    /// Directory holding the root CA certificate and key.
    #[serde(default = "default_ca_dir")]
    pub ca_dir: PathBuf,

    #[serde(default = "default_alias")]
    pub alias: String,

    #[serde(default = "default_password")]
    pub password: String,

    #[serde(default = "default_issuer_cn")]
    pub issuer_cn: String,
    #[serde(default = "default_issuer_o")]
    pub issuer_o: String,
    #[serde(default = "default_issuer_ou")]
    pub issuer_ou: String,

    #[serde(default = "default_subject_o")]
    pub subject_o: String,
    #[serde(default = "default_subject_ou")]
    pub subject_ou: String,

    /// Extra trust anchors (PEM bundle) tried before the built-in roots.
    #[serde(default)]
    pub trust_store: Option<PathBuf>,

    /// Number of forged leaf certificates kept in memory.
    #[serde(default = "default_leaf_cache_capacity")]
    pub leaf_cache_capacity: u64,
}

impl Default for MitmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ca_dir: default_ca_dir(),
            alias: default_alias(),
            password: default_password(),
            issuer_cn: default_issuer_cn(),
            issuer_o: default_issuer_o(),
            issuer_ou: default_issuer_ou(),
            subject_o: default_subject_o(),
            subject_ou: default_subject_ou(),
            trust_store: None,
            leaf_cache_capacity: default_leaf_cache_capacity(),
        }
    }
}

fn default_ca_dir() -> PathBuf {
    PathBuf::from("ca")
}

fn default_alias() -> String {
    "netsight-mitm".to_string()
}

fn default_password() -> String {
    "changeit".to_string()
}

fn default_issuer_cn() -> String {
    "Netsight".to_string()
}

fn default_issuer_o() -> String {
    "Netsight".to_string()
}

fn default_issuer_ou() -> String {
    "Netsight Interception".to_string()
}

fn default_subject_o() -> String {
    "Netsight Forged".to_string()
}

fn default_subject_ou() -> String {
    "Netsight Forged Unit".to_string()
}

fn default_leaf_cache_capacity() -> u64 {
    256
}

impl MitmConfig {
    pub fn authority(&self) -> Authority {
        Authority {
            key_store_dir: self.ca_dir.clone(),
            alias: self.alias.clone(),
            password: self.password.clone(),
            issuer_cn: self.issuer_cn.clone(),
            issuer_o: self.issuer_o.clone(),
            issuer_ou: self.issuer_ou.clone(),
            subject_o: self.subject_o.clone(),
            subject_ou: self.subject_ou.clone(),
        }
    }
}

/// Which applications have their TLS traffic intercepted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MonitoringScope {
    #[default]
    All,
    /// Everything not owned by a system account (uid < 1000).
    NonSystem,
    AllowList,
    DenyList,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum InterceptionMode {
    /// The engine intercepts TLS itself.
    #[default]
    Standalone,
    /// An external proxy does the interception; the engine only forwards.
    Proxy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default)]
    pub scope: MonitoringScope,

    /// Package/process names for the allow/deny list scopes.
    #[serde(default)]
    pub apps: Vec<String>,

    #[serde(default)]
    pub mode: InterceptionMode,

    #[serde(default = "default_proxy_address")]
    pub proxy_address: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            scope: MonitoringScope::All,
            apps: vec![],
            mode: InterceptionMode::Standalone,
            proxy_address: default_proxy_address(),
        }
    }
}

fn default_proxy_address() -> String {
    "127.0.0.1:9090".to_string()
}

/// First uid handed out to regular (non-system) accounts.
const FIRST_REGULAR_UID: i64 = 1000;

impl MonitoringConfig {
    /// Whether the owning application falls into the monitored scope.
    pub fn includes(&self, app_id: i64, package: &str) -> bool {
        match self.scope {
            MonitoringScope::All => true,
            MonitoringScope::NonSystem => app_id >= FIRST_REGULAR_UID,
            MonitoringScope::AllowList => self.apps.iter().any(|a| a == package),
            MonitoringScope::DenyList => !self.apps.iter().any(|a| a == package),
        }
    }

    /// Proxy endpoint, falling back to 127.0.0.1:9090.
    pub fn proxy_address(&self) -> SocketAddr {
        match self.proxy_address.parse() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::warn!(proxy_address = %self.proxy_address, error = %e, "invalid proxy address, using default");
                SocketAddr::from(([127, 0, 0, 1], 9090))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    /// Emit records as log lines.
    #[default]
    Log,
    /// Append records as JSON lines to `path`.
    JsonLines,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub sink: SinkKind,

    #[serde(default = "default_persistence_path")]
    pub path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            sink: SinkKind::Log,
            path: default_persistence_path(),
        }
    }
}

fn default_persistence_path() -> PathBuf {
    PathBuf::from("netsight-records.jsonl")
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Generate a default configuration.
    pub fn default_config() -> Self {
        Self {
            general: GeneralConfig::default(),
            vpn: VpnConfig::default(),
            mitm: MitmConfig::default(),
            monitoring: MonitoringConfig::default(),
            persistence: PersistenceConfig::default(),
            trackers: None,
        }
    }

    /// Whether the engine terminates TLS itself.
    pub fn mitm_active(&self) -> bool {
        self.mitm.enabled && self.monitoring.mode == InterceptionMode::Standalone
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.vpn.mtu, 1500);
        assert_eq!(config.vpn.device_name, "nsight0");
        assert!(!config.mitm.enabled);
        assert_eq!(config.mitm.alias, "netsight-mitm");
        assert_eq!(config.monitoring.scope, MonitoringScope::All);
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = r#"
vpn:
  address: 10.9.0.1
  prefix_len: 16
mitm:
  enabled: true
monitoring:
  scope: allow_list
  apps: [firefox]
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.vpn.network().to_string(), "10.9.0.1/16");
        assert!(config.mitm_active());
        assert!(config.monitoring.includes(1000, "firefox"));
        assert!(!config.monitoring.includes(1000, "curl"));
    }

    #[test]
    fn test_invalid_addresses_fall_back() {
        let mut config = Config::default_config();
        config.vpn.address = "not-an-ip".to_string();
        config.vpn.dns_server = "???".to_string();
        config.monitoring.proxy_address = "localhost".to_string();

        assert_eq!(config.vpn.network().to_string(), "10.120.0.1/24");
        assert_eq!(config.vpn.dns_server(), SocketAddr::from(([1, 1, 1, 1], 53)));
        assert_eq!(config.monitoring.proxy_address(), SocketAddr::from(([127, 0, 0, 1], 9090)));
    }

    #[test]
    fn test_dns_server_port() {
        let mut vpn = VpnConfig::default();
        assert_eq!(vpn.dns_server(), SocketAddr::from(([1, 1, 1, 1], 53)));
        vpn.dns_server = "127.0.0.1:5353".to_string();
        assert_eq!(vpn.dns_server(), SocketAddr::from(([127, 0, 0, 1], 5353)));
        vpn.dns_server = "::1".to_string();
        assert_eq!(vpn.dns_server(), "[::1]:53".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_invalid_prefix_falls_back() {
        let mut config = Config::default_config();
        config.vpn.prefix_len = 40;
        assert_eq!(config.vpn.network().to_string(), "10.120.0.1/24");
    }

    #[test]
    fn test_proxy_mode_disables_mitm() {
        let mut config = Config::default_config();
        config.mitm.enabled = true;
        config.monitoring.mode = InterceptionMode::Proxy;
        assert!(!config.mitm_active());
    }

    #[test]
    fn test_scopes() {
        let mut monitoring = MonitoringConfig::default();
        assert!(monitoring.includes(0, "systemd"));

        monitoring.scope = MonitoringScope::NonSystem;
        assert!(!monitoring.includes(0, "systemd"));
        assert!(monitoring.includes(1001, "firefox"));

        monitoring.scope = MonitoringScope::DenyList;
        monitoring.apps = vec!["firefox".to_string()];
        assert!(!monitoring.includes(1001, "firefox"));
        assert!(monitoring.includes(1001, "curl"));
    }
}
