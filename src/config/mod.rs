//! Registry configuration
//!
//! A single TOML file with the sections `common`, `data`, `log`, `event`,
//! `ldap`, `plugin`, and `dns`. Every key is optional; missing keys fall back
//! to the functions in [`defaults`]. Call [`RegistryConfig::validate`] after
//! loading.

mod error;

use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

pub use self::error::ConfigError;
use crate::constants;

/// Default values for configuration
mod defaults {
    // common
    pub fn httpbind() -> String { "0.0.0.0:8001".to_string() }
    pub fn pid() -> String { "/var/run/registry.pid".to_string() }
    pub fn persist_report() -> u64 { 1 }

    // data
    pub fn dir() -> String { "./data".to_string() }
    pub fn clusterbind() -> String { "127.0.0.1:9001".to_string() }
    pub fn heartbeat_ms() -> u64 { 250 }
    pub fn election_timeout_ms() -> u64 { 1000 }

    // log
    pub fn loglevel() -> String { "info".to_string() }
    pub fn logrotatenum() -> u32 { 5 }
    pub fn logrotatesize() -> u64 { 100 * 1024 * 1024 }

    // ldap
    pub fn ldap_uid() -> String { "uid".to_string() }

    // plugin
    pub fn gitlabbranch() -> String { "master".to_string() }
    pub fn alarmfile() -> String { "alarm.json".to_string() }

    // dns
    pub fn dns_port() -> u16 { 53 }
    pub fn zone() -> String { crate::constants::ROOT_NAME.to_string() }
}

/// `[common]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonConfig {
    /// HTTP API bind address.
    #[serde(default = "defaults::httpbind")]
    pub httpbind: String,
    #[serde(default = "defaults::pid")]
    pub pid: String,
    /// Usernames placed in the admin group on first boot.
    #[serde(default)]
    pub admins: Vec<String>,
    /// Hours between report journal snapshots; 0 disables persistence.
    #[serde(rename = "PersistReport", default = "defaults::persist_report")]
    pub persist_report: u64,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            httpbind: defaults::httpbind(),
            pid: defaults::pid(),
            admins: Vec::new(),
            persist_report: defaults::persist_report(),
        }
    }
}

/// `[data]` section: storage directory and consensus membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "defaults::dir")]
    pub dir: String,
    /// Cluster transport bind; raft RPC and forwarding share it.
    #[serde(default = "defaults::clusterbind")]
    pub clusterbind: String,
    /// Cluster address of an existing leader to join on boot.
    #[serde(default)]
    pub clusterleader: String,
    #[serde(default = "defaults::heartbeat_ms")]
    pub heartbeatms: u64,
    #[serde(default = "defaults::election_timeout_ms")]
    pub electiontimeoutms: u64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dir: defaults::dir(),
            clusterbind: defaults::clusterbind(),
            clusterleader: String::new(),
            heartbeatms: defaults::heartbeat_ms(),
            electiontimeoutms: defaults::election_timeout_ms(),
        }
    }
}

/// `[log]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Directory for `registry.log`; empty logs to stderr.
    #[serde(default)]
    pub logdir: String,
    #[serde(default = "defaults::loglevel")]
    pub loglevel: String,
    #[serde(default = "defaults::logrotatenum")]
    pub logrotatenum: u32,
    #[serde(default = "defaults::logrotatesize")]
    pub logrotatesize: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            logdir: String::new(),
            loglevel: defaults::loglevel(),
            logrotatenum: defaults::logrotatenum(),
            logrotatesize: defaults::logrotatesize(),
        }
    }
}

/// `[event]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventConfig {
    #[serde(default)]
    pub clearurl: String,
}

/// `[ldap]` section. Consumed by the external sign-in layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LdapConfig {
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub binddn: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub base: String,
    #[serde(default = "defaults::ldap_uid")]
    pub uid: String,
}

impl Default for LdapConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            binddn: String::new(),
            password: String::new(),
            base: String::new(),
            uid: defaults::ldap_uid(),
        }
    }
}

/// `[plugin]` section. Consumed by the external Gitlab fetch client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(default)]
    pub gitlabdomain: String,
    #[serde(default)]
    pub gitlabtoken: String,
    #[serde(default)]
    pub gitlabgroup: String,
    #[serde(default = "defaults::gitlabbranch")]
    pub gitlabbranch: String,
    #[serde(default = "defaults::alarmfile")]
    pub alarmfile: String,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            gitlabdomain: String::new(),
            gitlabtoken: String::new(),
            gitlabgroup: String::new(),
            gitlabbranch: defaults::gitlabbranch(),
            alarmfile: defaults::alarmfile(),
        }
    }
}

/// `[dns]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "defaults::dns_port")]
    pub port: u16,
    /// Only addresses starting with this prefix are answered; empty allows all.
    #[serde(default)]
    pub ipprefix: String,
    #[serde(default = "defaults::zone")]
    pub zone: String,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            enable: false,
            port: defaults::dns_port(),
            ipprefix: String::new(),
            zone: defaults::zone(),
        }
    }
}

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub common: CommonConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub event: EventConfig,
    #[serde(default)]
    pub ldap: LdapConfig,
    #[serde(default)]
    pub plugin: PluginConfig,
    #[serde(default)]
    pub dns: DnsConfig,
}

impl RegistryConfig {
    /// Load configuration from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::invalid("config_file", path.display(), format!("failed to read file: {e}"))
        })?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            ConfigError::InvalidValue { key, reason, .. } if key == "config_file" => ConfigError::InvalidValue {
                key,
                value: path.display().to_string(),
                reason,
            },
            other => other,
        })
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents)
            .map_err(|e| ConfigError::invalid("config_file", "<inline>", format!("failed to parse TOML: {e}")))
    }

    /// Validates values serde cannot check by type alone.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data.dir.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "data.dir".to_string(),
                hint: "directory for raft.db and registry.db".to_string(),
            });
        }
        self.data.clusterbind.parse::<SocketAddr>().map_err(|e| {
            ConfigError::invalid("data.clusterbind", &self.data.clusterbind, format!("not a socket address: {e}"))
        })?;
        self.common.httpbind.parse::<SocketAddr>().map_err(|e| {
            ConfigError::invalid("common.httpbind", &self.common.httpbind, format!("not a socket address: {e}"))
        })?;
        if self.dns.enable && self.dns.port == 0 {
            return Err(ConfigError::invalid("dns.port", self.dns.port, "must be non-zero when dns is enabled"));
        }
        if self.data.heartbeatms == 0 || self.data.electiontimeoutms <= self.data.heartbeatms {
            return Err(ConfigError::invalid(
                "data.electiontimeoutms",
                self.data.electiontimeoutms,
                "must be greater than data.heartbeatms",
            ));
        }
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.data.dir)
    }

    /// Interval between report snapshots, `None` when disabled.
    pub fn persist_report_interval(&self) -> Option<Duration> {
        match self.common.persist_report {
            0 => None,
            hours => Some(Duration::from_secs(hours * 3600)),
        }
    }

    /// DNS zone, falling back to the root node name.
    pub fn dns_zone(&self) -> &str {
        if self.dns.zone.is_empty() {
            constants::ROOT_NAME
        } else {
            &self.dns.zone
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = RegistryConfig::from_toml_str("").unwrap();
        assert_eq!(config.common.httpbind, "0.0.0.0:8001");
        assert_eq!(config.common.persist_report, 1);
        assert_eq!(config.data.dir, "./data");
        assert_eq!(config.log.loglevel, "info");
        assert_eq!(config.dns.port, 53);
        assert_eq!(config.dns_zone(), "loda");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_full_file() {
        let toml = r#"
            [common]
            httpbind = "127.0.0.1:8080"
            admins = ["alice", "bob"]
            PersistReport = 0

            [data]
            dir = "/tmp/registry"
            clusterbind = "127.0.0.1:9100"
            clusterleader = "10.0.0.1:9100"

            [log]
            logdir = "/var/log/registry"
            loglevel = "debug"

            [dns]
            enable = true
            port = 5353
            ipprefix = "10."
        "#;
        let config = RegistryConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.common.admins, vec!["alice", "bob"]);
        assert_eq!(config.persist_report_interval(), None);
        assert_eq!(config.data.clusterleader, "10.0.0.1:9100");
        assert_eq!(config.log.logdir, "/var/log/registry");
        assert!(config.dns.enable);
        assert_eq!(config.dns.ipprefix, "10.");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_persist_interval_hours() {
        let config = RegistryConfig::from_toml_str("[common]\nPersistReport = 2\n").unwrap();
        assert_eq!(config.persist_report_interval(), Some(Duration::from_secs(7200)));
    }

    #[test]
    fn test_validate_rejects_bad_bind() {
        let config = RegistryConfig::from_toml_str("[data]\nclusterbind = \"nope\"\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("data.clusterbind"));
    }

    #[test]
    fn test_validate_rejects_dns_port_zero() {
        let config = RegistryConfig::from_toml_str("[dns]\nenable = true\nport = 0\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_dir() {
        let config = RegistryConfig::from_toml_str("[data]\ndir = \"\"\n").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::MissingRequired { .. })));
    }

    #[test]
    fn test_from_toml_file_reports_path() {
        let err = RegistryConfig::from_toml_file("/nonexistent/registry.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/registry.toml"));
    }
}
