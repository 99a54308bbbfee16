use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// This server's replica id; must be unique across the topology.
    pub server_id: u16,
    /// Address the replication listener binds to, e.g. "0.0.0.0:8989".
    pub listen_addr: String,
    /// Replicated partitions (base DNs), each an independent unit.
    #[serde(default)]
    pub partitions: Vec<String>,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    /// Path of the change-log database file. None means in-memory (tests).
    pub changelog_path: Option<String>,
    /// Retention age for trimming, in seconds (default 86400).
    pub retention_sec: Option<u64>,
    /// Interval between trim passes, in milliseconds (default 1000).
    pub trim_interval_ms: Option<u64>,
    /// How long to wait for the peer handshake ack, in milliseconds
    /// (default 4000).
    pub handshake_timeout_ms: Option<u64>,
    /// Delay between reconnect attempts to a peer, in milliseconds
    /// (default 1000).
    pub connect_retry_delay_ms: Option<u64>,
    /// Session heartbeat interval, in seconds (default 10).
    pub heartbeat_interval_sec: Option<u64>,
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// host:port of the peer's replication listener.
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub ca_file: Option<String>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        Ok(config)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_sec.unwrap_or(86_400))
    }

    pub fn trim_interval(&self) -> Duration {
        Duration::from_millis(self.trim_interval_ms.unwrap_or(1_000))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms.unwrap_or(4_000))
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms.unwrap_or(1_000))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_sec.unwrap_or(10))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_id: 1,
            listen_addr: "127.0.0.1:8989".to_string(),
            partitions: vec![],
            peers: vec![],
            changelog_path: None,
            retention_sec: None,
            trim_interval_ms: None,
            handshake_timeout_ms: None,
            connect_retry_delay_ms: None,
            heartbeat_interval_sec: None,
            tls: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.server_id, 1);
        assert_eq!(config.listen_addr, "127.0.0.1:8989");
        assert!(config.partitions.is_empty());
        assert_eq!(config.retention(), Duration::from_secs(86_400));
        assert_eq!(config.trim_interval(), Duration::from_millis(1_000));
        assert_eq!(config.handshake_timeout(), Duration::from_millis(4_000));
    }

    #[test]
    fn test_config_from_str() {
        let yaml = r#"
server_id: 3
listen_addr: "0.0.0.0:8989"
partitions:
  - "dc=example,dc=com"
  - "dc=internal,dc=com"
peers:
  - address: "replica1.example.com:8989"
  - address: "replica2.example.com:8989"
changelog_path: "/var/lib/repl/changelog.redb"
retention_sec: 3600
trim_interval_ms: 500
handshake_timeout_ms: 2000
"#;
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.server_id, 3);
        assert_eq!(config.listen_addr, "0.0.0.0:8989");
        assert_eq!(config.partitions.len(), 2);
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.peers[0].address, "replica1.example.com:8989");
        assert_eq!(
            config.changelog_path.as_deref(),
            Some("/var/lib/repl/changelog.redb")
        );
        assert_eq!(config.retention(), Duration::from_secs(3600));
        assert_eq!(config.trim_interval(), Duration::from_millis(500));
        assert_eq!(config.handshake_timeout(), Duration::from_millis(2000));
    }

    #[test]
    fn test_config_from_str_minimal() {
        let yaml = r#"
server_id: 1
listen_addr: "127.0.0.1:0"
"#;
        let config = Config::from_str(yaml).unwrap();
        assert!(config.partitions.is_empty());
        assert!(config.peers.is_empty());
        assert!(config.changelog_path.is_none());
        assert!(config.tls.is_none());
    }

    #[test]
    fn test_config_from_file() {
        let yaml = r#"
server_id: 7
listen_addr: "127.0.0.1:8989"
partitions:
  - "dc=example,dc=com"
tls:
  cert_file: "/etc/ssl/repl-cert.pem"
  key_file: "/etc/ssl/repl-key.pem"
"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file.flush().unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.server_id, 7);
        assert_eq!(
            config.tls.as_ref().unwrap().cert_file.as_deref(),
            Some("/etc/ssl/repl-cert.pem")
        );
    }

    #[test]
    fn test_config_from_str_invalid_yaml() {
        assert!(Config::from_str("invalid: yaml: content: [").is_err());
    }

    #[test]
    fn test_config_from_file_nonexistent() {
        assert!(Config::from_file("/nonexistent/path/config.yaml").is_err());
    }
}
