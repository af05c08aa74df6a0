//! Server configuration
//!
//! Loaded from a YAML or JSON file; every field has a default so a partial
//! file (or none at all) is enough.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use goexpose_proto::{DEFAULT_CONTROL_PORT, DEFAULT_PROXY_PORT_AMOUNT, DEFAULT_PROXY_PORT_BASE};

use crate::error::ConfigError;

/// Locations of the PEM files used for mutual TLS
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TlsPaths {
    /// CA bundle that client certificates must chain to
    pub ca_cert: PathBuf,
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
}

impl TlsPaths {
    /// `myCA.pem`, `server.crt` and `server.key` inside `dir`
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            ca_cert: dir.join("myCA.pem"),
            server_cert: dir.join("server.crt"),
            server_key: dir.join("server.key"),
        }
    }
}

impl Default for TlsPaths {
    fn default() -> Self {
        let dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("certs");
        Self::in_dir(&dir)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address of the control (tunnel) listener
    pub control_addr: SocketAddr,
    /// Interface relay listeners bind to
    pub proxy_bind_ip: IpAddr,
    pub proxy_port_base: u16,
    pub proxy_port_amount: u16,
    pub tls: TlsPaths,
    /// Concurrently served tunnels; 1 serves clients one after another
    pub max_sessions: usize,
    pub handshake_timeout_secs: u64,
    pub inbound_queue_capacity: usize,
    pub outbound_queue_capacity: usize,
    /// How long a full inbound queue may stall the reader before the session is dropped
    pub inbound_queue_timeout_secs: u64,
    /// Tunnel data frames buffered per relayed TCP connection; overflow closes it
    pub stream_queue_capacity: usize,
    /// How long a relayed stream may refuse tunnel data before it is closed
    pub stream_write_timeout_secs: u64,
    pub udp_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            control_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_CONTROL_PORT),
            proxy_bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            proxy_port_base: DEFAULT_PROXY_PORT_BASE,
            proxy_port_amount: DEFAULT_PROXY_PORT_AMOUNT,
            tls: TlsPaths::default(),
            max_sessions: 1,
            handshake_timeout_secs: 10,
            inbound_queue_capacity: 16,
            outbound_queue_capacity: 256,
            inbound_queue_timeout_secs: 30,
            stream_queue_capacity: 64,
            stream_write_timeout_secs: 10,
            udp_idle_timeout_secs: 30,
        }
    }
}

impl ServerConfig {
    /// Load a config file; `.json` files are parsed as JSON, anything else as YAML
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let config: ServerConfig = if is_json {
            serde_json::from_str(&contents).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
        } else {
            serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.proxy_port_amount == 0 {
            return Err(ConfigError::Invalid(
                "proxy_port_amount must be at least 1".to_string(),
            ));
        }
        if u32::from(self.proxy_port_base) + u32::from(self.proxy_port_amount)
            > u32::from(u16::MAX) + 1
        {
            return Err(ConfigError::Invalid(format!(
                "proxy port range {}+{} exceeds 65535",
                self.proxy_port_base, self.proxy_port_amount
            )));
        }
        let relay_range = u32::from(self.proxy_port_base)
            ..u32::from(self.proxy_port_base) + u32::from(self.proxy_port_amount);
        if relay_range.contains(&u32::from(self.control_addr.port())) {
            return Err(ConfigError::Invalid(format!(
                "control port {} lies inside the relay port range",
                self.control_addr.port()
            )));
        }
        if self.max_sessions == 0 {
            return Err(ConfigError::Invalid(
                "max_sessions must be at least 1".to_string(),
            ));
        }
        if self.inbound_queue_capacity == 0
            || self.outbound_queue_capacity == 0
            || self.stream_queue_capacity == 0
        {
            return Err(ConfigError::Invalid(
                "queue capacities must be at least 1".to_string(),
            ));
        }

        let timeouts = [
            ("handshake_timeout_secs", self.handshake_timeout_secs),
            ("inbound_queue_timeout_secs", self.inbound_queue_timeout_secs),
            ("stream_write_timeout_secs", self.stream_write_timeout_secs),
            ("udp_idle_timeout_secs", self.udp_idle_timeout_secs),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, secs)| *secs == 0) {
            return Err(ConfigError::Invalid(format!("{} must be at least 1", name)));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Per-session tunables derived from this config
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            bind_ip: self.proxy_bind_ip,
            inbound_queue_capacity: self.inbound_queue_capacity,
            outbound_queue_capacity: self.outbound_queue_capacity,
            inbound_queue_timeout: Duration::from_secs(self.inbound_queue_timeout_secs),
            stream_queue_capacity: self.stream_queue_capacity,
            stream_write_timeout: Duration::from_secs(self.stream_write_timeout_secs),
            udp_idle_timeout: Duration::from_secs(self.udp_idle_timeout_secs),
        }
    }
}

/// Tunables handed to every client session
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub bind_ip: IpAddr,
    pub inbound_queue_capacity: usize,
    pub outbound_queue_capacity: usize,
    pub inbound_queue_timeout: Duration,
    pub stream_queue_capacity: usize,
    pub stream_write_timeout: Duration,
    pub udp_idle_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        ServerConfig::default().session_settings()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.control_addr.port(), 47921);
        assert_eq!(config.proxy_port_base, 47923);
        assert_eq!(config.proxy_port_amount, 10);
        assert_eq!(config.max_sessions, 1);
        assert!(config.tls.ca_cert.ends_with("certs/myCA.pem"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "control_addr: 127.0.0.1:9000\nproxy_port_base: 20000\nproxy_port_amount: 4\ntls:\n  ca_cert: /etc/goexpose/ca.pem"
        )
        .unwrap();

        let config = ServerConfig::load(file.path()).unwrap();
        assert_eq!(config.control_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.proxy_port_base, 20000);
        assert_eq!(config.proxy_port_amount, 4);
        assert_eq!(config.tls.ca_cert, PathBuf::from("/etc/goexpose/ca.pem"));
        assert!(config.tls.server_key.ends_with("certs/server.key"));
        assert_eq!(config.udp_idle_timeout_secs, 30);
    }

    #[test]
    fn test_json_config() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"max_sessions": 4, "udp_idle_timeout_secs": 5}}"#).unwrap();

        let config = ServerConfig::load(file.path()).unwrap();
        assert_eq!(config.max_sessions, 4);
        assert_eq!(
            config.session_settings().udp_idle_timeout,
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_invalid_configs() {
        let config = ServerConfig {
            proxy_port_amount: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            proxy_port_base: 65530,
            proxy_port_amount: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            control_addr: "0.0.0.0:47925".parse().unwrap(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            max_sessions: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            stream_queue_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let zeroed = [
            ServerConfig {
                handshake_timeout_secs: 0,
                ..Default::default()
            },
            ServerConfig {
                inbound_queue_timeout_secs: 0,
                ..Default::default()
            },
            ServerConfig {
                stream_write_timeout_secs: 0,
                ..Default::default()
            },
            ServerConfig {
                udp_idle_timeout_secs: 0,
                ..Default::default()
            },
        ];
        for config in zeroed {
            match config.validate() {
                Err(ConfigError::Invalid(reason)) => assert!(reason.contains("_secs")),
                other => panic!("zero timeout accepted: {:?}", other),
            }
        }
    }

    #[test]
    fn test_unparseable_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "proxy_port_base: [not, a, port]").unwrap();

        let err = ServerConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
