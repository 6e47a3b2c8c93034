//! Proxy configuration file
//!
//! JSON with camelCase keys. Every field is optional; omitted fields take the
//! defaults below.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use burrow_router::{BackendDescriptor, HealthConfig, RouteOrigin};
use burrow_transport::ClientTrust;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// One statically configured backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub name: String,
    pub website: bool,
    pub tunnel: bool,
    pub secure: bool,
    pub addr: String,
}

impl ServerRecord {
    /// The explicit path, or `"/" + name`
    pub fn route_path(&self) -> String {
        match &self.path {
            Some(path) if !path.is_empty() => path.clone(),
            _ => format!("/{}", self.name),
        }
    }

    pub fn to_descriptor(&self) -> BackendDescriptor {
        let descriptor = if self.tunnel {
            BackendDescriptor::tunnel(self.route_path())
        } else {
            BackendDescriptor::dialed(self.route_path(), &self.addr).with_secure(self.secure)
        };
        descriptor
            .with_name(&self.name)
            .with_website(self.website)
            .with_origin(RouteOrigin::Config)
    }
}

/// Connection-handling timeouts, in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutsConfig {
    /// First read on every accepted connection
    pub initial_read_ms: u64,
    /// TLS handshake on the listening port
    pub tls_handshake_ms: u64,
    /// Each read while completing a binary handshake
    pub handshake_read_ms: u64,
    /// How long a request waits for a parked tunnel
    pub tunnel_claim_ms: u64,
    /// How long an authenticated tunnel waits for a request
    pub tunnel_publish_ms: u64,
    /// Backend connect, including its TLS handshake
    pub dial_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            initial_read_ms: 1_000,
            tls_handshake_ms: 5_000,
            handshake_read_ms: 1_000,
            tunnel_claim_ms: 10_000,
            tunnel_publish_ms: 30_000,
            dial_ms: 10_000,
        }
    }
}

impl TimeoutsConfig {
    pub fn initial_read(&self) -> Duration {
        Duration::from_millis(self.initial_read_ms)
    }

    pub fn tls_handshake(&self) -> Duration {
        Duration::from_millis(self.tls_handshake_ms)
    }

    pub fn handshake_read(&self) -> Duration {
        Duration::from_millis(self.handshake_read_ms)
    }

    pub fn tunnel_claim(&self) -> Duration {
        Duration::from_millis(self.tunnel_claim_ms)
    }

    pub fn tunnel_publish(&self) -> Duration {
        Duration::from_millis(self.tunnel_publish_ms)
    }

    pub fn dial(&self) -> Duration {
        Duration::from_millis(self.dial_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthCheckConfig {
    pub interval_secs: u64,
    pub probe_timeout_ms: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            probe_timeout_ms: 5_000,
        }
    }
}

impl From<&HealthCheckConfig> for HealthConfig {
    fn from(config: &HealthCheckConfig) -> Self {
        HealthConfig {
            interval: Duration::from_secs(config.interval_secs.max(1)),
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
        }
    }
}

/// Top-level proxy configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyConfig {
    /// Listen address; `:8000` means all interfaces
    pub addr: String,
    pub server_cert_file_path: String,
    pub server_key_file_path: String,
    /// Root CAs for backend TLS. Empty disables backend verification.
    pub client_cert_file_path: String,
    pub servers: Vec<ServerRecord>,
    pub shutdown: bool,
    pub force_shutdown: bool,
    pub timeouts: TimeoutsConfig,
    pub health_check: HealthCheckConfig,
    pub config_poll_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8000".to_string(),
            server_cert_file_path: String::new(),
            server_key_file_path: String::new(),
            client_cert_file_path: String::new(),
            servers: Vec::new(),
            shutdown: false,
            force_shutdown: false,
            timeouts: TimeoutsConfig::default(),
            health_check: HealthCheckConfig::default(),
            config_poll_secs: 30,
        }
    }
}

impl ProxyConfig {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&json, path)
    }

    /// Parse and validate configuration read from `path`
    pub fn parse(json: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: ProxyConfig =
            serde_json::from_str(json).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_cert_file_path.is_empty() != self.server_key_file_path.is_empty() {
            return Err(ConfigError::Invalid(
                "serverCertFilePath and serverKeyFilePath must be set together".to_string(),
            ));
        }
        self.listen_addr()?;
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        };
        addr.parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid listen address {:?}", self.addr)))
    }

    /// Certificate and key paths when the listener should speak TLS
    pub fn tls_paths(&self) -> Option<(PathBuf, PathBuf)> {
        if self.server_cert_file_path.is_empty() {
            return None;
        }
        Some((
            PathBuf::from(&self.server_cert_file_path),
            PathBuf::from(&self.server_key_file_path),
        ))
    }

    pub fn client_trust(&self) -> ClientTrust {
        if self.client_cert_file_path.is_empty() {
            ClientTrust::Insecure
        } else {
            ClientTrust::CustomCa(PathBuf::from(&self.client_cert_file_path))
        }
    }

    pub fn routes(&self) -> Vec<BackendDescriptor> {
        self.servers.iter().map(ServerRecord::to_descriptor).collect()
    }

    pub fn health(&self) -> HealthConfig {
        HealthConfig::from(&self.health_check)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.config_poll_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::parse("{}", Path::new("inline")).unwrap();
        assert_eq!(config, ProxyConfig::default());
        assert_eq!(config.timeouts.initial_read(), Duration::from_secs(1));
        assert_eq!(config.timeouts.tunnel_claim(), Duration::from_secs(10));
        assert_eq!(config.health().interval, Duration::from_secs(60));
        assert_eq!(config.poll_interval(), Duration::from_secs(30));
        assert!(config.tls_paths().is_none());
        assert_eq!(config.client_trust(), ClientTrust::Insecure);
    }

    #[test]
    fn test_load_full_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "addr": ":9000",
                "clientCertFilePath": "/etc/burrow/ca.pem",
                "servers": [
                    {{"name": "svc1", "addr": "127.0.0.1:9001", "website": true}},
                    {{"path": "/api", "name": "api", "addr": "10.0.0.2:443", "secure": true}},
                    {{"name": "edge1", "tunnel": true}}
                ],
                "timeouts": {{"tunnelClaimMs": 250}},
                "healthCheck": {{"intervalSecs": 5}}
            }}"#
        )
        .unwrap();

        let config = ProxyConfig::load(file.path()).unwrap();
        assert_eq!(
            config.listen_addr().unwrap(),
            "0.0.0.0:9000".parse().unwrap()
        );
        assert_eq!(config.timeouts.tunnel_claim(), Duration::from_millis(250));
        assert_eq!(config.timeouts.dial(), Duration::from_secs(10));
        assert_eq!(config.health().interval, Duration::from_secs(5));
        assert_eq!(
            config.client_trust(),
            ClientTrust::CustomCa(PathBuf::from("/etc/burrow/ca.pem"))
        );

        let routes = config.routes();
        assert_eq!(routes.len(), 3);
        assert_eq!(routes[0].path, "/svc1");
        assert!(routes[0].website);
        assert_eq!(routes[1].path, "/api");
        assert!(routes[1].secure);
        assert!(routes[2].tunnel);
        assert!(routes.iter().all(|r| r.origin == RouteOrigin::Config));
    }

    #[test]
    fn test_pem_paths_must_pair() {
        let err = ProxyConfig::parse(
            r#"{"serverCertFilePath": "/tmp/cert.pem"}"#,
            Path::new("inline"),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_unparseable() {
        let err = ProxyConfig::parse("{not json", Path::new("inline")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));

        let err = ProxyConfig::parse(r#"{"addr": "nowhere"}"#, Path::new("inline")).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = ProxyConfig::load(Path::new("/nonexistent/burrow.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
