//! Gateway configuration file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::exchange::{CacheConfig, ExchangeConfig};
use crate::oidc::OidcConfig;

/// Complete gateway configuration, loaded from JSON.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    /// Inbound credential validation.
    #[serde(default)]
    pub oidc: OidcConfig,

    /// Token exchange with the identity provider.
    #[serde(default)]
    pub exchange: ExchangeConfig,

    #[serde(default)]
    pub cache: CacheConfig,
}

/// HTTP listener and downstream settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Base URL of the downstream API. Request paths are appended.
    #[serde(default)]
    pub downstream_url: String,

    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Largest request body forwarded downstream.
    #[serde(default = "default_max_body")]
    pub max_body_bytes: usize,

    #[serde(default = "default_downstream_timeout")]
    pub downstream_timeout_secs: u64,

    /// `Retry-After` value on 503 responses.
    #[serde(default = "default_retry_after")]
    pub retry_after_secs: u64,

    /// PEM bundle of CAs trusted for the downstream API.
    #[serde(default)]
    pub downstream_ca_bundle_path: Option<PathBuf>,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_health_path() -> String {
    "/.well-known/gateway/health".to_string()
}

fn default_max_body() -> usize {
    10 * 1024 * 1024 // 10 MiB
}

fn default_downstream_timeout() -> u64 {
    30
}

fn default_retry_after() -> u64 {
    2
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            downstream_url: String::new(),
            health_path: default_health_path(),
            max_body_bytes: default_max_body(),
            downstream_timeout_secs: default_downstream_timeout(),
            retry_after_secs: default_retry_after(),
            downstream_ca_bundle_path: None,
        }
    }
}

impl ServerConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.downstream_url.starts_with("https://") || self.downstream_url.starts_with("http://")) {
            return Err("server downstream_url must be a valid HTTP(S) URL".to_string());
        }
        if !self.health_path.starts_with('/') {
            return Err("server health_path must start with '/'".to_string());
        }
        if self.max_body_bytes == 0 {
            return Err("server max_body_bytes must be positive".to_string());
        }
        if let Some(ref path) = self.downstream_ca_bundle_path {
            if !path.exists() {
                return Err(format!("downstream CA bundle does not exist: {:?}", path));
            }
        }
        Ok(())
    }
}

impl GatewayConfig {
    /// Read a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.server.validate()?;
        self.oidc.validate()?;
        self.exchange.validate()?;
        self.cache.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const EXAMPLE: &str = r#"{
        "server": {
            "listen": "127.0.0.1:9000",
            "downstream_url": "https://kubernetes.default.svc"
        },
        "oidc": {
            "issuers": [{"issuer": "https://keycloak.example.com/realms/cluster"}],
            "accepted_audience": "gateway"
        },
        "exchange": {
            "token_endpoint": "https://keycloak.example.com/realms/cluster/protocol/openid-connect/token",
            "client_id": "delegation-gateway",
            "client_secret": "s3cr3t",
            "audience": "kubernetes"
        },
        "cache": {"negative_ttl_secs": 2}
    }"#;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.listen.port(), 8080);
        assert_eq!(config.health_path, "/.well-known/gateway/health");
        assert_eq!(config.retry_after_secs, 2);
        assert!(GatewayConfig::default().validate().is_err());
    }

    #[test]
    fn test_load_and_validate() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(EXAMPLE.as_bytes()).unwrap();

        let config = GatewayConfig::load(file.path()).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.cache.negative_ttl_secs, 2);
        assert_eq!(config.cache.max_entries, 10_000);
        assert_eq!(config.exchange.max_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_errors() {
        assert!(GatewayConfig::load(Path::new("/nonexistent/gateway.json")).is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{"unknown_section": {}}"#).unwrap();
        let err = GatewayConfig::load(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }

    #[test]
    fn test_server_validation() {
        let mut config = ServerConfig {
            downstream_url: "https://kubernetes.default.svc".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        config.health_path = "health".to_string();
        assert!(config.validate().is_err());

        config.health_path = "/health".to_string();
        config.downstream_url = "kubernetes.default.svc".to_string();
        assert!(config.validate().is_err());
    }
}
