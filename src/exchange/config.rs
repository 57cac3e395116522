//! Token exchange and exchange cache configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::secret::SecretString;

/// Token Exchange client configuration (RFC 8693).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExchangeConfig {
    /// Identity provider token endpoint.
    #[serde(default)]
    pub token_endpoint: String,

    /// Confidential client identifier.
    #[serde(default)]
    pub client_id: String,

    /// Confidential client secret. Usually supplied via `EXCHANGE_CLIENT_SECRET`.
    #[serde(default)]
    pub client_secret: Option<SecretString>,

    /// How the client authenticates to the token endpoint.
    #[serde(default)]
    pub client_auth: ClientAuthMethod,

    /// Audience requested for the downstream credential.
    #[serde(default)]
    pub audience: String,

    /// Scopes requested for the downstream credential.
    #[serde(default)]
    pub scopes: Vec<String>,

    #[serde(default = "default_token_type")]
    pub subject_token_type: TokenType,

    #[serde(default = "default_token_type")]
    pub requested_token_type: TokenType,

    /// Total attempts for transient failures, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Lifetime assumed when the response carries no `expires_in`.
    #[serde(default = "default_token_ttl")]
    pub default_token_ttl_secs: u64,

    /// PEM bundle of CAs trusted for the token endpoint.
    #[serde(default)]
    pub ca_bundle_path: Option<PathBuf>,
}

/// Confidential client authentication (RFC 6749 section 2.3.1).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthMethod {
    /// `Authorization: Basic` header.
    #[default]
    ClientSecretBasic,
    /// `client_id` and `client_secret` form fields.
    ClientSecretPost,
}

fn default_token_type() -> TokenType {
    TokenType::AccessToken
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    100
}

fn default_max_backoff() -> u64 {
    2000
}

fn default_request_timeout() -> u64 {
    10
}

fn default_token_ttl() -> u64 {
    300 // 5 minutes
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            token_endpoint: String::new(),
            client_id: String::new(),
            client_secret: None,
            client_auth: ClientAuthMethod::default(),
            audience: String::new(),
            scopes: Vec::new(),
            subject_token_type: default_token_type(),
            requested_token_type: default_token_type(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            request_timeout_secs: default_request_timeout(),
            default_token_ttl_secs: default_token_ttl(),
            ca_bundle_path: None,
        }
    }
}

impl ExchangeConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.token_endpoint.starts_with("https://") || self.token_endpoint.starts_with("http://")) {
            return Err("exchange token_endpoint must be a valid HTTP(S) URL".to_string());
        }

        if self.client_id.is_empty() {
            return Err("exchange client_id is required".to_string());
        }

        if self.client_secret.as_ref().map_or(true, SecretString::is_empty) {
            return Err("exchange client_secret is required".to_string());
        }

        if self.audience.is_empty() {
            return Err("exchange audience is required".to_string());
        }

        if self.max_attempts == 0 {
            return Err("exchange max_attempts must be at least 1".to_string());
        }

        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err("exchange initial_backoff_ms must not exceed max_backoff_ms".to_string());
        }

        if self.default_token_ttl_secs == 0 {
            return Err("exchange default_token_ttl_secs must be positive".to_string());
        }

        if let Some(ref path) = self.ca_bundle_path {
            if !path.exists() {
                return Err(format!("exchange CA bundle does not exist: {:?}", path));
            }
        }

        Ok(())
    }
}

/// Token type URNs (RFC 8693).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    /// OAuth 2.0 access token.
    AccessToken,
    /// OpenID Connect ID token.
    IdToken,
    /// Generic JWT.
    Jwt,
    RefreshToken,
}

impl TokenType {
    /// Get the URN for this token type.
    pub fn as_urn(&self) -> &'static str {
        match self {
            TokenType::AccessToken => "urn:ietf:params:oauth:token-type:access_token",
            TokenType::IdToken => "urn:ietf:params:oauth:token-type:id_token",
            TokenType::Jwt => "urn:ietf:params:oauth:token-type:jwt",
            TokenType::RefreshToken => "urn:ietf:params:oauth:token-type:refresh_token",
        }
    }

    /// Parse from URN string.
    pub fn from_urn(urn: &str) -> Option<Self> {
        match urn {
            "urn:ietf:params:oauth:token-type:access_token" => Some(TokenType::AccessToken),
            "urn:ietf:params:oauth:token-type:id_token" => Some(TokenType::IdToken),
            "urn:ietf:params:oauth:token-type:jwt" => Some(TokenType::Jwt),
            "urn:ietf:params:oauth:token-type:refresh_token" => Some(TokenType::RefreshToken),
            _ => None,
        }
    }
}

/// Exchange cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Upper bound on cached entries (pending entries included).
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// How long a failed exchange is remembered before it is retried.
    #[serde(default = "default_negative_ttl")]
    pub negative_ttl_secs: u64,

    /// Fraction of a credential's lifetime reserved before expiry.
    #[serde(default = "default_refresh_margin_ratio")]
    pub refresh_margin_ratio: f64,

    /// Lower bound on the reserved margin.
    #[serde(default = "default_min_refresh_margin")]
    pub min_refresh_margin_secs: u64,

    /// Interval of the expired-entry sweeper.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_max_entries() -> usize {
    10_000
}

fn default_negative_ttl() -> u64 {
    5
}

fn default_refresh_margin_ratio() -> f64 {
    0.1
}

fn default_min_refresh_margin() -> u64 {
    30
}

fn default_sweep_interval() -> u64 {
    60
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            negative_ttl_secs: default_negative_ttl(),
            refresh_margin_ratio: default_refresh_margin_ratio(),
            min_refresh_margin_secs: default_min_refresh_margin(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl CacheConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_entries == 0 {
            return Err("cache max_entries must be at least 1".to_string());
        }
        if !(0.0..1.0).contains(&self.refresh_margin_ratio) {
            return Err("cache refresh_margin_ratio must be in [0, 1)".to_string());
        }
        if self.sweep_interval_secs == 0 {
            return Err("cache sweep_interval_secs must be positive".to_string());
        }
        Ok(())
    }

    pub fn negative_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_ttl_secs)
    }

    pub fn min_refresh_margin(&self) -> Duration {
        Duration::from_secs(self.min_refresh_margin_secs)
    }
}
