//! OIDC configuration.

use serde::Deserialize;
use std::path::PathBuf;

/// Inbound credential validation configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OidcConfig {
    /// Trusted issuers. Tokens from any other issuer are rejected.
    #[serde(default)]
    pub issuers: Vec<IssuerConfig>,

    /// Audience the inbound token must carry (aud claim).
    #[serde(default)]
    pub accepted_audience: String,

    /// Required OAuth scopes. Request must have all listed scopes.
    #[serde(default)]
    pub required_scopes: Vec<String>,

    /// Claim containing scopes. Defaults to "scope".
    #[serde(default = "default_scope_claim")]
    pub scope_claim: String,

    /// Clock skew tolerance in seconds for exp/nbf validation.
    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: u64,

    /// Age after which a key set is refreshed, and the background refresh interval.
    #[serde(default = "default_jwks_refresh")]
    pub jwks_refresh_secs: u64,

    /// How long the last good key set keeps validating tokens while refreshes fail.
    #[serde(default = "default_key_grace")]
    pub key_grace_period_secs: u64,

    /// Minimum spacing between refreshes triggered by unknown key ids or failures.
    #[serde(default = "default_min_refresh")]
    pub min_refresh_interval_secs: u64,

    /// Timeout for discovery and JWKS requests.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// PEM bundle of CAs trusted for the key-discovery endpoints. When set,
    /// the built-in roots are not trusted.
    #[serde(default)]
    pub ca_bundle_path: Option<PathBuf>,

    /// Skip signature and expiry checks. Only honoured when built with the
    /// `insecure-dev-mode` feature. Never use in production.
    #[serde(default)]
    pub insecure_skip_verification: bool,
}

/// A trusted token issuer.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IssuerConfig {
    /// Token issuer (iss claim). Must match exactly.
    /// Example: "https://keycloak.example.com/realms/cluster"
    pub issuer: String,

    /// JWKS endpoint URL. Discovered from
    /// `<issuer>/.well-known/openid-configuration` when omitted.
    #[serde(default)]
    pub jwks_url: Option<String>,
}

fn default_scope_claim() -> String {
    "scope".to_string()
}

fn default_clock_skew() -> u64 {
    30
}

fn default_jwks_refresh() -> u64 {
    300 // 5 minutes
}

fn default_key_grace() -> u64 {
    3600 // 1 hour
}

fn default_min_refresh() -> u64 {
    10
}

fn default_fetch_timeout() -> u64 {
    10
}

impl Default for OidcConfig {
    fn default() -> Self {
        Self {
            issuers: Vec::new(),
            accepted_audience: String::new(),
            required_scopes: Vec::new(),
            scope_claim: default_scope_claim(),
            clock_skew_secs: default_clock_skew(),
            jwks_refresh_secs: default_jwks_refresh(),
            key_grace_period_secs: default_key_grace(),
            min_refresh_interval_secs: default_min_refresh(),
            fetch_timeout_secs: default_fetch_timeout(),
            ca_bundle_path: None,
            insecure_skip_verification: false,
        }
    }
}

impl OidcConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.issuers.is_empty() {
            return Err("OIDC requires at least one trusted issuer".to_string());
        }

        for issuer in &self.issuers {
            if issuer.issuer.is_empty() {
                return Err("OIDC issuer must not be empty".to_string());
            }
            if let Some(ref url) = issuer.jwks_url {
                if !is_http_url(url) {
                    return Err(format!("OIDC jwks_url for {} must be a valid HTTP(S) URL", issuer.issuer));
                }
            } else if !is_http_url(&issuer.issuer) {
                return Err(format!(
                    "OIDC issuer {} is not a URL, so jwks_url is required",
                    issuer.issuer
                ));
            }
        }

        if self.accepted_audience.is_empty() {
            return Err("OIDC accepted_audience is required".to_string());
        }

        if self.jwks_refresh_secs == 0 {
            return Err("OIDC jwks_refresh_secs must be positive".to_string());
        }

        if self.key_grace_period_secs < self.jwks_refresh_secs {
            return Err("OIDC key_grace_period_secs must be at least jwks_refresh_secs".to_string());
        }

        if let Some(ref path) = self.ca_bundle_path {
            if !path.exists() {
                return Err(format!("OIDC CA bundle does not exist: {:?}", path));
            }
        }

        if self.insecure_skip_verification && !cfg!(feature = "insecure-dev-mode") {
            return Err(
                "insecure_skip_verification requires a build with the insecure-dev-mode feature"
                    .to_string(),
            );
        }

        Ok(())
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("https://") || url.starts_with("http://")
}
