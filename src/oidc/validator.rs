//! Inbound bearer token validation.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, decode_header, Algorithm, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::debug;

use super::config::OidcConfig;
use super::jwks::KeySource;
use crate::error::ValidationError;
use crate::secret::SecretString;

type ClaimMap = Map<String, Value>;

/// Standard OIDC/JWT claims.
#[derive(Debug, Serialize, Deserialize)]
pub struct OidcClaims {
    /// Subject (user identifier)
    pub sub: Option<String>,
    pub iss: Option<String>,
    /// Audience (can be string or array)
    #[serde(default)]
    pub aud: Audience,
    pub exp: Option<i64>,
    pub nbf: Option<i64>,
}

/// Audience can be a single string or array of strings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    #[default]
    None,
    Single(String),
    Multiple(Vec<String>),
}

impl Audience {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Audience::None => Vec::new(),
            Audience::Single(s) => vec![s.clone()],
            Audience::Multiple(v) => v.clone(),
        }
    }
}

/// Whether a credential's signature and lifetime were actually checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verification {
    Verified,
    /// Accepted with verification disabled. Claims may only be used to deny.
    #[cfg_attr(not(feature = "insecure-dev-mode"), allow(dead_code))]
    Unverified,
}

/// An accepted inbound credential.
#[derive(Debug, Clone)]
pub struct InboundCredential {
    pub token: SecretString,
    pub issuer: String,
    pub subject: String,
    pub audience: Vec<String>,
    pub scopes: BTreeSet<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub not_before: Option<DateTime<Utc>>,
    pub groups: Vec<String>,
    pub roles: BTreeSet<String>,
    /// Every claim of the token payload.
    pub claims: ClaimMap,
    pub verification: Verification,
}

impl InboundCredential {
    pub fn is_verified(&self) -> bool {
        self.verification == Verification::Verified
    }
}

/// Validates inbound credentials against the trusted issuers' keys.
pub struct TokenValidator {
    keys: Arc<KeySource>,
    trusted_issuers: HashSet<String>,
    required_scopes: Vec<String>,
    scope_claim: String,
    leeway: u64,
    #[cfg(feature = "insecure-dev-mode")]
    skip_verification: bool,
}

impl TokenValidator {
    pub fn new(config: &OidcConfig, keys: Arc<KeySource>) -> Self {
        Self {
            keys,
            trusted_issuers: config.issuers.iter().map(|i| i.issuer.clone()).collect(),
            required_scopes: config.required_scopes.clone(),
            scope_claim: config.scope_claim.clone(),
            leeway: config.clock_skew_secs,
            #[cfg(feature = "insecure-dev-mode")]
            skip_verification: config.insecure_skip_verification,
        }
    }

    /// Validate `raw` and require `required_audience` in its `aud` claim.
    pub async fn validate(
        &self,
        raw: &str,
        required_audience: &str,
    ) -> Result<InboundCredential, ValidationError> {
        let header = decode_header(raw)
            .map_err(|e| ValidationError::MalformedCredential(e.to_string()))?;
        let unverified = peek_claims(raw)?;

        let issuer = unverified
            .get("iss")
            .and_then(Value::as_str)
            .ok_or_else(|| ValidationError::MalformedCredential("missing claim 'iss'".to_string()))?;

        if !self.trusted_issuers.contains(issuer) {
            return Err(ValidationError::UntrustedIssuer(issuer.to_string()));
        }

        debug!(
            issuer = %issuer,
            kid = ?header.kid,
            alg = ?header.alg,
            "Validating token"
        );

        #[cfg(feature = "insecure-dev-mode")]
        if self.skip_verification {
            return self.accept_unverified(raw, header.alg, issuer, required_audience);
        }

        if !is_asymmetric(header.alg) {
            return Err(ValidationError::SignatureInvalid);
        }

        let key = self
            .keys
            .key(issuer, header.kid.as_deref())
            .await?
            .ok_or(ValidationError::SignatureInvalid)?;

        if key.alg.is_some_and(|alg| alg != header.alg) {
            return Err(ValidationError::SignatureInvalid);
        }

        let mut validation = Validation::new(header.alg);
        validation.leeway = self.leeway;
        validation.validate_nbf = true;
        validation.set_issuer(&[issuer]);
        validation.set_audience(&[required_audience]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        let data = decode::<ClaimMap>(raw, &key.key, &validation)
            .map_err(|e| ValidationError::from_jwt(e, issuer))?;

        self.accept(raw, data.claims, Verification::Verified)
    }

    #[cfg(feature = "insecure-dev-mode")]
    fn accept_unverified(
        &self,
        raw: &str,
        alg: Algorithm,
        issuer: &str,
        required_audience: &str,
    ) -> Result<InboundCredential, ValidationError> {
        let mut validation = Validation::new(alg);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.set_issuer(&[issuer]);
        validation.set_audience(&[required_audience]);
        validation.set_required_spec_claims(&["iss", "sub"]);

        let data = decode::<ClaimMap>(raw, &jsonwebtoken::DecodingKey::from_secret(&[]), &validation)
            .map_err(|e| ValidationError::from_jwt(e, issuer))?;

        tracing::warn!(issuer = %issuer, "Signature verification disabled, accepting unverified token");
        self.accept(raw, data.claims, Verification::Unverified)
    }

    fn accept(
        &self,
        raw: &str,
        claims: ClaimMap,
        verification: Verification,
    ) -> Result<InboundCredential, ValidationError> {
        let parsed: OidcClaims = serde_json::from_value(Value::Object(claims.clone()))
            .map_err(|e| ValidationError::MalformedCredential(e.to_string()))?;

        let scopes = extract_scopes(&claims, &self.scope_claim);
        for required in &self.required_scopes {
            if !scopes.contains(required) {
                return Err(ValidationError::InsufficientScope(required.clone()));
            }
        }

        let subject = parsed
            .sub
            .ok_or_else(|| ValidationError::MalformedCredential("missing claim 'sub'".to_string()))?;
        let issuer = parsed.iss.unwrap_or_default();
        let token = SecretString::new(raw);

        debug!(
            issuer = %issuer,
            subject = %subject,
            token = %token.fingerprint(),
            scopes = ?scopes,
            "Token validated"
        );

        Ok(InboundCredential {
            token,
            issuer,
            subject,
            audience: parsed.aud.to_vec(),
            scopes,
            expires_at: parsed.exp.and_then(|t| DateTime::from_timestamp(t, 0)),
            not_before: parsed.nbf.and_then(|t| DateTime::from_timestamp(t, 0)),
            groups: string_list(claims.get("groups")),
            roles: extract_roles(&claims),
            claims,
            verification,
        })
    }
}

/// Decode the payload without verifying anything.
fn peek_claims(raw: &str) -> Result<ClaimMap, ValidationError> {
    let parts: Vec<&str> = raw.split('.').collect();
    if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
        return Err(ValidationError::MalformedCredential(
            "expected three dot-separated segments".to_string(),
        ));
    }

    let payload = URL_SAFE_NO_PAD
        .decode(parts[1].trim_end_matches('='))
        .map_err(|e| ValidationError::MalformedCredential(format!("payload encoding: {}", e)))?;

    serde_json::from_slice(&payload)
        .map_err(|e| ValidationError::MalformedCredential(format!("payload: {}", e)))
}

fn is_asymmetric(alg: Algorithm) -> bool {
    matches!(
        alg,
        Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512
            | Algorithm::ES256
            | Algorithm::ES384
    )
}

/// Extract scopes from a space-separated string or an array claim.
fn extract_scopes(claims: &ClaimMap, scope_claim: &str) -> BTreeSet<String> {
    match claims.get(scope_claim) {
        Some(Value::String(s)) => s.split_whitespace().map(String::from).collect(),
        Some(Value::Array(arr)) => arr
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        _ => BTreeSet::new(),
    }
}

/// Roles from `roles`, `realm_access.roles` and `resource_access.<client>.roles`.
fn extract_roles(claims: &ClaimMap) -> BTreeSet<String> {
    let mut roles: BTreeSet<String> = string_list(claims.get("roles")).into_iter().collect();

    if let Some(realm) = claims.get("realm_access") {
        roles.extend(string_list(realm.get("roles")));
    }

    if let Some(Value::Object(clients)) = claims.get("resource_access") {
        for access in clients.values() {
            roles.extend(string_list(access.get("roles")));
        }
    }

    roles
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(arr)) => arr
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}
