//! Exchange request and result values.

use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::Instant;

use super::config::TokenType;
use crate::secret::SecretString;

/// Inputs of one token exchange.
#[derive(Debug, Clone)]
pub struct ExchangeRequest {
    pub subject_token: SecretString,
    pub audience: String,
    pub scopes: BTreeSet<String>,
}

impl ExchangeRequest {
    pub fn new(
        subject_token: SecretString,
        audience: impl Into<String>,
        scopes: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            subject_token,
            audience: audience.into(),
            scopes: scopes.into_iter().collect(),
        }
    }

    /// Cache identity of this request. The subject token is reduced to its digest.
    pub fn key(&self) -> ExchangeKey {
        ExchangeKey {
            subject_digest: self.subject_token.digest(),
            audience: self.audience.clone(),
            scopes: self.scopes.iter().cloned().collect(),
        }
    }

    /// Space-delimited `scope` parameter.
    pub fn scope_param(&self) -> Option<String> {
        if self.scopes.is_empty() {
            None
        } else {
            Some(self.scopes.iter().cloned().collect::<Vec<_>>().join(" "))
        }
    }
}

/// (subject digest, audience, sorted scopes).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExchangeKey {
    subject_digest: [u8; 32],
    audience: String,
    scopes: Vec<String>,
}

impl ExchangeKey {
    /// Log-safe subject identifier.
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.subject_digest[..6])
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }
}

/// A credential issued by the token endpoint.
#[derive(Debug, Clone)]
pub struct ExchangedCredential {
    pub token: SecretString,
    pub audience: String,
    pub scopes: BTreeSet<String>,
    pub issued_token_type: Option<TokenType>,
    /// `token_type` from the response, normally "Bearer".
    pub token_type: String,
    pub issued_at: Instant,
    pub expires_at: Instant,
}

impl ExchangedCredential {
    pub fn lifetime(&self) -> Duration {
        self.expires_at.saturating_duration_since(self.issued_at)
    }

    /// When the credential should be replaced: expiry minus
    /// max(lifetime * ratio, min_margin), never before issuance.
    pub fn refresh_at(&self, ratio: f64, min_margin: Duration) -> Instant {
        let lifetime = self.lifetime();
        let margin = lifetime.mul_f64(ratio).max(min_margin).min(lifetime);
        self.expires_at - margin
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Authorization scheme for presenting the credential downstream.
    /// `bearer` in any case and RFC 8693's `N_A` become `Bearer`.
    pub fn authorization_scheme(&self) -> &str {
        if self.token_type.eq_ignore_ascii_case("bearer") || self.token_type == "N_A" {
            "Bearer"
        } else {
            &self.token_type
        }
    }
}
