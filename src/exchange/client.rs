//! RFC 8693 token exchange client.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::config::{ClientAuthMethod, ExchangeConfig, TokenType};
use super::types::{ExchangeRequest, ExchangedCredential};
use crate::error::ExchangeError;
use crate::secret::SecretString;
use zeroize::Zeroizing;

/// Token exchange grant type (RFC 8693).
pub const GRANT_TYPE_TOKEN_EXCHANGE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";

/// Error codes that signal a transient condition even with a 4xx status.
const TRANSIENT_ERROR_CODES: &[&str] = &["temporarily_unavailable", "server_error"];

/// Performs token exchanges.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn exchange(&self, request: &ExchangeRequest) -> Result<ExchangedCredential, ExchangeError>;
}

/// Token exchange response (JSON).
#[derive(Debug, Deserialize)]
pub struct TokenExchangeResponse {
    pub access_token: String,
    /// Type of token issued (URN).
    #[serde(default)]
    pub issued_token_type: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// Token endpoint error body.
#[derive(Debug, Deserialize)]
pub struct TokenExchangeError {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// Bounded exponential backoff for transient failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Token exchange over HTTP against the identity provider's token endpoint.
pub struct HttpExchangeClient {
    http_client: reqwest::Client,
    token_endpoint: String,
    client_id: String,
    client_secret: SecretString,
    client_auth: ClientAuthMethod,
    subject_token_type: TokenType,
    requested_token_type: TokenType,
    default_ttl: Duration,
    retry: RetryPolicy,
}

impl HttpExchangeClient {
    pub fn new(config: &ExchangeConfig) -> Result<Self> {
        let http_client = crate::http::build_client(
            Duration::from_secs(config.request_timeout_secs),
            config.ca_bundle_path.as_deref(),
        )?;

        Ok(Self {
            http_client,
            token_endpoint: config.token_endpoint.clone(),
            client_id: config.client_id.clone(),
            client_secret: config
                .client_secret
                .clone()
                .unwrap_or_else(|| SecretString::new("")),
            client_auth: config.client_auth,
            subject_token_type: config.subject_token_type,
            requested_token_type: config.requested_token_type,
            default_ttl: Duration::from_secs(config.default_token_ttl_secs),
            retry: RetryPolicy {
                max_attempts: config.max_attempts.max(1),
                initial_backoff: Duration::from_millis(config.initial_backoff_ms),
                max_backoff: Duration::from_millis(config.max_backoff_ms),
            },
        })
    }

    async fn exchange_once(
        &self,
        request: &ExchangeRequest,
    ) -> Result<ExchangedCredential, ExchangeError> {
        let scope = request.scope_param();

        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", GRANT_TYPE_TOKEN_EXCHANGE),
            ("subject_token", request.subject_token.expose()),
            ("subject_token_type", self.subject_token_type.as_urn()),
            ("requested_token_type", self.requested_token_type.as_urn()),
            ("audience", request.audience.as_str()),
        ];
        if let Some(ref scope) = scope {
            form.push(("scope", scope.as_str()));
        }

        let mut builder = self.http_client.post(&self.token_endpoint);
        match self.client_auth {
            ClientAuthMethod::ClientSecretBasic => {
                // RFC 6749 section 2.3.1: both halves are form-urlencoded first.
                let secret = Zeroizing::new(urlencoding::encode(self.client_secret.expose()).into_owned());
                builder = builder.basic_auth(urlencoding::encode(&self.client_id), Some(secret.as_str()));
            }
            ClientAuthMethod::ClientSecretPost => {
                form.push(("client_id", self.client_id.as_str()));
                form.push(("client_secret", self.client_secret.expose()));
            }
        }

        let response = builder
            .form(&form)
            .send()
            .await
            .map_err(|e| ExchangeError::Unavailable(format!("request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| ExchangeError::Unavailable(format!("reading response failed: {}", e)))?;

        classify(status, &body, request, self.default_ttl, Instant::now())
    }
}

#[async_trait]
impl TokenExchanger for HttpExchangeClient {
    async fn exchange(&self, request: &ExchangeRequest) -> Result<ExchangedCredential, ExchangeError> {
        let subject = request.subject_token.fingerprint();
        let mut attempt = 1;

        loop {
            debug!(
                subject = %subject,
                audience = %request.audience,
                attempt = attempt,
                "Requesting token exchange"
            );

            match self.exchange_once(request).await {
                Ok(credential) => {
                    info!(
                        subject = %subject,
                        audience = %credential.audience,
                        scopes = ?credential.scopes,
                        issued_token_type = ?credential.issued_token_type,
                        expires_in = credential.lifetime().as_secs(),
                        "Token exchange succeeded"
                    );
                    return Ok(credential);
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay(attempt);
                    warn!(
                        subject = %subject,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Token exchange failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(
                        subject = %subject,
                        audience = %request.audience,
                        attempts = attempt,
                        error = %e,
                        "Token exchange failed"
                    );
                    return Err(e);
                }
            }
        }
    }
}

/// Turn a token endpoint response into a credential or a classified error.
pub fn classify(
    status: StatusCode,
    body: &[u8],
    request: &ExchangeRequest,
    default_ttl: Duration,
    issued_at: Instant,
) -> Result<ExchangedCredential, ExchangeError> {
    if status.is_success() {
        let parsed: TokenExchangeResponse = serde_json::from_slice(body)
            .map_err(|e| ExchangeError::InvalidResponse(e.to_string()))?;

        if parsed.access_token.is_empty() {
            return Err(ExchangeError::InvalidResponse("empty access_token".to_string()));
        }

        let lifetime = parsed
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(default_ttl);
        let expires_at = issued_at
            .checked_add(lifetime)
            .ok_or_else(|| ExchangeError::InvalidResponse("expires_in out of range".to_string()))?;

        let scopes: BTreeSet<String> = match parsed.scope {
            Some(ref scope) => scope.split_whitespace().map(String::from).collect(),
            None => request.scopes.clone(),
        };

        return Ok(ExchangedCredential {
            token: SecretString::new(parsed.access_token),
            audience: request.audience.clone(),
            scopes,
            issued_token_type: parsed.issued_token_type.as_deref().and_then(TokenType::from_urn),
            token_type: parsed.token_type.unwrap_or_else(|| "Bearer".to_string()),
            issued_at,
            expires_at,
        });
    }

    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Err(ExchangeError::Unavailable(format!("token endpoint returned {}", status)));
    }

    if status.is_client_error() {
        let (code, description) = match serde_json::from_slice::<TokenExchangeError>(body) {
            Ok(err) => (err.error, err.error_description),
            Err(_) => ("unknown_error".to_string(), None),
        };

        if TRANSIENT_ERROR_CODES.contains(&code.as_str()) {
            return Err(ExchangeError::Unavailable(format!(
                "token endpoint returned {}: {}",
                status, code
            )));
        }

        return Err(ExchangeError::Rejected {
            status: status.as_u16(),
            code,
            description,
        });
    }

    Err(ExchangeError::Unavailable(format!("unexpected status {}", status)))
}
