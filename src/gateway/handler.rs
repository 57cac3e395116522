//! Request orchestration: validate, exchange, forward.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Outcome;
use crate::exchange::{ExchangeCache, ExchangeRequest, ExchangedCredential};
use crate::oidc::TokenValidator;

/// Audience and scopes requested for the downstream credential.
#[derive(Debug, Clone)]
pub struct ExchangeTarget {
    pub audience: String,
    pub scopes: BTreeSet<String>,
}

/// Lifecycle of one gateway request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    Validating,
    Validated,
    Rejected,
    Exchanging,
    Exchanged,
    ExchangeDenied,
    ExchangeUnavailable,
    Forwarding,
    Completed,
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestState::Received => "received",
            RequestState::Validating => "validating",
            RequestState::Validated => "validated",
            RequestState::Rejected => "rejected",
            RequestState::Exchanging => "exchanging",
            RequestState::Exchanged => "exchanged",
            RequestState::ExchangeDenied => "exchange_denied",
            RequestState::ExchangeUnavailable => "exchange_unavailable",
            RequestState::Forwarding => "forwarding",
            RequestState::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// What the caller is told. Details stay in the logs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("unauthenticated")]
    Unauthenticated,

    #[error("unauthorized")]
    Unauthorized,

    #[error("temporarily unavailable")]
    Unavailable { retry_after: Duration },

    #[error("bad gateway")]
    BadGateway,
}

impl GatewayError {
    fn from_outcome(outcome: Outcome, retry_after: Duration) -> Self {
        match outcome {
            Outcome::Unauthenticated => GatewayError::Unauthenticated,
            Outcome::Unauthorized => GatewayError::Unauthorized,
            Outcome::Unavailable => GatewayError::Unavailable { retry_after },
        }
    }
}

/// Downstream transport failure.
#[derive(Debug, Error)]
#[error("downstream request failed: {0}")]
pub struct ForwardError(pub String);

/// Validates the inbound credential, obtains an exchanged credential and hands
/// it to the downstream call. No path substitutes another identity.
pub struct AuthGateway {
    validator: Arc<TokenValidator>,
    cache: Arc<ExchangeCache>,
    accepted_audience: String,
    retry_after: Duration,
}

impl AuthGateway {
    pub fn new(
        validator: Arc<TokenValidator>,
        cache: Arc<ExchangeCache>,
        accepted_audience: impl Into<String>,
        retry_after: Duration,
    ) -> Self {
        Self {
            validator,
            cache,
            accepted_audience: accepted_audience.into(),
            retry_after,
        }
    }

    pub async fn handle<F, Fut, R>(
        &self,
        raw: &str,
        target: &ExchangeTarget,
        downstream: F,
    ) -> Result<R, GatewayError>
    where
        F: FnOnce(Arc<ExchangedCredential>) -> Fut,
        Fut: Future<Output = Result<R, ForwardError>>,
    {
        let request_id = Uuid::new_v4();
        let trace = |state: RequestState| debug!(request_id = %request_id, state = %state, "Request state");

        trace(RequestState::Received);
        trace(RequestState::Validating);

        let credential = match self.validator.validate(raw, &self.accepted_audience).await {
            Ok(credential) => credential,
            Err(e) => {
                trace(RequestState::Rejected);
                info!(request_id = %request_id, error = %e, outcome = %e.outcome(), "Inbound credential rejected");
                return Err(GatewayError::from_outcome(e.outcome(), self.retry_after));
            }
        };
        trace(RequestState::Validated);
        debug!(
            request_id = %request_id,
            issuer = %credential.issuer,
            subject = %credential.subject,
            audience = ?credential.audience,
            scopes = ?credential.scopes,
            roles = ?credential.roles,
            groups = ?credential.groups,
            not_before = ?credential.not_before,
            expires_at = ?credential.expires_at,
            claim_count = credential.claims.len(),
            "Inbound credential accepted"
        );

        if !credential.is_verified() {
            warn!(
                request_id = %request_id,
                subject = %credential.subject,
                "Proceeding with an unverified inbound credential"
            );
        }

        trace(RequestState::Exchanging);
        let request = ExchangeRequest::new(
            credential.token.clone(),
            target.audience.clone(),
            target.scopes.iter().cloned(),
        );

        let exchanged = match self.cache.get(request).await {
            Ok(exchanged) => exchanged,
            Err(e) => {
                let outcome = e.outcome();
                trace(if outcome == Outcome::Unauthorized {
                    RequestState::ExchangeDenied
                } else {
                    RequestState::ExchangeUnavailable
                });
                info!(
                    request_id = %request_id,
                    subject = %credential.subject,
                    audience = %target.audience,
                    error = %e,
                    outcome = %outcome,
                    "Token exchange failed"
                );
                return Err(GatewayError::from_outcome(outcome, self.retry_after));
            }
        };
        trace(RequestState::Exchanged);

        trace(RequestState::Forwarding);
        match downstream(exchanged).await {
            Ok(response) => {
                trace(RequestState::Completed);
                Ok(response)
            }
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "Downstream request failed");
                Err(GatewayError::BadGateway)
            }
        }
    }
}
