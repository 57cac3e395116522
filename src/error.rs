//! Error taxonomy for validation and exchange, and the coarse outcomes
//! that are the only thing an untrusted caller ever sees.

use thiserror::Error;

/// Coarse outcome surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Unauthenticated,
    Unauthorized,
    Unavailable,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Unauthenticated => write!(f, "unauthenticated"),
            Outcome::Unauthorized => write!(f, "unauthorized"),
            Outcome::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Signing key lookup errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    /// Issuer is not in the configured trust list.
    #[error("unknown issuer: {0}")]
    UnknownIssuer(String),

    /// Key set could not be fetched or parsed and no usable set is retained.
    #[error("key fetch failed for {issuer}: {reason}")]
    KeyFetch { issuer: String, reason: String },
}

impl KeyError {
    pub fn outcome(&self) -> Outcome {
        match self {
            KeyError::UnknownIssuer(_) => Outcome::Unauthenticated,
            KeyError::KeyFetch { .. } => Outcome::Unavailable,
        }
    }
}

/// Inbound credential validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("malformed credential: {0}")]
    MalformedCredential(String),

    #[error("signature invalid")]
    SignatureInvalid,

    #[error("untrusted issuer: {0}")]
    UntrustedIssuer(String),

    #[error("credential expired")]
    Expired,

    #[error("credential not yet valid")]
    NotYetValid,

    #[error("audience mismatch")]
    AudienceMismatch,

    #[error("missing required scope: {0}")]
    InsufficientScope(String),

    #[error(transparent)]
    Key(#[from] KeyError),
}

impl ValidationError {
    pub fn outcome(&self) -> Outcome {
        match self {
            ValidationError::InsufficientScope(_) => Outcome::Unauthorized,
            ValidationError::Key(err) => err.outcome(),
            _ => Outcome::Unauthenticated,
        }
    }

    /// Map a `jsonwebtoken` failure for a token claiming `issuer`.
    pub fn from_jwt(err: jsonwebtoken::errors::Error, issuer: &str) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::InvalidSignature
            | ErrorKind::InvalidAlgorithm
            | ErrorKind::InvalidKeyFormat
            | ErrorKind::InvalidRsaKey(_)
            | ErrorKind::InvalidEcdsaKey => ValidationError::SignatureInvalid,
            ErrorKind::ExpiredSignature => ValidationError::Expired,
            ErrorKind::ImmatureSignature => ValidationError::NotYetValid,
            ErrorKind::InvalidAudience => ValidationError::AudienceMismatch,
            ErrorKind::InvalidIssuer => ValidationError::UntrustedIssuer(issuer.to_string()),
            ErrorKind::MissingRequiredClaim(claim) => {
                ValidationError::MalformedCredential(format!("missing claim '{}'", claim))
            }
            _ => ValidationError::MalformedCredential(err.to_string()),
        }
    }
}

/// Token exchange errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExchangeError {
    /// The identity provider refused the exchange. Never retried.
    #[error(
        "exchange rejected with status {status}: {code}{}",
        .description.as_ref().map(|d| format!(" ({})", d)).unwrap_or_default()
    )]
    Rejected {
        status: u16,
        code: String,
        description: Option<String>,
    },

    /// Transient failure (5xx, network, rate limit).
    #[error("exchange unavailable: {0}")]
    Unavailable(String),

    /// Successful status but the payload could not be used.
    #[error("invalid exchange response: {0}")]
    InvalidResponse(String),
}

impl ExchangeError {
    pub fn outcome(&self) -> Outcome {
        match self {
            ExchangeError::Rejected { .. } => Outcome::Unauthorized,
            ExchangeError::Unavailable(_) | ExchangeError::InvalidResponse(_) => {
                Outcome::Unavailable
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ExchangeError::Unavailable(_))
    }
}
