//! Inbound credential validation against rotating issuer keys.
//!
//! [`KeySource`] owns one signing key set per trusted issuer and refreshes it
//! from the issuer's JWKS endpoint. [`TokenValidator`] verifies bearer tokens
//! with those keys.

pub mod config;
pub mod jwks;
pub mod validator;

pub use config::OidcConfig;
pub use jwks::{KeySource, KeyStatus};
pub use validator::TokenValidator;
