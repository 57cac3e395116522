//! Outbound HTTP client construction.

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::time::Duration;

/// Build a client with `timeout`. When `ca_bundle` is set, only the CAs in
/// that PEM bundle are trusted.
pub fn build_client(timeout: Duration, ca_bundle: Option<&Path>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(timeout);

    if let Some(path) = ca_bundle {
        let pem = std::fs::read(path)
            .with_context(|| format!("Failed to read CA bundle: {:?}", path))?;
        let certs = reqwest::Certificate::from_pem_bundle(&pem)
            .with_context(|| format!("Failed to parse CA bundle: {:?}", path))?;
        if certs.is_empty() {
            return Err(anyhow!("CA bundle {:?} contains no certificates", path));
        }
        builder = builder.tls_built_in_root_certs(false);
        for cert in certs {
            builder = builder.add_root_certificate(cert);
        }
    }

    builder.build().context("Failed to create HTTP client")
}
