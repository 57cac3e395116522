//! Forwarding to the downstream API with the exchanged credential.

use anyhow::Result;
use axum::body::{Body, Bytes};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::request::Parts;
use axum::response::Response;
use std::time::Duration;
use tracing::debug;

use super::handler::ForwardError;
use crate::config::ServerConfig;
use crate::exchange::ExchangedCredential;

/// Headers that carry the inbound credential behind oauth2-proxy.
pub const FORWARDED_TOKEN_HEADERS: [&str; 2] =
    ["x-forwarded-access-token", "x-auth-request-access-token"];

/// Connection-scoped headers (RFC 9110 section 7.6.1).
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Relays requests to the downstream base URL.
pub struct HttpForwarder {
    http_client: reqwest::Client,
    base_url: String,
}

impl HttpForwarder {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let http_client = crate::http::build_client(
            Duration::from_secs(config.downstream_timeout_secs),
            config.downstream_ca_bundle_path.as_deref(),
        )?;
        Ok(Self {
            http_client,
            base_url: config.downstream_url.trim_end_matches('/').to_string(),
        })
    }

    /// Send the request downstream as the exchanged credential's subject and
    /// relay the response.
    pub async fn forward(
        &self,
        parts: &Parts,
        body: Bytes,
        credential: &ExchangedCredential,
    ) -> Result<Response, ForwardError> {
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("{}{}", self.base_url, path);

        let mut headers = request_headers(&parts.headers);
        headers.insert(header::AUTHORIZATION, authorization(credential)?);

        debug!(method = %parts.method, path = %parts.uri.path(), "Forwarding downstream");

        let upstream = self
            .http_client
            .request(parts.method.clone(), url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| ForwardError(e.to_string()))?;

        let mut response = Response::builder().status(upstream.status());
        if let Some(out) = response.headers_mut() {
            *out = response_headers(upstream.headers());
        }
        response
            .body(Body::from_stream(upstream.bytes_stream()))
            .map_err(|e| ForwardError(e.to_string()))
    }
}

/// `Authorization` value presenting the exchanged credential, marked sensitive.
pub fn authorization(credential: &ExchangedCredential) -> Result<HeaderValue, ForwardError> {
    let mut value = HeaderValue::from_str(&format!(
        "{} {}",
        credential.authorization_scheme(),
        credential.token.expose()
    ))
    .map_err(|_| ForwardError("exchanged credential is not a valid header value".to_string()))?;
    value.set_sensitive(true);
    Ok(value)
}

/// Inbound headers minus hop-by-hop fields, `Host`, and every header that
/// carried the inbound credential.
pub fn request_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = strip_hop_by_hop(inbound);
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::AUTHORIZATION);
    for name in FORWARDED_TOKEN_HEADERS {
        headers.remove(name);
    }
    headers
}

/// Downstream headers minus hop-by-hop fields.
pub fn response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = strip_hop_by_hop(upstream);
    headers.remove(header::CONTENT_LENGTH);
    headers
}

fn strip_hop_by_hop(source: &HeaderMap) -> HeaderMap {
    // Headers listed in Connection are hop-by-hop too.
    let listed: Vec<HeaderName> = source
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    let mut headers = source.clone();
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    for name in listed {
        headers.remove(name);
    }
    headers
}
