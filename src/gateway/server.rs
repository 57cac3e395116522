//! HTTP front end: credential extraction, health reporting and the proxy route.

use anyhow::Result;
use axum::body::to_bytes;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::handler::{AuthGateway, ExchangeTarget, GatewayError};
use super::proxy::{HttpForwarder, FORWARDED_TOKEN_HEADERS};
use crate::config::GatewayConfig;
use crate::exchange::{ExchangeCache, HttpExchangeClient};
use crate::oidc::{KeySource, KeyStatus, TokenValidator};

/// Shared state of the HTTP surface.
#[derive(Clone)]
pub struct AppState {
    gateway: Arc<AuthGateway>,
    forwarder: Arc<HttpForwarder>,
    keys: Arc<KeySource>,
    cache: Arc<ExchangeCache>,
    target: Arc<ExchangeTarget>,
    max_body_bytes: usize,
}

impl AppState {
    /// Wire every component from `config`. Nothing is fetched yet.
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let keys = Arc::new(KeySource::new(&config.oidc)?);
        let validator = Arc::new(TokenValidator::new(&config.oidc, Arc::clone(&keys)));
        let client = Arc::new(HttpExchangeClient::new(&config.exchange)?);
        let cache = Arc::new(ExchangeCache::new(&config.cache, client));
        let gateway = Arc::new(AuthGateway::new(
            validator,
            Arc::clone(&cache),
            config.oidc.accepted_audience.clone(),
            Duration::from_secs(config.server.retry_after_secs),
        ));

        Ok(Self {
            gateway,
            forwarder: Arc::new(HttpForwarder::new(&config.server)?),
            keys,
            cache,
            target: Arc::new(ExchangeTarget {
                audience: config.exchange.audience.clone(),
                scopes: config.exchange.scopes.iter().cloned().collect(),
            }),
            max_body_bytes: config.server.max_body_bytes,
        })
    }

    pub fn keys(&self) -> Arc<KeySource> {
        Arc::clone(&self.keys)
    }

    pub fn cache(&self) -> Arc<ExchangeCache> {
        Arc::clone(&self.cache)
    }
}

/// Health route plus a fallback that proxies everything else.
pub fn build_router(state: AppState, health_path: &str) -> Router {
    Router::new()
        .route(health_path, get(health))
        .fallback(proxy)
        .with_state(state)
}

/// Inbound bearer credential. `Authorization: Bearer` wins over the
/// oauth2-proxy headers, which are tried in order.
pub fn extract_credential(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("bearer "))
        })
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(token) = bearer {
        return Some(token.to_string());
    }

    FORWARDED_TOKEN_HEADERS.iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
    })
}

#[derive(Serialize)]
struct HealthReport {
    status: &'static str,
    issuers: BTreeMap<String, KeyStatus>,
    cached_exchanges: usize,
}

async fn health(State(state): State<AppState>) -> Response {
    let issuers: BTreeMap<String, KeyStatus> = state
        .keys
        .issuers()
        .filter_map(|issuer| {
            state
                .keys
                .status(issuer)
                .ok()
                .map(|status| (issuer.to_string(), status))
        })
        .collect();

    let healthy = issuers
        .values()
        .all(|s| matches!(s, KeyStatus::Fresh | KeyStatus::Degraded));
    let report = HealthReport {
        status: if healthy { "ok" } else { "unavailable" },
        issuers,
        cached_exchanges: state.cache.len(),
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

async fn proxy(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let Some(raw) = extract_credential(&parts.headers) else {
        debug!(path = %parts.uri.path(), "No bearer credential");
        return GatewayError::Unauthenticated.into_response();
    };

    let forwarder = &state.forwarder;
    let parts = &parts;
    let max_body_bytes = state.max_body_bytes;
    // The body is only read once the caller is authenticated and exchanged.
    match state
        .gateway
        .handle(&raw, &state.target, |credential| async move {
            let body = match to_bytes(body, max_body_bytes).await {
                Ok(body) => body,
                Err(_) => return Ok(StatusCode::PAYLOAD_TOO_LARGE.into_response()),
            };
            forwarder.forward(parts, body, &credential).await
        })
        .await
    {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, code) = match self {
            GatewayError::Unauthenticated => (StatusCode::UNAUTHORIZED, "unauthenticated"),
            GatewayError::Unauthorized => (StatusCode::FORBIDDEN, "unauthorized"),
            GatewayError::Unavailable { .. } => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            GatewayError::BadGateway => (StatusCode::BAD_GATEWAY, "bad_gateway"),
        };

        let mut response = (status, Json(json!({ "error": code }))).into_response();
        match self {
            GatewayError::Unauthenticated => {
                response.headers_mut().insert(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static("Bearer realm=\"gateway\""),
                );
            }
            GatewayError::Unavailable { retry_after } => {
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(retry_after.as_secs().max(1)));
            }
            _ => {}
        }
        response
    }
}
