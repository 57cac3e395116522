//! Per-issuer JWKS (JSON Web Key Set) fetching and caching.
//!
//! Each trusted issuer owns one [`SigningKeySet`]. Refreshes are single-flight
//! per issuer: callers that miss a key while a refresh is running wait for it
//! instead of issuing their own fetch. When refreshes fail, the last good set
//! keeps serving for the configured grace period, then lookups fail closed.

use anyhow::{anyhow, Context, Result};
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::config::OidcConfig;
use crate::error::KeyError;

/// Public key material for one `kid`.
#[derive(Clone)]
pub struct PublicKey {
    pub key: DecodingKey,
    /// Algorithm pinned by the JWK, if it declared one.
    pub alg: Option<Algorithm>,
}

/// Keys published by one issuer at one point in time.
pub struct SigningKeySet {
    keys: HashMap<String, PublicKey>,
    fetched_at: Instant,
}

impl SigningKeySet {
    pub fn get(&self, kid: &str) -> Option<&PublicKey> {
        self.keys.get(kid)
    }

    /// The single key of a one-key set, for tokens that carry no `kid`.
    pub fn sole(&self) -> Option<&PublicKey> {
        if self.keys.len() == 1 {
            self.keys.values().next()
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    fn lookup(&self, kid: Option<&str>) -> Option<&PublicKey> {
        match kid {
            Some(kid) => self.get(kid),
            None => self.sole(),
        }
    }
}

/// Availability of an issuer's keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    /// Never fetched successfully.
    Missing,
    /// Last refresh succeeded.
    Fresh,
    /// Last refresh failed; the previous set is served within the grace period.
    Degraded,
    /// Refreshes failed past the grace period. Validation fails closed.
    Unavailable,
}

/// JWKS response from the endpoint.
#[derive(Debug, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

/// Individual JSON Web Key.
#[derive(Debug, Deserialize)]
pub struct Jwk {
    /// Key type (RSA, EC)
    pub kty: String,
    pub kid: Option<String>,
    pub alg: Option<String>,
    /// Key use (sig, enc)
    #[serde(rename = "use")]
    pub key_use: Option<String>,

    // RSA parameters
    pub n: Option<String>,
    pub e: Option<String>,

    // EC parameters
    pub crv: Option<String>,
    pub x: Option<String>,
    pub y: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    jwks_uri: String,
}

struct IssuerState {
    keys: Option<Arc<SigningKeySet>>,
    /// Bumped after every completed refresh attempt.
    generation: u64,
    last_attempt: Option<Instant>,
    last_error: Option<KeyError>,
    discovered_jwks_url: Option<String>,
}

struct IssuerKeys {
    issuer: String,
    jwks_url: Option<String>,
    state: RwLock<IssuerState>,
    refresh_lock: Mutex<()>,
}

impl IssuerKeys {
    fn read(&self) -> RwLockReadGuard<'_, IssuerState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, IssuerState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Signing keys for every trusted issuer.
pub struct KeySource {
    issuers: HashMap<String, IssuerKeys>,
    http_client: reqwest::Client,
    refresh_interval: Duration,
    grace_period: Duration,
    min_refresh_interval: Duration,
}

impl KeySource {
    /// Create a key source for the configured issuers. Nothing is fetched yet.
    pub fn new(config: &OidcConfig) -> Result<Self> {
        let http_client = crate::http::build_client(
            Duration::from_secs(config.fetch_timeout_secs),
            config.ca_bundle_path.as_deref(),
        )?;

        let issuers = config
            .issuers
            .iter()
            .map(|i| {
                (
                    i.issuer.clone(),
                    IssuerKeys {
                        issuer: i.issuer.clone(),
                        jwks_url: i.jwks_url.clone(),
                        state: RwLock::new(IssuerState {
                            keys: None,
                            generation: 0,
                            last_attempt: None,
                            last_error: None,
                            discovered_jwks_url: None,
                        }),
                        refresh_lock: Mutex::new(()),
                    },
                )
            })
            .collect();

        Ok(Self {
            issuers,
            http_client,
            refresh_interval: Duration::from_secs(config.jwks_refresh_secs),
            grace_period: Duration::from_secs(config.key_grace_period_secs),
            min_refresh_interval: Duration::from_secs(config.min_refresh_interval_secs),
        })
    }

    /// Current key set for `issuer`, refreshing it first when it is stale.
    pub async fn keys(&self, issuer: &str) -> Result<Arc<SigningKeySet>, KeyError> {
        let entry = self.entry(issuer)?;

        let generation = {
            let state = entry.read();
            if let Some(ref set) = state.keys {
                if set.fetched_at.elapsed() < self.refresh_interval {
                    return Ok(Arc::clone(set));
                }
            }
            if self.recently_attempted(&state) {
                return self.usable(entry, &state);
            }
            state.generation
        };

        self.refresh_after(entry, generation).await
    }

    /// Force a refresh of `issuer`'s key set.
    pub async fn refresh(&self, issuer: &str) -> Result<Arc<SigningKeySet>, KeyError> {
        let entry = self.entry(issuer)?;
        let generation = entry.read().generation;
        self.refresh_after(entry, generation).await
    }

    /// Key for `kid` (or the sole key when `kid` is absent).
    ///
    /// An unknown `kid` triggers one refresh, unless a refresh happened within
    /// the minimum refresh interval. `Ok(None)` means no published key matches.
    pub async fn key(&self, issuer: &str, kid: Option<&str>) -> Result<Option<PublicKey>, KeyError> {
        let set = self.keys(issuer).await?;
        if let Some(key) = set.lookup(kid) {
            return Ok(Some(key.clone()));
        }

        let entry = self.entry(issuer)?;
        let generation = {
            let state = entry.read();
            if self.recently_attempted(&state) {
                debug!(issuer = %issuer, kid = ?kid, "Key not found, refresh suppressed");
                return Ok(state.keys.as_ref().and_then(|s| s.lookup(kid).cloned()));
            }
            state.generation
        };

        debug!(issuer = %issuer, kid = ?kid, "Key not found in cache, refreshing JWKS");
        let set = self.refresh_after(entry, generation).await?;
        Ok(set.lookup(kid).cloned())
    }

    /// Key availability for `issuer`.
    pub fn status(&self, issuer: &str) -> Result<KeyStatus, KeyError> {
        let entry = self.entry(issuer)?;
        let state = entry.read();
        Ok(match state.keys {
            None => KeyStatus::Missing,
            Some(ref set) if set.fetched_at.elapsed() > self.grace_period => KeyStatus::Unavailable,
            Some(_) if state.last_error.is_some() => KeyStatus::Degraded,
            Some(_) => KeyStatus::Fresh,
        })
    }

    pub fn issuers(&self) -> impl Iterator<Item = &str> {
        self.issuers.keys().map(String::as_str)
    }

    /// Refresh every issuer, logging failures.
    pub async fn refresh_all(&self) {
        for issuer in self.issuers.keys() {
            if let Err(e) = self.refresh(issuer).await {
                warn!(issuer = %issuer, error = %e, "JWKS refresh failed");
            }
        }
    }

    fn entry(&self, issuer: &str) -> Result<&IssuerKeys, KeyError> {
        self.issuers
            .get(issuer)
            .ok_or_else(|| KeyError::UnknownIssuer(issuer.to_string()))
    }

    fn recently_attempted(&self, state: &IssuerState) -> bool {
        state
            .last_attempt
            .is_some_and(|at| at.elapsed() < self.min_refresh_interval)
    }

    /// The retained set if it is still inside the grace period.
    fn usable(&self, entry: &IssuerKeys, state: &IssuerState) -> Result<Arc<SigningKeySet>, KeyError> {
        match state.keys {
            Some(ref set) if set.fetched_at.elapsed() <= self.grace_period => {
                if let Some(ref err) = state.last_error {
                    warn!(issuer = %entry.issuer, error = %err, "Serving retained JWKS (degraded)");
                }
                Ok(Arc::clone(set))
            }
            _ => Err(state.last_error.clone().unwrap_or_else(|| KeyError::KeyFetch {
                issuer: entry.issuer.clone(),
                reason: "no usable key set".to_string(),
            })),
        }
    }

    /// Refresh unless another caller completed an attempt since `seen_generation`.
    async fn refresh_after(
        &self,
        entry: &IssuerKeys,
        seen_generation: u64,
    ) -> Result<Arc<SigningKeySet>, KeyError> {
        let _guard = entry.refresh_lock.lock().await;

        {
            let state = entry.read();
            if state.generation != seen_generation {
                return self.usable(entry, &state);
            }
        }

        let fetched = self.fetch(entry).await;

        let mut state = entry.write();
        state.generation += 1;
        state.last_attempt = Some(Instant::now());

        match fetched {
            Ok((set, jwks_url)) => {
                info!(
                    issuer = %entry.issuer,
                    url = %jwks_url,
                    key_count = set.len(),
                    "JWKS cache refreshed"
                );
                let set = Arc::new(set);
                state.keys = Some(Arc::clone(&set));
                state.last_error = None;
                if entry.jwks_url.is_none() {
                    state.discovered_jwks_url = Some(jwks_url);
                }
                Ok(set)
            }
            Err(e) => {
                let err = KeyError::KeyFetch {
                    issuer: entry.issuer.clone(),
                    reason: format!("{:#}", e),
                };
                warn!(issuer = %entry.issuer, error = %err, "JWKS refresh failed");
                state.last_error = Some(err);
                self.usable(entry, &state)
            }
        }
    }

    async fn fetch(&self, entry: &IssuerKeys) -> Result<(SigningKeySet, String)> {
        let jwks_url = match entry.jwks_url.clone() {
            Some(url) => url,
            None => {
                let cached = entry.read().discovered_jwks_url.clone();
                match cached {
                    Some(url) => url,
                    None => self.discover_jwks_url(&entry.issuer).await?,
                }
            }
        };

        debug!(url = %jwks_url, "Fetching JWKS");

        let response = self
            .http_client
            .get(&jwks_url)
            .send()
            .await
            .context("Failed to fetch JWKS")?;

        if !response.status().is_success() {
            return Err(anyhow!("JWKS endpoint returned status {}", response.status()));
        }

        let jwks: Jwks = response.json().await.context("Failed to parse JWKS")?;
        let set = parse_key_set(&entry.issuer, jwks)?;
        Ok((set, jwks_url))
    }

    async fn discover_jwks_url(&self, issuer: &str) -> Result<String> {
        let url = format!(
            "{}/.well-known/openid-configuration",
            issuer.trim_end_matches('/')
        );
        debug!(url = %url, "Fetching OIDC discovery document");

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .context("Failed to fetch discovery document")?;

        if !response.status().is_success() {
            return Err(anyhow!("Discovery endpoint returned status {}", response.status()));
        }

        let doc: DiscoveryDocument = response
            .json()
            .await
            .context("Failed to parse discovery document")?;
        Ok(doc.jwks_uri)
    }
}

fn parse_key_set(issuer: &str, jwks: Jwks) -> Result<SigningKeySet> {
    let mut keys = HashMap::new();
    for jwk in jwks.keys {
        // Skip encryption keys
        if jwk.key_use.as_deref() == Some("enc") {
            continue;
        }

        match jwk_to_public_key(&jwk) {
            Ok(key) => {
                let kid = jwk.kid.clone().unwrap_or_else(|| "default".to_string());
                debug!(issuer = %issuer, kid = %kid, kty = %jwk.kty, "Loaded JWK");
                keys.insert(kid, key);
            }
            Err(e) => {
                warn!(
                    issuer = %issuer,
                    kid = ?jwk.kid,
                    kty = %jwk.kty,
                    error = %e,
                    "Failed to parse JWK, skipping"
                );
            }
        }
    }

    if keys.is_empty() {
        return Err(anyhow!("No valid signing keys found in JWKS for {}", issuer));
    }

    Ok(SigningKeySet {
        keys,
        fetched_at: Instant::now(),
    })
}

/// Convert a JWK to verification key material.
fn jwk_to_public_key(jwk: &Jwk) -> Result<PublicKey> {
    let alg = jwk
        .alg
        .as_deref()
        .map(Algorithm::from_str)
        .transpose()
        .map_err(|_| anyhow!("Unsupported JWK algorithm: {:?}", jwk.alg))?;

    let key = match jwk.kty.as_str() {
        "RSA" => {
            let n = jwk.n.as_ref().ok_or_else(|| anyhow!("RSA key missing 'n'"))?;
            let e = jwk.e.as_ref().ok_or_else(|| anyhow!("RSA key missing 'e'"))?;
            DecodingKey::from_rsa_components(n, e).context("Failed to create RSA DecodingKey")?
        }
        "EC" => {
            let x = jwk.x.as_ref().ok_or_else(|| anyhow!("EC key missing 'x'"))?;
            let y = jwk.y.as_ref().ok_or_else(|| anyhow!("EC key missing 'y'"))?;
            match jwk.crv.as_deref() {
                Some("P-256") | Some("P-384") => DecodingKey::from_ec_components(x, y)
                    .context("Failed to create EC DecodingKey")?,
                other => return Err(anyhow!("Unsupported EC curve: {:?}", other)),
            }
        }
        kty => return Err(anyhow!("Unsupported key type: {}", kty)),
    };

    Ok(PublicKey { key, alg })
}
