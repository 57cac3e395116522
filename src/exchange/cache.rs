//! Single-flight cache of exchanged credentials.
//!
//! One entry per [`ExchangeKey`]. A miss inserts a `Pending` entry and spawns
//! exactly one exchange; concurrent callers for the same key subscribe to that
//! flight's `watch` channel. The flight runs as its own task, so a caller that
//! gives up waiting never cancels it. Results become `Ready` (served until the
//! refresh threshold) or `Failed` (served until the negative TTL lapses).

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::client::TokenExchanger;
use super::config::CacheConfig;
use super::types::{ExchangeKey, ExchangeRequest, ExchangedCredential};
use crate::error::ExchangeError;

type FlightResult = Result<Arc<ExchangedCredential>, ExchangeError>;
type Flight = watch::Receiver<Option<FlightResult>>;

enum EntryState {
    Pending(Flight),
    Ready {
        credential: Arc<ExchangedCredential>,
        refresh_at: Instant,
    },
    Failed {
        error: ExchangeError,
        retry_at: Instant,
    },
}

struct CacheEntry {
    state: EntryState,
    last_used: u64,
}

impl CacheEntry {
    fn is_pending(&self) -> bool {
        matches!(self.state, EntryState::Pending(_))
    }
}

enum Lookup {
    Hit(Arc<ExchangedCredential>),
    NegativeHit(ExchangeError),
    Wait(Flight),
}

#[derive(Clone, Copy)]
struct RefreshPolicy {
    ratio: f64,
    min_margin: Duration,
    negative_ttl: Duration,
}

/// Coalescing, negative-caching, size-bounded cache in front of a [`TokenExchanger`].
pub struct ExchangeCache {
    entries: Arc<DashMap<ExchangeKey, CacheEntry>>,
    exchanger: Arc<dyn TokenExchanger>,
    max_entries: usize,
    policy: RefreshPolicy,
    clock: AtomicU64,
}

impl ExchangeCache {
    pub fn new(config: &CacheConfig, exchanger: Arc<dyn TokenExchanger>) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            exchanger,
            max_entries: config.max_entries.max(1),
            policy: RefreshPolicy {
                ratio: config.refresh_margin_ratio,
                min_margin: config.min_refresh_margin(),
                negative_ttl: config.negative_ttl(),
            },
            clock: AtomicU64::new(0),
        }
    }

    /// Credential for `request`, exchanging at most once per key concurrently.
    pub async fn get(&self, request: ExchangeRequest) -> Result<Arc<ExchangedCredential>, ExchangeError> {
        let key = request.key();

        let mut flight = match self.lookup(key, request) {
            Lookup::Hit(credential) => return Ok(credential),
            Lookup::NegativeHit(error) => return Err(error),
            Lookup::Wait(flight) => flight,
        };

        let outcome = match flight.wait_for(Option::is_some).await {
            Ok(result) => (*result).clone().unwrap_or_else(|| {
                Err(ExchangeError::Unavailable("exchange produced no result".to_string()))
            }),
            Err(_) => Err(ExchangeError::Unavailable(
                "exchange task ended without a result".to_string(),
            )),
        };
        outcome
    }

    /// Number of entries, pending ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop expired credentials, lapsed failures and abandoned flights.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| match &entry.state {
            EntryState::Pending(flight) => flight.has_changed().is_ok(),
            EntryState::Ready { credential, .. } => !credential.is_expired(now),
            EntryState::Failed { retry_at, .. } => now < *retry_at,
        });
        before.saturating_sub(self.entries.len())
    }

    fn lookup(&self, key: ExchangeKey, request: ExchangeRequest) -> Lookup {
        let now = Instant::now();
        let seq = self.clock.fetch_add(1, Ordering::Relaxed);

        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries && !self.evict_lru() {
            warn!(
                entries = self.entries.len(),
                max_entries = self.max_entries,
                "Exchange cache full of pending entries, admitting over capacity"
            );
        }

        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.last_used = seq;

                match &entry.state {
                    EntryState::Ready { credential, refresh_at } if now < *refresh_at => {
                        debug!(subject = %key.fingerprint(), audience = %key.audience(), "Exchange cache hit");
                        return Lookup::Hit(Arc::clone(credential));
                    }
                    EntryState::Failed { error, retry_at } if now < *retry_at => {
                        debug!(subject = %key.fingerprint(), audience = %key.audience(), "Exchange cache negative hit");
                        return Lookup::NegativeHit(error.clone());
                    }
                    EntryState::Pending(flight) if flight.has_changed().is_ok() => {
                        debug!(subject = %key.fingerprint(), audience = %key.audience(), "Joining in-flight exchange");
                        return Lookup::Wait(flight.clone());
                    }
                    _ => {}
                }

                debug!(subject = %key.fingerprint(), audience = %key.audience(), "Exchange cache entry stale");
                let flight = self.start_flight(key, request);
                entry.state = EntryState::Pending(flight.clone());
                Lookup::Wait(flight)
            }
            Entry::Vacant(vacant) => {
                debug!(subject = %key.fingerprint(), audience = %key.audience(), "Exchange cache miss");
                let flight = self.start_flight(key, request);
                vacant.insert(CacheEntry {
                    state: EntryState::Pending(flight.clone()),
                    last_used: seq,
                });
                Lookup::Wait(flight)
            }
        }
    }

    /// Spawn the exchange for `key`. The task records the outcome in the
    /// entry before publishing it to waiters.
    fn start_flight(&self, key: ExchangeKey, request: ExchangeRequest) -> Flight {
        let (tx, flight) = watch::channel(None);
        let own_flight = flight.clone();
        let entries = Arc::clone(&self.entries);
        let exchanger = Arc::clone(&self.exchanger);
        let policy = self.policy;

        tokio::spawn(async move {
            let result: FlightResult = exchanger.exchange(&request).await.map(Arc::new);

            if let Some(mut entry) = entries.get_mut(&key) {
                let owned = matches!(&entry.state, EntryState::Pending(f) if f.same_channel(&own_flight));
                if owned {
                    entry.state = match &result {
                        Ok(credential) => EntryState::Ready {
                            credential: Arc::clone(credential),
                            refresh_at: credential.refresh_at(policy.ratio, policy.min_margin),
                        },
                        Err(error) => EntryState::Failed {
                            error: error.clone(),
                            retry_at: Instant::now() + policy.negative_ttl,
                        },
                    };
                }
            }

            tx.send_replace(Some(result));
        });

        flight
    }

    /// Remove the least recently used settled entry. Pending entries are never evicted.
    fn evict_lru(&self) -> bool {
        let victim = self
            .entries
            .iter()
            .filter(|entry| !entry.value().is_pending())
            .min_by_key(|entry| entry.value().last_used)
            .map(|entry| (entry.key().clone(), entry.value().last_used));

        match victim {
            Some((key, last_used)) => {
                let removed = self
                    .entries
                    .remove_if(&key, |_, entry| !entry.is_pending() && entry.last_used == last_used)
                    .is_some();
                if removed {
                    debug!(subject = %key.fingerprint(), "Evicted least recently used exchange");
                }
                removed
            }
            None => false,
        }
    }
}
