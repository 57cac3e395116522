//! Background maintenance tasks.
//!
//! Keys are refreshed ahead of demand and lapsed exchange cache entries are
//! swept so memory does not grow with departed subjects.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info};

use crate::exchange::ExchangeCache;
use crate::oidc::KeySource;

/// Refresh every issuer's keys on a fixed interval.
///
/// Failures are logged by the key source; retained keys keep serving within
/// their grace period.
pub fn spawn_key_refresh_task(keys: Arc<KeySource>, refresh_secs: u64) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(refresh_secs.max(1)));

        // Skip the first immediate tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            keys.refresh_all().await;
            debug!("Background key refresh completed");
        }
    })
}

/// Drop expired credentials and lapsed failures from the exchange cache.
pub fn spawn_cache_sweep_task(cache: Arc<ExchangeCache>, sweep_secs: u64) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(sweep_secs.max(1)));
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let purged = cache.purge_expired();
            if purged > 0 {
                info!(purged, remaining = cache.len(), "Exchange cache sweep completed");
            } else {
                debug!(entries = cache.len(), "Exchange cache sweep: nothing expired");
            }
        }
    })
}
