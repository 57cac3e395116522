//! Token Exchange (RFC 8693) client and its single-flight cache.

pub mod cache;
pub mod client;
pub mod config;
pub mod types;

pub use cache::ExchangeCache;
pub use client::HttpExchangeClient;
pub use config::{CacheConfig, ExchangeConfig};
pub use types::{ExchangeRequest, ExchangedCredential};
