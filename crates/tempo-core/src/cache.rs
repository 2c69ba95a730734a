//! Time-bounded result cache.
//!
//! Entries expire a fixed time after they were written; reading an entry
//! never extends its life, and a live entry is never overwritten. There is
//! no size bound.

use std::time::{Duration, Instant};

use moka::Expiry;
use moka::future::Cache;

use crate::models::{CacheKey, ScrapeResult};

/// Configuration for the result cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Lifetime of a successfully extracted value.
    pub ttl: Duration,
    /// Lifetime of an "N/A" value. `Duration::ZERO` disables caching them.
    pub not_found_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            not_found_ttl: Duration::from_secs(3600),
        }
    }
}

/// Per-entry expiry: the lifetime is picked once, at insertion.
struct ResultExpiry {
    ttl: Duration,
    not_found_ttl: Duration,
}

impl Expiry<CacheKey, ScrapeResult> for ResultExpiry {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &ScrapeResult,
        _created_at: Instant,
    ) -> Option<Duration> {
        if value.is_available() {
            Some(self.ttl)
        } else {
            Some(self.not_found_ttl)
        }
    }
}

/// Cache of scrape results keyed by `kind:subjectId`.
#[derive(Clone)]
pub struct ResultCache {
    inner: Cache<CacheKey, ScrapeResult>,
    config: CacheConfig,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        let inner = Cache::builder()
            .name("scrape-results")
            .expire_after(ResultExpiry {
                ttl: config.ttl,
                not_found_ttl: config.not_found_ttl,
            })
            .build();
        Self { inner, config }
    }

    pub async fn get(&self, key: &CacheKey) -> Option<ScrapeResult> {
        self.inner.get(key).await
    }

    /// Stores `value` unless a live entry already exists for `key`.
    ///
    /// Returns true if the value was stored. "N/A" values are skipped when
    /// their TTL is zero.
    pub async fn set(&self, key: CacheKey, value: ScrapeResult) -> bool {
        if !value.is_available() && self.config.not_found_ttl.is_zero() {
            return false;
        }
        let entry = self.inner.entry(key).or_insert(value).await;
        if !entry.is_fresh() {
            tracing::debug!(key = %entry.key(), "Cache entry already present, keeping it");
        }
        entry.is_fresh()
    }

    /// Approximate number of live entries.
    pub fn len(&self) -> u64 {
        self.inner.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }
}
