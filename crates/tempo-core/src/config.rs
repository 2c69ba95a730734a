use std::str::FromStr;
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::error::AppError;
use crate::intercept::RequestFilter;
use crate::queue::QueueConfig;
use crate::scrape::{ScrapeConfig, StrategyMode};
use crate::supervisor::SupervisorConfig;

/// Full gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub supervisor: SupervisorConfig,
    pub queue: QueueConfig,
    pub cache: CacheConfig,
    pub scrape: ScrapeConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            supervisor: SupervisorConfig::default(),
            queue: QueueConfig::default(),
            cache: CacheConfig::default(),
            scrape: ScrapeConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Read configuration from environment variables.
    ///
    /// Every variable is optional; unset variables keep their default.
    ///
    /// - `TEMPO_PORT` (3000)
    /// - `TEMPO_MAX_CONCURRENT_PAGES` (3)
    /// - `TEMPO_QUEUE_CAPACITY` (100)
    /// - `TEMPO_BROWSER_MAX_LIFETIME_SECS` (3600)
    /// - `TEMPO_HEALTH_CHECK_INTERVAL_SECS` (300)
    /// - `TEMPO_CACHE_TTL_SECS` (3600)
    /// - `TEMPO_NOT_FOUND_CACHE_TTL_SECS` (cache TTL; `0` disables caching "N/A")
    /// - `TEMPO_NAVIGATION_TIMEOUT_SECS` (30)
    /// - `TEMPO_SELECTOR_TIMEOUT_SECS` (10)
    /// - `TEMPO_STRATEGY_MODE` (`race` or `sequential`)
    /// - `TEMPO_TARGET_BASE_URL` (`https://open.spotify.com`)
    /// - `TEMPO_BLOCKED_HOSTS` (comma-separated tracker hosts)
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reads values through `lookup`.
    pub fn from_lookup<L>(lookup: L) -> Result<Self, AppError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let port = parse_or(&lookup, "TEMPO_PORT", defaults.port)?;
        let max_concurrent = positive_or(
            &lookup,
            "TEMPO_MAX_CONCURRENT_PAGES",
            defaults.queue.max_concurrent,
        )?;
        let capacity = positive_or(&lookup, "TEMPO_QUEUE_CAPACITY", defaults.queue.capacity)?;
        let max_lifetime = secs_or(
            &lookup,
            "TEMPO_BROWSER_MAX_LIFETIME_SECS",
            defaults.supervisor.max_lifetime,
        )?;
        let health_interval = secs_or(
            &lookup,
            "TEMPO_HEALTH_CHECK_INTERVAL_SECS",
            defaults.supervisor.health_interval,
        )?;
        if health_interval >= max_lifetime {
            return Err(AppError::ConfigError(format!(
                "TEMPO_HEALTH_CHECK_INTERVAL_SECS ({}) must be shorter than TEMPO_BROWSER_MAX_LIFETIME_SECS ({})",
                health_interval.as_secs(),
                max_lifetime.as_secs()
            )));
        }

        let ttl = secs_or(&lookup, "TEMPO_CACHE_TTL_SECS", defaults.cache.ttl)?;
        // Zero is meaningful here: it turns off caching of "N/A" results.
        let not_found_ttl = match lookup("TEMPO_NOT_FOUND_CACHE_TTL_SECS") {
            None => ttl,
            Some(raw) => Duration::from_secs(parse_value("TEMPO_NOT_FOUND_CACHE_TTL_SECS", &raw)?),
        };

        let navigation_timeout = secs_or(
            &lookup,
            "TEMPO_NAVIGATION_TIMEOUT_SECS",
            defaults.scrape.navigation_timeout,
        )?;
        let selector_timeout = secs_or(
            &lookup,
            "TEMPO_SELECTOR_TIMEOUT_SECS",
            defaults.scrape.selector_timeout,
        )?;
        let strategy_mode = match lookup("TEMPO_STRATEGY_MODE") {
            None => defaults.scrape.strategy_mode,
            Some(raw) => raw.parse().map_err(AppError::ConfigError)?,
        };
        let target_base_url = match lookup("TEMPO_TARGET_BASE_URL") {
            None => defaults.scrape.target_base_url,
            Some(raw) => {
                url::Url::parse(&raw).map_err(|e| {
                    AppError::ConfigError(format!("Invalid TEMPO_TARGET_BASE_URL '{raw}': {e}"))
                })?;
                raw.trim_end_matches('/').to_string()
            }
        };
        let filter = match lookup("TEMPO_BLOCKED_HOSTS") {
            None => defaults.scrape.filter,
            Some(raw) => RequestFilter::default_kinds().with_blocked_hosts(raw.split(',')),
        };

        Ok(Self {
            port,
            supervisor: SupervisorConfig {
                max_lifetime,
                health_interval,
            },
            queue: QueueConfig {
                max_concurrent,
                capacity,
            },
            cache: CacheConfig { ttl, not_found_ttl },
            scrape: ScrapeConfig {
                target_base_url,
                navigation_timeout,
                selector_timeout,
                strategy_mode,
                filter,
            },
        })
    }
}

fn parse_value<T: FromStr>(name: &str, raw: &str) -> Result<T, AppError> {
    raw.trim().parse().map_err(|_| {
        AppError::ConfigError(format!("Invalid {name} '{raw}': must be a non-negative integer"))
    })
}

fn parse_or<T, L>(lookup: &L, name: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    L: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => parse_value(name, &raw),
    }
}

fn positive_or<L>(lookup: &L, name: &str, default: usize) -> Result<usize, AppError>
where
    L: Fn(&str) -> Option<String>,
{
    let value = parse_or(lookup, name, default)?;
    if value == 0 {
        return Err(AppError::ConfigError(format!("{name} must be at least 1")));
    }
    Ok(value)
}

fn secs_or<L>(lookup: &L, name: &str, default: Duration) -> Result<Duration, AppError>
where
    L: Fn(&str) -> Option<String>,
{
    let secs = parse_or(lookup, name, default.as_secs())?;
    if secs == 0 {
        return Err(AppError::ConfigError(format!("{name} must be at least 1")));
    }
    Ok(Duration::from_secs(secs))
}
