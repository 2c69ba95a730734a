use chrono::{DateTime, Utc};
use serde::Serialize;

use tempo_core::gateway::GatewayHealth;

// ---------------------------------------------------------------------------
// Scrape
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyListenersResponse {
    pub artist_id: String,
    /// Digits only, or `"N/A"` when the figure is not on the page.
    pub monthly_listeners: String,
    pub response_time_ms: u64,
    /// When the value was scraped; older than the request on a cache hit.
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlayCountResponse {
    pub track_id: String,
    /// As displayed on the page, or `"N/A"`.
    pub play_count: String,
    pub response_time_ms: u64,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    /// Seconds since the server started.
    pub server_uptime: u64,
    /// `"running"` or `"not running"`.
    pub browser_status: &'static str,
    /// Seconds since the current browser was launched.
    pub browser_uptime: Option<u64>,
    pub browser_generation: Option<u64>,
    pub queue_length: usize,
    pub active_pages: usize,
    pub cached_results: u64,
    pub timestamp: DateTime<Utc>,
}

impl From<GatewayHealth> for HealthResponse {
    fn from(health: GatewayHealth) -> Self {
        Self {
            status: "ok",
            server_uptime: health.server_uptime.as_secs(),
            browser_status: if health.browser.running {
                "running"
            } else {
                "not running"
            },
            browser_uptime: health.browser.uptime.map(|d| d.as_secs()),
            browser_generation: health.browser.generation,
            queue_length: health.queue_length,
            active_pages: health.active_count,
            cached_results: health.cached_results,
            timestamp: health.timestamp,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
