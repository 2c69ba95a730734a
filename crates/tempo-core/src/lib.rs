pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod intercept;
pub mod models;
pub mod queue;
pub mod scrape;
pub mod supervisor;
pub mod traits;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use cache::{CacheConfig, ResultCache};
pub use config::GatewayConfig;
pub use error::{AppError, sanitize_message};
pub use gateway::{GatewayHealth, ScrapeApi, ScrapeGateway};
pub use intercept::{RequestFilter, ResourceKind};
pub use models::{
    CacheKey, ExtractionStrategy, Locator, NOT_AVAILABLE, ScrapeKind, ScrapeResult, SubjectId,
};
pub use queue::{QueueConfig, QueueEvent, QueueReporter, TaskQueue, TracingQueueReporter};
pub use scrape::{ScrapeConfig, Scraper, StrategyMode};
pub use supervisor::{BrowserStatus, BrowserSupervisor, HealthOutcome, SupervisorConfig};
pub use traits::{BrowserBackend, BrowserSession, BrowsingContext};
