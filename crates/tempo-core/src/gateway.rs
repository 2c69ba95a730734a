//! The gateway: cache in front of the queue, the queue in front of the
//! browser, and the background tasks that keep the browser alive.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::ResultCache;
use crate::config::GatewayConfig;
use crate::error::AppError;
use crate::models::{CacheKey, ScrapeKind, ScrapeResult, SubjectId};
use crate::queue::{QueueReporter, TaskExecutor, TaskQueue, TaskSpec, TracingQueueReporter};
use crate::scrape::Scraper;
use crate::supervisor::{BrowserStatus, BrowserSupervisor};
use crate::traits::{BrowserBackend, BrowserSession};

/// Snapshot of the gateway's moving parts.
#[derive(Debug, Clone)]
pub struct GatewayHealth {
    pub server_uptime: Duration,
    pub browser: BrowserStatus,
    pub queue_length: usize,
    pub active_count: usize,
    pub cached_results: u64,
    pub timestamp: DateTime<Utc>,
}

/// What the HTTP layer needs from a gateway, independent of the browser backend.
pub trait ScrapeApi: Send + Sync + 'static {
    /// Validates `raw_id`, then answers from the cache or by scraping.
    fn lookup<'a>(
        &'a self,
        kind: ScrapeKind,
        raw_id: &'a str,
    ) -> BoxFuture<'a, Result<ScrapeResult, AppError>>;

    fn health(&self) -> BoxFuture<'_, GatewayHealth>;
}

/// Scrapes on a queue worker and stores the result before the submitter is
/// answered, so a caller that stops waiting does not waste the scrape.
struct CachingScraper {
    scraper: Scraper,
    cache: ResultCache,
}

impl<S: BrowserSession> TaskExecutor<S> for CachingScraper {
    async fn execute(&self, session: &S, task: &TaskSpec) -> Result<ScrapeResult, AppError> {
        let result = self.scraper.scrape(session, task.kind, &task.subject_id).await?;
        self.cache
            .set(CacheKey::new(task.kind, &task.subject_id), result.clone())
            .await;
        Ok(result)
    }
}

/// Supervisor, queue, cache, and scraper wired together.
pub struct ScrapeGateway<B: BrowserBackend> {
    supervisor: Arc<BrowserSupervisor<B>>,
    queue: TaskQueue,
    cache: ResultCache,
    started: Instant,
    cancel_token: CancellationToken,
    monitor: StdMutex<Option<JoinHandle<()>>>,
}

impl<B: BrowserBackend> ScrapeGateway<B> {
    /// Starts the health monitor (which launches the browser right away) and
    /// the queue workers. Must be called inside a Tokio runtime.
    pub fn start(backend: B, config: &GatewayConfig) -> Self {
        Self::start_with_reporter(backend, config, Arc::new(TracingQueueReporter))
    }

    pub fn start_with_reporter(
        backend: B,
        config: &GatewayConfig,
        reporter: Arc<dyn QueueReporter>,
    ) -> Self {
        let cancel_token = CancellationToken::new();
        let supervisor = Arc::new(BrowserSupervisor::new(backend, config.supervisor.clone()));
        let monitor = Arc::clone(&supervisor).spawn_health_monitor(cancel_token.child_token());
        let cache = ResultCache::new(config.cache.clone());
        let executor = CachingScraper {
            scraper: Scraper::new(config.scrape.clone()),
            cache: cache.clone(),
        };
        let queue = TaskQueue::start(
            config.queue.clone(),
            Arc::clone(&supervisor),
            Arc::new(executor),
            reporter,
            cancel_token.child_token(),
        );

        tracing::info!(
            max_concurrent = config.queue.max_concurrent,
            queue_capacity = config.queue.capacity,
            cache_ttl_secs = config.cache.ttl.as_secs(),
            strategy_mode = %config.scrape.strategy_mode,
            "Scrape gateway started"
        );

        Self {
            supervisor,
            queue,
            cache,
            started: Instant::now(),
            cancel_token,
            monitor: StdMutex::new(Some(monitor)),
        }
    }

    /// Cache lookup first; on a miss the scrape is queued and the worker
    /// caches its result. Invalid identifiers are rejected before anything
    /// else runs.
    pub async fn scrape(&self, kind: ScrapeKind, raw_id: &str) -> Result<ScrapeResult, AppError> {
        let subject = SubjectId::parse(raw_id)?;
        let key = CacheKey::new(kind, &subject);

        if let Some(hit) = self.cache.get(&key).await {
            tracing::debug!(%key, "Cache hit");
            return Ok(hit);
        }

        self.queue.run(kind, subject).await
    }

    pub async fn snapshot(&self) -> GatewayHealth {
        GatewayHealth {
            server_uptime: self.started.elapsed(),
            browser: self.supervisor.status().await,
            queue_length: self.queue.queue_length(),
            active_count: self.queue.active_count(),
            cached_results: self.cache.len(),
            timestamp: Utc::now(),
        }
    }

    pub fn supervisor(&self) -> &Arc<BrowserSupervisor<B>> {
        &self.supervisor
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Stops the workers and the health monitor, then closes the browser.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down scrape gateway");
        self.cancel_token.cancel();
        self.queue.shutdown().await;

        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(monitor) = monitor
            && let Err(e) = monitor.await
        {
            tracing::error!(error = %e, "Health monitor panicked");
        }

        self.supervisor.shutdown().await;
    }
}

impl<B: BrowserBackend> ScrapeApi for ScrapeGateway<B> {
    fn lookup<'a>(
        &'a self,
        kind: ScrapeKind,
        raw_id: &'a str,
    ) -> BoxFuture<'a, Result<ScrapeResult, AppError>> {
        Box::pin(self.scrape(kind, raw_id))
    }

    fn health(&self) -> BoxFuture<'_, GatewayHealth> {
        Box::pin(self.snapshot())
    }
}
