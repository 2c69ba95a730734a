//! Scrape orchestration: one isolated context per task, navigation under a
//! timeout, a fallback chain of extraction strategies, and normalisation.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use futures::StreamExt;
use futures::stream::FuturesUnordered;

use crate::error::AppError;
use crate::intercept::RequestFilter;
use crate::models::{ExtractionStrategy, NOT_AVAILABLE, ScrapeKind, ScrapeResult, SubjectId};
use crate::queue::{TaskExecutor, TaskSpec};
use crate::traits::{BrowserSession, BrowsingContext};

/// Base URL of the site the figures are read from.
pub const DEFAULT_TARGET_BASE_URL: &str = "https://open.spotify.com";

/// How the strategies of one kind are run against a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrategyMode {
    /// All strategies at once; the first to find a value wins and the rest
    /// are dropped without being polled again.
    #[default]
    Race,
    /// One after another, in priority order.
    Sequential,
}

impl fmt::Display for StrategyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyMode::Race => f.write_str("race"),
            StrategyMode::Sequential => f.write_str("sequential"),
        }
    }
}

impl FromStr for StrategyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "race" => Ok(StrategyMode::Race),
            "sequential" => Ok(StrategyMode::Sequential),
            _ => Err(format!(
                "Unknown strategy mode '{s}': expected 'race' or 'sequential'"
            )),
        }
    }
}

/// Configuration for page scraping.
#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    pub target_base_url: String,
    pub navigation_timeout: Duration,
    /// Upper bound for a single strategy's element lookup.
    pub selector_timeout: Duration,
    pub strategy_mode: StrategyMode,
    pub filter: RequestFilter,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            target_base_url: DEFAULT_TARGET_BASE_URL.to_string(),
            navigation_timeout: Duration::from_secs(30),
            selector_timeout: Duration::from_secs(10),
            strategy_mode: StrategyMode::default(),
            filter: RequestFilter::default(),
        }
    }
}

/// Strategies tried for `kind`, highest priority first.
pub fn default_strategies(kind: ScrapeKind) -> Vec<ExtractionStrategy> {
    match kind {
        ScrapeKind::ArtistListeners => vec![
            ExtractionStrategy::css("testid", "[data-testid='monthly-listeners-label']"),
            ExtractionStrategy::text_contains("label-text", "monthly listeners"),
            ExtractionStrategy::css("header-meta", "[data-testid='artist-page'] header span"),
        ],
        ScrapeKind::TrackPlaycount => vec![
            ExtractionStrategy::css("testid", "[data-testid='playcount']"),
            ExtractionStrategy::css("header-meta", "[data-testid='track-page'] span.playcount"),
        ],
    }
}

/// Strips everything but ASCII digits: `"1,234,567 monthly listeners"` → `"1234567"`.
pub fn normalize_listeners(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    (!digits.is_empty()).then_some(digits)
}

/// Trims and collapses whitespace; compact forms such as `"1.2M"` are kept.
pub fn normalize_playcount(raw: &str) -> Option<String> {
    let text = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    (!text.is_empty()).then_some(text)
}

fn normalize(kind: ScrapeKind, raw: &str) -> Option<String> {
    match kind {
        ScrapeKind::ArtistListeners => normalize_listeners(raw),
        ScrapeKind::TrackPlaycount => normalize_playcount(raw),
    }
}

/// Runs scrape tasks against a browser session.
#[derive(Debug, Clone)]
pub struct Scraper {
    config: ScrapeConfig,
    artist_strategies: Vec<ExtractionStrategy>,
    track_strategies: Vec<ExtractionStrategy>,
}

impl Scraper {
    pub fn new(config: ScrapeConfig) -> Self {
        Self {
            config,
            artist_strategies: default_strategies(ScrapeKind::ArtistListeners),
            track_strategies: default_strategies(ScrapeKind::TrackPlaycount),
        }
    }

    /// Replaces the strategy chain used for `kind`.
    pub fn with_strategies(mut self, kind: ScrapeKind, strategies: Vec<ExtractionStrategy>) -> Self {
        match kind {
            ScrapeKind::ArtistListeners => self.artist_strategies = strategies,
            ScrapeKind::TrackPlaycount => self.track_strategies = strategies,
        }
        self
    }

    pub fn config(&self) -> &ScrapeConfig {
        &self.config
    }

    pub fn strategies(&self, kind: ScrapeKind) -> &[ExtractionStrategy] {
        match kind {
            ScrapeKind::ArtistListeners => &self.artist_strategies,
            ScrapeKind::TrackPlaycount => &self.track_strategies,
        }
    }

    /// Opens a context on `session`, reads the figure for `subject` and
    /// closes the context again, whatever the outcome.
    ///
    /// A page on which no strategy finds the figure yields an "N/A" result,
    /// not an error.
    pub async fn scrape<S: BrowserSession>(
        &self,
        session: &S,
        kind: ScrapeKind,
        subject: &SubjectId,
    ) -> Result<ScrapeResult, AppError> {
        let url = kind.page_url(&self.config.target_base_url, subject);
        // A context that finishes opening after the timeout is never closed
        // here. The ContextFailure makes the queue replace the browser, which
        // takes such a context down with it.
        let context = tokio::time::timeout(self.config.navigation_timeout, session.new_context())
            .await
            .map_err(|_| {
                AppError::ContextFailure(format!(
                    "opening a browsing context timed out after {}s",
                    self.config.navigation_timeout.as_secs()
                ))
            })??;

        let outcome = self.navigate_and_extract(&context, kind, &url).await;

        if let Err(e) = context.close().await {
            tracing::warn!(%url, error = %e.sanitized(), "Failed to close browsing context");
        }

        let value = outcome?;
        Ok(match value {
            Some(value) => ScrapeResult::new(kind, subject.clone(), value),
            None => {
                tracing::info!(kind = %kind, subject_id = %subject, "No strategy located the value");
                ScrapeResult::not_available(kind, subject.clone())
            }
        })
    }

    async fn navigate_and_extract<C: BrowsingContext>(
        &self,
        context: &C,
        kind: ScrapeKind,
        url: &str,
    ) -> Result<Option<String>, AppError> {
        let started = Instant::now();
        tokio::time::timeout(
            self.config.navigation_timeout,
            context.navigate(url, &self.config.filter),
        )
        .await
        .map_err(|_| {
            AppError::NavigationFailure(format!(
                "{url} did not load within {}s",
                self.config.navigation_timeout.as_secs()
            ))
        })??;
        tracing::debug!(%url, elapsed_ms = started.elapsed().as_millis() as u64, "Page loaded");

        let strategies = self.strategies(kind);
        match self.config.strategy_mode {
            StrategyMode::Race => self.race(context, kind, strategies).await,
            StrategyMode::Sequential => self.sequential(context, kind, strategies).await,
        }
    }

    /// First-of-N: every strategy starts at once, the first value wins and
    /// the losers are dropped. A browser fault from any of them ends the race.
    async fn race<C: BrowsingContext>(
        &self,
        context: &C,
        kind: ScrapeKind,
        strategies: &[ExtractionStrategy],
    ) -> Result<Option<String>, AppError> {
        let mut attempts: FuturesUnordered<_> = strategies
            .iter()
            .map(|strategy| self.attempt(context, kind, strategy))
            .collect();
        while let Some(found) = attempts.next().await {
            if let Some(value) = found? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    async fn sequential<C: BrowsingContext>(
        &self,
        context: &C,
        kind: ScrapeKind,
        strategies: &[ExtractionStrategy],
    ) -> Result<Option<String>, AppError> {
        for strategy in strategies {
            if let Some(value) = self.attempt(context, kind, strategy).await? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// One strategy. A missing element, a timeout, a non-fatal lookup error
    /// or text that normalises to nothing count as "not found"; a browser
    /// fault is returned so the task fails instead of resolving to "N/A".
    async fn attempt<C: BrowsingContext>(
        &self,
        context: &C,
        kind: ScrapeKind,
        strategy: &ExtractionStrategy,
    ) -> Result<Option<String>, AppError> {
        let lookup =
            tokio::time::timeout(self.config.selector_timeout, context.read_text(&strategy.locator))
                .await;
        let text = match lookup {
            Ok(Ok(Some(text))) => text,
            Ok(Ok(None)) => {
                tracing::debug!(strategy = strategy.name, locator = %strategy.locator, "Element not found");
                return Ok(None);
            }
            Ok(Err(e)) if e.is_browser_fault() => {
                tracing::warn!(strategy = strategy.name, error = %e.sanitized(), "Browser failed during extraction");
                return Err(e);
            }
            Ok(Err(e)) => {
                tracing::debug!(strategy = strategy.name, error = %e.sanitized(), "Strategy failed");
                return Ok(None);
            }
            Err(_) => {
                tracing::debug!(strategy = strategy.name, "Strategy timed out");
                return Ok(None);
            }
        };

        let value = normalize(kind, &text);
        match &value {
            Some(value) => tracing::debug!(strategy = strategy.name, %value, "Strategy matched"),
            None => tracing::debug!(strategy = strategy.name, "Matched element had no usable text"),
        }
        Ok(value)
    }
}

impl<S: BrowserSession> TaskExecutor<S> for Scraper {
    async fn execute(&self, session: &S, task: &TaskSpec) -> Result<ScrapeResult, AppError> {
        self.scrape(session, task.kind, &task.subject_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Locator;
    use crate::testutil::StubBackend;
    use crate::traits::BrowserBackend;

    fn id(raw: &str) -> SubjectId {
        SubjectId::parse(raw).unwrap()
    }

    #[test]
    fn listeners_keep_digits_only() {
        assert_eq!(
            normalize_listeners("1,234,567 monthly listeners").as_deref(),
            Some("1234567")
        );
        assert_eq!(normalize_listeners("  98 765  ").as_deref(), Some("98765"));
        assert_eq!(normalize_listeners("monthly listeners"), None);
    }

    #[test]
    fn playcount_is_passed_through() {
        assert_eq!(normalize_playcount(" 1,024,388 ").as_deref(), Some("1,024,388"));
        assert_eq!(normalize_playcount("1.2M\n plays").as_deref(), Some("1.2M plays"));
        assert_eq!(normalize_playcount(" \n "), None);
    }

    #[test]
    fn strategy_mode_parses() {
        assert_eq!("Race".parse::<StrategyMode>().unwrap(), StrategyMode::Race);
        assert_eq!(
            " sequential ".parse::<StrategyMode>().unwrap(),
            StrategyMode::Sequential
        );
        assert!("fastest".parse::<StrategyMode>().is_err());
        assert_eq!(StrategyMode::Sequential.to_string(), "sequential");
    }

    #[test]
    fn every_kind_has_a_fallback_chain() {
        for kind in [ScrapeKind::ArtistListeners, ScrapeKind::TrackPlaycount] {
            assert!(default_strategies(kind).len() >= 2);
        }
    }

    #[tokio::test]
    async fn scrapes_monthly_listeners() {
        let backend = StubBackend::with_page_text("1,234,567 monthly listeners");
        let session = backend.launch().await.unwrap();
        let scraper = Scraper::new(ScrapeConfig::default());

        let result = scraper
            .scrape(&session, ScrapeKind::ArtistListeners, &id("4iHNK0tOyZPYnBU7nGAgpQ"))
            .await
            .unwrap();

        assert_eq!(result.value, "1234567");
        assert_eq!(
            backend.navigations(),
            vec!["https://open.spotify.com/artist/4iHNK0tOyZPYnBU7nGAgpQ".to_string()]
        );
        assert_eq!(backend.filters(), vec![RequestFilter::default()]);
        assert_eq!(backend.contexts_opened(), 1);
        assert_eq!(backend.open_contexts(), 0);
    }

    #[tokio::test]
    async fn missing_playcount_is_not_available() {
        let backend = StubBackend::new();
        let session = backend.launch().await.unwrap();
        let scraper = Scraper::new(ScrapeConfig::default());

        let result = scraper
            .scrape(&session, ScrapeKind::TrackPlaycount, &id("1301WleyT98MSxVHPZCA6M"))
            .await
            .unwrap();

        assert_eq!(result.value, NOT_AVAILABLE);
        assert!(!result.is_available());
        assert_eq!(backend.open_contexts(), 0);
    }

    #[tokio::test]
    async fn falls_back_to_later_strategy() {
        for mode in [StrategyMode::Race, StrategyMode::Sequential] {
            let backend = StubBackend::new()
                .with_element(Locator::Css("span.fallback".into()), "52,001 monthly listeners");
            let session = backend.launch().await.unwrap();
            let scraper = Scraper::new(ScrapeConfig {
                strategy_mode: mode,
                ..Default::default()
            })
            .with_strategies(
                ScrapeKind::ArtistListeners,
                vec![
                    ExtractionStrategy::css("primary", "span.primary"),
                    ExtractionStrategy::css("fallback", "span.fallback"),
                ],
            );

            let result = scraper
                .scrape(&session, ScrapeKind::ArtistListeners, &id("4iHNK0tOyZPYnBU7nGAgpQ"))
                .await
                .unwrap();
            assert_eq!(result.value, "52001", "mode {mode}");
        }
    }

    #[tokio::test]
    async fn match_without_digits_keeps_looking() {
        let backend = StubBackend::new()
            .with_element(Locator::Css("span.label".into()), "Monthly listeners")
            .with_element(Locator::Css("span.count".into()), "7,001");
        let session = backend.launch().await.unwrap();
        let scraper = Scraper::new(ScrapeConfig {
            strategy_mode: StrategyMode::Sequential,
            ..Default::default()
        })
        .with_strategies(
            ScrapeKind::ArtistListeners,
            vec![
                ExtractionStrategy::css("label", "span.label"),
                ExtractionStrategy::css("count", "span.count"),
            ],
        );

        let result = scraper
            .scrape(&session, ScrapeKind::ArtistListeners, &id("4iHNK0tOyZPYnBU7nGAgpQ"))
            .await
            .unwrap();
        assert_eq!(result.value, "7001");
    }

    #[tokio::test]
    async fn navigation_failure_closes_context() {
        let backend = StubBackend::with_page_text("100");
        backend.set_navigation_error(Some(AppError::NavigationFailure(
            "net::ERR_NAME_NOT_RESOLVED".into(),
        )));
        let session = backend.launch().await.unwrap();
        let scraper = Scraper::new(ScrapeConfig::default());

        let err = scraper
            .scrape(&session, ScrapeKind::TrackPlaycount, &id("1301WleyT98MSxVHPZCA6M"))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::NavigationFailure(_)));
        assert_eq!(backend.contexts_opened(), 1);
        assert_eq!(backend.contexts_closed(), 1);
    }

    #[tokio::test]
    async fn navigation_timeout_is_navigation_failure() {
        let backend = StubBackend::with_page_text("100")
            .with_navigation_latency(Duration::from_millis(500));
        let session = backend.launch().await.unwrap();
        let scraper = Scraper::new(ScrapeConfig {
            navigation_timeout: Duration::from_millis(50),
            ..Default::default()
        });

        let err = scraper
            .scrape(&session, ScrapeKind::TrackPlaycount, &id("1301WleyT98MSxVHPZCA6M"))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::NavigationFailure(_)));
        assert!(!err.is_browser_fault());
        assert_eq!(backend.open_contexts(), 0);
    }

    #[tokio::test]
    async fn dead_browser_is_a_browser_fault() {
        let backend = StubBackend::with_page_text("100");
        let session = backend.launch().await.unwrap();
        backend.kill_current();
        let scraper = Scraper::new(ScrapeConfig::default());

        let err = scraper
            .scrape(&session, ScrapeKind::ArtistListeners, &id("4iHNK0tOyZPYnBU7nGAgpQ"))
            .await
            .unwrap_err();
        assert!(err.is_browser_fault());
        assert_eq!(backend.open_contexts(), 0);
    }

    #[tokio::test]
    async fn browser_crash_during_extraction_is_a_fault() {
        for mode in [StrategyMode::Race, StrategyMode::Sequential] {
            let backend = StubBackend::with_page_text("1,234,567 monthly listeners");
            backend.set_read_error(Some(AppError::ContextFailure("Target closed".into())));
            let session = backend.launch().await.unwrap();
            let scraper = Scraper::new(ScrapeConfig {
                strategy_mode: mode,
                ..Default::default()
            });

            let err = scraper
                .scrape(&session, ScrapeKind::ArtistListeners, &id("4iHNK0tOyZPYnBU7nGAgpQ"))
                .await
                .unwrap_err();

            assert!(err.is_browser_fault(), "{mode}: {err}");
            assert_eq!(backend.navigations().len(), 1);
            assert_eq!(backend.open_contexts(), 0);
        }
    }

    #[tokio::test]
    async fn non_fatal_read_error_is_not_available() {
        let backend = StubBackend::with_page_text("1,234,567 monthly listeners");
        backend.set_read_error(Some(AppError::Generic("node detached".into())));
        let session = backend.launch().await.unwrap();
        let scraper = Scraper::new(ScrapeConfig::default());

        let result = scraper
            .scrape(&session, ScrapeKind::ArtistListeners, &id("4iHNK0tOyZPYnBU7nGAgpQ"))
            .await
            .unwrap();
        assert_eq!(result.value, NOT_AVAILABLE);
    }

    #[tokio::test]
    async fn slow_context_open_is_a_browser_fault() {
        let backend = StubBackend::with_page_text("100")
            .with_context_latency(Duration::from_millis(500));
        let session = backend.launch().await.unwrap();
        let scraper = Scraper::new(ScrapeConfig {
            navigation_timeout: Duration::from_millis(50),
            ..Default::default()
        });

        let err = scraper
            .scrape(&session, ScrapeKind::TrackPlaycount, &id("1301WleyT98MSxVHPZCA6M"))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::ContextFailure(_)));
        assert!(backend.navigations().is_empty());
    }
}
