//! Ownership and lifecycle of the shared browser process.
//!
//! # Lifecycle
//!
//! ```text
//! (none) --start--> RUNNING(gen N) --expired | probe failed | task fault--> closing --> RUNNING(gen N+1)
//!                        ^                                                      |
//!                        +---------------- launch failed: (none) <--------------+
//! ```
//!
//! Exactly one [`BrowserHandle`] is current at any time, or none while a
//! replacement is being launched. Consumers borrow the handle through
//! [`BrowserSupervisor::current`] right before they use it; nothing should
//! hold on to a handle across tasks.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::traits::{BrowserBackend, BrowserSession};

/// Configuration for browser supervision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// A browser older than this is replaced at the next health check.
    pub max_lifetime: Duration,
    /// Period of the background health check.
    pub health_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_lifetime: Duration::from_secs(3600),
            health_interval: Duration::from_secs(300),
        }
    }
}

/// Upper bound for one liveness probe; a browser that cannot open a context
/// in this time is treated as dead.
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// A running browser plus the bookkeeping needed to decide when to replace it.
pub struct BrowserHandle<S> {
    session: S,
    generation: u64,
    started: Instant,
    launched_at: DateTime<Utc>,
}

impl<S> BrowserHandle<S> {
    fn new(session: S, generation: u64) -> Self {
        Self {
            session,
            generation,
            started: Instant::now(),
            launched_at: Utc::now(),
        }
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    /// Increases by one every time a browser is launched.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn launched_at(&self) -> DateTime<Utc> {
        self.launched_at
    }
}

/// Result of one health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthOutcome {
    /// The browser answered the probe.
    Healthy,
    /// No browser was running; a new one was launched.
    Launched,
    /// The browser exceeded its maximum lifetime and was replaced.
    Expired,
    /// The probe failed and the browser was replaced.
    Recovered,
    /// A launch was needed and failed; no browser is running.
    LaunchFailed,
}

/// Point-in-time view of the supervised browser.
#[derive(Debug, Clone)]
pub struct BrowserStatus {
    pub running: bool,
    pub generation: Option<u64>,
    pub uptime: Option<Duration>,
    pub launched_at: Option<DateTime<Utc>>,
}

/// Owns the one shared browser and replaces it when it dies or gets old.
pub struct BrowserSupervisor<B: BrowserBackend> {
    backend: B,
    config: SupervisorConfig,
    current: RwLock<Option<Arc<BrowserHandle<B::Session>>>>,
    /// Serialises launches so at most one replacement is in flight.
    launch_lock: Mutex<()>,
    generations: AtomicU64,
}

impl<B: BrowserBackend> BrowserSupervisor<B> {
    /// Creates a supervisor with no browser running. Call [`start`](Self::start)
    /// or let the first task launch one.
    pub fn new(backend: B, config: SupervisorConfig) -> Self {
        Self {
            backend,
            config,
            current: RwLock::new(None),
            launch_lock: Mutex::new(()),
            generations: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// The browser in use right now, if any.
    pub async fn current(&self) -> Option<Arc<BrowserHandle<B::Session>>> {
        self.current.read().await.clone()
    }

    /// Closes the current browser (errors are logged, not returned) and
    /// launches a new one. Returns false if the launch failed, in which case
    /// no browser is running afterwards.
    pub async fn start(&self) -> bool {
        let _launch = self.launch_lock.lock().await;
        self.replace().await
    }

    /// Replaces the browser only if `generation` is still the current one.
    ///
    /// Several tasks failing on the same dead browser thus cause a single
    /// relaunch. Returns false if a needed launch failed.
    pub async fn restart_if_current(&self, generation: u64) -> bool {
        let _launch = self.launch_lock.lock().await;
        if let Some(handle) = self.current().await
            && handle.generation != generation
        {
            tracing::debug!(
                failed = generation,
                current = handle.generation,
                "Browser already replaced"
            );
            return true;
        }
        self.replace().await
    }

    /// Returns the current browser, launching one if none is running.
    pub async fn ensure_session(&self) -> Result<Arc<BrowserHandle<B::Session>>, AppError> {
        if let Some(handle) = self.current().await {
            return Ok(handle);
        }
        let _launch = self.launch_lock.lock().await;
        // Another task may have launched while we waited for the lock.
        if let Some(handle) = self.current().await {
            return Ok(handle);
        }
        if self.replace().await
            && let Some(handle) = self.current().await
        {
            return Ok(handle);
        }
        Err(AppError::BrowserUnavailable(
            "browser could not be launched".to_string(),
        ))
    }

    /// Launches a browser if none is running, replaces it if it is too old,
    /// otherwise probes it and replaces it if the probe fails.
    pub async fn health_check(&self) -> HealthOutcome {
        let Some(handle) = self.current().await else {
            tracing::info!("No browser running, launching one");
            return match self.ensure_session().await {
                Ok(_) => HealthOutcome::Launched,
                Err(_) => HealthOutcome::LaunchFailed,
            };
        };

        if handle.age() > self.config.max_lifetime {
            tracing::info!(
                generation = handle.generation,
                age_secs = handle.age().as_secs(),
                "Browser exceeded its maximum lifetime, restarting"
            );
            return if self.restart_if_current(handle.generation).await {
                HealthOutcome::Expired
            } else {
                HealthOutcome::LaunchFailed
            };
        }

        let probe = tokio::time::timeout(PROBE_TIMEOUT, handle.session.probe()).await;
        let error = match probe {
            Ok(Ok(())) => {
                tracing::debug!(generation = handle.generation, "Browser probe ok");
                return HealthOutcome::Healthy;
            }
            Ok(Err(e)) => e.sanitized(),
            Err(_) => format!("probe timed out after {}s", PROBE_TIMEOUT.as_secs()),
        };

        tracing::warn!(
            generation = handle.generation,
            %error,
            "Browser failed its health probe, restarting"
        );
        if self.restart_if_current(handle.generation).await {
            HealthOutcome::Recovered
        } else {
            HealthOutcome::LaunchFailed
        }
    }

    /// Launches a browser if none is running, then runs
    /// [`health_check`](Self::health_check) every `health_interval` until
    /// `cancel_token` fires.
    ///
    /// Probes open a context outside the queue's admission control, so the
    /// first one waits a full interval instead of racing startup traffic.
    pub fn spawn_health_monitor(self: Arc<Self>, cancel_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::select! {
                launched = self.ensure_session() => {
                    if launched.is_err() {
                        tracing::error!("Initial browser launch failed, retrying at the next health check");
                    }
                }
                () = cancel_token.cancelled() => {
                    tracing::debug!("Health monitor stopped");
                    return;
                }
            }

            let first = tokio::time::Instant::now() + self.config.health_interval;
            let mut ticker = tokio::time::interval_at(first, self.config.health_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let outcome = self.health_check().await;
                        match outcome {
                            HealthOutcome::Healthy => {}
                            HealthOutcome::LaunchFailed => {
                                tracing::error!("Health check could not bring a browser up");
                            }
                            other => tracing::info!(outcome = ?other, "Health check replaced browser"),
                        }
                    }
                    () = cancel_token.cancelled() => break,
                }
            }
            tracing::debug!("Health monitor stopped");
        })
    }

    pub async fn status(&self) -> BrowserStatus {
        match self.current().await {
            Some(handle) => BrowserStatus {
                running: true,
                generation: Some(handle.generation),
                uptime: Some(handle.age()),
                launched_at: Some(handle.launched_at),
            },
            None => BrowserStatus {
                running: false,
                generation: None,
                uptime: None,
                launched_at: None,
            },
        }
    }

    /// Closes the browser and leaves the slot empty.
    pub async fn shutdown(&self) {
        let _launch = self.launch_lock.lock().await;
        let previous = self.current.write().await.take();
        if let Some(handle) = previous {
            self.close_handle(&handle).await;
        }
    }

    /// Takes the current handle out of the slot, closes it, and launches a
    /// replacement. Callers must hold `launch_lock`.
    async fn replace(&self) -> bool {
        let previous = self.current.write().await.take();
        if let Some(handle) = previous {
            self.close_handle(&handle).await;
        }

        let started = Instant::now();
        match self.backend.launch().await {
            Ok(session) => {
                let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
                *self.current.write().await = Some(Arc::new(BrowserHandle::new(session, generation)));
                tracing::info!(
                    generation,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Browser launched"
                );
                true
            }
            Err(e) => {
                tracing::error!(error = %e.sanitized(), "Failed to launch browser");
                false
            }
        }
    }

    async fn close_handle(&self, handle: &BrowserHandle<B::Session>) {
        tracing::info!(generation = handle.generation, "Closing browser");
        if let Err(e) = handle.session.close().await {
            tracing::warn!(
                generation = handle.generation,
                error = %e.sanitized(),
                "Failed to close browser cleanly"
            );
        }
    }
}
