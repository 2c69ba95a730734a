//! Test utilities: a scripted in-memory browsing backend and a recording
//! queue reporter.
//!
//! Handwritten stubs for dependency injection in unit and integration tests.
//! Shared state lives behind `Arc`, so a test keeps a clone of the backend
//! and asserts on counters after handing the original to the code under test.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::AppError;
use crate::intercept::RequestFilter;
use crate::models::Locator;
use crate::queue::{QueueEvent, QueueReporter};
use crate::traits::{BrowserBackend, BrowserSession, BrowsingContext};

// ---------------------------------------------------------------------------
// StubBackend
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StubState {
    /// Text returned for any locator without an explicit element.
    page_text: Mutex<Option<String>>,
    elements: Mutex<HashMap<Locator, String>>,
    navigation_latency: Mutex<Duration>,
    navigation_error: Mutex<Option<AppError>>,
    read_error: Mutex<Option<AppError>>,
    context_latency: Mutex<Duration>,
    pending_launch_failures: AtomicUsize,
    launch_attempts: AtomicUsize,
    launches: AtomicUsize,
    sessions_closed: AtomicUsize,
    contexts_opened: AtomicUsize,
    contexts_closed: AtomicUsize,
    open_contexts: AtomicUsize,
    peak_open_contexts: AtomicUsize,
    navigations: Mutex<Vec<String>>,
    filters: Mutex<Vec<RequestFilter>>,
    current_alive: Mutex<Option<Arc<AtomicBool>>>,
}

/// Browsing backend whose pages contain scripted text.
#[derive(Clone, Default)]
pub struct StubBackend {
    state: Arc<StubState>,
}

impl StubBackend {
    /// Pages on which no locator finds anything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pages on which every locator finds `text`.
    pub fn with_page_text(text: &str) -> Self {
        let backend = Self::new();
        *backend.state.page_text.lock().unwrap() = Some(text.to_string());
        backend
    }

    /// Only `locator` finds `text` (in addition to any page-wide text).
    pub fn with_element(self, locator: Locator, text: &str) -> Self {
        self.state
            .elements
            .lock()
            .unwrap()
            .insert(locator, text.to_string());
        self
    }

    /// Every navigation takes `latency`.
    pub fn with_navigation_latency(self, latency: Duration) -> Self {
        *self.state.navigation_latency.lock().unwrap() = latency;
        self
    }

    /// Every navigation fails with `error` (or succeeds again with `None`).
    pub fn set_navigation_error(&self, error: Option<AppError>) {
        *self.state.navigation_error.lock().unwrap() = error;
    }

    /// Opening a context takes `latency`.
    pub fn with_context_latency(self, latency: Duration) -> Self {
        *self.state.context_latency.lock().unwrap() = latency;
        self
    }

    /// Every element read fails with `error` (or works again with `None`),
    /// while navigation keeps succeeding.
    pub fn set_read_error(&self, error: Option<AppError>) {
        *self.state.read_error.lock().unwrap() = error;
    }

    /// The next `n` launches fail.
    pub fn fail_next_launches(&self, n: usize) {
        self.state.pending_launch_failures.store(n, Ordering::SeqCst);
    }

    /// Makes the most recently launched browser unusable, as if its process
    /// had crashed: every operation on it fails with `ContextFailure`.
    pub fn kill_current(&self) {
        if let Some(alive) = self.state.current_alive.lock().unwrap().as_ref() {
            alive.store(false, Ordering::SeqCst);
        }
    }

    /// Launches tried, including failed ones.
    pub fn launch_attempts(&self) -> usize {
        self.state.launch_attempts.load(Ordering::SeqCst)
    }

    /// Launches that produced a browser.
    pub fn launches(&self) -> usize {
        self.state.launches.load(Ordering::SeqCst)
    }

    pub fn sessions_closed(&self) -> usize {
        self.state.sessions_closed.load(Ordering::SeqCst)
    }

    pub fn contexts_opened(&self) -> usize {
        self.state.contexts_opened.load(Ordering::SeqCst)
    }

    pub fn contexts_closed(&self) -> usize {
        self.state.contexts_closed.load(Ordering::SeqCst)
    }

    /// Contexts opened and not yet closed.
    pub fn open_contexts(&self) -> usize {
        self.state.open_contexts.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open contexts observed.
    pub fn peak_open_contexts(&self) -> usize {
        self.state.peak_open_contexts.load(Ordering::SeqCst)
    }

    /// URLs navigated to, in order.
    pub fn navigations(&self) -> Vec<String> {
        self.state.navigations.lock().unwrap().clone()
    }

    /// Filters installed by each navigation, in order.
    pub fn filters(&self) -> Vec<RequestFilter> {
        self.state.filters.lock().unwrap().clone()
    }
}

impl BrowserBackend for StubBackend {
    type Session = StubSession;

    async fn launch(&self) -> Result<StubSession, AppError> {
        self.state.launch_attempts.fetch_add(1, Ordering::SeqCst);
        let failures = &self.state.pending_launch_failures;
        if failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(AppError::BrowserUnavailable(
                "stub launch failure".to_string(),
            ));
        }

        self.state.launches.fetch_add(1, Ordering::SeqCst);
        let alive = Arc::new(AtomicBool::new(true));
        *self.state.current_alive.lock().unwrap() = Some(Arc::clone(&alive));
        Ok(StubSession {
            state: Arc::clone(&self.state),
            alive,
        })
    }
}

pub struct StubSession {
    state: Arc<StubState>,
    alive: Arc<AtomicBool>,
}

impl StubSession {
    fn check_alive(&self) -> Result<(), AppError> {
        check_alive(&self.alive)
    }
}

fn check_alive(alive: &AtomicBool) -> Result<(), AppError> {
    if alive.load(Ordering::SeqCst) {
        Ok(())
    } else {
        Err(AppError::ContextFailure(
            "Target closed: browser connection lost".to_string(),
        ))
    }
}

impl BrowserSession for StubSession {
    type Context = StubContext;

    async fn new_context(&self) -> Result<StubContext, AppError> {
        self.check_alive()?;
        let latency = *self.state.context_latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.state.contexts_opened.fetch_add(1, Ordering::SeqCst);
        let open = self.state.open_contexts.fetch_add(1, Ordering::SeqCst) + 1;
        self.state
            .peak_open_contexts
            .fetch_max(open, Ordering::SeqCst);
        Ok(StubContext {
            state: Arc::clone(&self.state),
            alive: Arc::clone(&self.alive),
        })
    }

    async fn close(&self) -> Result<(), AppError> {
        let was_alive = self.alive.swap(false, Ordering::SeqCst);
        self.state.sessions_closed.fetch_add(1, Ordering::SeqCst);
        if was_alive {
            Ok(())
        } else {
            Err(AppError::ContextFailure("browser already gone".to_string()))
        }
    }
}

pub struct StubContext {
    state: Arc<StubState>,
    alive: Arc<AtomicBool>,
}

impl BrowsingContext for StubContext {
    async fn navigate(&self, url: &str, filter: &RequestFilter) -> Result<(), AppError> {
        check_alive(&self.alive)?;
        self.state.navigations.lock().unwrap().push(url.to_string());
        self.state.filters.lock().unwrap().push(filter.clone());

        let latency = *self.state.navigation_latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let error = self.state.navigation_error.lock().unwrap().clone();
        match error {
            Some(e) => Err(e),
            None => check_alive(&self.alive),
        }
    }

    async fn read_text(&self, locator: &Locator) -> Result<Option<String>, AppError> {
        check_alive(&self.alive)?;
        let error = self.state.read_error.lock().unwrap().clone();
        if let Some(e) = error {
            return Err(e);
        }
        if let Some(text) = self.state.elements.lock().unwrap().get(locator) {
            return Ok(Some(text.clone()));
        }
        Ok(self.state.page_text.lock().unwrap().clone())
    }

    async fn close(self) -> Result<(), AppError> {
        self.state.contexts_closed.fetch_add(1, Ordering::SeqCst);
        self.state.open_contexts.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecordingReporter
// ---------------------------------------------------------------------------

/// Owned summary of a [`QueueEvent`], kept by [`RecordingReporter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedEvent {
    Queued(String),
    Admitted(String),
    Completed(String),
    Failed(String),
    RestartRequested(u64),
    Other,
}

/// Reporter that records task events for assertions.
#[derive(Clone, Default)]
pub struct RecordingReporter {
    pub events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subject ids in the order they were admitted.
    pub fn admitted(&self) -> Vec<String> {
        self.collect(|e| match e {
            RecordedEvent::Admitted(s) => Some(s.clone()),
            _ => None,
        })
    }

    /// Subject ids in the order they completed successfully.
    pub fn completed(&self) -> Vec<String> {
        self.collect(|e| match e {
            RecordedEvent::Completed(s) => Some(s.clone()),
            _ => None,
        })
    }

    pub fn restarts(&self) -> Vec<u64> {
        self.collect(|e| match e {
            RecordedEvent::RestartRequested(g) => Some(*g),
            _ => None,
        })
    }

    fn collect<T>(&self, f: impl Fn(&RecordedEvent) -> Option<T>) -> Vec<T> {
        self.events.lock().unwrap().iter().filter_map(f).collect()
    }
}

impl QueueReporter for RecordingReporter {
    fn report(&self, event: QueueEvent<'_>) {
        let recorded = match event {
            QueueEvent::TaskQueued { task } => RecordedEvent::Queued(task.subject_id.to_string()),
            QueueEvent::TaskAdmitted { task, .. } => {
                RecordedEvent::Admitted(task.subject_id.to_string())
            }
            QueueEvent::TaskCompleted { task, .. } => {
                RecordedEvent::Completed(task.subject_id.to_string())
            }
            QueueEvent::TaskFailed { task, .. } => {
                RecordedEvent::Failed(task.subject_id.to_string())
            }
            QueueEvent::BrowserRestartRequested { generation, .. } => {
                RecordedEvent::RestartRequested(generation)
            }
            _ => RecordedEvent::Other,
        };
        self.events.lock().unwrap().push(recorded);
    }
}

/// Subject ids that pass validation, for tests that need many distinct ones.
pub fn subject_id(n: usize) -> String {
    format!("{:0>22}", format!("T{n}"))
}
