//! Admission-controlled scrape queue.
//!
//! Submissions go into a bounded channel. A fixed pool of `max_concurrent`
//! workers drains it; a worker takes the next task only when it is idle, so
//! at most `max_concurrent` tasks execute at once and tasks are admitted in
//! the order they were submitted. Completion order is not guaranteed.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{ScrapeKind, ScrapeResult, SubjectId};
use crate::supervisor::BrowserSupervisor;
use crate::traits::{BrowserBackend, BrowserSession};

/// Configuration for the task queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Number of workers, i.e. the most tasks that execute at once.
    pub max_concurrent: usize,
    /// Most tasks that may wait for a worker before submissions are refused.
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            capacity: 100,
        }
    }
}

/// Identity of a queued scrape.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub id: Uuid,
    pub kind: ScrapeKind,
    pub subject_id: SubjectId,
    pub enqueued_at: Instant,
}

impl TaskSpec {
    pub fn new(kind: ScrapeKind, subject_id: SubjectId) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            subject_id,
            enqueued_at: Instant::now(),
        }
    }
}

type TaskOutcome = Result<ScrapeResult, AppError>;

struct QueuedTask {
    spec: TaskSpec,
    respond_to: oneshot::Sender<TaskOutcome>,
}

/// The work a queue runs for each admitted task.
pub trait TaskExecutor<S: BrowserSession>: Send + Sync + 'static {
    /// Runs `task` against `session`, the browser that is current at admission.
    fn execute(&self, session: &S, task: &TaskSpec) -> impl Future<Output = TaskOutcome> + Send;
}

/// Events emitted by the queue for monitoring/logging.
#[derive(Debug, Clone)]
pub enum QueueEvent<'a> {
    WorkerStarted {
        worker: usize,
    },
    TaskQueued {
        task: &'a TaskSpec,
    },
    TaskAdmitted {
        task: &'a TaskSpec,
        active: usize,
    },
    TaskCompleted {
        task: &'a TaskSpec,
        value: &'a str,
        elapsed: Duration,
    },
    TaskFailed {
        task: &'a TaskSpec,
        error: &'a AppError,
        elapsed: Duration,
    },
    BrowserRestartRequested {
        task: &'a TaskSpec,
        generation: u64,
    },
    WorkerStopped {
        worker: usize,
    },
}

/// Trait for receiving queue events (decoupled logging).
pub trait QueueReporter: Send + Sync + 'static {
    fn report(&self, event: QueueEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingQueueReporter;

impl QueueReporter for TracingQueueReporter {
    fn report(&self, event: QueueEvent<'_>) {
        match event {
            QueueEvent::WorkerStarted { worker } => {
                tracing::debug!(worker, "Queue worker started");
            }
            QueueEvent::TaskQueued { task } => {
                tracing::debug!(task_id = %task.id, kind = %task.kind, subject_id = %task.subject_id, "Task queued");
            }
            QueueEvent::TaskAdmitted { task, active } => {
                tracing::info!(
                    task_id = %task.id,
                    kind = %task.kind,
                    subject_id = %task.subject_id,
                    active,
                    waited_ms = task.enqueued_at.elapsed().as_millis() as u64,
                    "Task admitted"
                );
            }
            QueueEvent::TaskCompleted {
                task,
                value,
                elapsed,
            } => {
                tracing::info!(
                    task_id = %task.id,
                    kind = %task.kind,
                    subject_id = %task.subject_id,
                    %value,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Task completed"
                );
            }
            QueueEvent::TaskFailed {
                task,
                error,
                elapsed,
            } => {
                tracing::warn!(
                    task_id = %task.id,
                    kind = %task.kind,
                    subject_id = %task.subject_id,
                    error = %error.sanitized(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Task failed"
                );
            }
            QueueEvent::BrowserRestartRequested { task, generation } => {
                tracing::warn!(task_id = %task.id, generation, "Browser fault during task, restarting browser");
            }
            QueueEvent::WorkerStopped { worker } => {
                tracing::debug!(worker, "Queue worker stopped");
            }
        }
    }
}

/// Counts a task as active for as long as it lives.
struct ActiveSlot {
    active: Arc<AtomicUsize>,
}

impl ActiveSlot {
    fn acquire(active: &Arc<AtomicUsize>) -> (Self, usize) {
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        (
            Self {
                active: Arc::clone(active),
            },
            now,
        )
    }
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// State shared by all workers of one queue.
struct WorkerShared<B: BrowserBackend, E> {
    receiver: Mutex<mpsc::Receiver<QueuedTask>>,
    supervisor: Arc<BrowserSupervisor<B>>,
    executor: Arc<E>,
    reporter: Arc<dyn QueueReporter>,
    active: Arc<AtomicUsize>,
}

/// FIFO scrape queue bounded in both backlog and concurrency.
pub struct TaskQueue {
    sender: mpsc::Sender<QueuedTask>,
    active: Arc<AtomicUsize>,
    reporter: Arc<dyn QueueReporter>,
    config: QueueConfig,
    cancel_token: CancellationToken,
    workers: StdMutex<Vec<JoinHandle<()>>>,
}

impl TaskQueue {
    /// Spawns `config.max_concurrent` workers that run tasks with `executor`
    /// against the browser owned by `supervisor`. Workers stop when
    /// `cancel_token` is cancelled, finishing the task they hold first.
    pub fn start<B, E>(
        config: QueueConfig,
        supervisor: Arc<BrowserSupervisor<B>>,
        executor: Arc<E>,
        reporter: Arc<dyn QueueReporter>,
        cancel_token: CancellationToken,
    ) -> Self
    where
        B: BrowserBackend,
        E: TaskExecutor<B::Session>,
    {
        let (sender, receiver) = mpsc::channel(config.capacity.max(1));
        let active = Arc::new(AtomicUsize::new(0));
        let shared = Arc::new(WorkerShared {
            receiver: Mutex::new(receiver),
            supervisor,
            executor,
            reporter: Arc::clone(&reporter),
            active: Arc::clone(&active),
        });

        let workers = (0..config.max_concurrent.max(1))
            .map(|worker| {
                tokio::spawn(run_worker(
                    worker,
                    Arc::clone(&shared),
                    cancel_token.clone(),
                ))
            })
            .collect();

        Self {
            sender,
            active,
            reporter,
            config,
            cancel_token,
            workers: StdMutex::new(workers),
        }
    }

    /// Appends a task to the queue.
    ///
    /// Fails immediately with `QueueFull` when the backlog is at capacity.
    /// The returned receiver resolves exactly once with the task's outcome.
    pub fn submit(
        &self,
        kind: ScrapeKind,
        subject_id: SubjectId,
    ) -> Result<oneshot::Receiver<TaskOutcome>, AppError> {
        let (respond_to, outcome) = oneshot::channel();
        let spec = TaskSpec::new(kind, subject_id);
        let queued = QueuedTask {
            spec: spec.clone(),
            respond_to,
        };

        match self.sender.try_send(queued) {
            Ok(()) => {
                self.reporter.report(QueueEvent::TaskQueued { task: &spec });
                Ok(outcome)
            }
            Err(TrySendError::Full(_)) => Err(AppError::QueueFull {
                capacity: self.config.capacity,
            }),
            Err(TrySendError::Closed(_)) => Err(AppError::QueueClosed),
        }
    }

    /// Submits a task and waits for its outcome.
    pub async fn run(&self, kind: ScrapeKind, subject_id: SubjectId) -> TaskOutcome {
        let outcome = self.submit(kind, subject_id)?;
        outcome.await.map_err(|_| AppError::QueueClosed)?
    }

    /// Tasks waiting for a worker.
    pub fn queue_length(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    /// Tasks currently executing.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Stops all workers and waits for them. Tasks still waiting resolve
    /// with `QueueClosed`; later submissions are refused the same way.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned worker list");
            poisoned.into_inner()
        }));
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Queue worker panicked");
            }
        }
    }
}

async fn run_worker<B, E>(
    worker: usize,
    shared: Arc<WorkerShared<B, E>>,
    cancel_token: CancellationToken,
) where
    B: BrowserBackend,
    E: TaskExecutor<B::Session>,
{
    shared.reporter.report(QueueEvent::WorkerStarted { worker });

    loop {
        let admitted = tokio::select! {
            admitted = admit(&shared) => admitted,
            () = cancel_token.cancelled() => break,
        };
        let Some((task, slot)) = admitted else {
            break;
        };
        let task_id = task.spec.id;
        // A panicking task loses its submitter's answer (they see
        // QueueClosed) but not the worker.
        if let Err(panic) = AssertUnwindSafe(process(&shared, task)).catch_unwind().await {
            tracing::error!(
                worker,
                %task_id,
                panic = panic_message(panic.as_ref()),
                "Scrape task panicked"
            );
        }
        drop(slot);
    }

    shared.reporter.report(QueueEvent::WorkerStopped { worker });
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

/// Takes the head task. The receiver lock is held until the admission is
/// recorded, so admissions are observed in submission order.
async fn admit<B, E>(shared: &WorkerShared<B, E>) -> Option<(QueuedTask, ActiveSlot)>
where
    B: BrowserBackend,
{
    let mut receiver = shared.receiver.lock().await;
    let task = receiver.recv().await?;
    let (slot, active) = ActiveSlot::acquire(&shared.active);
    shared.reporter.report(QueueEvent::TaskAdmitted {
        task: &task.spec,
        active,
    });
    Some((task, slot))
}

async fn process<B, E>(shared: &WorkerShared<B, E>, task: QueuedTask)
where
    B: BrowserBackend,
    E: TaskExecutor<B::Session>,
{
    let started = Instant::now();
    let spec = &task.spec;

    let mut failed_generation = None;
    let outcome = match shared.supervisor.ensure_session().await {
        Ok(handle) => {
            let outcome = shared.executor.execute(handle.session(), spec).await;
            if let Err(e) = &outcome
                && e.is_browser_fault()
            {
                failed_generation = Some(handle.generation());
            }
            outcome
        }
        Err(e) => Err(e),
    };

    let elapsed = started.elapsed();
    match &outcome {
        Ok(result) => shared.reporter.report(QueueEvent::TaskCompleted {
            task: spec,
            value: &result.value,
            elapsed,
        }),
        Err(error) => shared.reporter.report(QueueEvent::TaskFailed {
            task: spec,
            error,
            elapsed,
        }),
    }

    // The broken browser is replaced before the submitter hears back, so a
    // retry never lands on it.
    if let Some(generation) = failed_generation {
        shared.reporter.report(QueueEvent::BrowserRestartRequested {
            task: spec,
            generation,
        });
        shared.supervisor.restart_if_current(generation).await;
    }

    let QueuedTask { spec, respond_to } = task;
    if respond_to.send(outcome).is_err() {
        tracing::debug!(task_id = %spec.id, "Submitter went away before the task finished");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tokio::sync::Semaphore;

    use super::*;
    use crate::supervisor::SupervisorConfig;
    use crate::testutil::{RecordingReporter, StubBackend, StubSession, subject_id};

    /// Executor with per-subject latency and failures that tracks how many
    /// tasks run at once.
    #[derive(Clone, Default)]
    struct ScriptedExecutor {
        delays: Arc<HashMap<String, Duration>>,
        failures: Arc<HashMap<String, AppError>>,
        gate: Option<Arc<Semaphore>>,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        calls: Arc<AtomicUsize>,
        panic_on: Option<String>,
    }

    impl TaskExecutor<StubSession> for ScriptedExecutor {
        async fn execute(&self, _session: &StubSession, task: &TaskSpec) -> TaskOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let key = task.subject_id.to_string();
            if let Some(delay) = self.delays.get(&key) {
                tokio::time::sleep(*delay).await;
            } else {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }

            self.running.fetch_sub(1, Ordering::SeqCst);
            if self.panic_on.as_deref() == Some(key.as_str()) {
                panic!("scripted panic for {key}");
            }
            match self.failures.get(&key) {
                Some(e) => Err(e.clone()),
                None => Ok(ScrapeResult::new(task.kind, task.subject_id.clone(), "1")),
            }
        }
    }

    struct Fixture {
        queue: TaskQueue,
        backend: StubBackend,
        reporter: RecordingReporter,
        supervisor: Arc<BrowserSupervisor<StubBackend>>,
    }

    fn fixture(config: QueueConfig, executor: ScriptedExecutor) -> Fixture {
        let backend = StubBackend::new();
        let supervisor = Arc::new(BrowserSupervisor::new(
            backend.clone(),
            SupervisorConfig::default(),
        ));
        let reporter = RecordingReporter::new();
        let queue = TaskQueue::start(
            config,
            Arc::clone(&supervisor),
            Arc::new(executor),
            Arc::new(reporter.clone()),
            CancellationToken::new(),
        );
        Fixture {
            queue,
            backend,
            reporter,
            supervisor,
        }
    }

    fn sid(n: usize) -> SubjectId {
        SubjectId::parse(&subject_id(n)).unwrap()
    }

    async fn wait_for_active(queue: &TaskQueue, n: usize) {
        for _ in 0..200 {
            if queue.active_count() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("queue never reached {n} active tasks");
    }

    #[tokio::test]
    async fn admits_in_submission_order() {
        let delays: HashMap<String, Duration> = [80, 10, 50, 10, 30, 10]
            .into_iter()
            .enumerate()
            .map(|(i, ms)| (subject_id(i), Duration::from_millis(ms)))
            .collect();
        let executor = ScriptedExecutor {
            delays: Arc::new(delays),
            ..Default::default()
        };
        let f = fixture(
            QueueConfig {
                max_concurrent: 2,
                capacity: 10,
            },
            executor,
        );

        let pending: Vec<_> = (0..6)
            .map(|i| f.queue.submit(ScrapeKind::ArtistListeners, sid(i)).unwrap())
            .collect();
        for outcome in pending {
            outcome.await.unwrap().unwrap();
        }

        let submitted: Vec<String> = (0..6).map(subject_id).collect();
        assert_eq!(f.reporter.admitted(), submitted);
        assert_ne!(f.reporter.completed(), submitted);
    }

    #[tokio::test]
    async fn never_exceeds_max_concurrent() {
        let executor = ScriptedExecutor::default();
        let peak = Arc::clone(&executor.peak);
        let f = fixture(
            QueueConfig {
                max_concurrent: 3,
                capacity: 50,
            },
            executor,
        );

        let pending: Vec<_> = (0..20)
            .map(|i| f.queue.submit(ScrapeKind::TrackPlaycount, sid(i)).unwrap())
            .collect();
        for outcome in pending {
            outcome.await.unwrap().unwrap();
        }

        let peak = peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak concurrency was {peak}");
        assert!(peak >= 2, "tasks never overlapped");
        assert_eq!(f.queue.active_count(), 0);
        assert_eq!(f.queue.queue_length(), 0);
    }

    #[tokio::test]
    async fn rejects_when_backlog_is_full() {
        let gate = Arc::new(Semaphore::new(0));
        let executor = ScriptedExecutor {
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        };
        let f = fixture(
            QueueConfig {
                max_concurrent: 1,
                capacity: 2,
            },
            executor,
        );

        let first = f.queue.submit(ScrapeKind::ArtistListeners, sid(0)).unwrap();
        wait_for_active(&f.queue, 1).await;

        let second = f.queue.submit(ScrapeKind::ArtistListeners, sid(1)).unwrap();
        let third = f.queue.submit(ScrapeKind::ArtistListeners, sid(2)).unwrap();
        assert_eq!(f.queue.queue_length(), 2);

        let err = f
            .queue
            .submit(ScrapeKind::ArtistListeners, sid(3))
            .unwrap_err();
        assert!(matches!(err, AppError::QueueFull { capacity: 2 }));

        gate.add_permits(3);
        for outcome in [first, second, third] {
            outcome.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn browser_fault_restarts_browser() {
        let failures: HashMap<String, AppError> = [(
            subject_id(0),
            AppError::ContextFailure("connection closed".into()),
        )]
        .into_iter()
        .collect();
        let executor = ScriptedExecutor {
            failures: Arc::new(failures),
            ..Default::default()
        };
        let f = fixture(
            QueueConfig {
                max_concurrent: 1,
                capacity: 10,
            },
            executor,
        );

        let err = f
            .queue
            .run(ScrapeKind::ArtistListeners, sid(0))
            .await
            .unwrap_err();
        assert!(err.is_browser_fault());

        let ok = f.queue.run(ScrapeKind::ArtistListeners, sid(1)).await;
        assert!(ok.is_ok());
        assert_eq!(f.reporter.restarts(), vec![1]);
        assert_eq!(f.backend.launches(), 2);
        assert_eq!(f.supervisor.current().await.unwrap().generation(), 2);
    }

    #[tokio::test]
    async fn navigation_failure_keeps_browser() {
        let failures: HashMap<String, AppError> = [(
            subject_id(0),
            AppError::NavigationFailure("timed out".into()),
        )]
        .into_iter()
        .collect();
        let executor = ScriptedExecutor {
            failures: Arc::new(failures),
            ..Default::default()
        };
        let f = fixture(QueueConfig::default(), executor);

        let err = f
            .queue
            .run(ScrapeKind::ArtistListeners, sid(0))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NavigationFailure(_)));
        assert!(f.reporter.restarts().is_empty());
        assert_eq!(f.backend.launches(), 1);
    }

    #[tokio::test]
    async fn launch_failure_fails_task_without_executing() {
        let executor = ScriptedExecutor::default();
        let calls = Arc::clone(&executor.calls);
        let f = fixture(QueueConfig::default(), executor);
        f.backend.fail_next_launches(1);

        let err = f
            .queue
            .run(ScrapeKind::TrackPlaycount, sid(0))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BrowserUnavailable(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(f.reporter.restarts().is_empty());

        // The next task re-attempts the launch.
        f.queue.run(ScrapeKind::TrackPlaycount, sid(1)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn worker_survives_panicking_task() {
        let executor = ScriptedExecutor {
            panic_on: Some(subject_id(0)),
            ..Default::default()
        };
        let f = fixture(
            QueueConfig {
                max_concurrent: 1,
                capacity: 10,
            },
            executor,
        );

        let err = f
            .queue
            .run(ScrapeKind::ArtistListeners, sid(0))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::QueueClosed));
        assert_eq!(f.queue.active_count(), 0);

        // The only worker is still there to take the next task.
        f.queue.run(ScrapeKind::ArtistListeners, sid(1)).await.unwrap();
        assert_eq!(f.reporter.completed(), vec![subject_id(1)]);
    }

    #[tokio::test]
    async fn shutdown_refuses_new_tasks() {
        let f = fixture(QueueConfig::default(), ScriptedExecutor::default());
        f.queue.run(ScrapeKind::ArtistListeners, sid(0)).await.unwrap();

        f.queue.shutdown().await;
        let err = f
            .queue
            .run(ScrapeKind::ArtistListeners, sid(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::QueueClosed));
    }
}
