//! The work-queue controller: bounded concurrency, retry with backoff, and
//! failure isolation around user reconcilers.
use std::{
    collections::HashSet,
    fmt::{self, Debug},
    hash::Hash,
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use async_trait::async_trait;
use futures::{
    channel::mpsc as stream_mpsc, stream, Future, FutureExt, Stream, StreamExt,
};
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use thiserror::Error;
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    cache::Cache,
    metrics::{ControllerMetrics, DuplicateControllerName, Registry},
    rate_limit::{self, RateLimiter},
    scheduler::{scheduler, ScheduleRequest, Scheduler},
};

/// Results of a successful reconciliation attempt
///
/// The controller interprets the combination of fields:
/// `requeue_after` re-adds the request after the given delay without touching
/// its backoff state; `requeue` re-adds it through the rate limiter; neither
/// drops the request and resets its backoff state to zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Action {
    /// Re-add the request through the rate limiter
    pub requeue: bool,
    /// Re-add the request after this delay, bypassing the rate limiter
    pub requeue_after: Option<Duration>,
}

impl Action {
    /// The request converged; drop it and reset its backoff state
    #[must_use]
    pub fn done() -> Self {
        Self::default()
    }

    /// Re-add the request through the rate limiter
    #[must_use]
    pub fn requeue() -> Self {
        Self {
            requeue: true,
            requeue_after: None,
        }
    }

    /// Re-add the request after `delay`, without incrementing its backoff
    ///
    /// The usual way to poll external systems or expire time-limited state.
    #[must_use]
    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue: false,
            requeue_after: Some(delay),
        }
    }
}

/// A reconciler failure, optionally flagged terminal
///
/// The blanket `From<E>` conversion produces the ordinary retryable form, so
/// `?` inside a reconciler yields retry-with-backoff by default; only an
/// explicit [`ReconcileError::terminal`] suppresses further attempts.
#[derive(Debug)]
pub struct ReconcileError<E> {
    error: E,
    terminal: bool,
}

impl<E> ReconcileError<E> {
    /// Flag `error` as terminal: the failed request is dropped permanently
    /// instead of retried
    pub fn terminal(error: E) -> Self {
        Self {
            error,
            terminal: true,
        }
    }

    /// Whether this error suppresses retry
    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    /// The underlying reconciler error
    pub fn into_inner(self) -> E {
        self.error
    }
}

impl<E> From<E> for ReconcileError<E> {
    fn from(error: E) -> Self {
        Self {
            error,
            terminal: false,
        }
    }
}

impl<E: fmt::Display> fmt::Display for ReconcileError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.terminal {
            write!(f, "terminal: {}", self.error)
        } else {
            write!(f, "{}", self.error)
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ReconcileError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// The sole business-logic boundary of the runtime
///
/// A reconciler is invoked once per dequeued request with the controller's
/// cancellation token, which it is expected to honor for long-running work.
/// It observes whatever state it needs (typically through a captured
/// [`Cache`] handle) and converges the world towards it; the returned
/// [`Action`] and error drive the requeue policy.
///
/// Any `Fn(R, CancellationToken) -> impl Future<Output = Result<Action,
/// ReconcileError<E>>>` closure is a reconciler.
#[async_trait]
pub trait Reconciler<R>: Send + Sync + 'static {
    /// The reconciler's own error type
    type Error: std::error::Error + Send + 'static;

    /// Drive the world towards the desired state of `request`
    async fn reconcile(
        &self,
        request: R,
        token: CancellationToken,
    ) -> Result<Action, ReconcileError<Self::Error>>;
}

#[async_trait]
impl<R, F, Fut, E> Reconciler<R> for F
where
    R: Send + 'static,
    F: Fn(R, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Action, ReconcileError<E>>> + Send + 'static,
    E: std::error::Error + Send + 'static,
{
    type Error = E;

    async fn reconcile(
        &self,
        request: R,
        token: CancellationToken,
    ) -> Result<Action, ReconcileError<E>> {
        (self)(request, token).await
    }
}

/// A reconciler error with the concrete type erased, so the controller does
/// not need to be generic over it.
struct DynError {
    error: Box<dyn std::error::Error + Send>,
    terminal: bool,
}

#[async_trait]
trait ErasedReconciler<R>: Send + Sync {
    async fn try_reconcile(&self, request: R, token: CancellationToken) -> Result<Action, DynError>;
}

#[async_trait]
impl<R: Send + 'static, T: Reconciler<R>> ErasedReconciler<R> for T {
    async fn try_reconcile(&self, request: R, token: CancellationToken) -> Result<Action, DynError> {
        self.reconcile(request, token).await.map_err(|err| DynError {
            terminal: err.is_terminal(),
            error: Box::new(err.into_inner()),
        })
    }
}

/// Parameters of one controller
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of worker tasks, i.e. the bound on concurrent reconciliations
    pub concurrency: usize,
    /// How long startup may wait for the cache sync gate before failing
    pub sync_timeout: Duration,
    /// Requeue policy for failed reconciliations
    pub rate_limit: rate_limit::Config,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: 1,
            sync_timeout: Duration::from_secs(120),
            rate_limit: rate_limit::Config::default(),
        }
    }
}

/// Failure to build or start a controller.
#[derive(Debug, Error)]
pub enum Error {
    /// The cache sync gate did not open within the configured timeout
    ///
    /// This is fatal for the controller instance: running workers against an
    /// unsynced cache would reconcile from fabricated emptiness.
    #[error("controller {name:?} timed out waiting for caches to sync after {timeout:?}")]
    SyncTimeout {
        /// The controller that gave up
        name: String,
        /// The configured sync timeout
        timeout: Duration,
    },
    /// The controller name collided in the registry
    #[error(transparent)]
    DuplicateName(#[from] DuplicateControllerName),
}

/// What the queue should do with a completed request.
enum Disposition {
    /// Clean success: drop and reset backoff state
    Forget,
    /// Terminal failure: drop permanently
    Discard,
    /// Re-add after a fixed delay, bypassing the rate limiter
    After(Duration),
    /// Re-add through the rate limiter
    Backoff,
}

struct Completion<R> {
    request: R,
    disposition: Disposition,
}

/// Builder for a [`Controller`]
pub struct ControllerBuilder<R> {
    name: String,
    config: Config,
    cache: Option<Arc<dyn Cache>>,
    triggers: Vec<stream::BoxStream<'static, R>>,
}

impl<R> ControllerBuilder<R>
where
    R: Eq + Hash + Clone + Debug + Send + 'static,
{
    /// Start building a controller called `name`
    ///
    /// The name must be unique within the [`Registry`] the controller is
    /// eventually built against.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            config: Config::default(),
            cache: None,
            triggers: Vec::new(),
        }
    }

    /// Replace the whole configuration
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the worker pool size
    #[must_use]
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.config.concurrency = concurrency;
        self
    }

    /// Gate startup on this cache's sync and thread it to reconcilers
    ///
    /// Before any worker pops a request the controller blocks on
    /// [`Cache::wait_for_sync`], bounded by the configured sync timeout.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Add a trigger stream of requests
    ///
    /// Usually the output of [`trigger_self`](crate::trigger::trigger_self) /
    /// [`trigger_with`](crate::trigger::trigger_with) over an informer's
    /// events; any request stream works.
    #[must_use]
    pub fn watches(mut self, trigger: impl Stream<Item = R> + Send + 'static) -> Self {
        self.triggers.push(trigger.boxed());
        self
    }

    /// Add an external request feed that bypasses event mapping
    #[must_use]
    pub fn reconcile_on(self, requests: impl Stream<Item = R> + Send + 'static) -> Self {
        self.watches(requests)
    }

    /// Register the controller's name and finish the build
    pub fn build(
        self,
        registry: &mut Registry,
        reconciler: impl Reconciler<R>,
    ) -> Result<Controller<R>, Error> {
        let metrics = registry.register(&self.name)?;
        Ok(Controller {
            name: self.name,
            config: self.config,
            cache: self.cache,
            triggers: self.triggers,
            reconciler: Arc::new(reconciler),
            metrics,
        })
    }
}

/// A running control loop's engine
///
/// Owns a deduplicating, rate-limited queue and a fixed pool of worker tasks
/// that invoke the [`Reconciler`] once per dequeued request. The queue
/// guarantees at most one in-flight worker per distinct request identity: a
/// request re-added while in flight is parked and collapses into exactly one
/// follow-up reconciliation after the current run finishes.
pub struct Controller<R> {
    name: String,
    config: Config,
    cache: Option<Arc<dyn Cache>>,
    triggers: Vec<stream::BoxStream<'static, R>>,
    reconciler: Arc<dyn ErasedReconciler<R>>,
    metrics: Arc<ControllerMetrics>,
}

/// Pop the next request whose identity is not currently in flight.
async fn next_request<R, S>(
    scheduler: Pin<&mut Scheduler<R, S>>,
    in_flight: &Arc<Mutex<HashSet<R>>>,
) -> Option<R>
where
    R: Eq + Hash + Clone,
    S: Stream<Item = ScheduleRequest<R>>,
{
    let in_flight = in_flight.clone();
    scheduler
        .hold_unless(move |request| !in_flight.lock().contains(request))
        .next()
        .await
}

impl<R> Controller<R>
where
    R: Eq + Hash + Clone + Debug + Send + 'static,
{
    /// The controller's registered name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The controller's counters (also reachable through the [`Registry`])
    #[must_use]
    pub fn metrics(&self) -> Arc<ControllerMetrics> {
        self.metrics.clone()
    }

    /// Run the controller until `token` fires
    ///
    /// Startup blocks on the cache sync gate (if a cache was attached);
    /// expiry of the sync timeout is a fatal startup error. After the gate
    /// opens, the queue task and `concurrency` workers run until
    /// cancellation; the call returns only once every worker has finished
    /// its current request and exited.
    pub async fn run(self, token: CancellationToken) -> Result<(), Error> {
        let Self {
            name,
            config,
            cache,
            triggers,
            reconciler,
            metrics,
        } = self;

        if let Some(cache) = &cache {
            tracing::debug!(controller = %name, "waiting for caches to sync");
            match tokio::time::timeout(config.sync_timeout, cache.wait_for_sync(&token)).await {
                Ok(true) => tracing::debug!(controller = %name, "caches synced"),
                Ok(false) => {
                    tracing::debug!(controller = %name, "cancelled while waiting for cache sync");
                    return Ok(());
                }
                Err(_) => {
                    return Err(Error::SyncTimeout {
                        name,
                        timeout: config.sync_timeout,
                    })
                }
            }
        }

        let concurrency = config.concurrency.max(1);
        let (requeue_tx, requeue_rx) = stream_mpsc::unbounded::<ScheduleRequest<R>>();
        let trigger_requests = stream::select_all(triggers).map(|request| ScheduleRequest {
            message: request,
            run_at: Instant::now(),
        });
        let mut scheduler = Box::pin(scheduler(stream::select(trigger_requests, requeue_rx)));

        let in_flight: Arc<Mutex<HashSet<R>>> = Arc::default();
        let (work_tx, work_rx) = mpsc::channel::<R>(concurrency);
        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Completion<R>>();

        let mut workers = Vec::with_capacity(concurrency);
        for worker_id in 0..concurrency {
            workers.push(tokio::spawn(worker_loop(
                name.clone(),
                worker_id,
                work_rx.clone(),
                reconciler.clone(),
                token.clone(),
                done_tx.clone(),
                metrics.clone(),
            )));
        }
        // Workers hold the only remaining senders, so done_rx ends with them
        drop(done_tx);

        let mut limiter = RateLimiter::new(config.rate_limit.clone());
        let mut shutting_down = false;
        let mut triggers_exhausted = false;
        loop {
            metrics
                .queue_depth
                .store(scheduler.as_ref().get_ref().len(), Ordering::Relaxed);
            if (shutting_down || triggers_exhausted) && in_flight.lock().is_empty() {
                break;
            }
            tokio::select! {
                biased;
                completion = done_rx.recv() => {
                    let Some(Completion { request, disposition }) = completion else { break };
                    in_flight.lock().remove(&request);
                    match disposition {
                        Disposition::Forget | Disposition::Discard => limiter.forget(&request),
                        Disposition::After(delay) => {
                            let _ = requeue_tx.unbounded_send(ScheduleRequest {
                                message: request,
                                run_at: Instant::now() + delay,
                            });
                        }
                        Disposition::Backoff => {
                            let delay = limiter.next_delay(&request);
                            let _ = requeue_tx.unbounded_send(ScheduleRequest {
                                message: request,
                                run_at: Instant::now() + delay,
                            });
                        }
                    }
                }
                () = token.cancelled(), if !shutting_down => {
                    tracing::debug!(controller = %name, "shutdown requested, draining in-flight reconciliations");
                    shutting_down = true;
                }
                next = next_request(scheduler.as_mut(), &in_flight),
                    if !shutting_down && !triggers_exhausted && in_flight.lock().len() < concurrency =>
                {
                    match next {
                        Some(request) => {
                            in_flight.lock().insert(request.clone());
                            // in_flight < concurrency implies a free channel slot
                            if let Err(refused) = work_tx.try_send(request) {
                                let request = match refused {
                                    mpsc::error::TrySendError::Full(r)
                                    | mpsc::error::TrySendError::Closed(r) => r,
                                };
                                in_flight.lock().remove(&request);
                                let _ = requeue_tx.unbounded_send(ScheduleRequest {
                                    message: request,
                                    run_at: Instant::now(),
                                });
                            }
                        }
                        None => triggers_exhausted = true,
                    }
                }
            }
        }

        // Stop handing out work; each worker finishes its current request
        drop(work_tx);
        for worker in workers {
            let _ = worker.await;
        }
        tracing::debug!(controller = %name, "all workers exited");
        Ok(())
    }
}

/// One worker task: pop, reconcile under a panic guard, report the outcome.
async fn worker_loop<R>(
    name: String,
    worker_id: usize,
    work_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<R>>>,
    reconciler: Arc<dyn ErasedReconciler<R>>,
    token: CancellationToken,
    done_tx: mpsc::UnboundedSender<Completion<R>>,
    metrics: Arc<ControllerMetrics>,
) where
    R: Eq + Hash + Clone + Debug + Send + 'static,
{
    loop {
        let request = { work_rx.lock().await.recv().await };
        let Some(request) = request else { break };
        let span =
            tracing::debug_span!("reconcile", controller = %name, worker = worker_id, request = ?request);
        let outcome = AssertUnwindSafe(reconciler.try_reconcile(request.clone(), token.clone()))
            .catch_unwind()
            .instrument(span)
            .await;
        let disposition = match outcome {
            Ok(Ok(action)) => {
                metrics.reconciliations.fetch_add(1, Ordering::Relaxed);
                if let Some(after) = action.requeue_after.filter(|delay| !delay.is_zero()) {
                    Disposition::After(after)
                } else if action.requeue {
                    Disposition::Backoff
                } else {
                    Disposition::Forget
                }
            }
            Ok(Err(failure)) => {
                metrics.failures.fetch_add(1, Ordering::Relaxed);
                if failure.terminal {
                    metrics.terminal_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        controller = %name,
                        request = ?request,
                        error = %failure.error,
                        "terminal reconcile error, dropping request"
                    );
                    Disposition::Discard
                } else {
                    tracing::warn!(
                        controller = %name,
                        request = ?request,
                        error = %failure.error,
                        "reconcile failed, requeueing with backoff"
                    );
                    Disposition::Backoff
                }
            }
            Err(payload) => {
                // One panicking request must not take the pool down: convert
                // to an error, requeue like any other failure, keep serving
                metrics.panics.fetch_add(1, Ordering::Relaxed);
                metrics.failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    controller = %name,
                    request = ?request,
                    panic = %panic_message(payload.as_ref()),
                    "reconciler panicked, requeueing with backoff"
                );
                Disposition::Backoff
            }
        };
        if done_tx
            .send(Completion {
                request,
                disposition,
            })
            .is_err()
        {
            break;
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&'static str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

#[cfg(test)]
mod tests {
    use super::{Action, Config, ControllerBuilder, Error, ReconcileError};
    use crate::{
        cache::{CacheConfig, InformerCache},
        metrics::Registry,
        rate_limit,
        source::{DeltaStream, ObjectList, RemoteSource, SourceError},
    };
    use async_trait::async_trait;
    use converge_core::ResourceKind;
    use futures::{stream, StreamExt};
    use parking_lot::Mutex;
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Duration,
    };
    use thiserror::Error as ThisError;
    use tokio::{
        sync::{mpsc, Notify},
        time::{timeout, Instant},
    };
    use tokio_util::sync::CancellationToken;

    #[derive(Debug, ThisError)]
    #[error("boom")]
    struct Boom;

    /// Fast rate-limiter config for failure-path tests under a paused clock
    fn test_config(concurrency: usize) -> Config {
        Config {
            concurrency,
            sync_timeout: Duration::from_secs(120),
            rate_limit: rate_limit::Config {
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_secs(10),
                admission_interval: Duration::ZERO,
            },
        }
    }

    fn request_stream() -> (mpsc::UnboundedSender<&'static str>, impl futures::Stream<Item = &'static str>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, tokio_stream(rx))
    }

    /// Adapt a tokio unbounded receiver into a Stream without extra deps
    fn tokio_stream<T>(rx: mpsc::UnboundedReceiver<T>) -> impl futures::Stream<Item = T> {
        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_requests_reconcile_in_parallel_and_readds_collapse() {
        let (trigger_tx, trigger_rx) = request_stream();
        let (started_tx, mut started_rx) = mpsc::unbounded_channel::<&'static str>();
        let release = Arc::new(Notify::new());
        let calls: Arc<Mutex<Vec<&'static str>>> = Arc::default();

        let reconciler = {
            let release = release.clone();
            let calls = calls.clone();
            move |request: &'static str, _token: CancellationToken| {
                let started = started_tx.clone();
                let release = release.clone();
                let calls = calls.clone();
                async move {
                    calls.lock().push(request);
                    started.send(request).unwrap();
                    release.notified().await;
                    Ok::<_, ReconcileError<Boom>>(Action::done())
                }
            }
        };

        let mut registry = Registry::new();
        let controller = ControllerBuilder::new("widgets")
            .config(test_config(2))
            .watches(trigger_rx)
            .build(&mut registry, reconciler)
            .unwrap();
        let token = CancellationToken::new();
        let run = tokio::spawn(controller.run(token.clone()));

        // Create events for A and B arrive concurrently: both reconcile in
        // parallel (both starts observed while neither has been released)
        trigger_tx.send("A").unwrap();
        trigger_tx.send("B").unwrap();
        let mut first = vec![
            started_rx.recv().await.unwrap(),
            started_rx.recv().await.unwrap(),
        ];
        first.sort_unstable();
        assert_eq!(first, vec!["A", "B"]);

        // A third event for A arrives while A is still in flight
        trigger_tx.send("A").unwrap();
        trigger_tx.send("A").unwrap(); // and a fourth: re-adds collapse
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        release.notify_waiters();

        // Exactly one follow-up reconciliation of A occurs
        assert_eq!(started_rx.recv().await.unwrap(), "A");
        release.notify_waiters();
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert!(
            timeout(Duration::from_millis(100), started_rx.recv())
                .await
                .is_err(),
            "no further reconciliation may start"
        );
        assert_eq!(
            calls.lock().iter().filter(|r| **r == "A").count(),
            2,
            "A reconciles exactly twice: once initially, once for the collapsed re-adds"
        );

        token.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_errors_get_exactly_one_attempt() {
        let (trigger_tx, trigger_rx) = request_stream();
        let calls: Arc<Mutex<Vec<&'static str>>> = Arc::default();

        let reconciler = {
            let calls = calls.clone();
            move |request: &'static str, _token: CancellationToken| {
                let calls = calls.clone();
                async move {
                    calls.lock().push(request);
                    Err::<Action, _>(ReconcileError::terminal(Boom))
                }
            }
        };

        let mut registry = Registry::new();
        let controller = ControllerBuilder::new("widgets")
            .config(test_config(1))
            .watches(trigger_rx)
            .build(&mut registry, reconciler)
            .unwrap();
        let metrics = controller.metrics();
        let token = CancellationToken::new();
        let run = tokio::spawn(controller.run(token.clone()));

        trigger_tx.send("A").unwrap();
        // Give the queue plenty of (virtual) time to retry if it wrongly would
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(calls.lock().len(), 1, "terminal errors are never retried");
        assert_eq!(metrics.terminal_failures.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.failures.load(Ordering::Relaxed), 1);

        token.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failures_retry_with_backoff_and_success_resets_it() {
        let (trigger_tx, trigger_rx) = request_stream();
        // Reconciler script: fail, succeed, fail, succeed
        let starts: Arc<Mutex<Vec<Instant>>> = Arc::default();

        let reconciler = {
            let starts = starts.clone();
            move |_request: &'static str, _token: CancellationToken| {
                let starts = starts.clone();
                async move {
                    let mut starts = starts.lock();
                    starts.push(Instant::now());
                    if starts.len() % 2 == 1 {
                        Err(ReconcileError::from(Boom))
                    } else {
                        Ok(Action::done())
                    }
                }
            }
        };

        let mut registry = Registry::new();
        let base = Duration::from_secs(3600);
        let controller = ControllerBuilder::new("widgets")
            .config(Config {
                concurrency: 1,
                sync_timeout: Duration::from_secs(120),
                rate_limit: rate_limit::Config {
                    base_delay: base,
                    max_delay: base * 8,
                    admission_interval: Duration::ZERO,
                },
            })
            .watches(trigger_rx)
            .build(&mut registry, reconciler)
            .unwrap();
        let token = CancellationToken::new();
        let run = tokio::spawn(controller.run(token.clone()));

        // First failure retries after the base delay, then succeeds
        trigger_tx.send("A").unwrap();
        while starts.lock().len() < 2 {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        // A new event after the clean success: its failure must start over at
        // the base delay, not continue the old exponential ladder
        trigger_tx.send("A").unwrap();
        while starts.lock().len() < 4 {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        let starts = starts.lock();
        let first_retry = starts[1] - starts[0];
        let second_retry = starts[3] - starts[2];
        assert!(
            first_retry >= base && first_retry < base * 2,
            "first retry after base delay, got {first_retry:?}"
        );
        assert!(
            second_retry >= base && second_retry < base * 2,
            "backoff was reset by the clean success, got {second_retry:?}"
        );
        drop(starts);

        token.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn a_panicking_request_does_not_stop_the_pool() {
        let (trigger_tx, trigger_rx) = request_stream();
        let calls: Arc<Mutex<Vec<&'static str>>> = Arc::default();
        let panicked = Arc::new(AtomicBool::new(false));

        let reconciler = {
            let calls = calls.clone();
            let panicked = panicked.clone();
            move |request: &'static str, _token: CancellationToken| {
                let calls = calls.clone();
                let panicked = panicked.clone();
                async move {
                    calls.lock().push(request);
                    if request == "boom" && !panicked.swap(true, Ordering::SeqCst) {
                        panic!("reconciler exploded");
                    }
                    Ok::<_, ReconcileError<Boom>>(Action::done())
                }
            }
        };

        let mut registry = Registry::new();
        let controller = ControllerBuilder::new("widgets")
            .config(test_config(1))
            .watches(trigger_rx)
            .build(&mut registry, reconciler)
            .unwrap();
        let metrics = controller.metrics();
        let token = CancellationToken::new();
        let run = tokio::spawn(controller.run(token.clone()));

        trigger_tx.send("boom").unwrap();
        trigger_tx.send("ok").unwrap();

        // The unrelated request is still processed by the same (only) worker
        while !calls.lock().contains(&"ok") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(metrics.panics.load(Ordering::Relaxed), 1);
        // And the panicked request was requeued like any other failure
        while calls.lock().iter().filter(|r| **r == "boom").count() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        token.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_in_flight_work() {
        let (trigger_tx, trigger_rx) = request_stream();
        let (started_tx, mut started_rx) = mpsc::unbounded_channel::<&'static str>();
        let release = Arc::new(Notify::new());

        let reconciler = {
            let release = release.clone();
            move |request: &'static str, _token: CancellationToken| {
                let started = started_tx.clone();
                let release = release.clone();
                async move {
                    started.send(request).unwrap();
                    release.notified().await;
                    Ok::<_, ReconcileError<Boom>>(Action::done())
                }
            }
        };

        let mut registry = Registry::new();
        let controller = ControllerBuilder::new("widgets")
            .config(test_config(1))
            .watches(trigger_rx)
            .build(&mut registry, reconciler)
            .unwrap();
        let token = CancellationToken::new();
        let mut run = tokio::spawn(controller.run(token.clone()));

        trigger_tx.send("A").unwrap();
        started_rx.recv().await.unwrap();

        // Cancel while A is in flight: run() must block until A finishes
        token.cancel();
        assert!(
            timeout(Duration::from_millis(100), &mut run).await.is_err(),
            "run() returned before the in-flight reconciliation finished"
        );
        release.notify_waiters();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn sync_timeout_is_a_fatal_startup_error() {
        /// A source whose informer never syncs (its loop is never started)
        struct NeverSource;

        #[async_trait]
        impl RemoteSource for NeverSource {
            async fn list(&self, _kind: &ResourceKind) -> Result<ObjectList, SourceError> {
                Ok(ObjectList::default())
            }

            async fn watch(
                &self,
                _kind: &ResourceKind,
                _resource_version: &str,
            ) -> Result<DeltaStream, SourceError> {
                Ok(stream::pending().boxed())
            }
        }

        let cache = Arc::new(InformerCache::new(Arc::new(NeverSource), CacheConfig::default()));
        cache.register(&ResourceKind::new("factory.example.dev", "v1", "Widget"));

        let mut registry = Registry::new();
        let controller = ControllerBuilder::new("widgets")
            .config(Config {
                sync_timeout: Duration::from_millis(50),
                ..test_config(1)
            })
            .with_cache(cache)
            .watches(stream::pending::<&'static str>())
            .build(&mut registry, |_request: &'static str, _token: CancellationToken| async move {
                Ok::<_, ReconcileError<Boom>>(Action::done())
            })
            .unwrap();

        let token = CancellationToken::new();
        match controller.run(token).await {
            Err(Error::SyncTimeout { name, .. }) => assert_eq!(name, "widgets"),
            other => panic!("expected sync timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_controller_names_fail_the_build() {
        let mut registry = Registry::new();
        let reconcile = |_request: &'static str, _token: CancellationToken| async move {
            Ok::<_, ReconcileError<Boom>>(Action::done())
        };
        ControllerBuilder::new("widgets")
            .watches(stream::pending::<&'static str>())
            .build(&mut registry, reconcile)
            .unwrap();
        let again = ControllerBuilder::new("widgets")
            .watches(stream::pending::<&'static str>())
            .build(&mut registry, reconcile);
        assert!(matches!(again, Err(Error::DuplicateName(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn requeue_after_runs_again_without_backoff_penalty() {
        let (trigger_tx, trigger_rx) = request_stream();
        let starts: Arc<Mutex<Vec<Instant>>> = Arc::default();

        let reconciler = {
            let starts = starts.clone();
            move |_request: &'static str, _token: CancellationToken| {
                let starts = starts.clone();
                async move {
                    let mut starts = starts.lock();
                    starts.push(Instant::now());
                    if starts.len() == 1 {
                        Ok::<_, ReconcileError<Boom>>(Action::requeue_after(Duration::from_secs(30)))
                    } else {
                        Ok(Action::done())
                    }
                }
            }
        };

        let mut registry = Registry::new();
        let controller = ControllerBuilder::new("widgets")
            .config(test_config(1))
            .watches(trigger_rx)
            .build(&mut registry, reconciler)
            .unwrap();
        let token = CancellationToken::new();
        let run = tokio::spawn(controller.run(token.clone()));

        trigger_tx.send("A").unwrap();
        while starts.lock().len() < 2 {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        let starts = starts.lock();
        let delay = starts[1] - starts[0];
        assert!(
            delay >= Duration::from_secs(30) && delay < Duration::from_secs(32),
            "requeue_after delay honored, got {delay:?}"
        );
        drop(starts);

        token.cancel();
        run.await.unwrap().unwrap();
    }
}
