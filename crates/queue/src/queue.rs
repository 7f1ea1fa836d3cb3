use crate::error::ErrorKind;
use crate::merge::{Join, MergeStrategy};
use crate::options::Options;
use crate::ticket::{Outcome, Ticket};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Semaphore, broadcast, oneshot};
use tokio::task::AbortHandle;

type Waiter<T> = oneshot::Sender<Outcome<T>>;
type ProcessFn<K, P, T, E> = Arc<dyn Fn(K, P) -> BoxFuture<'static, Result<T, E>> + Send + Sync>;
type FailedAttemptFn<K, P, E> = Arc<dyn Fn(&K, &P, &E, Attempt) + Send + Sync>;
type RejectedFn<K, P, E> = Arc<dyn Fn(&K, &P, &E) + Send + Sync>;

/// Where a known operation is in its lifecycle. Settled operations are
/// forgotten, so there is no variant for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Waiting for its settle delay to elapse.
    Delayed,
    /// Waiting for a free concurrency slot.
    Queued,
    Running,
}

/// A failed attempt, as reported to the failed-attempt hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// 1-based attempt number.
    pub number: u32,
    pub retries_left: u32,
}

struct Operation<P, T> {
    payload: P,
    status: Status,
    generation: u64,
    timer: Option<AbortHandle>,
    waiters: Vec<Waiter<T>>,
    follow_up: Option<FollowUp<P, T>>,
}

struct FollowUp<P, T> {
    payload: P,
    waiters: Vec<Waiter<T>>,
}

impl<P, T> Operation<P, T> {
    fn new(payload: P, waiters: Vec<Waiter<T>>) -> Self {
        Self { payload, status: Status::Delayed, generation: 0, timer: None, waiters, follow_up: None }
    }
}

struct Inner<K, P, T, E> {
    name: String,
    options: Options,
    process: ProcessFn<K, P, T, E>,
    merge: Arc<dyn MergeStrategy<P>>,
    on_failed_attempt: Option<FailedAttemptFn<K, P, E>>,
    on_rejected: Option<RejectedFn<K, P, E>>,
    operations: Mutex<HashMap<K, Operation<P, T>>>,
    permits: Semaphore,
    generation: AtomicU64,
    /// Queued plus running.
    in_flight: AtomicUsize,
    running: AtomicUsize,
    idle: broadcast::Sender<()>,
}

/// Debounced, deduplicating, retrying queue of keyed operations.
///
/// Each key has at most one live operation. Requests for a key whose operation
/// is still delayed reset its settle timer and join it; requests arriving later
/// are handed to the [`MergeStrategy`]. Once the timer fires the operation waits
/// for one of `concurrency` slots, then runs the process function with up to
/// `retries` extra attempts.
///
/// Operations are driven by tasks spawned on the current tokio runtime, so
/// [`add`](Self::add) must be called from within one.
pub struct OperationQueue<K, P, T, E> {
    inner: Arc<Inner<K, P, T, E>>,
}

impl<K, P, T, E> Clone for OperationQueue<K, P, T, E> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

/// Configures an [`OperationQueue`].
pub struct Builder<K, P, E> {
    name: String,
    options: Options,
    merge: Arc<dyn MergeStrategy<P>>,
    on_failed_attempt: Option<FailedAttemptFn<K, P, E>>,
    on_rejected: Option<RejectedFn<K, P, E>>,
}

impl<K, P, E> Builder<K, P, E>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
    E: Debug + Send + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), options: Options::default(), merge: Arc::new(Join), on_failed_attempt: None, on_rejected: None }
    }

    #[must_use]
    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn merge(mut self, strategy: impl MergeStrategy<P>) -> Self {
        self.merge = Arc::new(strategy);
        self
    }

    /// Called after every failed attempt, before any retry.
    #[must_use]
    pub fn on_failed_attempt(mut self, hook: impl Fn(&K, &P, &E, Attempt) + Send + Sync + 'static) -> Self {
        self.on_failed_attempt = Some(Arc::new(hook));
        self
    }

    /// Called once retries are exhausted, before waiters are notified.
    #[must_use]
    pub fn on_rejected(mut self, hook: impl Fn(&K, &P, &E) + Send + Sync + 'static) -> Self {
        self.on_rejected = Some(Arc::new(hook));
        self
    }

    pub fn build<T, F, Fut>(self, process: F) -> OperationQueue<K, P, T, E>
    where
        T: Clone + Send + 'static,
        F: Fn(K, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (idle, _) = broadcast::channel(16);
        OperationQueue {
            inner: Arc::new(Inner {
                permits: Semaphore::new(self.options.concurrency.max(1)),
                name: self.name,
                options: self.options,
                process: Arc::new(move |key: K, payload: P| process(key, payload).boxed()),
                merge: self.merge,
                on_failed_attempt: self.on_failed_attempt,
                on_rejected: self.on_rejected,
                operations: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(1),
                in_flight: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                idle,
            }),
        }
    }
}

impl<K, P, T, E> OperationQueue<K, P, T, E>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
    T: Clone + Send + 'static,
    E: Debug + Send + 'static,
{
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    /// Request an operation for `key` using the queue's settle delay.
    pub fn add(&self, key: K, payload: P) -> Ticket<T> {
        self.add_with(key, payload, None)
    }

    /// Request an operation for `key`, overriding the settle delay when the
    /// operation is (re)armed by this call.
    pub fn add_with(&self, key: K, payload: P, delay: Option<Duration>) -> Ticket<T> {
        let (sender, receiver) = oneshot::channel();
        let mut operations = self.operations();
        match operations.get_mut(&key) {
            None => {
                let mut operation = Operation::new(payload, vec![sender]);
                self.arm(&key, &mut operation, delay);
                operations.insert(key, operation);
            },
            Some(operation) => match operation.status {
                Status::Delayed => {
                    self.inner.merge.pending(&mut operation.payload, payload);
                    operation.waiters.push(sender);
                    self.arm(&key, operation, delay);
                    tracing::trace!(queue = %self.inner.name, ?key, "Settle timer reset");
                },
                Status::Queued => {
                    self.inner.merge.pending(&mut operation.payload, payload);
                    operation.waiters.push(sender);
                },
                Status::Running => match operation.follow_up.as_mut() {
                    Some(follow_up) => {
                        self.inner.merge.pending(&mut follow_up.payload, payload);
                        follow_up.waiters.push(sender);
                    },
                    None => match self.inner.merge.running(&operation.payload, payload) {
                        Some(payload) => {
                            tracing::trace!(queue = %self.inner.name, ?key, "Follow-up scheduled behind running operation");
                            operation.follow_up = Some(FollowUp { payload, waiters: vec![sender] });
                        },
                        None => operation.waiters.push(sender),
                    },
                },
            },
        }
        Ticket::new(receiver)
    }

    /// Attach to the live operation for `key` without requesting a new one.
    pub fn subscribe(&self, key: &K) -> Option<Ticket<T>> {
        let mut operations = self.operations();
        let operation = operations.get_mut(key)?;
        let (sender, receiver) = oneshot::channel();
        operation.waiters.push(sender);
        Some(Ticket::new(receiver))
    }

    pub fn status(&self, key: &K) -> Option<Status> {
        self.operations().get(key).map(|operation| operation.status)
    }

    /// Number of operations that have been requested but not yet settled,
    /// whatever their status.
    pub fn delayed(&self) -> usize {
        self.operations().len()
    }

    /// Operations waiting for a concurrency slot.
    pub fn queued(&self) -> usize {
        let in_flight = self.inner.in_flight.load(Ordering::SeqCst);
        in_flight.saturating_sub(self.inner.running.load(Ordering::SeqCst))
    }

    pub fn running(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Receives a message every time the last queued or running operation
    /// settles.
    pub fn subscribe_idle(&self) -> broadcast::Receiver<()> {
        self.inner.idle.subscribe()
    }

    /// Wait until no operation is known to the queue.
    pub async fn settled(&self) {
        let mut idle = self.subscribe_idle();
        while !self.is_empty() {
            // Lagging only means several idle signals were missed; check again.
            let _ = idle.recv().await;
        }
    }

    fn is_empty(&self) -> bool {
        self.operations().is_empty()
    }

    fn operations(&self) -> MutexGuard<'_, HashMap<K, Operation<P, T>>> {
        self.inner.operations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// (Re)start the settle timer. A superseded timer is aborted, and should it
    /// already have woken, the generation check in `dispatch` discards it.
    fn arm(&self, key: &K, operation: &mut Operation<P, T>, delay: Option<Duration>) {
        if let Some(timer) = operation.timer.take() {
            timer.abort();
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        operation.generation = generation;
        let delay = delay.unwrap_or(self.inner.options.delay);
        let queue = self.clone();
        let key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.dispatch(key, generation).await;
        });
        operation.timer = Some(handle.abort_handle());
    }

    async fn dispatch(self, key: K, generation: u64) {
        {
            let mut operations = self.operations();
            let Some(operation) = operations.get_mut(&key) else { return };
            if operation.generation != generation || operation.status != Status::Delayed {
                return;
            }
            operation.status = Status::Queued;
            operation.timer = None;
            self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        }

        // The semaphore is never closed, so this always holds a permit.
        let permit = self.inner.permits.acquire().await.ok();
        let payload = self.operations().get_mut(&key).map(|operation| {
            operation.status = Status::Running;
            operation.payload.clone()
        });
        let Some(payload) = payload else {
            self.leave();
            return;
        };

        self.inner.running.fetch_add(1, Ordering::SeqCst);
        let result = self.execute(&key, &payload).await;
        self.inner.running.fetch_sub(1, Ordering::SeqCst);
        drop(permit);

        self.settle(key, payload, result);
        self.leave();
    }

    async fn execute(&self, key: &K, payload: &P) -> Result<T, (E, u32)> {
        let attempts = self.inner.options.retries.saturating_add(1);
        let mut number = 1;
        loop {
            match (self.inner.process)(key.clone(), payload.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let attempt = Attempt { number, retries_left: attempts.saturating_sub(number) };
                    tracing::warn!(
                        queue = %self.inner.name,
                        ?key,
                        attempt = attempt.number,
                        retries_left = attempt.retries_left,
                        error = ?err,
                        "Operation attempt failed"
                    );
                    if let Some(hook) = &self.inner.on_failed_attempt {
                        hook(key, payload, &err, attempt);
                    }
                    if attempt.retries_left == 0 {
                        return Err((err, number));
                    }
                    tokio::time::sleep(self.inner.options.backoff.delay(number)).await;
                    number += 1;
                },
            }
        }
    }

    fn settle(&self, key: K, payload: P, result: Result<T, (E, u32)>) {
        let waiters = {
            let mut operations = self.operations();
            let Some(operation) = operations.remove(&key) else {
                return;
            };
            // Swapped in under the same lock so a concurrent `add` can't slip a
            // second operation in between.
            if let Some(follow_up) = operation.follow_up {
                let mut next = Operation::new(follow_up.payload, follow_up.waiters);
                self.arm(&key, &mut next, None);
                operations.insert(key.clone(), next);
            }
            operation.waiters
        };

        let outcome = match result {
            Ok(value) => {
                tracing::debug!(queue = %self.inner.name, ?key, "Operation resolved");
                Ok(value)
            },
            Err((err, attempts)) => {
                tracing::error!(queue = %self.inner.name, ?key, attempts, error = ?err, "Operation rejected");
                if let Some(hook) = &self.inner.on_rejected {
                    hook(&key, &payload, &err);
                }
                Err(ErrorKind::Rejected { attempts, reason: format!("{err:?}") })
            },
        };
        for waiter in waiters {
            // The caller may have dropped its ticket.
            let _ = waiter.send(outcome.clone());
        }
    }

    fn leave(&self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            tracing::trace!(queue = %self.inner.name, "Queue idle");
            // No receivers is fine.
            let _ = self.inner.idle.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::Latest;
    use futures::future::join_all;
    use std::sync::atomic::AtomicU32;
    use tokio::time::{Instant, sleep};

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    /// Doubles its input after 100ms, counting calls.
    fn doubling(options: Options, calls: Arc<AtomicUsize>) -> OperationQueue<&'static str, u32, u32, String> {
        Builder::new("test").options(options).build(move |_key, n: u32| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                sleep(ms(100)).await;
                Ok(n * 2)
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_key_collapses_into_one_execution() {
        let calls = Arc::new(AtomicUsize::new(0));
        let queue = doubling(Options::new(ms(200), 1, 0), Arc::clone(&calls));
        let start = Instant::now();
        let first = queue.add("a", 1);
        sleep(ms(100)).await;
        let second = queue.add("a", 2);
        let third = queue.add("a", 3);
        assert_eq!(queue.delayed(), 1);
        assert_eq!(queue.status(&"a"), Some(Status::Delayed));

        let (first, second, third) = tokio::join!(first, second, third);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Join keeps the payload of the first request.
        assert_eq!(first.unwrap(), 2);
        assert_eq!(second.unwrap(), 2);
        assert_eq!(third.unwrap(), 2);
        // Timer was reset at 100ms, so dispatch happened at 300ms.
        let elapsed = start.elapsed();
        assert!(elapsed >= ms(400) && elapsed < ms(500), "elapsed {elapsed:?}");
        assert_eq!(queue.delayed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settled_key_starts_new_execution() {
        let calls = Arc::new(AtomicUsize::new(0));
        let queue = doubling(Options::new(ms(10), 1, 0), Arc::clone(&calls));
        assert_eq!(queue.add("a", 1).await.unwrap(), 2);
        assert_eq!(queue.add("a", 5).await.unwrap(), 10);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_counters_follow_lifecycle() {
        let calls = Arc::new(AtomicUsize::new(0));
        let queue = doubling(Options::new(ms(200), 1, 0), Arc::clone(&calls));
        let first = queue.add("a", 1);
        let second = queue.add("b", 2);
        assert_eq!((queue.delayed(), queue.queued(), queue.running()), (2, 0, 0));

        sleep(ms(250)).await;
        assert_eq!((queue.delayed(), queue.queued(), queue.running()), (2, 1, 1));

        sleep(ms(100)).await;
        assert_eq!((queue.delayed(), queue.queued(), queue.running()), (1, 0, 1));

        assert_eq!(first.await.unwrap(), 2);
        assert_eq!(second.await.unwrap(), 4);
        assert_eq!((queue.delayed(), queue.queued(), queue.running()), (0, 0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_limit_holds_under_flood() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let queue: OperationQueue<usize, (), (), String> = Builder::new("flood").options(Options::new(ms(5), 3, 0)).build({
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            move |_key, ()| {
                let current = Arc::clone(&current);
                let peak = Arc::clone(&peak);
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(ms(50)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        });

        let tickets: Vec<_> = (0..20).map(|key| queue.add(key, ())).collect();
        sleep(ms(20)).await;
        assert_eq!(queue.running(), 3);
        assert_eq!(queue.queued(), 17);
        for result in join_all(tickets).await {
            result.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let failures = Arc::new(Mutex::new(Vec::new()));
        let queue = Builder::new("retry")
            .options(Options::new(ms(10), 1, 2))
            .on_failed_attempt({
                let failures = Arc::clone(&failures);
                move |_key: &&str, _payload: &u32, _err: &String, attempt| failures.lock().unwrap().push(attempt)
            })
            .build({
                let calls = Arc::clone(&calls);
                move |_key, n: u32| {
                    let calls = Arc::clone(&calls);
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) < 2 { Err("flaky".to_string()) } else { Ok(n + 1) }
                    }
                }
            });

        assert_eq!(queue.add("a", 1).await.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(*failures.lock().unwrap(), vec![
            Attempt { number: 1, retries_left: 2 },
            Attempt { number: 2, retries_left: 1 },
        ]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_after_exhausting_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let rejected = Arc::new(AtomicU32::new(0));
        let queue: OperationQueue<&str, u32, u32, String> = Builder::new("reject")
            .options(Options::new(ms(10), 1, 2))
            .on_rejected({
                let rejected = Arc::clone(&rejected);
                move |_key, _payload, _err| {
                    rejected.fetch_add(1, Ordering::SeqCst);
                }
            })
            .build({
                let calls = Arc::clone(&calls);
                move |_key, _n| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("down".to_string()) }
                }
            });

        let first = queue.add("a", 1);
        let second = queue.add("a", 1);
        let (first, second) = tokio::join!(first, second);
        for err in [first.unwrap_err(), second.unwrap_err()] {
            assert!(matches!(&*err, ErrorKind::Rejected { attempts: 3, reason } if reason.contains("down")));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(rejected.load(Ordering::SeqCst), 1);
        assert_eq!(queue.delayed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_fires_once_drained() {
        let calls = Arc::new(AtomicUsize::new(0));
        let queue = doubling(Options::new(ms(10), 1, 0), Arc::clone(&calls));
        let mut idle = queue.subscribe_idle();
        let _first = queue.add("a", 1);
        let _second = queue.add("b", 2);
        idle.recv().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(queue.delayed(), 0);
        assert!(idle.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_settled_waits_for_every_operation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let queue = doubling(Options::new(ms(10), 2, 0), Arc::clone(&calls));
        let _first = queue.add("a", 1);
        let _second = queue.add_with("b", 2, Some(ms(500)));
        queue.settled().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(queue.delayed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_override() {
        let calls = Arc::new(AtomicUsize::new(0));
        let queue = doubling(Options::new(Duration::from_secs(10), 1, 0), Arc::clone(&calls));
        let start = Instant::now();
        assert_eq!(queue.add_with("a", 4, Some(ms(10))).await.unwrap(), 8);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_replays_request_made_while_running() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let queue: OperationQueue<&str, u32, u32, String> =
            Builder::new("latest").options(Options::new(ms(10), 1, 0)).merge(Latest).build({
                let seen = Arc::clone(&seen);
                move |_key, n| {
                    let seen = Arc::clone(&seen);
                    async move {
                        seen.lock().unwrap().push(n);
                        sleep(ms(100)).await;
                        Ok(n * 2)
                    }
                }
            });

        let first = queue.add("a", 1);
        sleep(ms(50)).await;
        assert_eq!(queue.status(&"a"), Some(Status::Running));
        let second = queue.add("a", 2);
        let third = queue.add("a", 3);
        assert_eq!(first.await.unwrap(), 2);
        assert_eq!(second.await.unwrap(), 6);
        assert_eq!(third.await.unwrap(), 6);
        assert_eq!(*seen.lock().unwrap(), vec![1, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_replaces_pending_payload() {
        let calls = Arc::new(AtomicUsize::new(0));
        let queue: OperationQueue<&str, u32, u32, String> =
            Builder::new("latest").options(Options::new(ms(10), 1, 0)).merge(Latest).build({
                let calls = Arc::clone(&calls);
                move |_key, n| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(n * 2) }
                }
            });
        let first = queue.add("a", 1);
        let second = queue.add("a", 5);
        assert_eq!(first.await.unwrap(), 10);
        assert_eq!(second.await.unwrap(), 10);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_joins_live_operation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let queue = doubling(Options::new(ms(10), 1, 0), Arc::clone(&calls));
        assert!(queue.subscribe(&"a").is_none());
        let ticket = queue.add("a", 3);
        let joined = queue.subscribe(&"a").unwrap();
        assert_eq!(ticket.await.unwrap(), 6);
        assert_eq!(joined.await.unwrap(), 6);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
