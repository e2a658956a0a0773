//! Bounded, optionally expandable async worker pool.
//!
//! A fixed set of workers consumes tasks from a bounded MPMC channel.
//! [`WorkerPool::dispatch`] waits for queue space; [`WorkerPool::try_dispatch`]
//! never waits and instead spawns a short-lived *expanded* worker when
//! the queue is full and the expansion budget allows. Expanded workers
//! exit after sitting idle for the configured lifetime.
//!
//! Every task owns a one-shot result channel. Tasks carry an optional
//! cancellation token, checked at dequeue: a task whose token fired is
//! completed with [`TaskError::Canceled`] without running. Stopping the
//! pool cancels its token, fails queued tasks with
//! [`TaskError::PoolStopped`], and terminates the workers.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bon::Builder;
use futures::future::BoxFuture;
use futures::FutureExt;
use snafu::Snafu;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Type-erased task output.
pub type TaskOutput = Box<dyn Any + Send>;

/// Why a task did not produce an output.
#[derive(Debug, Snafu)]
pub enum TaskError {
    /// The task's token was cancelled before the task ran.
    #[snafu(display("task canceled before execution"))]
    Canceled,

    /// The pool stopped before the task ran.
    #[snafu(display("worker pool is stopped"))]
    PoolStopped,

    /// The queue was full and no expansion budget remained.
    #[snafu(display("worker pool queue is full"))]
    Rejected,

    /// The task ran and returned an error.
    #[snafu(display("task failed: {source}"))]
    Failed { source: crate::Error },
}

type WorkFn = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<TaskOutput, crate::Error>> + Send>;

/// A unit of work plus its result channel.
pub struct Task {
    cancel: CancellationToken,
    work: WorkFn,
    result: oneshot::Sender<Result<TaskOutput, TaskError>>,
}

impl Task {
    /// Creates a task that cannot be cancelled individually.
    pub fn new<F, Fut>(work: F) -> (Task, TaskHandle)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<TaskOutput, crate::Error>> + Send + 'static,
    {
        Self::with_cancel(CancellationToken::new(), work)
    }

    /// Creates a task governed by `cancel`: if the token fires before a
    /// worker dequeues the task, it completes with
    /// [`TaskError::Canceled`] without running.
    pub fn with_cancel<F, Fut>(cancel: CancellationToken, work: F) -> (Task, TaskHandle)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<TaskOutput, crate::Error>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        (
            Task {
                cancel,
                work: Box::new(move |token| work(token).boxed()),
                result: tx,
            },
            TaskHandle { rx },
        )
    }

    async fn run(self) {
        if self.cancel.is_cancelled() {
            let _ = self.result.send(Err(TaskError::Canceled));
            return;
        }
        let outcome = (self.work)(self.cancel).await;
        let _ = self
            .result
            .send(outcome.map_err(|source| TaskError::Failed { source }));
    }

    fn reject(self, error: TaskError) {
        let _ = self.result.send(Err(error));
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").finish_non_exhaustive()
    }
}

/// Receives a task's one-shot result.
#[derive(Debug)]
pub struct TaskHandle {
    rx: oneshot::Receiver<Result<TaskOutput, TaskError>>,
}

impl TaskHandle {
    /// Waits for the task outcome.
    pub async fn result(self) -> Result<TaskOutput, TaskError> {
        self.rx.await.unwrap_or(Err(TaskError::PoolStopped))
    }
}

/// Worker pool sizing.
#[derive(Clone, Copy, Debug, Builder)]
pub struct PoolConfig {
    /// Fixed worker count. Zero means the number of CPUs.
    #[builder(default = 0)]
    pub number_worker: usize,

    /// Extra workers that may be spawned by `try_dispatch` under load.
    #[builder(default = 0)]
    pub expandable_limit: usize,

    /// How long an expanded worker lingers idle before exiting. Zero
    /// means one minute.
    #[builder(default = Duration::from_secs(60))]
    pub expanded_lifetime: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl PoolConfig {
    fn normalize(mut self) -> Self {
        if self.number_worker == 0 {
            self.number_worker = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
        }
        if self.expanded_lifetime.is_zero() {
            self.expanded_lifetime = Duration::from_secs(60);
        }
        self
    }
}

/// A bounded async worker pool.
///
/// ```no_run
/// # async fn example() {
/// use resilient_client::pool::{PoolConfig, TaskOutput, WorkerPool};
///
/// let pool = WorkerPool::new(PoolConfig::default());
/// let handle = pool
///     .run(|_cancel| async { Ok(Box::new(2 + 2) as TaskOutput) })
///     .await;
/// let output = handle.result().await.unwrap();
/// assert_eq!(*output.downcast::<i32>().unwrap(), 4);
/// pool.stop().await;
/// # }
/// ```
pub struct WorkerPool {
    tx: async_channel::Sender<Task>,
    rx: async_channel::Receiver<Task>,
    shutdown: CancellationToken,
    expanded: Arc<AtomicUsize>,
    started: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    config: PoolConfig,
}

impl WorkerPool {
    /// Creates a pool. Workers start lazily on first dispatch.
    pub fn new(config: PoolConfig) -> Self {
        let config = config.normalize();
        let (tx, rx) = async_channel::bounded(config.number_worker);
        Self {
            tx,
            rx,
            shutdown: CancellationToken::new(),
            expanded: Arc::new(AtomicUsize::new(0)),
            started: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            config,
        }
    }

    /// Spawns the fixed workers. Idempotent; called implicitly by the
    /// dispatch methods.
    pub fn start(&self) {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let mut workers = self.workers.lock().unwrap();
        for _ in 0..self.config.number_worker {
            let rx = self.rx.clone();
            let shutdown = self.shutdown.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            drain(&rx);
                            break;
                        }
                        task = rx.recv() => match task {
                            Ok(task) => task.run().await,
                            Err(_) => break,
                        }
                    }
                }
            }));
        }
    }

    /// Enqueues `task`, waiting for queue space. The task is failed with
    /// [`TaskError::PoolStopped`] if the pool stops first.
    pub async fn dispatch(&self, task: Task) {
        self.start();
        if self.shutdown.is_cancelled() {
            task.reject(TaskError::PoolStopped);
            return;
        }
        tokio::select! {
            // Pool stopped while waiting for queue space: dropping the
            // parked send drops the task, and its handle resolves to
            // PoolStopped.
            _ = self.shutdown.cancelled() => {}
            sent = self.tx.send(task) => {
                if let Err(async_channel::SendError(task)) = sent {
                    task.reject(TaskError::PoolStopped);
                }
            }
        }
    }

    /// Enqueues `task` without waiting. On a full queue, spawns an
    /// expanded worker when under the limit and hands it the task
    /// directly; with no expansion budget left the task is failed with
    /// [`TaskError::Rejected`]. Returns whether the task was accepted.
    pub fn try_dispatch(&self, task: Task) -> bool {
        self.start();
        if self.shutdown.is_cancelled() {
            task.reject(TaskError::PoolStopped);
            return false;
        }
        match self.tx.try_send(task) {
            Ok(()) => true,
            Err(async_channel::TrySendError::Closed(task)) => {
                task.reject(TaskError::PoolStopped);
                false
            }
            Err(async_channel::TrySendError::Full(task)) => {
                if self.claim_expansion() {
                    self.spawn_expanded(Some(task));
                    true
                } else {
                    task.reject(TaskError::Rejected);
                    false
                }
            }
        }
    }

    /// Convenience: wraps `work` in a task and dispatches it.
    pub async fn run<F, Fut>(&self, work: F) -> TaskHandle
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<TaskOutput, crate::Error>> + Send + 'static,
    {
        let (task, handle) = Task::new(work);
        self.dispatch(task).await;
        handle
    }

    /// Convenience: wraps `work` in a task and try-dispatches it.
    pub fn try_run<F, Fut>(&self, work: F) -> TaskHandle
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<TaskOutput, crate::Error>> + Send + 'static,
    {
        let (task, handle) = Task::with_cancel(CancellationToken::new(), work);
        self.try_dispatch(task);
        handle
    }

    /// Number of live expanded workers.
    pub fn expanded_workers(&self) -> usize {
        self.expanded.load(Ordering::Relaxed)
    }

    /// Stops the pool: cancels the pool token, fails queued tasks, and
    /// joins the fixed workers. Running tasks finish their current work.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.tx.close();
        drain(&self.rx);
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            let _ = worker.await;
        }
    }

    /// Reserves one slot of the expansion budget.
    fn claim_expansion(&self) -> bool {
        let mut current = self.expanded.load(Ordering::Relaxed);
        loop {
            if current >= self.config.expandable_limit {
                return false;
            }
            match self.expanded.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Spawns an expanded worker, optionally seeded with a task that did
    /// not fit in the queue. The caller must have claimed budget.
    fn spawn_expanded(&self, initial: Option<Task>) {
        let rx = self.rx.clone();
        let shutdown = self.shutdown.clone();
        let expanded = Arc::clone(&self.expanded);
        let lifetime = self.config.expanded_lifetime;
        tokio::spawn(async move {
            if let Some(task) = initial {
                task.run().await;
            }
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        drain(&rx);
                        break;
                    }
                    _ = tokio::time::sleep(lifetime) => break,
                    task = rx.recv() => match task {
                        Ok(task) => task.run().await,
                        Err(_) => break,
                    }
                }
            }
            expanded.fetch_sub(1, Ordering::AcqRel);
        });
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("number_worker", &self.config.number_worker)
            .field("expandable_limit", &self.config.expandable_limit)
            .field("expanded", &self.expanded_workers())
            .finish()
    }
}

fn drain(rx: &async_channel::Receiver<Task>) {
    while let Ok(task) = rx.try_recv() {
        task.reject(TaskError::PoolStopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed<T: Any + Send>(value: T) -> TaskOutput {
        Box::new(value)
    }

    #[tokio::test]
    async fn tasks_produce_results() {
        let pool = WorkerPool::new(PoolConfig::builder().number_worker(4).build());

        let mut handles = Vec::new();
        for i in 0..100i64 {
            handles.push(pool.run(move |_| async move { Ok(boxed(i * i)) }).await);
        }

        let mut sum = 0;
        for handle in handles {
            let output = handle.result().await.unwrap();
            sum += *output.downcast::<i64>().unwrap();
        }
        let expect: i64 = (0..100).map(|i| i * i).sum();
        assert_eq!(sum, expect);

        pool.stop().await;
    }

    #[tokio::test]
    async fn handle_is_pending_until_the_worker_finishes() {
        use tokio_test::{assert_pending, assert_ready, task};

        let pool = WorkerPool::new(PoolConfig::builder().number_worker(1).build());
        let (unblock_tx, unblock_rx) = oneshot::channel::<()>();
        let handle = pool
            .run(move |_| async move {
                let _ = unblock_rx.await;
                Ok(boxed(7i32))
            })
            .await;

        let mut result = task::spawn(handle.result());
        assert_pending!(result.poll());

        let _ = unblock_tx.send(());
        while !result.is_woken() {
            tokio::task::yield_now().await;
        }
        let output = assert_ready!(result.poll()).unwrap();
        assert_eq!(*output.downcast::<i32>().unwrap(), 7);

        pool.stop().await;
    }

    #[tokio::test]
    async fn task_error_is_delivered() {
        let pool = WorkerPool::new(PoolConfig::builder().number_worker(1).build());
        let handle = pool
            .run(|_| async { Err::<TaskOutput, crate::Error>("boom".into()) })
            .await;
        match handle.result().await {
            Err(TaskError::Failed { source }) => assert_eq!(source.to_string(), "boom"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        pool.stop().await;
    }

    #[tokio::test]
    async fn precancelled_task_is_skipped() {
        let pool = WorkerPool::new(PoolConfig::builder().number_worker(1).build());

        let token = CancellationToken::new();
        token.cancel();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_flag = Arc::clone(&ran);
        let (task, handle) = Task::with_cancel(token, move |_| async move {
            ran_flag.store(true, Ordering::SeqCst);
            Ok(boxed(()))
        });
        pool.dispatch(task).await;

        assert!(matches!(handle.result().await, Err(TaskError::Canceled)));
        assert!(!ran.load(Ordering::SeqCst));
        pool.stop().await;
    }

    #[tokio::test]
    async fn stop_fails_queued_tasks() {
        let pool = WorkerPool::new(PoolConfig::builder().number_worker(1).build());

        // Park the single worker on a task that waits for us.
        let (unblock_tx, unblock_rx) = oneshot::channel::<()>();
        let blocker = pool
            .run(move |_| async move {
                let _ = unblock_rx.await;
                Ok(boxed(()))
            })
            .await;

        // This task sits in the queue behind the blocker.
        let queued = pool.run(|_| async { Ok(boxed(())) }).await;

        let _ = unblock_tx.send(());
        pool.stop().await;

        assert!(blocker.result().await.is_ok());
        // The queued task may have been picked up in the window between
        // unblocking and stopping; both outcomes are legal, but a
        // stopped-pool failure must map to PoolStopped.
        if let Err(error) = queued.result().await {
            assert!(matches!(error, TaskError::PoolStopped));
        }

        // Dispatch after stop fails immediately.
        let late = pool.run(|_| async { Ok(boxed(())) }).await;
        assert!(matches!(late.result().await, Err(TaskError::PoolStopped)));
    }

    #[tokio::test]
    async fn try_dispatch_expands_under_load() {
        let pool = WorkerPool::new(
            PoolConfig::builder()
                .number_worker(1)
                .expandable_limit(2)
                .expanded_lifetime(Duration::from_secs(60))
                .build(),
        );

        // Park the fixed worker and fill the queue (capacity 1).
        let (unblock_tx, unblock_rx) = oneshot::channel::<()>();
        let blocker = pool
            .run(move |_| async move {
                let _ = unblock_rx.await;
                Ok(boxed(()))
            })
            .await;
        // Give the worker a chance to dequeue the blocker.
        tokio::task::yield_now().await;
        let filler = pool.run(|_| async { Ok(boxed(())) }).await;

        // The queue is now full: try_run must expand and still enqueue.
        let overflow = pool.try_run(|_| async { Ok(boxed(1i32)) });
        assert!(pool.expanded_workers() >= 1);

        let _ = unblock_tx.send(());
        assert!(blocker.result().await.is_ok());
        assert!(filler.result().await.is_ok());
        assert!(overflow.result().await.is_ok());

        pool.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn expanded_workers_expire_when_idle() {
        let pool = WorkerPool::new(
            PoolConfig::builder()
                .number_worker(1)
                .expandable_limit(1)
                .expanded_lifetime(Duration::from_millis(10))
                .build(),
        );

        // Park the fixed worker, fill the queue, force an expansion.
        let (unblock_tx, unblock_rx) = oneshot::channel::<()>();
        let blocker = pool
            .run(move |_| async move {
                let _ = unblock_rx.await;
                Ok(boxed(()))
            })
            .await;
        tokio::task::yield_now().await;
        let filler = pool.run(|_| async { Ok(boxed(())) }).await;
        let overflow = pool.try_run(|_| async { Ok(boxed(())) });
        assert_eq!(pool.expanded_workers(), 1);

        let _ = unblock_tx.send(());
        assert!(blocker.result().await.is_ok());
        assert!(filler.result().await.is_ok());
        assert!(overflow.result().await.is_ok());

        // Idle past the lifetime: the expanded worker exits.
        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::task::yield_now().await;
        assert_eq!(pool.expanded_workers(), 0);

        pool.stop().await;
    }
}
