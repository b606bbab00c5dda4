use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, field, instrument, warn, Span};

use super::key::ObjectKey;
use super::queue::WorkQueue;
use super::watch::ResourceEventHandler;
use crate::{telemetry, Error, Metrics, Result};

/// Completion report of one worker loop
#[derive(Debug)]
pub struct WorkerExit {
    pub worker: String,
}

/// Reports that a worker loop has exited.
///
/// The report is sent exactly once: either through [`WorkerDone::report`] or,
/// if the worker unwinds or forgets, when the handle is dropped.
pub struct WorkerDone {
    worker: String,
    tx: Option<mpsc::UnboundedSender<WorkerExit>>,
}

impl WorkerDone {
    pub(crate) fn new(worker: String, tx: mpsc::UnboundedSender<WorkerExit>) -> Self {
        Self {
            worker,
            tx: Some(tx),
        }
    }

    pub fn report(mut self) {
        self.send();
    }

    fn send(&mut self) {
        if let Some(tx) = self.tx.take() {
            // the group keeps its receiver for as long as it has workers
            let _ = tx.send(WorkerExit {
                worker: std::mem::take(&mut self.worker),
            });
        }
    }
}

impl Drop for WorkerDone {
    fn drop(&mut self) {
        self.send();
    }
}

/// The unit every resource-type controller plugs into a controller group.
pub trait WorkerRunner: Send + Sync {
    fn name(&self) -> &str;

    /// How many independent worker loops the group launches.
    fn worker_count(&self) -> usize;

    /// Run one worker loop until `stop` fires and the work is drained, then
    /// report through `done`.
    fn run_worker(self: Arc<Self>, stop: CancellationToken, done: WorkerDone) -> BoxFuture<'static, ()>;

    /// Keys waiting to be processed
    fn queue_len(&self) -> usize {
        0
    }
}

/// Business logic invoked for every key a worker dequeues.
///
/// Returning a transient error requeues the key with backoff; success or a
/// permanent error resets its backoff.
pub trait Reconciler: Send + Sync + 'static {
    fn reconcile(&self, key: &ObjectKey) -> impl Future<Output = Result<()>> + Send;
}

/// The canonical queue-driven [`WorkerRunner`]
pub struct QueueWorker<R> {
    name: String,
    queue: Arc<WorkQueue>,
    reconciler: Arc<R>,
    workers: usize,
    metrics: Metrics,
}

impl<R: Reconciler> QueueWorker<R> {
    pub fn new(
        name: impl Into<String>,
        queue: Arc<WorkQueue>,
        reconciler: Arc<R>,
        workers: usize,
        metrics: Metrics,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            queue,
            reconciler,
            workers,
            metrics,
        })
    }

    async fn worker_loop(self: Arc<Self>, stop: CancellationToken, done: WorkerDone) {
        let shutdown_on_stop = async {
            stop.cancelled().await;
            self.queue.shut_down();
            debug!(controller = %self.name, "received stop signal, worker queue told to shut down");
            std::future::pending::<()>().await
        };
        let drain = async { while self.process_next_item().await {} };

        tokio::select! {
            _ = shutdown_on_stop => {}
            _ = drain => {}
        }

        debug!(controller = %self.name, "worker queue has been shut down, reporting done");
        done.report();
    }

    #[instrument(skip(self), fields(controller = %self.name, trace_id))]
    async fn traced_reconcile(&self, key: &ObjectKey) -> Result<()> {
        if let Some(trace_id) = telemetry::get_trace_id() {
            Span::current().record("trace_id", field::display(&trace_id));
        }
        self.reconciler.reconcile(key).await
    }

    /// Handle one key. Returns `false` once the queue is shut down and empty.
    async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        let result = {
            let _timer = self.metrics.count_and_measure(&self.name);
            AssertUnwindSafe(self.traced_reconcile(&key))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(Error::ReconcilerPanic(panic_message(panic))))
        };

        match result {
            Ok(()) => {
                debug!(controller = %self.name, %key, "reconciled");
                self.queue.forget(&key);
            }
            Err(err @ Error::ReconcilerPanic(_)) => {
                error!(controller = %self.name, %key, "reconcile panicked, will retry: {err}");
                self.metrics.reconcile_failure(&self.name, &err);
                self.queue.add_rate_limited(key.clone());
            }
            Err(err) if err.is_transient() => {
                warn!(controller = %self.name, %key, "reconcile failed, will retry: {err}");
                self.metrics.reconcile_failure(&self.name, &err);
                self.queue.add_rate_limited(key.clone());
            }
            Err(err) => {
                error!(controller = %self.name, %key, "reconcile failed permanently: {err}");
                self.metrics.reconcile_failure(&self.name, &err);
                self.queue.forget(&key);
            }
        }
        self.queue.done(&key);
        true
    }
}

impl<R: Reconciler> WorkerRunner for QueueWorker<R> {
    fn name(&self) -> &str {
        &self.name
    }

    fn worker_count(&self) -> usize {
        self.workers
    }

    fn run_worker(self: Arc<Self>, stop: CancellationToken, done: WorkerDone) -> BoxFuture<'static, ()> {
        self.worker_loop(stop, done).boxed()
    }

    fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Pushes the key of every changed object onto a queue.
pub struct EnqueueHandler {
    queue: Arc<WorkQueue>,
}

impl EnqueueHandler {
    pub fn new(queue: Arc<WorkQueue>) -> Arc<Self> {
        Arc::new(Self { queue })
    }
}

impl<K: kube::Resource> ResourceEventHandler<K> for EnqueueHandler {
    fn on_add(&self, obj: &K) {
        self.queue.add(ObjectKey::from_object(obj));
    }

    fn on_update(&self, _old: &K, new: &K) {
        self.queue.add(ObjectKey::from_object(new));
    }

    fn on_delete(&self, obj: &K) {
        self.queue.add(ObjectKey::from_object(obj));
    }
}
