//! In-process fakes for exercising the supervisor without a cluster.

use std::collections::{HashMap, HashSet};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::group::ControllerGroup;
use super::key::ObjectKey;
use super::queue::WorkQueue;
use super::watch::ResourceWatch;
use super::worker::{QueueWorker, Reconciler, WorkerDone, WorkerRunner};
use super::GroupFactory;
use crate::{Error, Metrics, Result};

pub struct FakeWatch {
    name: String,
    synced: AtomicBool,
    started: AtomicUsize,
    running: Arc<AtomicUsize>,
}

impl FakeWatch {
    pub fn synced(name: &str) -> Arc<Self> {
        Self::build(name, true)
    }

    pub fn unsynced(name: &str) -> Arc<Self> {
        Self::build(name, false)
    }

    fn build(name: &str, synced: bool) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            synced: AtomicBool::new(synced),
            started: AtomicUsize::new(0),
            running: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn set_synced(&self) {
        self.synced.store(true, Ordering::SeqCst);
    }

    pub fn times_started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) > 0
    }
}

impl ResourceWatch for FakeWatch {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self, stop: CancellationToken) -> JoinHandle<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.running.fetch_add(1, Ordering::SeqCst);
        let running = self.running.clone();
        tokio::spawn(async move {
            stop.cancelled().await;
            running.fetch_sub(1, Ordering::SeqCst);
        })
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, Debug)]
pub enum Outcome {
    Ok,
    Transient,
    Permanent,
    Panic,
}

/// Records every invocation and how many workers held a key at once.
pub struct ScriptedReconciler {
    script: Mutex<Vec<Outcome>>,
    fallback: Outcome,
    delay: Option<Duration>,
    calls: Mutex<HashMap<ObjectKey, usize>>,
    in_flight: Mutex<HashMap<ObjectKey, usize>>,
    max_concurrent: AtomicUsize,
    total: AtomicUsize,
    notify: Notify,
}

impl ScriptedReconciler {
    fn build(script: Vec<Outcome>, fallback: Outcome, delay: Option<Duration>) -> Arc<Self> {
        let mut script = script;
        script.reverse();
        Arc::new(Self {
            script: Mutex::new(script),
            fallback,
            delay,
            calls: Mutex::default(),
            in_flight: Mutex::default(),
            max_concurrent: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
            notify: Notify::new(),
        })
    }

    pub fn always(outcome: Outcome) -> Arc<Self> {
        Self::build(Vec::new(), outcome, None)
    }

    /// Plays `script` in order, then succeeds.
    pub fn sequence(script: Vec<Outcome>) -> Arc<Self> {
        Self::build(script, Outcome::Ok, None)
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Self::build(Vec::new(), Outcome::Ok, Some(delay))
    }

    pub fn calls_for(&self, key: &ObjectKey) -> usize {
        self.calls.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_per_key(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    pub async fn wait_for_calls(&self, n: usize) {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();
            if self.total_calls() >= n {
                return;
            }
            notified.await;
        }
    }

    fn enter(&self, key: &ObjectKey) -> InFlight<'_> {
        let mut in_flight = self.in_flight.lock().unwrap();
        let count = in_flight.entry(key.clone()).or_insert(0);
        *count += 1;
        self.max_concurrent.fetch_max(*count, Ordering::SeqCst);
        InFlight {
            reconciler: self,
            key: key.clone(),
        }
    }
}

struct InFlight<'a> {
    reconciler: &'a ScriptedReconciler,
    key: ObjectKey,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(count) = self.reconciler.in_flight.lock().unwrap().get_mut(&self.key) {
            *count -= 1;
        }
    }
}

impl Reconciler for ScriptedReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> Result<()> {
        let _guard = self.enter(key);
        let outcome = self.script.lock().unwrap().pop().unwrap_or(self.fallback);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        *self.calls.lock().unwrap().entry(key.clone()).or_insert(0) += 1;
        self.total.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
        match outcome {
            Outcome::Ok => Ok(()),
            Outcome::Transient => Err(Error::NotReady {
                message: format!("{key} is not ready"),
                reason: "Testing".into(),
            }),
            Outcome::Permanent => Err(Error::InvalidSpec(format!("{key} is malformed"))),
            Outcome::Panic => panic!("reconciling {key} blew up"),
        }
    }
}

/// A runner whose workers ignore the stop signal.
pub struct StuckRunner;

impl WorkerRunner for StuckRunner {
    fn name(&self) -> &str {
        "stuck"
    }

    fn worker_count(&self) -> usize {
        1
    }

    fn run_worker(self: Arc<Self>, _stop: CancellationToken, done: WorkerDone) -> BoxFuture<'static, ()> {
        async move {
            std::future::pending::<()>().await;
            done.report();
        }
        .boxed()
    }
}

/// Everything a [`FakeFactory`] built for one namespace.
#[derive(Clone)]
pub struct BuiltGroup {
    pub watch: Arc<FakeWatch>,
    pub queue: Arc<WorkQueue>,
    pub reconciler: Arc<ScriptedReconciler>,
}

#[derive(Default)]
pub struct FakeFactory {
    workers: usize,
    unsynced: bool,
    stuck: bool,
    broken: HashSet<String>,
    unprivileged: Mutex<HashSet<String>>,
    built: Mutex<HashMap<String, Vec<BuiltGroup>>>,
}

impl FakeFactory {
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            ..Default::default()
        }
    }

    /// Watches never finish their initial list.
    pub fn unsynced(mut self) -> Self {
        self.unsynced = true;
        self
    }

    /// Every group carries a worker that never exits.
    pub fn stuck(mut self) -> Self {
        self.stuck = true;
        self
    }

    /// Building a group for `namespace` fails.
    pub fn broken(mut self, namespace: &str) -> Self {
        self.broken.insert(namespace.to_string());
        self
    }

    /// Groups built for `namespace`, oldest first.
    pub fn built(&self, namespace: &str) -> Vec<BuiltGroup> {
        self.built.lock().unwrap().get(namespace).cloned().unwrap_or_default()
    }

    pub fn latest(&self, namespace: &str) -> BuiltGroup {
        self.built(namespace).pop().expect("no group built for namespace")
    }

    pub fn revoke(&self, namespace: &str) {
        self.unprivileged.lock().unwrap().insert(namespace.to_string());
    }
}

impl GroupFactory for FakeFactory {
    fn build(&self, namespace: &str) -> Result<ControllerGroup> {
        if self.broken.contains(namespace) {
            return Err(Error::InvalidSpec(format!("cannot build clients for {namespace}")));
        }
        let watch = if self.unsynced {
            FakeWatch::unsynced("pgclusters")
        } else {
            FakeWatch::synced("pgclusters")
        };
        let queue = WorkQueue::new(format!("{namespace}-pgclusters"));
        let reconciler = ScriptedReconciler::always(Outcome::Ok);
        let worker = QueueWorker::new(
            "pgcluster",
            queue.clone(),
            reconciler.clone(),
            self.workers,
            Metrics::default(),
        );
        let mut workers: Vec<Arc<dyn WorkerRunner>> = vec![worker];
        if self.stuck {
            workers.push(Arc::new(StuckRunner));
        }
        self.built
            .lock()
            .unwrap()
            .entry(namespace.to_string())
            .or_default()
            .push(BuiltGroup {
                watch: watch.clone(),
                queue,
                reconciler,
            });
        Ok(ControllerGroup::new(namespace, vec![watch], workers))
    }

    fn check_privileges<'a>(&'a self, namespace: &'a str) -> BoxFuture<'a, Result<()>> {
        let denied = self.unprivileged.lock().unwrap().contains(namespace);
        async move {
            if denied {
                Err(Error::MissingPrivileges {
                    namespace: namespace.to_string(),
                    resource: "pgclusters".into(),
                })
            } else {
                Ok(())
            }
        }
        .boxed()
    }
}
