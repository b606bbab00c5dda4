use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::watch::{wait_for_cache_sync, ResourceWatch};
use super::worker::{WorkerDone, WorkerExit, WorkerRunner};
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupState {
    /// Watches, queues and workers exist, nothing runs yet.
    Created,
    /// Caches are synced and every worker loop has been launched.
    Running,
    /// Drained. A stopped group is never restarted; build a new one instead.
    Stopped,
}

/// Snapshot of a group for the diagnostics endpoint
#[derive(Clone, Debug, Serialize)]
pub struct GroupStatus {
    pub namespace: String,
    pub state: GroupState,
    pub workers: usize,
    pub queued: usize,
}

/// The watches and workers that serve one namespace.
pub struct ControllerGroup {
    namespace: String,
    state: GroupState,
    stop: CancellationToken,
    done_tx: mpsc::UnboundedSender<WorkerExit>,
    done_rx: mpsc::UnboundedReceiver<WorkerExit>,
    watches: Vec<Arc<dyn ResourceWatch>>,
    workers: Vec<Arc<dyn WorkerRunner>>,
    watch_tasks: Vec<JoinHandle<()>>,
    worker_tasks: JoinSet<()>,
}

impl ControllerGroup {
    pub fn new(
        namespace: impl Into<String>,
        watches: Vec<Arc<dyn ResourceWatch>>,
        workers: Vec<Arc<dyn WorkerRunner>>,
    ) -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self {
            namespace: namespace.into(),
            state: GroupState::Created,
            stop: CancellationToken::new(),
            done_tx,
            done_rx,
            watches,
            workers,
            watch_tasks: Vec::new(),
            worker_tasks: JoinSet::new(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn state(&self) -> GroupState {
        self.state
    }

    pub fn is_started(&self) -> bool {
        self.state == GroupState::Running
    }

    /// Number of worker loops a started group runs.
    pub fn worker_total(&self) -> usize {
        self.workers.iter().map(|w| w.worker_count()).sum()
    }

    pub fn status(&self) -> GroupStatus {
        GroupStatus {
            namespace: self.namespace.clone(),
            state: self.state,
            workers: if self.is_started() { self.worker_total() } else { 0 },
            queued: self.workers.iter().map(|w| w.queue_len()).sum(),
        }
    }

    /// Start the watches, wait for their caches and launch every worker.
    ///
    /// Cancelling `abort` gives up on the cache-sync barrier. On any failure
    /// the group is torn down and ends up [`GroupState::Stopped`].
    pub async fn start(&mut self, sync_timeout: Duration, abort: &CancellationToken) -> Result<()> {
        match self.state {
            GroupState::Running => {
                debug!(namespace = %self.namespace, "controller group already running");
                return Ok(());
            }
            GroupState::Stopped => return Err(Error::GroupStopped(self.namespace.clone())),
            GroupState::Created => {}
        }

        for watch in &self.watches {
            debug!(namespace = %self.namespace, watch = watch.name(), "starting watch");
            self.watch_tasks.push(watch.start(self.stop.clone()));
        }

        // caches that are already synced win over a concurrent abort
        let synced = tokio::select! {
            biased;
            synced = tokio::time::timeout(sync_timeout, wait_for_cache_sync(&self.watches, &self.stop)) => synced,
            _ = abort.cancelled() => Ok(false),
        };
        let failure = match synced {
            Ok(true) => None,
            Ok(false) => Some(Error::CacheSyncAborted(self.namespace.clone())),
            Err(_) => Some(Error::CacheSyncTimeout {
                namespace: self.namespace.clone(),
                timeout: sync_timeout,
            }),
        };
        if let Some(err) = failure {
            error!(namespace = %self.namespace, "controller group failed to start: {err}");
            self.stop.cancel();
            self.join_watches().await;
            self.state = GroupState::Stopped;
            return Err(err);
        }
        debug!(namespace = %self.namespace, "caches synced");

        for runner in &self.workers {
            for replica in 0..runner.worker_count() {
                let done = WorkerDone::new(format!("{}-{replica}", runner.name()), self.done_tx.clone());
                self.worker_tasks
                    .spawn(runner.clone().run_worker(self.stop.clone(), done));
            }
        }
        self.state = GroupState::Running;
        info!(
            namespace = %self.namespace,
            workers = self.worker_total(),
            "controller group started"
        );
        Ok(())
    }

    /// Signal stop and wait until every launched worker has reported done.
    ///
    /// A worker that ignores the stop signal keeps this pending forever.
    pub async fn stop(&mut self) -> Result<()> {
        match self.state {
            GroupState::Created => {
                debug!(namespace = %self.namespace, "controller group never started, nothing to drain");
                self.state = GroupState::Stopped;
                return Ok(());
            }
            GroupState::Stopped => return Ok(()),
            GroupState::Running => {}
        }

        let expected = self.worker_total();
        info!(namespace = %self.namespace, workers = expected, "stopping controller group");
        self.stop.cancel();

        for remaining in (0..expected).rev() {
            // the group holds a sender, so this only yields reports
            let Some(exit) = self.done_rx.recv().await else {
                break;
            };
            debug!(namespace = %self.namespace, worker = %exit.worker, remaining, "worker done");
        }

        let mut panicked = 0;
        while let Some(joined) = self.worker_tasks.join_next().await {
            if let Err(err) = joined {
                if err.is_panic() {
                    panicked += 1;
                }
            }
        }
        self.join_watches().await;
        self.state = GroupState::Stopped;
        info!(namespace = %self.namespace, "controller group stopped");

        if panicked > 0 {
            return Err(Error::WorkerPanicked {
                namespace: self.namespace.clone(),
                count: panicked,
            });
        }
        Ok(())
    }

    async fn join_watches(&mut self) {
        for task in self.watch_tasks.drain(..) {
            if let Err(err) = task.await {
                warn!(namespace = %self.namespace, "watch task failed: {err}");
            }
        }
    }
}

impl Drop for ControllerGroup {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
