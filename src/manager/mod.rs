use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{Error, Metrics, Result};

pub mod group;
pub mod key;
pub mod queue;
pub mod rate_limiter;
pub mod rolling;
pub mod watch;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use group::{ControllerGroup, GroupState, GroupStatus};
pub use key::ObjectKey;
pub use queue::WorkQueue;
pub use watch::{Informer, ResourceEventHandler, ResourceWatch};
pub use worker::{EnqueueHandler, QueueWorker, Reconciler, WorkerDone, WorkerRunner};

/// Builds the controller group for a namespace.
pub trait GroupFactory: Send + Sync {
    /// Construct watches, queues and workers. Nothing may be started yet.
    fn build(&self, namespace: &str) -> Result<ControllerGroup>;

    /// Whether the operator may list everything a group watches in `namespace`.
    fn check_privileges<'a>(&'a self, _namespace: &'a str) -> BoxFuture<'a, Result<()>> {
        futures::future::ready(Ok(())).boxed()
    }
}

enum GroupEntry {
    /// Registered, waiting for its builder
    Pending,
    Ready(ControllerGroup),
    /// Unregistered; whoever holds a stale handle must look the namespace up again
    Removed,
}

struct GroupSlot {
    /// Interrupts a cache-sync barrier in progress when the group is removed
    abort: Mutex<CancellationToken>,
    /// Removals that cancelled `abort` and have not finished yet
    removing: AtomicUsize,
    entry: tokio::sync::Mutex<GroupEntry>,
}

impl GroupSlot {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            abort: Mutex::new(CancellationToken::new()),
            removing: AtomicUsize::new(0),
            entry: tokio::sync::Mutex::new(GroupEntry::Pending),
        })
    }

    fn abort(&self) -> MutexGuard<'_, CancellationToken> {
        self.abort.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Announce a removal and interrupt any cache-sync barrier in progress.
    fn begin_removal(&self) -> Removal<'_> {
        self.removing.fetch_add(1, Ordering::SeqCst);
        self.abort().cancel();
        Removal(self)
    }

    /// Token for the next cache-sync barrier. A removal that was given up on
    /// before it finished leaves a cancelled token behind, which is replaced.
    fn sync_abort(&self) -> CancellationToken {
        let mut abort = self.abort();
        if abort.is_cancelled() && self.removing.load(Ordering::SeqCst) == 0 {
            *abort = CancellationToken::new();
        }
        abort.clone()
    }
}

struct Removal<'a>(&'a GroupSlot);

impl Drop for Removal<'_> {
    fn drop(&mut self) {
        self.0.removing.fetch_sub(1, Ordering::SeqCst);
    }
}

static NAMESPACE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("static regex"));

/// Namespaces are DNS-1123 labels.
pub fn validate_namespace(namespace: &str) -> Result<()> {
    if namespace.len() <= 63 && NAMESPACE_NAME.is_match(namespace) {
        Ok(())
    } else {
        Err(Error::InvalidNamespace(namespace.to_string()))
    }
}

/// Supervises one [`ControllerGroup`] per namespace.
///
/// The registry lock is only held for lookups and inserts. Everything slow
/// happens under the per-namespace slot lock, so calls for the same
/// namespace serialize while different namespaces proceed independently.
pub struct ControllerManager {
    groups: Mutex<HashMap<String, Arc<GroupSlot>>>,
    factory: Arc<dyn GroupFactory>,
    cache_sync_timeout: Duration,
    metrics: Metrics,
}

impl ControllerManager {
    pub fn new(factory: Arc<dyn GroupFactory>, cache_sync_timeout: Duration, metrics: Metrics) -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            factory,
            cache_sync_timeout,
            metrics,
        }
    }

    fn groups(&self) -> MutexGuard<'_, HashMap<String, Arc<GroupSlot>>> {
        self.groups.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self, namespace: &str) -> Option<Arc<GroupSlot>> {
        self.groups().get(namespace).cloned()
    }

    /// Drop `namespace` from the registry if it still maps to `slot`.
    fn unregister(&self, namespace: &str, slot: &Arc<GroupSlot>) {
        let mut groups = self.groups();
        if groups.get(namespace).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            groups.remove(namespace);
        }
    }

    /// Namespaces with a registered group, sorted.
    pub fn namespaces(&self) -> Vec<String> {
        let mut namespaces: Vec<String> = self.groups().keys().cloned().collect();
        namespaces.sort();
        namespaces
    }

    pub fn contains(&self, namespace: &str) -> bool {
        self.groups().contains_key(namespace)
    }

    /// Create the group for `namespace` unless one exists.
    pub async fn add_group(&self, namespace: &str) -> Result<()> {
        match self.try_add_group(namespace).await {
            Err(Error::ControllerGroupExists(_)) => Ok(()),
            other => other,
        }
    }

    async fn try_add_group(&self, namespace: &str) -> Result<()> {
        validate_namespace(namespace)?;
        loop {
            let slot = self
                .groups()
                .entry(namespace.to_string())
                .or_insert_with(GroupSlot::new)
                .clone();

            let mut entry = slot.entry.lock().await;
            match &*entry {
                GroupEntry::Ready(_) => {
                    debug!(namespace, "controller group already exists");
                    return Err(Error::ControllerGroupExists(namespace.to_string()));
                }
                GroupEntry::Removed => continue,
                GroupEntry::Pending => {}
            }

            return match self.factory.build(namespace) {
                Ok(group) => {
                    *entry = GroupEntry::Ready(group);
                    self.metrics.groups.inc();
                    debug!(namespace, "added controller group");
                    Ok(())
                }
                Err(err) => {
                    *entry = GroupEntry::Removed;
                    self.unregister(namespace, &slot);
                    error!(namespace, "unable to build controller group: {err}");
                    Err(err)
                }
            };
        }
    }

    /// Start the group for `namespace`. Unknown namespaces are ignored.
    pub async fn run_group(&self, namespace: &str) -> Result<()> {
        let Some(slot) = self.slot(namespace) else {
            debug!(namespace, "no controller group to run");
            return Ok(());
        };
        let mut entry = slot.entry.lock().await;
        let GroupEntry::Ready(group) = &mut *entry else {
            debug!(namespace, "controller group is not registered, not running it");
            return Ok(());
        };

        let privileges = self.factory.check_privileges(namespace).await;
        match (group.is_started(), privileges) {
            (true, Ok(())) => {
                debug!(namespace, "controller group already running");
                Ok(())
            }
            (true, Err(err)) => {
                warn!(namespace, "controller group lost its privileges, removing it: {err}");
                if let Err(stop_err) = self.remove_locked(namespace, &slot, &mut entry).await {
                    error!(namespace, "{stop_err}");
                }
                Err(err)
            }
            (false, Err(err)) => {
                warn!(namespace, "not starting controller group: {err}");
                Err(err)
            }
            (false, Ok(())) => match group.start(self.cache_sync_timeout, &slot.sync_abort()).await {
                Ok(()) => {
                    self.metrics.workers.add(group.worker_total() as i64);
                    Ok(())
                }
                Err(err) => {
                    // never leave a half-started group registered
                    if let Err(stop_err) = self.remove_locked(namespace, &slot, &mut entry).await {
                        error!(namespace, "{stop_err}");
                    }
                    Err(err)
                }
            },
        }
    }

    /// Ensure `namespace` has a running group. Safe to call on every event.
    pub async fn add_and_run_group(&self, namespace: &str) -> Result<()> {
        self.add_group(namespace).await?;
        self.run_group(namespace).await
    }

    /// Stop the group for `namespace`, drain its workers and unregister it.
    pub async fn remove_group(&self, namespace: &str) -> Result<()> {
        let Some(slot) = self.slot(namespace) else {
            debug!(namespace, "no controller group to remove");
            return Ok(());
        };
        let _removal = slot.begin_removal();
        let mut entry = slot.entry.lock().await;
        self.remove_locked(namespace, &slot, &mut entry).await
    }

    async fn remove_locked(&self, namespace: &str, slot: &Arc<GroupSlot>, entry: &mut GroupEntry) -> Result<()> {
        let result = match std::mem::replace(entry, GroupEntry::Removed) {
            GroupEntry::Ready(mut group) => {
                let started = group.is_started();
                let workers = group.worker_total() as i64;
                let stopped = group.stop().await;
                if started {
                    self.metrics.workers.sub(workers);
                }
                self.metrics.groups.dec();
                info!(namespace, "removed controller group");
                stopped
            }
            GroupEntry::Pending | GroupEntry::Removed => Ok(()),
        };
        self.unregister(namespace, slot);
        result
    }

    /// Run every registered group.
    pub async fn run_all(&self) -> Result<()> {
        let mut first = None;
        for namespace in self.namespaces() {
            if let Err(err) = self.run_group(&namespace).await {
                error!(namespace, "unable to run controller group: {err}");
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Remove every registered group.
    pub async fn remove_all(&self) -> Result<()> {
        let mut first = None;
        for namespace in self.namespaces() {
            if let Err(err) = self.remove_group(&namespace).await {
                error!(namespace, "unable to remove controller group: {err}");
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Status of every group. Groups busy starting or stopping are skipped.
    pub fn statuses(&self) -> Vec<GroupStatus> {
        let slots: Vec<Arc<GroupSlot>> = self.groups().values().cloned().collect();
        let mut statuses: Vec<GroupStatus> = slots
            .iter()
            .filter_map(|slot| match &*slot.entry.try_lock().ok()? {
                GroupEntry::Ready(group) => Some(group.status()),
                _ => None,
            })
            .collect();
        statuses.sort_by(|a, b| a.namespace.cmp(&b.namespace));
        statuses
    }

    /// State of the group for `namespace`, waiting for pending lifecycle calls.
    pub async fn group_state(&self, namespace: &str) -> Option<GroupState> {
        let slot = self.slot(namespace)?;
        let entry = slot.entry.lock().await;
        match &*entry {
            GroupEntry::Ready(group) => Some(group.state()),
            _ => None,
        }
    }
}
