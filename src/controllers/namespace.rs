//! Adds and removes controller groups as labelled namespaces come and go.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::reflector::Store;
use kube::runtime::watcher;
use kube::{Api, Client};
use tracing::{info, instrument};

use crate::config::{OperatorConfig, LABEL_INSTALLATION_NAME};
use crate::manager::{
    ControllerGroup, ControllerManager, EnqueueHandler, Informer, ObjectKey, QueueWorker, Reconciler,
    ResourceWatch, WorkQueue, WorkerRunner,
};
use crate::{Metrics, Result};

/// Name of the group running the namespace controller, which spans all namespaces.
pub const NAMESPACE_GROUP: &str = "*";

fn is_terminating(ns: &Namespace) -> bool {
    ns.metadata.deletion_timestamp.is_some()
        || ns
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .is_some_and(|phase| phase == "Terminating")
}

pub struct NamespaceReconciler {
    store: Store<Namespace>,
    manager: Arc<ControllerManager>,
}

impl NamespaceReconciler {
    pub fn new(store: Store<Namespace>, manager: Arc<ControllerManager>) -> Self {
        Self { store, manager }
    }
}

impl Reconciler for NamespaceReconciler {
    #[instrument(skip(self), fields(controller = "namespace"))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<()> {
        match self.store.get(&key.object_ref()) {
            Some(ns) if !is_terminating(&ns) => self.manager.add_and_run_group(&key.name).await,
            _ => {
                if self.manager.contains(&key.name) {
                    info!(namespace = %key.name, "namespace is going away");
                }
                self.manager.remove_group(&key.name).await
            }
        }
    }
}

/// The group watching namespaces labelled with this installation's name.
pub fn namespace_group(
    client: Client,
    manager: Arc<ControllerManager>,
    config: &OperatorConfig,
    metrics: Metrics,
) -> ControllerGroup {
    let selector = format!("{LABEL_INSTALLATION_NAME}={}", config.installation_name);
    let informer = Informer::with_resync(
        "namespaces",
        Api::<Namespace>::all(client),
        watcher::Config::default().labels(&selector),
        config.namespace_refresh_interval,
    );
    let queue = WorkQueue::new("namespace");
    informer.add_event_handler(EnqueueHandler::new(queue.clone()));

    let reconciler = Arc::new(NamespaceReconciler::new(informer.store(), manager));
    let worker = QueueWorker::new("namespace", queue, reconciler, config.workers.namespace, metrics);

    let watches: Vec<Arc<dyn ResourceWatch>> = vec![informer];
    let workers: Vec<Arc<dyn WorkerRunner>> = vec![worker];
    ControllerGroup::new(NAMESPACE_GROUP, watches, workers)
}
