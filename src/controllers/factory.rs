use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::api::{Api, PostParams};
use kube::runtime::watcher;
use tracing::debug;

use super::configmap::ConfigMapReconciler;
use super::job::JobReconciler;
use super::pgcluster::PgClusterReconciler;
use super::pgreplica::PgReplicaReconciler;
use super::pgtask::PgTaskReconciler;
use super::pod::{ClusterOfPod, PodReconciler};
use super::Context;
use crate::config::{LABEL_PG_CLUSTER, LABEL_PG_TASK};
use crate::manager::{
    ControllerGroup, EnqueueHandler, GroupFactory, Informer, QueueWorker, ResourceWatch, WorkQueue,
    WorkerRunner,
};
use crate::resources::{PgCluster, PgReplica, PgTask};
use crate::{Error, Result};

/// `(api group, resource)` of everything a namespace group lists and watches
const WATCHED_RESOURCES: [(&str, &str); 6] = [
    ("crunchydata.com", "pgclusters"),
    ("crunchydata.com", "pgtasks"),
    ("crunchydata.com", "pgreplicas"),
    ("", "pods"),
    ("", "configmaps"),
    ("batch", "jobs"),
];

fn list_review(namespace: &str, group: &str, resource: &str) -> SelfSubjectAccessReview {
    SelfSubjectAccessReview {
        spec: SelfSubjectAccessReviewSpec {
            resource_attributes: Some(ResourceAttributes {
                namespace: Some(namespace.into()),
                verb: Some("list".into()),
                group: Some(group.into()),
                resource: Some(resource.into()),
                ..Default::default()
            }),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Builds the controllers of a namespace, one per watched resource.
pub struct KubeGroupFactory {
    ctx: Arc<Context>,
}

impl KubeGroupFactory {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn can_list_all(&self, namespace: &str) -> Result<()> {
        let reviews: Api<SelfSubjectAccessReview> = Api::all(self.ctx.client.clone());
        for (group, resource) in WATCHED_RESOURCES {
            let review = reviews
                .create(&PostParams::default(), &list_review(namespace, group, resource))
                .await?;
            if !review.status.is_some_and(|s| s.allowed) {
                return Err(Error::MissingPrivileges {
                    namespace: namespace.into(),
                    resource: resource.into(),
                });
            }
        }
        debug!(%namespace, "operator may list every watched resource");
        Ok(())
    }
}

impl GroupFactory for KubeGroupFactory {
    fn build(&self, namespace: &str) -> Result<ControllerGroup> {
        let ctx = &self.ctx;
        let client = || ctx.client.clone();
        let counts = &ctx.config.workers;
        let labelled = |label: &str| watcher::Config::default().labels(label);
        let queue = |controller: &str| WorkQueue::new(format!("{namespace}/{controller}"));

        let clusters = Informer::new(
            format!("{namespace}/pgclusters"),
            Api::<PgCluster>::namespaced(client(), namespace),
            watcher::Config::default(),
        );
        let tasks = Informer::new(
            format!("{namespace}/pgtasks"),
            Api::<PgTask>::namespaced(client(), namespace),
            watcher::Config::default(),
        );
        let replicas = Informer::new(
            format!("{namespace}/pgreplicas"),
            Api::<PgReplica>::namespaced(client(), namespace),
            watcher::Config::default(),
        );
        let pods = Informer::new(
            format!("{namespace}/pods"),
            Api::<Pod>::namespaced(client(), namespace),
            labelled(LABEL_PG_CLUSTER),
        );
        let configmaps = Informer::with_resync(
            format!("{namespace}/configmaps"),
            Api::<ConfigMap>::namespaced(client(), namespace),
            labelled(LABEL_PG_CLUSTER),
            ctx.config.controller_group_refresh_interval,
        );
        let jobs = Informer::new(
            format!("{namespace}/jobs"),
            Api::<Job>::namespaced(client(), namespace),
            labelled(LABEL_PG_TASK),
        );

        let cluster_queue = queue("pgcluster");
        clusters.add_event_handler(EnqueueHandler::new(cluster_queue.clone()));
        let task_queue = queue("pgtask");
        tasks.add_event_handler(EnqueueHandler::new(task_queue.clone()));
        let replica_queue = queue("pgreplica");
        replicas.add_event_handler(EnqueueHandler::new(replica_queue.clone()));
        let pod_queue = queue("pod");
        pods.add_event_handler(ClusterOfPod::new(pod_queue.clone()));
        let configmap_queue = queue("configmap");
        configmaps.add_event_handler(EnqueueHandler::new(configmap_queue.clone()));
        let job_queue = queue("job");
        jobs.add_event_handler(EnqueueHandler::new(job_queue.clone()));

        let metrics = || ctx.metrics.clone();
        let workers: Vec<Arc<dyn WorkerRunner>> = vec![
            QueueWorker::new(
                "pgcluster",
                cluster_queue,
                Arc::new(PgClusterReconciler::new(clusters.store(), ctx.clone())),
                counts.pgcluster,
                metrics(),
            ),
            QueueWorker::new(
                "pgtask",
                task_queue,
                Arc::new(PgTaskReconciler::new(tasks.store(), ctx.clone())),
                counts.pgtask,
                metrics(),
            ),
            QueueWorker::new(
                "pgreplica",
                replica_queue,
                Arc::new(PgReplicaReconciler::new(replicas.store(), clusters.store(), ctx.clone())),
                counts.pgreplica,
                metrics(),
            ),
            QueueWorker::new(
                "pod",
                pod_queue,
                Arc::new(PodReconciler::new(pods.store(), clusters.store(), ctx.clone())),
                counts.pod,
                metrics(),
            ),
            QueueWorker::new(
                "configmap",
                configmap_queue,
                Arc::new(ConfigMapReconciler::new(configmaps.store(), clusters.store(), ctx.clone())),
                counts.configmap,
                metrics(),
            ),
            QueueWorker::new(
                "job",
                job_queue,
                Arc::new(JobReconciler::new(jobs.store(), ctx.clone())),
                counts.job,
                metrics(),
            ),
        ];
        let watches: Vec<Arc<dyn ResourceWatch>> = vec![clusters, tasks, replicas, pods, configmaps, jobs];

        Ok(ControllerGroup::new(namespace, watches, workers))
    }

    fn check_privileges<'a>(&'a self, namespace: &'a str) -> BoxFuture<'a, Result<()>> {
        self.can_list_all(namespace).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reviews_ask_to_list_in_the_namespace() {
        let review = list_review("team-a", "batch", "jobs");
        let attributes = review.spec.resource_attributes.unwrap();
        assert_eq!(attributes.namespace.as_deref(), Some("team-a"));
        assert_eq!(attributes.verb.as_deref(), Some("list"));
        assert_eq!(attributes.group.as_deref(), Some("batch"));
        assert_eq!(attributes.resource.as_deref(), Some("jobs"));
    }

    #[test]
    fn core_resources_use_the_empty_group() {
        assert!(WATCHED_RESOURCES
            .iter()
            .filter(|(_, resource)| *resource == "pods" || *resource == "configmaps")
            .all(|(group, _)| group.is_empty()));
    }
}
