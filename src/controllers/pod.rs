use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::reflector::Store;
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, instrument};

use crate::config::LABEL_PG_CLUSTER;
use crate::controllers::Context;
use crate::manager::{ObjectKey, Reconciler, ResourceEventHandler, WorkQueue};
use crate::resources::PgCluster;
use crate::Result;

/// Queues the cluster a database pod belongs to, rather than the pod itself.
pub struct ClusterOfPod {
    queue: Arc<WorkQueue>,
}

impl ClusterOfPod {
    pub fn new(queue: Arc<WorkQueue>) -> Arc<Self> {
        Arc::new(Self { queue })
    }

    fn enqueue(&self, pod: &Pod) {
        if let (Some(namespace), Some(cluster)) = (pod.namespace(), pod.labels().get(LABEL_PG_CLUSTER)) {
            self.queue.add(ObjectKey::new(namespace, cluster));
        }
    }
}

impl ResourceEventHandler<Pod> for ClusterOfPod {
    fn on_add(&self, pod: &Pod) {
        self.enqueue(pod);
    }

    fn on_update(&self, old: &Pod, new: &Pod) {
        if is_ready(old) != is_ready(new) || old.labels() != new.labels() {
            self.enqueue(old);
            self.enqueue(new);
        }
    }

    fn on_delete(&self, pod: &Pod) {
        self.enqueue(pod);
    }
}

fn is_ready(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_none()
        && pod
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .is_some_and(|conditions| conditions.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
}

/// Ready database pods of `cluster` among `pods`
fn ready_pods<'a>(pods: impl IntoIterator<Item = &'a Pod>, namespace: &str, cluster: &str) -> i32 {
    let count = pods
        .into_iter()
        .filter(|pod| pod.namespace().as_deref() == Some(namespace))
        .filter(|pod| pod.labels().get(LABEL_PG_CLUSTER).map(String::as_str) == Some(cluster))
        .filter(|pod| is_ready(pod))
        .count();
    i32::try_from(count).unwrap_or(i32::MAX)
}

/// Keeps `status.readyReplicas` of every cluster current. Keys are cluster keys.
pub struct PodReconciler {
    pods: Store<Pod>,
    clusters: Store<PgCluster>,
    ctx: Arc<Context>,
}

impl PodReconciler {
    pub fn new(pods: Store<Pod>, clusters: Store<PgCluster>, ctx: Arc<Context>) -> Self {
        Self { pods, clusters, ctx }
    }
}

impl Reconciler for PodReconciler {
    #[instrument(skip(self), fields(controller = "pod"))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<()> {
        let Some(cluster) = self.clusters.get(&key.object_ref()) else {
            debug!(%key, "pod belongs to an unknown cluster");
            return Ok(());
        };
        let pods = self.pods.state();
        let ready = ready_pods(pods.iter().map(|p| p.as_ref()), &key.namespace, &key.name);
        if cluster.status.as_ref().and_then(|s| s.ready_replicas) == Some(ready) {
            return Ok(());
        }

        self.ctx.touch().await;
        debug!(%key, ready, "updating ready replicas");
        let api: Api<PgCluster> = Api::namespaced(self.ctx.client.clone(), &key.namespace);
        api.patch_status(
            &key.name,
            &PatchParams::default(),
            &Patch::Merge(json!({ "status": { "readyReplicas": ready } })),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use std::collections::BTreeMap;

    fn pod(name: &str, namespace: &str, cluster: &str, ready: bool) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(namespace.into()),
                labels: Some(BTreeMap::from([(LABEL_PG_CLUSTER.into(), cluster.into())])),
                ..Default::default()
            },
            spec: None,
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "Ready".into(),
                    status: if ready { "True" } else { "False" }.into(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn counts_ready_pods_of_one_cluster() {
        let mut terminating = pod("c1-2", "team-a", "c1", true);
        terminating.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        let pods = [
            pod("c1-0", "team-a", "c1", true),
            pod("c1-1", "team-a", "c1", false),
            terminating,
            pod("c2-0", "team-a", "c2", true),
            pod("c1-0", "team-b", "c1", true),
        ];
        assert_eq!(ready_pods(&pods, "team-a", "c1"), 1);
        assert_eq!(ready_pods(&pods, "team-b", "c1"), 1);
        assert_eq!(ready_pods(&pods, "team-a", "c3"), 0);
    }

    #[tokio::test]
    async fn pod_events_queue_their_cluster() {
        let queue = WorkQueue::new("pod");
        let handler = ClusterOfPod::new(queue.clone());

        handler.on_add(&pod("c1-0", "team-a", "c1", false));
        // readiness flip
        handler.on_update(&pod("c1-0", "team-a", "c1", false), &pod("c1-0", "team-a", "c1", true));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some(ObjectKey::new("team-a", "c1")));

        let mut unlabelled = pod("other", "team-a", "c1", true);
        unlabelled.metadata.labels = None;
        handler.on_add(&unlabelled);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn unchanged_readiness_is_ignored() {
        let queue = WorkQueue::new("pod");
        let handler = ClusterOfPod::new(queue.clone());
        handler.on_update(&pod("c1-0", "team-a", "c1", true), &pod("c1-0", "team-a", "c1", true));
        assert!(queue.is_empty());
    }
}
