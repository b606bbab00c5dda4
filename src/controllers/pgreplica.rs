//! Scales a cluster up for every `PgReplica` and back down when it is deleted.
//!
//! The replica count lives on the `PgCluster` spec, so the pgcluster
//! controller applies the change in place. Each replica leaves a marker
//! annotation on its cluster, written in the same optimistically locked patch
//! as the count, which keeps retries from scaling twice.

use std::sync::Arc;

use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Event as Finalizer};
use kube::runtime::reflector::Store;
use kube::ResourceExt;
use serde_json::{json, Value};
use tracing::{debug, info, instrument};

use crate::controllers::Context;
use crate::manager::{ObjectKey, Reconciler};
use crate::resources::{PgCluster, PgReplica, REPLICA_STATE_PENDING_INIT, REPLICA_STATE_PROCESSED};
use crate::{Error, Result};

pub static REPLICA_FINALIZER: &str = "pgreplicas.crunchydata.com";
const REPLICA_ANNOTATION_PREFIX: &str = "pgreplica.crunchydata.com/";

fn replica_annotation(replica: &str) -> String {
    format!("{REPLICA_ANNOTATION_PREFIX}{replica}")
}

/// The cluster has been taken over by the pgcluster controller.
fn is_initialized(cluster: &PgCluster) -> bool {
    cluster
        .status
        .as_ref()
        .is_some_and(|s| s.reconciled_spec.is_some())
}

fn is_counted(cluster: &PgCluster, replica: &str) -> bool {
    cluster.annotations().contains_key(&replica_annotation(replica))
}

/// Merge patch adding (`up`) or removing one replica together with its marker.
/// The resourceVersion makes a concurrent writer a conflict.
fn scale_patch(cluster: &PgCluster, replica: &str, up: bool) -> Value {
    let (replicas, marker) = if up {
        (cluster.spec.replicas + 1, Value::String("1".into()))
    } else {
        ((cluster.spec.replicas - 1).max(0), Value::Null)
    };
    json!({
        "metadata": {
            "resourceVersion": cluster.resource_version(),
            "annotations": { replica_annotation(replica): marker },
        },
        "spec": { "replicas": replicas },
    })
}

pub struct PgReplicaReconciler {
    replicas: Store<PgReplica>,
    clusters: Store<PgCluster>,
    ctx: Arc<Context>,
}

impl PgReplicaReconciler {
    pub fn new(replicas: Store<PgReplica>, clusters: Store<PgCluster>, ctx: Arc<Context>) -> Self {
        Self {
            replicas,
            clusters,
            ctx,
        }
    }

    fn cluster_of(&self, replica: &PgReplica) -> (ObjectKey, Option<Arc<PgCluster>>) {
        let key = ObjectKey::new(replica.namespace().unwrap_or_default(), &replica.spec.cluster_name);
        let cluster = self.clusters.get(&key.object_ref());
        (key, cluster)
    }

    async fn set_state(&self, replica: &PgReplica, state: &str, message: &str) -> Result<()> {
        let api: Api<PgReplica> =
            Api::namespaced(self.ctx.client.clone(), &replica.namespace().unwrap_or_default());
        api.patch_status(
            &replica.name_any(),
            &PatchParams::default(),
            &Patch::Merge(json!({ "status": { "state": state, "message": message } })),
        )
        .await?;
        Ok(())
    }

    async fn scale(&self, key: &ObjectKey, cluster: &PgCluster, replica: &str, up: bool) -> Result<()> {
        let api: Api<PgCluster> = Api::namespaced(self.ctx.client.clone(), &key.namespace);
        api.patch(
            &key.name,
            &PatchParams::default(),
            &Patch::Merge(scale_patch(cluster, replica, up)),
        )
        .await?;
        Ok(())
    }

    async fn scale_up(&self, replica: &PgReplica) -> Result<Action> {
        let name = replica.name_any();
        let (cluster_key, cluster) = self.cluster_of(replica);
        let Some(cluster) = cluster else {
            return Err(Error::ObjectDeleted {
                kind: "pgcluster",
                key: cluster_key.to_string(),
            });
        };
        if !is_initialized(&cluster) {
            self.set_state(
                replica,
                REPLICA_STATE_PENDING_INIT,
                "waiting for the cluster to be initialized",
            )
            .await?;
            return Err(Error::NotReady {
                message: format!("pgcluster {cluster_key} is not initialized"),
                reason: "ClusterPendingInit".into(),
            });
        }

        if is_counted(&cluster, &name) {
            debug!(replica = %name, cluster = %cluster_key, "replica already counted");
        } else {
            self.scale(&cluster_key, &cluster, &name, true).await?;
            info!(replica = %name, cluster = %cluster_key, "scaled cluster up");
        }
        if replica.status.as_ref().and_then(|s| s.state.as_deref()) != Some(REPLICA_STATE_PROCESSED) {
            self.set_state(replica, REPLICA_STATE_PROCESSED, "replica added to the cluster")
                .await?;
        }
        Ok(Action::await_change())
    }

    async fn scale_down(&self, replica: &PgReplica) -> Result<Action> {
        let name = replica.name_any();
        match self.cluster_of(replica) {
            (cluster_key, Some(cluster)) if is_counted(&cluster, &name) => {
                self.scale(&cluster_key, &cluster, &name, false).await?;
                info!(replica = %name, cluster = %cluster_key, "scaled cluster down");
            }
            (cluster_key, _) => debug!(replica = %name, cluster = %cluster_key, "nothing to scale down"),
        }
        Ok(Action::await_change())
    }
}

impl Reconciler for PgReplicaReconciler {
    #[instrument(skip(self), fields(controller = "pgreplica"))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<()> {
        let Some(replica) = self.replicas.get(&key.object_ref()) else {
            debug!(%key, "pgreplica is gone");
            return Ok(());
        };
        self.ctx.touch().await;

        let api: Api<PgReplica> = Api::namespaced(self.ctx.client.clone(), &key.namespace);
        finalizer(&api, REPLICA_FINALIZER, replica, |event| async move {
            match event {
                Finalizer::Apply(replica) => self.scale_up(&replica).await,
                Finalizer::Cleanup(replica) => self.scale_down(&replica).await,
            }
        })
        .await
        .map_err(|err| Error::FinalizerError(Box::new(err)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{PgClusterSpec, PgClusterStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn cluster(replicas: i32, annotations: &[&str]) -> PgCluster {
        let mut cluster = PgCluster::new(
            "cluster1",
            PgClusterSpec {
                replicas,
                ..Default::default()
            },
        );
        cluster.metadata = ObjectMeta {
            name: Some("cluster1".into()),
            namespace: Some("team-a".into()),
            resource_version: Some("7".into()),
            annotations: Some(
                annotations
                    .iter()
                    .map(|r| (replica_annotation(r), "1".to_string()))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        };
        cluster
    }

    #[test]
    fn clusters_are_initialized_once_reconciled() {
        let mut c = cluster(1, &[]);
        assert!(!is_initialized(&c));
        c.status = Some(PgClusterStatus {
            reconciled_spec: Some(c.spec.clone()),
            ..Default::default()
        });
        assert!(is_initialized(&c));
    }

    #[test]
    fn scaling_up_marks_the_replica_under_a_version_check() {
        let c = cluster(1, &[]);
        assert!(!is_counted(&c, "cluster1-rpl1"));
        assert_eq!(
            scale_patch(&c, "cluster1-rpl1", true),
            json!({
                "metadata": {
                    "resourceVersion": "7",
                    "annotations": { "pgreplica.crunchydata.com/cluster1-rpl1": "1" },
                },
                "spec": { "replicas": 2 },
            })
        );
    }

    #[test]
    fn scaling_down_clears_the_marker_and_never_goes_negative() {
        let c = cluster(0, &["cluster1-rpl1"]);
        assert!(is_counted(&c, "cluster1-rpl1"));
        let patch = scale_patch(&c, "cluster1-rpl1", false);
        assert_eq!(patch["spec"]["replicas"], json!(0));
        assert_eq!(
            patch["metadata"]["annotations"]["pgreplica.crunchydata.com/cluster1-rpl1"],
            Value::Null
        );
    }
}
