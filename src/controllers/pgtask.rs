use std::sync::Arc;

use kube::api::{Api, Patch, PatchParams};
use kube::runtime::reflector::Store;
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, info, instrument};

use crate::controllers::pgcluster::statefulset::{self, StatefulSetWorkload, ANNOTATION_RESTARTED_AT};
use crate::controllers::Context;
use crate::manager::rolling::UpdatePlan;
use crate::manager::{ObjectKey, Reconciler};
use crate::resources::{
    PgCluster, PgTask, TaskType, TASK_STATE_COMPLETED, TASK_STATE_FAILED, TASK_STATE_PROCESSED,
};
use crate::{Error, Result};

fn is_finished(state: Option<&str>) -> bool {
    matches!(state, Some(TASK_STATE_COMPLETED | TASK_STATE_FAILED))
}

/// Runs one-off tasks against a cluster.
pub struct PgTaskReconciler {
    store: Store<PgTask>,
    ctx: Arc<Context>,
}

impl PgTaskReconciler {
    pub fn new(store: Store<PgTask>, ctx: Arc<Context>) -> Self {
        Self { store, ctx }
    }

    async fn set_state(&self, key: &ObjectKey, state: &str, message: Option<String>) -> Result<()> {
        let api: Api<PgTask> = Api::namespaced(self.ctx.client.clone(), &key.namespace);
        api.patch_status(
            &key.name,
            &PatchParams::default(),
            &Patch::Merge(json!({ "status": { "state": state, "message": message } })),
        )
        .await?;
        Ok(())
    }

    async fn fail(&self, key: &ObjectKey, err: Error) -> Result<()> {
        self.set_state(key, TASK_STATE_FAILED, Some(err.to_string())).await?;
        Err(err)
    }

    /// Restart every instance of the target cluster in a single rollout.
    async fn rolling_update(&self, key: &ObjectKey, task: &PgTask) -> Result<()> {
        let clusters: Api<PgCluster> = Api::namespaced(self.ctx.client.clone(), &key.namespace);
        let Some(cluster) = clusters.get_opt(&task.spec.cluster).await? else {
            return self
                .fail(
                    key,
                    Error::ObjectDeleted {
                        kind: "pgcluster",
                        key: ObjectKey::new(&key.namespace, &task.spec.cluster).to_string(),
                    },
                )
                .await;
        };

        let timeout = self.ctx.config.rollout_timeout;
        let workload = StatefulSetWorkload::new(
            self.ctx.client.clone(),
            &key.namespace,
            &cluster.statefulset_name(),
            &cluster.name_any(),
            timeout,
        );
        // stamping the task uid keeps a retried task from restarting the cluster twice
        let stamp = task.uid().unwrap_or_else(|| task.name_any());
        let mut plan = UpdatePlan::new();
        plan.disruptive("restart", move |sts| {
            statefulset::set_template_annotation(sts, ANNOTATION_RESTARTED_AT, &stamp)
        });
        plan.execute(&workload, timeout).await?.into_result()?;

        info!(%key, cluster = %task.spec.cluster, "rolling update finished");
        self.set_state(key, TASK_STATE_COMPLETED, None).await
    }
}

impl Reconciler for PgTaskReconciler {
    #[instrument(skip(self), fields(controller = "pgtask"))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<()> {
        let Some(task) = self.store.get(&key.object_ref()) else {
            debug!(%key, "pgtask is gone");
            return Ok(());
        };
        let state = task.status.as_ref().and_then(|s| s.state.as_deref());
        if is_finished(state) {
            return Ok(());
        }
        self.ctx.touch().await;
        if state != Some(TASK_STATE_PROCESSED) {
            self.set_state(key, TASK_STATE_PROCESSED, None).await?;
        }

        match task.spec.task_type {
            TaskType::RollingUpdate => self.rolling_update(key, &task).await,
            TaskType::Unknown => {
                self.fail(key, Error::InvalidSpec("unknown task type".into()))
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::PgTaskSpec;

    #[test]
    fn only_completed_and_failed_are_final() {
        assert!(!is_finished(None));
        assert!(!is_finished(Some(TASK_STATE_PROCESSED)));
        assert!(is_finished(Some(TASK_STATE_COMPLETED)));
        assert!(is_finished(Some(TASK_STATE_FAILED)));
    }

    #[test]
    fn unrecognised_task_types_deserialize_as_unknown() {
        let spec: PgTaskSpec =
            serde_json::from_value(json!({ "cluster": "cluster1", "taskType": "backup" })).unwrap();
        assert_eq!(spec.task_type, TaskType::Unknown);

        let spec: PgTaskSpec =
            serde_json::from_value(json!({ "cluster": "cluster1", "taskType": "rollingUpdate" })).unwrap();
        assert_eq!(spec.task_type, TaskType::RollingUpdate);
        assert!(spec.parameters.is_empty());
    }
}
