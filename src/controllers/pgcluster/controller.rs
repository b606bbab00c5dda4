use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::StatefulSet;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::events::{Event, EventType};
use kube::runtime::reflector::Store;
use kube::{Resource, ResourceExt};
use serde_json::{json, Map, Value};
use tracing::{debug, info, instrument, warn};

use super::diff::{diff, SpecChange};
use super::statefulset::{self, StatefulSetWorkload};
use crate::controllers::Context;
use crate::manager::rolling::{Executed, UpdatePlan};
use crate::manager::{ObjectKey, Reconciler};
use crate::resources::{PgCluster, PgClusterSpec, CLUSTER_STATE_PROCESSED};
use crate::Result;

/// Converges a cluster's StatefulSet with changes to its `PgCluster`.
pub struct PgClusterReconciler {
    store: Store<PgCluster>,
    ctx: Arc<Context>,
}

impl PgClusterReconciler {
    pub fn new(store: Store<PgCluster>, ctx: Arc<Context>) -> Self {
        Self { store, ctx }
    }

    async fn patch_status(&self, key: &ObjectKey, status: Value) -> Result<()> {
        let api: Api<PgCluster> = Api::namespaced(self.ctx.client.clone(), &key.namespace);
        api.patch_status(
            &key.name,
            &PatchParams::default(),
            &Patch::Merge(json!({ "status": status })),
        )
        .await?;
        Ok(())
    }

    async fn publish(&self, cluster: &PgCluster, type_: EventType, reason: &str, note: String) {
        let published = self
            .ctx
            .recorder
            .publish(
                &Event {
                    type_,
                    reason: reason.into(),
                    note: Some(note),
                    action: "Reconcile".into(),
                    secondary: None,
                },
                &cluster.object_ref(&()),
            )
            .await;
        if let Err(err) = published {
            warn!(pgcluster = %cluster.name_any(), reason, "unable to publish event: {err}");
        }
    }

    async fn update(&self, key: &ObjectKey, cluster: &PgCluster, old: &PgClusterSpec) -> Result<()> {
        let changes = match diff(old, &cluster.spec) {
            Ok(changes) => changes,
            Err(err) => {
                self.patch_status(key, json!({ "message": err.to_string() })).await?;
                self.publish(cluster, EventType::Warning, "InvalidUpdate", err.to_string())
                    .await;
                return Err(err);
            }
        };
        let what: Vec<&str> = changes.iter().map(SpecChange::describe).collect();
        info!(%key, changes = ?what, "pgcluster spec changed");

        let sts: Api<StatefulSet> = Api::namespaced(self.ctx.client.clone(), &key.namespace);
        let name = cluster.statefulset_name();
        let plan = plan_update(&sts, &name, old, &cluster.spec, changes);
        let workload = StatefulSetWorkload::new(
            self.ctx.client.clone(),
            &key.namespace,
            &name,
            &key.name,
            self.ctx.config.rollout_timeout,
        );
        let executed = plan.execute(&workload, self.ctx.config.rollout_timeout).await?;

        // recorded before anything else can fail so a retry never repeats the rollout
        let applied = applied_spec(old, &cluster.spec, &executed);
        self.patch_status(
            key,
            json!({ "message": Value::Null, "reconciledSpec": applied }),
        )
        .await?;
        self.publish(
            cluster,
            EventType::Normal,
            "Updated",
            format!("Applied changes to {}", what.join(", ")),
        )
        .await;
        executed.into_result()
    }
}

impl Reconciler for PgClusterReconciler {
    #[instrument(skip(self), fields(controller = "pgcluster"))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<()> {
        let Some(cluster) = self.store.get(&key.object_ref()) else {
            debug!(%key, "pgcluster is gone");
            return Ok(());
        };
        self.ctx.touch().await;

        match cluster.status.as_ref().and_then(|s| s.reconciled_spec.as_ref()) {
            None => {
                info!(%key, "taking ownership of pgcluster");
                self.patch_status(
                    key,
                    json!({ "state": CLUSTER_STATE_PROCESSED, "reconciledSpec": cluster.spec }),
                )
                .await
            }
            Some(old) if old == &cluster.spec => Ok(()),
            Some(old) => self.update(key, &cluster, old).await,
        }
    }
}

/// JSON merge patch turning `old` into `new`; removed keys become null.
fn map_patch(old: &BTreeMap<String, String>, new: &BTreeMap<String, String>) -> Value {
    let mut patch = Map::new();
    for key in old.keys().filter(|k| !new.contains_key(*k)) {
        patch.insert(key.clone(), Value::Null);
    }
    for (key, value) in new {
        if old.get(key) != Some(value) {
            patch.insert(key.clone(), Value::String(value.clone()));
        }
    }
    Value::Object(patch)
}

fn statefulset_replicas(replicas: i32) -> i32 {
    // the primary plus its replicas
    replicas + 1
}

fn merge_patch<'a>(sts: &Api<StatefulSet>, name: &str, patch: Value) -> futures::future::BoxFuture<'a, Result<()>> {
    let (sts, name) = (sts.clone(), name.to_string());
    Box::pin(async move {
        sts.patch(&name, &PatchParams::default(), &Patch::Merge(patch)).await?;
        Ok(())
    })
}

/// In-place patch of the StatefulSet for a non-disruptive change.
fn statefulset_patch(change: &SpecChange, old: &PgClusterSpec, new: &PgClusterSpec) -> Option<Value> {
    match change {
        SpecChange::Labels => Some(json!({
            "metadata": { "labels": map_patch(&old.user_labels, &new.user_labels) }
        })),
        SpecChange::Annotations => Some(json!({
            "metadata": { "annotations": map_patch(&old.annotations, &new.annotations) }
        })),
        SpecChange::Replicas(replicas) => Some(json!({
            "spec": { "replicas": statefulset_replicas(*replicas) }
        })),
        _ => None,
    }
}

type TemplateChange = Box<dyn FnOnce(&mut StatefulSet) -> Result<()> + Send>;

/// Instance template mutation for a disruptive change.
fn template_change(change: SpecChange, new: &PgClusterSpec) -> TemplateChange {
    match change {
        SpecChange::Image(image) => Box::new(move |s: &mut StatefulSet| statefulset::set_image(s, &image)),
        SpecChange::Resources => {
            let (requests, limits) = (new.resources.clone(), new.limits.clone());
            Box::new(move |s: &mut StatefulSet| statefulset::set_resources(s, &requests, &limits))
        }
        SpecChange::Tolerations => {
            let tolerations = new.tolerations.clone();
            Box::new(move |s: &mut StatefulSet| statefulset::set_tolerations(s, &tolerations))
        }
        SpecChange::TlsOnly(tls_only) => {
            Box::new(move |s: &mut StatefulSet| statefulset::set_tls_only(s, tls_only))
        }
        SpecChange::StorageGrowth(size) => {
            Box::new(move |s: &mut StatefulSet| statefulset::set_storage_request(s, &size))
        }
        SpecChange::Labels | SpecChange::Annotations | SpecChange::Replicas(_) => {
            Box::new(|_: &mut StatefulSet| Ok(()))
        }
    }
}

fn plan_update<'a>(
    sts: &Api<StatefulSet>,
    name: &str,
    old: &PgClusterSpec,
    new: &PgClusterSpec,
    changes: Vec<SpecChange>,
) -> UpdatePlan<'a, StatefulSet> {
    let mut plan = UpdatePlan::new();
    for change in changes {
        let what = change.describe();
        if !change.is_disruptive() {
            if let Some(patch) = statefulset_patch(&change, old, new) {
                plan.immediate(what, merge_patch(sts, name, patch));
            }
            continue;
        }
        if change.requires_rescale() {
            plan.require_rescale();
        }
        plan.disruptive(what, template_change(change, new));
    }
    plan
}

/// `new` without the in-place changes that could not be applied, so that
/// only those are retried.
fn applied_spec(old: &PgClusterSpec, new: &PgClusterSpec, executed: &Executed) -> PgClusterSpec {
    let mut applied = new.clone();
    if executed.has_failed(SpecChange::Labels.describe()) {
        applied.user_labels = old.user_labels.clone();
    }
    if executed.has_failed(SpecChange::Annotations.describe()) {
        applied.annotations = old.annotations.clone();
    }
    if executed.has_failed(SpecChange::Replicas(old.replicas).describe()) {
        applied.replicas = old.replicas;
    }
    applied
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn map_patch_nulls_removed_keys() {
        let old = labels(&[("team", "a"), ("tier", "db"), ("keep", "x")]);
        let new = labels(&[("team", "b"), ("keep", "x"), ("env", "prod")]);
        assert_eq!(
            map_patch(&old, &new),
            json!({ "tier": null, "team": "b", "env": "prod" })
        );
    }

    fn spec() -> PgClusterSpec {
        PgClusterSpec {
            image: "crunchy-postgres:13".into(),
            replicas: 1,
            ..Default::default()
        }
    }

    #[test]
    fn only_disruptive_changes_touch_the_template() {
        let (old, mut new) = (spec(), spec());
        new.user_labels.insert("team".into(), "a".into());
        new.replicas = 2;
        assert_eq!(
            statefulset_patch(&SpecChange::Replicas(2), &old, &new),
            Some(json!({ "spec": { "replicas": 3 } }))
        );
        assert_eq!(
            statefulset_patch(&SpecChange::Labels, &old, &new),
            Some(json!({ "metadata": { "labels": { "team": "a" } } }))
        );
        assert_eq!(statefulset_patch(&SpecChange::TlsOnly(true), &old, &new), None);

        let mut sts = StatefulSet::default();
        template_change(SpecChange::Labels, &new)(&mut sts).unwrap();
        assert_eq!(sts, StatefulSet::default());
    }

    #[test]
    fn failed_in_place_changes_stay_unreconciled() {
        let old = spec();
        let mut new = spec();
        new.user_labels.insert("team".into(), "a".into());
        new.replicas = 2;
        new.image = "crunchy-postgres:14".into();

        let executed = Executed {
            failed: vec![("labels".into(), crate::Error::InvalidSpec("rejected".into()))],
        };
        let applied = applied_spec(&old, &new, &executed);
        assert!(applied.user_labels.is_empty());
        assert_eq!(applied.replicas, 2);
        assert_eq!(applied.image, "crunchy-postgres:14");

        // the retry only redoes the labels, never the rollout
        assert_eq!(diff(&applied, &new).unwrap(), vec![SpecChange::Labels]);
        assert_eq!(applied_spec(&old, &new, &Executed::default()), new);
    }

    #[test]
    fn statefulset_runs_primary_and_replicas() {
        assert_eq!(statefulset_replicas(0), 1);
        assert_eq!(statefulset_replicas(2), 3);
    }
}
