use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Container, EnvVar, PersistentVolumeClaim, Toleration};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, Preconditions, PropagationPolicy};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

use crate::config::{FIELD_MANAGER, LABEL_PG_CLUSTER};
use crate::manager::rolling::Workload;
use crate::{Error, Result};

/// Name of the PostgreSQL container in the instance template
pub const DATABASE_CONTAINER: &str = "database";
pub const ANNOTATION_CONFIG_HASH: &str = "postgres-operator.crunchydata.com/config-hash";
pub const ANNOTATION_RESTARTED_AT: &str = "postgres-operator.crunchydata.com/restartedAt";
const ENV_TLS_ONLY: &str = "PGHA_TLS_ONLY";

const POLL_PERIOD: Duration = Duration::from_secs(2);

fn database_container(sts: &mut StatefulSet) -> Result<&mut Container> {
    let name = sts.name_any();
    sts.spec
        .as_mut()
        .and_then(|spec| spec.template.spec.as_mut())
        .and_then(|pod| pod.containers.iter_mut().find(|c| c.name == DATABASE_CONTAINER))
        .ok_or_else(|| Error::InvalidSpec(format!("statefulset {name} has no {DATABASE_CONTAINER} container")))
}

pub fn set_image(sts: &mut StatefulSet, image: &str) -> Result<()> {
    database_container(sts)?.image = Some(image.to_string());
    Ok(())
}

pub fn set_resources(
    sts: &mut StatefulSet,
    requests: &BTreeMap<String, Quantity>,
    limits: &BTreeMap<String, Quantity>,
) -> Result<()> {
    let resources = database_container(sts)?.resources.get_or_insert_with(Default::default);
    resources.requests = (!requests.is_empty()).then(|| requests.clone());
    resources.limits = (!limits.is_empty()).then(|| limits.clone());
    Ok(())
}

pub fn set_tls_only(sts: &mut StatefulSet, tls_only: bool) -> Result<()> {
    let env = database_container(sts)?.env.get_or_insert_with(Vec::new);
    env.retain(|var| var.name != ENV_TLS_ONLY);
    env.push(EnvVar {
        name: ENV_TLS_ONLY.into(),
        value: Some(tls_only.to_string()),
        ..Default::default()
    });
    Ok(())
}

pub fn set_tolerations(sts: &mut StatefulSet, tolerations: &[Toleration]) -> Result<()> {
    let name = sts.name_any();
    let pod = sts
        .spec
        .as_mut()
        .and_then(|spec| spec.template.spec.as_mut())
        .ok_or_else(|| Error::InvalidSpec(format!("statefulset {name} has no pod template")))?;
    pod.tolerations = (!tolerations.is_empty()).then(|| tolerations.to_vec());
    Ok(())
}

pub fn set_storage_request(sts: &mut StatefulSet, size: &Quantity) -> Result<()> {
    let name = sts.name_any();
    let claim = sts
        .spec
        .as_mut()
        .and_then(|spec| spec.volume_claim_templates.as_mut())
        .and_then(|templates| templates.first_mut())
        .ok_or_else(|| Error::InvalidSpec(format!("statefulset {name} has no volume claim template")))?;
    claim
        .spec
        .get_or_insert_with(Default::default)
        .resources
        .get_or_insert_with(Default::default)
        .requests
        .get_or_insert_with(BTreeMap::new)
        .insert("storage".into(), size.clone());
    Ok(())
}

fn storage_request(sts: &StatefulSet) -> Option<Quantity> {
    sts.spec
        .as_ref()?
        .volume_claim_templates
        .as_ref()?
        .first()?
        .spec
        .as_ref()?
        .resources
        .as_ref()?
        .requests
        .as_ref()?
        .get("storage")
        .cloned()
}

pub fn set_template_annotation(sts: &mut StatefulSet, key: &str, value: &str) -> Result<()> {
    let name = sts.name_any();
    let spec = sts
        .spec
        .as_mut()
        .ok_or_else(|| Error::InvalidSpec(format!("statefulset {name} has no spec")))?;
    spec.template
        .metadata
        .get_or_insert_with(Default::default)
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.into(), value.into());
    Ok(())
}

pub fn template_annotation<'a>(sts: &'a StatefulSet, key: &str) -> Option<&'a str> {
    sts.spec
        .as_ref()?
        .template
        .metadata
        .as_ref()?
        .annotations
        .as_ref()?
        .get(key)
        .map(String::as_str)
}

/// The live volume claim template already requests what `desired` does.
fn storage_matches(live: &StatefulSet, desired: &StatefulSet) -> bool {
    let requested = storage_request(desired);
    requested.is_some() && storage_request(live) == requested
}

/// Every replica runs the latest template and is ready.
pub fn is_rolled_out(sts: &StatefulSet) -> bool {
    let desired = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let Some(status) = &sts.status else {
        return false;
    };
    status.observed_generation.unwrap_or(0) >= sts.metadata.generation.unwrap_or(0)
        && status.updated_replicas.unwrap_or(0) == desired
        && status.ready_replicas.unwrap_or(0) == desired
        && status.current_revision == status.update_revision
}

/// The desired part of `sts`, suitable for creating it anew.
fn for_recreate(mut sts: StatefulSet) -> StatefulSet {
    let meta = &mut sts.metadata;
    meta.resource_version = None;
    meta.uid = None;
    meta.creation_timestamp = None;
    meta.deletion_timestamp = None;
    meta.generation = None;
    meta.managed_fields = None;
    sts.status = None;
    sts
}

/// The StatefulSet running a cluster's instances
pub struct StatefulSetWorkload {
    api: Api<StatefulSet>,
    pvcs: Api<PersistentVolumeClaim>,
    name: String,
    cluster: String,
    timeout: Duration,
}

impl StatefulSetWorkload {
    pub fn new(client: Client, namespace: &str, name: &str, cluster: &str, timeout: Duration) -> Self {
        Self {
            api: Api::namespaced(client.clone(), namespace),
            pvcs: Api::namespaced(client, namespace),
            name: name.to_string(),
            cluster: cluster.to_string(),
            timeout,
        }
    }

    async fn wait_until(&self, what: &str, timeout: Duration, done: impl Fn(Option<&StatefulSet>) -> bool) -> Result<()> {
        let poll = async {
            loop {
                let current = self.api.get_opt(&self.name).await?;
                if done(current.as_ref()) {
                    return Ok::<(), Error>(());
                }
                tokio::time::sleep(POLL_PERIOD).await;
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| Error::RolloutTimeout {
                name: format!("statefulset {} ({what})", self.name),
                timeout,
            })?
    }

    /// Volume claim templates are immutable: take every instance down, grow
    /// the existing claims and recreate the StatefulSet around them.
    async fn recreate(&self, existing: StatefulSet, sts: StatefulSet) -> Result<()> {
        info!(statefulset = %self.name, "scaling down for storage resize");
        self.api
            .patch(
                &self.name,
                &PatchParams::default(),
                &Patch::Merge(json!({ "spec": { "replicas": 0 } })),
            )
            .await?;
        self.wait_until("scale down", self.timeout, |current| {
            current.and_then(|s| s.status.as_ref()).is_none_or(|s| s.replicas == 0)
        })
        .await?;

        if let Some(size) = storage_request(&sts) {
            let claims = self
                .pvcs
                .list(&ListParams::default().labels(&format!("{LABEL_PG_CLUSTER}={}", self.cluster)))
                .await?;
            for claim in claims {
                debug!(claim = %claim.name_any(), size = %size.0, "resizing volume claim");
                self.pvcs
                    .patch(
                        &claim.name_any(),
                        &PatchParams::default(),
                        &Patch::Merge(json!({ "spec": { "resources": { "requests": { "storage": size } } } })),
                    )
                    .await?;
            }
        }

        // orphan the claims and pods; the uid guards against deleting a replacement
        self.api
            .delete(
                &self.name,
                &DeleteParams {
                    propagation_policy: Some(PropagationPolicy::Orphan),
                    preconditions: Some(Preconditions {
                        uid: existing.uid(),
                        resource_version: None,
                    }),
                    ..Default::default()
                },
            )
            .await?;
        self.wait_until("delete", self.timeout, |current| current.is_none())
            .await?;

        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.into()),
            ..Default::default()
        };
        self.api.create(&params, &for_recreate(sts)).await?;
        info!(statefulset = %self.name, "recreated with resized storage");
        Ok(())
    }
}

impl Workload for StatefulSetWorkload {
    type Template = StatefulSet;

    fn name(&self) -> &str {
        &self.name
    }

    async fn template(&self) -> Result<StatefulSet> {
        self.api
            .get_opt(&self.name)
            .await?
            .ok_or_else(|| Error::NotReady {
                message: format!("statefulset {} does not exist yet", self.name),
                reason: "StatefulSetMissing".into(),
            })
    }

    async fn apply(&self, sts: StatefulSet, rescale: bool) -> Result<()> {
        if rescale {
            let live = self.template().await?;
            if !storage_matches(&live, &sts) {
                return self.recreate(live, sts).await;
            }
            info!(statefulset = %self.name, "storage already resized, replacing in place");
        }
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.into()),
            ..Default::default()
        };
        // carries the fetched resourceVersion: a concurrent writer makes this a retriable conflict
        self.api.replace(&self.name, &params, &sts).await?;
        Ok(())
    }

    async fn wait_rolled_out(&self, timeout: Duration) -> Result<()> {
        self.wait_until("rollout", timeout, |current| current.is_some_and(is_rolled_out))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{StatefulSetSpec, StatefulSetStatus};
    use k8s_openapi::api::core::v1::{PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, VolumeResourceRequirements};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn sts() -> StatefulSet {
        StatefulSet {
            metadata: ObjectMeta {
                name: Some("cluster1".into()),
                resource_version: Some("42".into()),
                uid: Some("abc".into()),
                generation: Some(3),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                replicas: Some(2),
                template: PodTemplateSpec {
                    metadata: None,
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: DATABASE_CONTAINER.into(),
                            image: Some("crunchy-postgres:13".into()),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                volume_claim_templates: Some(vec![PersistentVolumeClaim {
                    spec: Some(PersistentVolumeClaimSpec {
                        resources: Some(VolumeResourceRequirements {
                            requests: Some(BTreeMap::from([("storage".into(), Quantity("1Gi".into()))])),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            status: None,
        }
    }

    fn database(sts: &mut StatefulSet) -> Container {
        database_container(sts).unwrap().clone()
    }

    #[test]
    fn mutations_target_the_database_container() {
        let mut sts = sts();
        set_image(&mut sts, "crunchy-postgres:14").unwrap();
        set_tls_only(&mut sts, true).unwrap();
        set_tls_only(&mut sts, false).unwrap();
        set_resources(
            &mut sts,
            &BTreeMap::from([("cpu".into(), Quantity("500m".into()))]),
            &BTreeMap::new(),
        )
        .unwrap();

        let db = database(&mut sts);
        assert_eq!(db.image.as_deref(), Some("crunchy-postgres:14"));
        let env = db.env.unwrap();
        assert_eq!(env.len(), 1);
        assert_eq!(env[0].value.as_deref(), Some("false"));
        let resources = db.resources.unwrap();
        assert!(resources.requests.unwrap().contains_key("cpu"));
        assert!(resources.limits.is_none());
    }

    #[test]
    fn missing_database_container_is_permanent() {
        let mut sts = sts();
        sts.spec.as_mut().unwrap().template.spec.as_mut().unwrap().containers[0].name = "other".into();
        let err = set_image(&mut sts, "x").unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn storage_and_annotations() {
        let mut sts = sts();
        set_storage_request(&mut sts, &Quantity("5Gi".into())).unwrap();
        assert_eq!(storage_request(&sts), Some(Quantity("5Gi".into())));

        assert_eq!(template_annotation(&sts, ANNOTATION_CONFIG_HASH), None);
        set_template_annotation(&mut sts, ANNOTATION_CONFIG_HASH, "deadbeef").unwrap();
        assert_eq!(template_annotation(&sts, ANNOTATION_CONFIG_HASH), Some("deadbeef"));
    }

    #[test]
    fn resized_statefulset_is_not_recreated_again() {
        let live = sts();
        let mut desired = sts();
        set_storage_request(&mut desired, &Quantity("5Gi".into())).unwrap();
        assert!(!storage_matches(&live, &desired));

        let mut resized = sts();
        set_storage_request(&mut resized, &Quantity("5Gi".into())).unwrap();
        assert!(storage_matches(&resized, &desired));

        let mut no_claims = sts();
        no_claims.spec.as_mut().unwrap().volume_claim_templates = None;
        assert!(!storage_matches(&no_claims, &no_claims.clone()));
    }

    #[test]
    fn recreate_drops_server_populated_fields() {
        let sts = for_recreate(sts());
        assert_eq!(sts.metadata.name.as_deref(), Some("cluster1"));
        assert!(sts.metadata.resource_version.is_none());
        assert!(sts.metadata.uid.is_none());
        assert_eq!(sts.spec.unwrap().replicas, Some(2));
    }

    #[test]
    fn rollout_requires_every_replica_updated_and_ready() {
        let mut sts = sts();
        assert!(!is_rolled_out(&sts));

        sts.status = Some(StatefulSetStatus {
            observed_generation: Some(3),
            replicas: 2,
            updated_replicas: Some(2),
            ready_replicas: Some(1),
            current_revision: Some("r2".into()),
            update_revision: Some("r2".into()),
            ..Default::default()
        });
        assert!(!is_rolled_out(&sts));

        sts.status.as_mut().unwrap().ready_replicas = Some(2);
        assert!(is_rolled_out(&sts));

        sts.metadata.generation = Some(4);
        assert!(!is_rolled_out(&sts));
    }
}
