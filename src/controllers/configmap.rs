use std::sync::Arc;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::reflector::Store;
use kube::ResourceExt;
use sha2::Digest;
use tracing::{debug, info, instrument};

use crate::config::LABEL_PG_CLUSTER;
use crate::controllers::pgcluster::statefulset::{self, StatefulSetWorkload, ANNOTATION_CONFIG_HASH};
use crate::controllers::Context;
use crate::manager::rolling::{UpdatePlan, Workload};
use crate::manager::{ObjectKey, Reconciler};
use crate::resources::PgCluster;
use crate::Result;

/// Short digest of everything a config map holds.
pub fn config_hash(cm: &ConfigMap) -> String {
    let mut hasher = sha2::Sha256::new();
    for (key, value) in cm.data.iter().flatten() {
        hasher.update(key.as_bytes());
        hasher.update([0]);
        hasher.update(value.as_bytes());
        hasher.update([0]);
    }
    for (key, value) in cm.binary_data.iter().flatten() {
        hasher.update(key.as_bytes());
        hasher.update([1]);
        hasher.update(&value.0);
        hasher.update([1]);
    }
    let digest = hasher.finalize();
    let short = digest[..8].iter().fold(0u64, |acc, b| acc << 8 | u64::from(*b));
    format!("{short:016x}")
}

/// Rolls a cluster's instances when its configuration config map changes.
pub struct ConfigMapReconciler {
    configmaps: Store<ConfigMap>,
    clusters: Store<PgCluster>,
    ctx: Arc<Context>,
}

impl ConfigMapReconciler {
    pub fn new(configmaps: Store<ConfigMap>, clusters: Store<PgCluster>, ctx: Arc<Context>) -> Self {
        Self {
            configmaps,
            clusters,
            ctx,
        }
    }
}

impl Reconciler for ConfigMapReconciler {
    #[instrument(skip(self), fields(controller = "configmap"))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<()> {
        let Some(cm) = self.configmaps.get(&key.object_ref()) else {
            debug!(%key, "config map is gone");
            return Ok(());
        };
        let Some(cluster_name) = cm.labels().get(LABEL_PG_CLUSTER) else {
            return Ok(());
        };
        let Some(cluster) = self
            .clusters
            .get(&ObjectKey::new(&key.namespace, cluster_name).object_ref())
        else {
            debug!(%key, cluster = %cluster_name, "config map of an unknown cluster");
            return Ok(());
        };

        let timeout = self.ctx.config.rollout_timeout;
        let workload = StatefulSetWorkload::new(
            self.ctx.client.clone(),
            &key.namespace,
            &cluster.statefulset_name(),
            &cluster.name_any(),
            timeout,
        );
        let hash = config_hash(&cm);
        let current = workload.template().await?;
        if statefulset::template_annotation(&current, ANNOTATION_CONFIG_HASH) == Some(hash.as_str()) {
            return Ok(());
        }

        self.ctx.touch().await;
        info!(%key, cluster = %cluster_name, %hash, "configuration changed");
        let mut plan = UpdatePlan::new();
        plan.disruptive("configuration", move |sts| {
            statefulset::set_template_annotation(sts, ANNOTATION_CONFIG_HASH, &hash)
        });
        plan.execute(&workload, timeout).await?.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn cm(data: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            data: Some(data.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
            ..Default::default()
        }
    }

    #[test]
    fn hash_follows_content() {
        let a = cm(&[("postgresql.conf", "max_connections = 100")]);
        let b = cm(&[("postgresql.conf", "max_connections = 200")]);
        assert_eq!(config_hash(&a), config_hash(&a.clone()));
        assert_ne!(config_hash(&a), config_hash(&b));
        assert_eq!(config_hash(&a).len(), 16);
    }

    #[test]
    fn key_value_boundaries_matter() {
        assert_ne!(config_hash(&cm(&[("ab", "c")])), config_hash(&cm(&[("a", "bc")])));
    }

    #[test]
    fn binary_data_is_hashed() {
        let mut binary = ConfigMap::default();
        binary.binary_data = Some(BTreeMap::from([("cert".into(), ByteString(vec![1, 2, 3]))]));
        assert_ne!(config_hash(&binary), config_hash(&ConfigMap::default()));
    }
}
