use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Toleration;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// State a cluster is put in once the operator has taken ownership of it.
pub const CLUSTER_STATE_PROCESSED: &str = "pgcluster Processed";

/// A PostgreSQL cluster managed by the operator
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "Pgcluster",
    root = "PgCluster",
    group = "crunchydata.com",
    version = "v1",
    namespaced,
    status = "PgClusterStatus",
    shortname = "pgc",
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PgClusterSpec {
    /// Container image of the PostgreSQL instances
    pub image: String,
    /// Number of replicas next to the primary
    #[serde(default)]
    pub replicas: i32,
    pub primary_storage: PgStorageSpec,
    /// Container resource requests, e.g. `{ cpu: "0.5", memory: "2Gi" }`
    #[serde(default)]
    pub resources: BTreeMap<String, Quantity>,
    /// Container resource limits
    #[serde(default)]
    pub limits: BTreeMap<String, Quantity>,
    /// Labels propagated to every object of the cluster
    #[serde(default)]
    pub user_labels: BTreeMap<String, String>,
    /// Annotations propagated to every object of the cluster
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
    /// Only accept TLS connections
    #[serde(default)]
    pub tls_only: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PgStorageSpec {
    /// Requested volume size. May grow, never shrink.
    pub size: Quantity,
    pub storage_class: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PgClusterStatus {
    pub state: Option<String>,
    pub message: Option<String>,
    pub ready_replicas: Option<i32>,
    /// The spec the last successful reconciliation converged to
    pub reconciled_spec: Option<PgClusterSpec>,
}

impl PgCluster {
    /// Name of the StatefulSet running the instances
    pub fn statefulset_name(&self) -> String {
        kube::ResourceExt::name_any(self)
    }
}
