use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const REPLICA_STATE_PROCESSED: &str = "pgreplica Processed";
pub const REPLICA_STATE_PENDING_INIT: &str = "pgreplica Pending init";

/// An additional replica of a cluster. Deleting it scales the cluster back down.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "Pgreplica",
    root = "PgReplica",
    group = "crunchydata.com",
    version = "v1",
    namespaced,
    status = "PgReplicaStatus",
    shortname = "pgr",
    printcolumn = r#"{"name":"Cluster", "type":"string", "jsonPath":".spec.clusterName"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PgReplicaSpec {
    pub cluster_name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PgReplicaStatus {
    pub state: Option<String>,
    pub message: Option<String>,
}
