use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const TASK_STATE_PROCESSED: &str = "pgtask Processed";
pub const TASK_STATE_COMPLETED: &str = "completed";
pub const TASK_STATE_FAILED: &str = "failed";

/// A one-off operation against a cluster
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "Pgtask",
    root = "PgTask",
    group = "crunchydata.com",
    version = "v1",
    namespaced,
    status = "PgTaskStatus",
    shortname = "pgt",
    printcolumn = r#"{"name":"Type", "type":"string", "jsonPath":".spec.taskType"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PgTaskSpec {
    /// Cluster the task operates on
    pub cluster: String,
    pub task_type: TaskType,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum TaskType {
    /// Restart every instance of the cluster, one at a time
    #[default]
    #[serde(rename = "rollingUpdate")]
    RollingUpdate,
    /// Anything this operator version doesn't know how to run
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PgTaskStatus {
    pub state: Option<String>,
    pub message: Option<String>,
}
