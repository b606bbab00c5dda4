/// Generated via `cargo run --bin crdgen`
pub mod pgclusters;
pub mod pgreplicas;
pub mod pgtasks;

pub use pgclusters::{PgCluster, PgClusterSpec, PgClusterStatus, PgStorageSpec, CLUSTER_STATE_PROCESSED};
pub use pgreplicas::{
    PgReplica, PgReplicaSpec, PgReplicaStatus, REPLICA_STATE_PENDING_INIT, REPLICA_STATE_PROCESSED,
};
pub use pgtasks::{
    PgTask, PgTaskSpec, PgTaskStatus, TaskType, TASK_STATE_COMPLETED, TASK_STATE_FAILED, TASK_STATE_PROCESSED,
};
