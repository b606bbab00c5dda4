use kube::CustomResourceExt;
use postgres_operator::resources::{PgCluster, PgReplica, PgTask};

fn main() {
    print!(
        "{}---\n{}---\n{}",
        serde_yaml::to_string(&PgCluster::crd()).unwrap(),
        serde_yaml::to_string(&PgReplica::crd()).unwrap(),
        serde_yaml::to_string(&PgTask::crd()).unwrap()
    )
}
