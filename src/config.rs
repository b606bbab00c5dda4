use std::time::Duration;

use serde::Serialize;

/// Label carried by every namespace that belongs to an operator installation
pub const LABEL_INSTALLATION_NAME: &str = "pgo-installation-name";
/// Label identifying the cluster an object belongs to
pub const LABEL_PG_CLUSTER: &str = "pg-cluster";
/// Label identifying the task a job was created for
pub const LABEL_PG_TASK: &str = "pg-task";
/// Field manager for server side apply
pub const FIELD_MANAGER: &str = "postgres-operator";

/// How the operator discovers the namespaces it manages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceOperatingMode {
    /// Watch namespaces and add or remove controller groups as they come and go
    Dynamic,
    /// Watch namespaces but never create or delete them
    Readonly,
    /// Only manage the namespaces given at startup
    Disabled,
}

impl NamespaceOperatingMode {
    pub fn watches_namespaces(self) -> bool {
        !matches!(self, NamespaceOperatingMode::Disabled)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct WorkerCounts {
    pub pgcluster: usize,
    pub pgtask: usize,
    pub pgreplica: usize,
    pub configmap: usize,
    pub pod: usize,
    pub job: usize,
    pub namespace: usize,
}

impl Default for WorkerCounts {
    fn default() -> Self {
        Self {
            pgcluster: 1,
            pgtask: 1,
            pgreplica: 1,
            configmap: 2,
            pod: 1,
            job: 1,
            namespace: 3,
        }
    }
}

/// Settings shared by every controller group the operator creates
#[derive(Clone, Debug, Serialize)]
pub struct OperatorConfig {
    pub installation_name: String,
    pub namespace_mode: NamespaceOperatingMode,
    pub workers: WorkerCounts,
    /// Upper bound on the cache-sync barrier of a single group
    pub cache_sync_timeout: Duration,
    /// Resync period of the namespace watch
    pub namespace_refresh_interval: Option<Duration>,
    /// Resync period of the refreshing watches inside a group (config maps)
    pub controller_group_refresh_interval: Option<Duration>,
    /// How long a rolling update waits for a workload to become ready
    pub rollout_timeout: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            installation_name: "devtest".into(),
            namespace_mode: NamespaceOperatingMode::Dynamic,
            workers: WorkerCounts::default(),
            cache_sync_timeout: Duration::from_secs(60),
            namespace_refresh_interval: Some(Duration::from_secs(60)),
            controller_group_refresh_interval: Some(Duration::from_secs(60)),
            rollout_timeout: Duration::from_secs(600),
        }
    }
}

/// Zero disables a periodic resync.
pub fn interval_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_interval_disables_resync() {
        assert_eq!(interval_from_secs(0), None);
        assert_eq!(interval_from_secs(30), Some(Duration::from_secs(30)));
    }

    #[test]
    fn disabled_mode_does_not_watch() {
        assert!(NamespaceOperatingMode::Dynamic.watches_namespaces());
        assert!(NamespaceOperatingMode::Readonly.watches_namespaces());
        assert!(!NamespaceOperatingMode::Disabled.watches_namespaces());
    }
}
