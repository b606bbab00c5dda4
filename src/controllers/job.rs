use std::sync::Arc;

use k8s_openapi::api::batch::v1::Job;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::reflector::Store;
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, info, instrument};

use crate::config::LABEL_PG_TASK;
use crate::controllers::Context;
use crate::manager::{ObjectKey, Reconciler};
use crate::resources::{PgTask, TASK_STATE_COMPLETED, TASK_STATE_FAILED};
use crate::{Error, Result};

/// Task state a finished job maps to, if it has finished.
fn job_outcome(job: &Job) -> Option<&'static str> {
    let status = job.status.as_ref()?;
    let has_condition = |type_: &str| {
        status
            .conditions
            .iter()
            .flatten()
            .any(|c| c.type_ == type_ && c.status == "True")
    };
    if has_condition("Failed") {
        Some(TASK_STATE_FAILED)
    } else if has_condition("Complete") || status.succeeded.unwrap_or(0) > 0 {
        Some(TASK_STATE_COMPLETED)
    } else {
        None
    }
}

/// Records the outcome of task jobs on their `PgTask`.
pub struct JobReconciler {
    jobs: Store<Job>,
    ctx: Arc<Context>,
}

impl JobReconciler {
    pub fn new(jobs: Store<Job>, ctx: Arc<Context>) -> Self {
        Self { jobs, ctx }
    }
}

impl Reconciler for JobReconciler {
    #[instrument(skip(self), fields(controller = "job"))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<()> {
        let Some(job) = self.jobs.get(&key.object_ref()) else {
            return Ok(());
        };
        let Some(task) = job.labels().get(LABEL_PG_TASK) else {
            return Ok(());
        };
        let Some(outcome) = job_outcome(&job) else {
            debug!(%key, "job still running");
            return Ok(());
        };

        self.ctx.touch().await;
        let api: Api<PgTask> = Api::namespaced(self.ctx.client.clone(), &key.namespace);
        let patch = Patch::Merge(json!({
            "status": { "state": outcome, "message": format!("job {} {outcome}", job.name_any()) }
        }));
        match api.patch_status(task, &PatchParams::default(), &patch).await {
            Ok(_) => {
                info!(%key, %task, outcome, "task finished");
                Ok(())
            }
            Err(kube::Error::Api(err)) if err.code == 404 => {
                debug!(%key, %task, "task of finished job is gone");
                Ok(())
            }
            Err(err) => Err(Error::KubeError(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};

    fn job(status: JobStatus) -> Job {
        Job {
            status: Some(status),
            ..Default::default()
        }
    }

    fn condition(type_: &str) -> JobCondition {
        JobCondition {
            type_: type_.into(),
            status: "True".into(),
            ..Default::default()
        }
    }

    #[test]
    fn running_jobs_have_no_outcome() {
        assert_eq!(job_outcome(&Job::default()), None);
        assert_eq!(
            job_outcome(&job(JobStatus {
                active: Some(1),
                ..Default::default()
            })),
            None
        );
    }

    #[test]
    fn succeeded_jobs_complete_the_task() {
        let succeeded = job(JobStatus {
            succeeded: Some(1),
            ..Default::default()
        });
        assert_eq!(job_outcome(&succeeded), Some(TASK_STATE_COMPLETED));

        let complete = job(JobStatus {
            conditions: Some(vec![condition("Complete")]),
            ..Default::default()
        });
        assert_eq!(job_outcome(&complete), Some(TASK_STATE_COMPLETED));
    }

    #[test]
    fn failed_condition_wins() {
        let failed = job(JobStatus {
            succeeded: Some(1),
            conditions: Some(vec![condition("Failed")]),
            ..Default::default()
        });
        assert_eq!(job_outcome(&failed), Some(TASK_STATE_FAILED));
    }
}
