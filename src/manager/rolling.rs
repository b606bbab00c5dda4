//! Immediate vs. disruptive updates of a stateful workload.
//!
//! A reconciler diffs the old and new desired state into an [`UpdatePlan`]:
//! changes that are safe to apply in place run right away, while every change
//! that needs the workload's instances restarted is folded into one template
//! update and rolled out once.

use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{debug, error, info};

use crate::{Error, Result};

/// Something with an instance template that can be rolled out.
pub trait Workload: Send + Sync {
    type Template: Send;

    fn name(&self) -> &str;

    fn template(&self) -> impl Future<Output = Result<Self::Template>> + Send;

    /// Persist `template`. With `rescale`, all instances are taken down and
    /// recreated instead of replaced one at a time.
    fn apply(&self, template: Self::Template, rescale: bool) -> impl Future<Output = Result<()>> + Send;

    fn wait_rolled_out(&self, timeout: Duration) -> impl Future<Output = Result<()>> + Send;
}

/// Immediate actions of an executed plan that did not go through.
///
/// Only returned once the rollout, if there was one, has completed.
#[derive(Debug, Default)]
pub struct Executed {
    pub failed: Vec<(String, Error)>,
}

impl Executed {
    pub fn has_failed(&self, what: &str) -> bool {
        self.failed.iter().any(|(failed, _)| failed == what)
    }

    /// The first failed immediate action, if any.
    pub fn into_result(self) -> Result<()> {
        self.failed.into_iter().next().map_or(Ok(()), |(_, err)| Err(err))
    }
}

type TemplateChange<T> = Box<dyn FnOnce(&mut T) -> Result<()> + Send>;

pub struct UpdatePlan<'a, T> {
    immediate: Vec<(String, BoxFuture<'a, Result<()>>)>,
    disruptive: Vec<(String, TemplateChange<T>)>,
    rescale: bool,
}

impl<T> Default for UpdatePlan<'_, T> {
    fn default() -> Self {
        Self {
            immediate: Vec::new(),
            disruptive: Vec::new(),
            rescale: false,
        }
    }
}

impl<'a, T: Send> UpdatePlan<'a, T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// An action that doesn't disturb running instances.
    pub fn immediate(&mut self, what: impl Into<String>, action: BoxFuture<'a, Result<()>>) {
        self.immediate.push((what.into(), action));
    }

    /// A template mutation applied during the single rolling update.
    pub fn disruptive(
        &mut self,
        what: impl Into<String>,
        change: impl FnOnce(&mut T) -> Result<()> + Send + 'static,
    ) {
        self.disruptive.push((what.into(), Box::new(change)));
    }

    /// The rolling update has to take every instance down first.
    pub fn require_rescale(&mut self) {
        self.rescale = true;
    }

    /// Run every immediate action, then roll out the disruptive changes at
    /// once. A failed rollout is the error; failed immediate actions are
    /// reported in [`Executed`].
    pub async fn execute<W>(self, workload: &W, timeout: Duration) -> Result<Executed>
    where
        W: Workload<Template = T>,
    {
        let mut executed = Executed::default();
        for (what, action) in self.immediate {
            match action.await {
                Ok(()) => debug!(workload = workload.name(), "applied {what}"),
                Err(err) => {
                    error!(workload = workload.name(), "unable to apply {what}: {err}");
                    executed.failed.push((what, err));
                }
            }
        }

        if !self.disruptive.is_empty() {
            rolling_update(workload, self.disruptive, self.rescale, timeout).await?;
        }
        Ok(executed)
    }
}

async fn rolling_update<W: Workload>(
    workload: &W,
    changes: Vec<(String, TemplateChange<W::Template>)>,
    rescale: bool,
    timeout: Duration,
) -> Result<()> {
    let what: Vec<&str> = changes.iter().map(|(what, _)| what.as_str()).collect();
    info!(workload = workload.name(), rescale, changes = ?what, "rolling update");

    let mut template = workload.template().await?;
    for (_, change) in changes {
        change(&mut template)?;
    }
    workload.apply(template, rescale).await?;
    workload.wait_rolled_out(timeout).await?;

    info!(workload = workload.name(), "rolling update complete");
    Ok(())
}
