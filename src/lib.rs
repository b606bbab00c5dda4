use std::time::Duration;

use kube::runtime::finalizer;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Finalizer Error: {0}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(#[from] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("A controller group for namespace {0} already exists")]
    ControllerGroupExists(String),

    #[error("Timed out after {timeout:?} waiting for caches to sync in namespace {namespace}")]
    CacheSyncTimeout { namespace: String, timeout: Duration },

    #[error("Stopped while waiting for caches to sync in namespace {0}")]
    CacheSyncAborted(String),

    #[error("Missing list privileges for {resource} in namespace {namespace}")]
    MissingPrivileges { namespace: String, resource: String },

    #[error("The controller group for namespace {0} has been stopped and cannot be restarted")]
    GroupStopped(String),

    #[error("Invalid namespace name {0:?}")]
    InvalidNamespace(String),

    #[error("{kind} {key} no longer exists")]
    ObjectDeleted { kind: &'static str, key: String },

    #[error("Invalid desired state: {0}")]
    InvalidSpec(String),

    #[error("Not yet ready: {message}")]
    NotReady { message: String, reason: String },

    #[error("Timed out after {timeout:?} waiting for {name} to roll out")]
    RolloutTimeout { name: String, timeout: Duration },

    #[error("Reconciler panicked: {0}")]
    ReconcilerPanic(String),

    #[error("{count} worker task(s) in namespace {namespace} panicked outside of reconciliation")]
    WorkerPanicked { namespace: String, count: usize },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::SerializationError(_) => "SerializationError",
            Error::KubeError(_) => "KubeError",
            Error::FinalizerError(_) => "FinalizerError",
            Error::ControllerGroupExists(_) => "ControllerGroupExists",
            Error::CacheSyncTimeout { .. } => "CacheSyncTimeout",
            Error::CacheSyncAborted(_) => "CacheSyncAborted",
            Error::MissingPrivileges { .. } => "MissingPrivileges",
            Error::GroupStopped(_) => "GroupStopped",
            Error::InvalidNamespace(_) => "InvalidNamespace",
            Error::ObjectDeleted { .. } => "ObjectDeleted",
            Error::InvalidSpec(_) => "InvalidSpec",
            Error::NotReady { .. } => "NotReady",
            Error::RolloutTimeout { .. } => "RolloutTimeout",
            Error::ReconcilerPanic(_) => "ReconcilerPanic",
            Error::WorkerPanicked { .. } => "WorkerPanicked",
        }
    }

    /// Whether a failed reconciliation should be retried with backoff.
    ///
    /// Permanent failures are forgotten by the work queue; retrying them would
    /// spin forever.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::KubeError(err) => kube_error_is_transient(err),
            Error::FinalizerError(err) => match err.as_ref() {
                finalizer::Error::ApplyFailed(err) | finalizer::Error::CleanupFailed(err) => err.is_transient(),
                finalizer::Error::AddFinalizer(err) | finalizer::Error::RemoveFinalizer(err) => {
                    kube_error_is_transient(err)
                }
                _ => false,
            },
            Error::NotReady { .. } => true,
            Error::RolloutTimeout { .. } => true,
            Error::ReconcilerPanic(_) => true,
            Error::CacheSyncTimeout { .. } => true,
            Error::MissingPrivileges { .. } => true,
            Error::SerializationError(_)
            | Error::ControllerGroupExists(_)
            | Error::CacheSyncAborted(_)
            | Error::GroupStopped(_)
            | Error::InvalidNamespace(_)
            | Error::ObjectDeleted { .. }
            | Error::InvalidSpec(_)
            | Error::WorkerPanicked { .. } => false,
        }
    }
}

fn kube_error_is_transient(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(e) => !matches!(e.code, 400 | 404 | 410 | 422),
        _ => true,
    }
}

/// Runtime configuration
pub mod config;

/// Namespace scoped controller groups and the supervisor that owns them
pub mod manager;

pub mod controllers;
pub use controllers::{Diagnostics, State};

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;

pub use metrics::Metrics;

/// Custom resources
pub mod resources;

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    fn api_error(code: u16) -> Error {
        Error::KubeError(kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: "test".into(),
            reason: "test".into(),
            code,
        }))
    }

    #[test]
    fn conflicts_are_transient() {
        assert!(api_error(409).is_transient());
        assert!(api_error(500).is_transient());
    }

    #[test]
    fn deleted_and_malformed_are_permanent() {
        assert!(!api_error(404).is_transient());
        assert!(!api_error(422).is_transient());
        assert!(!Error::InvalidSpec("storage cannot shrink".into()).is_transient());
        assert!(!Error::ObjectDeleted {
            kind: "PgCluster",
            key: "a/b".into()
        }
        .is_transient());
    }

    #[test]
    fn finalizer_errors_follow_their_cause() {
        let apply = |err: Error| Error::FinalizerError(Box::new(finalizer::Error::ApplyFailed(err)));
        assert!(apply(Error::NotReady {
            message: "cluster not initialized".into(),
            reason: "PendingInit".into()
        })
        .is_transient());
        assert!(!apply(Error::InvalidSpec("bad".into())).is_transient());
        assert!(!Error::FinalizerError(Box::new(finalizer::Error::UnnamedObject)).is_transient());
    }

    #[test]
    fn panics_are_retried() {
        assert!(Error::ReconcilerPanic("boom".into()).is_transient());
    }
}
