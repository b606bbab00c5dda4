use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use super::quantity::QuantityParser;
use crate::resources::PgClusterSpec;
use crate::{Error, Result};

/// One difference between the last reconciled and the desired spec
#[derive(Clone, Debug, PartialEq)]
pub enum SpecChange {
    Labels,
    Annotations,
    Replicas(i32),
    Image(String),
    Resources,
    Tolerations,
    TlsOnly(bool),
    StorageGrowth(Quantity),
}

impl SpecChange {
    /// Whether applying the change restarts running instances.
    pub fn is_disruptive(&self) -> bool {
        match self {
            SpecChange::Labels | SpecChange::Annotations | SpecChange::Replicas(_) => false,
            SpecChange::Image(_)
            | SpecChange::Resources
            | SpecChange::Tolerations
            | SpecChange::TlsOnly(_)
            | SpecChange::StorageGrowth(_) => true,
        }
    }

    /// Whether instances have to be taken down entirely.
    pub fn requires_rescale(&self) -> bool {
        matches!(self, SpecChange::StorageGrowth(_))
    }

    pub fn describe(&self) -> &'static str {
        match self {
            SpecChange::Labels => "labels",
            SpecChange::Annotations => "annotations",
            SpecChange::Replicas(_) => "replicas",
            SpecChange::Image(_) => "image",
            SpecChange::Resources => "resources",
            SpecChange::Tolerations => "tolerations",
            SpecChange::TlsOnly(_) => "tls",
            SpecChange::StorageGrowth(_) => "storage",
        }
    }
}

/// Field-by-field differences between `old` and `new`.
///
/// Shrinking storage or switching its class is rejected: volumes can only grow.
pub fn diff(old: &PgClusterSpec, new: &PgClusterSpec) -> Result<Vec<SpecChange>> {
    let mut changes = Vec::new();

    if old.user_labels != new.user_labels {
        changes.push(SpecChange::Labels);
    }
    if old.annotations != new.annotations {
        changes.push(SpecChange::Annotations);
    }
    if old.replicas != new.replicas {
        if new.replicas < 0 {
            return Err(Error::InvalidSpec(format!(
                "replicas must not be negative, got {}",
                new.replicas
            )));
        }
        changes.push(SpecChange::Replicas(new.replicas));
    }
    if old.image != new.image {
        changes.push(SpecChange::Image(new.image.clone()));
    }
    if old.resources != new.resources || old.limits != new.limits {
        changes.push(SpecChange::Resources);
    }
    if old.tolerations != new.tolerations {
        changes.push(SpecChange::Tolerations);
    }
    if old.tls_only != new.tls_only {
        changes.push(SpecChange::TlsOnly(new.tls_only));
    }

    if old.primary_storage.storage_class != new.primary_storage.storage_class {
        return Err(Error::InvalidSpec("storageClass is immutable".into()));
    }
    let parse = |q: &Quantity| {
        q.to_bytes()
            .map_err(|e| Error::InvalidSpec(format!("primaryStorage.size: {e}")))
    };
    let (old_size, new_size) = (
        parse(&old.primary_storage.size)?,
        parse(&new.primary_storage.size)?,
    );
    if new_size < old_size {
        return Err(Error::InvalidSpec(format!(
            "primaryStorage.size cannot shrink from {} to {}",
            old.primary_storage.size.0, new.primary_storage.size.0
        )));
    }
    if new_size > old_size {
        changes.push(SpecChange::StorageGrowth(new.primary_storage.size.clone()));
    }

    Ok(changes)
}
