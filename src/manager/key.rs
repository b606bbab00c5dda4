use std::fmt;

use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;

/// Identity of a work item: `<namespace>/<name>`.
///
/// This is the canonical key used by watch events, queue entries and
/// reconciler invocations.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key for an object as seen by a watch. Cluster scoped objects get an
    /// empty namespace, matching how namespaces themselves are queued.
    pub fn from_object<K: kube::Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace().unwrap_or_default(),
            name: obj.name_any(),
        }
    }

    /// Reference for looking the object up in a reflector store.
    pub fn object_ref<K: kube::Resource<DynamicType = ()>>(&self) -> ObjectRef<K> {
        let obj = ObjectRef::new(&self.name);
        if self.namespace.is_empty() {
            obj
        } else {
            obj.within(&self.namespace)
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Namespace, Pod};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn displays_as_namespace_slash_name() {
        assert_eq!(
            ObjectKey::new("team-a", "cluster1").to_string(),
            "team-a/cluster1"
        );
    }

    #[test]
    fn keys_objects_by_namespace_and_name() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("db-0".into()),
                namespace: Some("team-a".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(ObjectKey::from_object(&pod).to_string(), "team-a/db-0");

        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some("team-a".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(ObjectKey::from_object(&ns), ObjectKey::new("", "team-a"));
    }

    #[test]
    fn store_references_follow_scope() {
        let pod: ObjectRef<Pod> = ObjectKey::new("team-a", "db-0").object_ref();
        assert_eq!(pod.namespace.as_deref(), Some("team-a"));
        assert_eq!(pod.name, "db-0");

        let ns: ObjectRef<Namespace> = ObjectKey::new("", "team-a").object_ref();
        assert_eq!(ns.namespace, None);
    }
}
