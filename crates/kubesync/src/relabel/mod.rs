//! Stamps manifests with the commit and agent version they were synced from.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_yaml::{Mapping, Value};

use crate::error::{Result, SyncError};
use crate::resource::{ObjectMeta, Resource, ResourceId, SharedResource, Stamped};

/// Annotation carrying the commit a resource was applied from.
pub const COMMIT_ANNOTATION: &str = "kubesync.io/commit";

/// Annotation carrying the version of the agent that applied a resource.
pub const AGENT_VERSION_ANNOTATION: &str = "kubesync.io/agent-version";

/// Kinds that live outside any namespace and never get one filled in.
const CLUSTER_SCOPED: &[&str] = &[
    "Namespace",
    "ClusterRole",
    "ClusterRoleBinding",
    "PersistentVolume",
    "CustomResourceDefinition",
    "StorageClass",
];

/// Rewrites a manifest document so it records where it came from.
pub trait Relabel: Send + Sync {
    fn relabel(
        &self,
        namespace: &str,
        bytes: &[u8],
        agent_version: &str,
        commit: &str,
    ) -> Result<Vec<u8>>;
}

type StampFn = fn(&mut Mapping, &Mapping) -> std::result::Result<(), String>;

/// [`Relabel`] dispatching on `kind` through an explicit table.
///
/// Kinds missing from the table get their top-level metadata stamped.
#[derive(Clone)]
pub struct RelabelTable {
    stampers: BTreeMap<&'static str, StampFn>,
}

impl RelabelTable {
    pub fn empty() -> Self {
        Self {
            stampers: BTreeMap::new(),
        }
    }

    pub fn standard() -> Self {
        Self::empty()
            .with("Pod", stamp_pod)
            .with("Deployment", stamp_pod_template)
            .with("DaemonSet", stamp_pod_template)
            .with("StatefulSet", stamp_pod_template)
            .with("ReplicaSet", stamp_pod_template)
            .with("ReplicationController", stamp_pod_template)
            .with("Job", stamp_pod_template)
            .with("CronJob", stamp_cron_job)
    }

    pub fn with(mut self, kind: &'static str, stamp: StampFn) -> Self {
        self.stampers.insert(kind, stamp);
        self
    }

    fn stamper(&self, kind: &str) -> StampFn {
        self.stampers.get(kind).copied().unwrap_or(stamp_metadata)
    }
}

impl Default for RelabelTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl Relabel for RelabelTable {
    fn relabel(
        &self,
        namespace: &str,
        bytes: &[u8],
        agent_version: &str,
        commit: &str,
    ) -> Result<Vec<u8>> {
        let parsed: Value = serde_yaml::from_slice(bytes).map_err(|e| SyncError::Relabel {
            id: "<unparsable>".to_string(),
            message: e.to_string(),
        })?;
        let Value::Mapping(mut document) = parsed else {
            return Err(SyncError::Relabel {
                id: "<unparsable>".to_string(),
                message: "document is not a mapping".to_string(),
            });
        };

        let kind = document
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let name = document
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let relabel_error = |message: String| SyncError::Relabel {
            id: format!("{}/{}", kind, name),
            message,
        };

        let metadata = child_mapping(&mut document, "metadata").map_err(relabel_error)?;
        if !CLUSTER_SCOPED.contains(&kind.as_str()) && metadata.get("namespace").is_none() {
            metadata.insert("namespace".into(), namespace.into());
        }

        let mut stamp = Mapping::new();
        stamp.insert(COMMIT_ANNOTATION.into(), commit.into());
        stamp.insert(AGENT_VERSION_ANNOTATION.into(), agent_version.into());

        self.stamper(&kind)(&mut document, &stamp).map_err(relabel_error)?;

        serde_yaml::to_string(&Value::Mapping(document))
            .map(String::into_bytes)
            .map_err(|e| SyncError::SerializeYaml(e.to_string()))
    }
}

/// Relabels `resource` and wraps the result as a [`Stamped`] resource.
pub fn stamp_resource(
    relabel: &dyn Relabel,
    resource: &SharedResource,
    agent_version: &str,
    commit: &str,
) -> Result<SharedResource> {
    let id: &ResourceId = resource.id();
    let bytes = relabel
        .relabel(id.namespace(), resource.bytes(), agent_version, commit)
        .map_err(|e| match e {
            SyncError::Relabel { message, .. } => SyncError::Relabel {
                id: id.to_string(),
                message,
            },
            other => other,
        })?;

    let document: Value = serde_yaml::from_slice(&bytes).map_err(|e| SyncError::Relabel {
        id: id.to_string(),
        message: e.to_string(),
    })?;
    let metadata: ObjectMeta = document
        .get("metadata")
        .cloned()
        .map(serde_yaml::from_value)
        .transpose()
        .map_err(|e| SyncError::Relabel {
            id: id.to_string(),
            message: e.to_string(),
        })?
        .unwrap_or_else(|| resource.metadata().clone());

    Ok(Arc::new(Stamped::new(resource.as_ref(), bytes, metadata, commit)))
}

/// Returns the mapping stored under `key`, creating it when absent.
fn child_mapping<'a>(
    parent: &'a mut Mapping,
    key: &str,
) -> std::result::Result<&'a mut Mapping, String> {
    let entry = parent
        .entry(key.into())
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if entry.is_null() {
        *entry = Value::Mapping(Mapping::new());
    }
    entry
        .as_mapping_mut()
        .ok_or_else(|| format!("{} is not a mapping", key))
}

fn annotate(metadata: &mut Mapping, stamp: &Mapping) -> std::result::Result<(), String> {
    let annotations = child_mapping(metadata, "annotations")?;
    for (key, value) in stamp {
        annotations.insert(key.clone(), value.clone());
    }
    Ok(())
}

fn stamp_metadata(document: &mut Mapping, stamp: &Mapping) -> std::result::Result<(), String> {
    annotate(child_mapping(document, "metadata")?, stamp)
}

fn stamp_pod(document: &mut Mapping, stamp: &Mapping) -> std::result::Result<(), String> {
    // Pod specs are immutable; the stamp only ever touches metadata.
    stamp_metadata(document, stamp)
}

fn stamp_template(spec: &mut Mapping, stamp: &Mapping) -> std::result::Result<(), String> {
    let template = child_mapping(spec, "template")?;
    annotate(child_mapping(template, "metadata")?, stamp)
}

fn stamp_pod_template(document: &mut Mapping, stamp: &Mapping) -> std::result::Result<(), String> {
    stamp_metadata(document, stamp)?;
    stamp_template(child_mapping(document, "spec")?, stamp)
}

fn stamp_cron_job(document: &mut Mapping, stamp: &Mapping) -> std::result::Result<(), String> {
    stamp_metadata(document, stamp)?;
    let job_template = child_mapping(child_mapping(document, "spec")?, "jobTemplate")?;
    annotate(child_mapping(job_template, "metadata")?, stamp)?;
    stamp_template(child_mapping(job_template, "spec")?, stamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::parse_multidoc;

    fn relabel(bytes: &str) -> Value {
        let out = RelabelTable::standard()
            .relabel("web", bytes.as_bytes(), "1.2.0", "abc123")
            .unwrap();
        serde_yaml::from_slice(&out).unwrap()
    }

    fn annotation<'a>(value: &'a Value, path: &[&str], key: &str) -> Option<&'a str> {
        let mut current = value;
        for segment in path {
            current = current.get(*segment)?;
        }
        current.get("annotations")?.get(key)?.as_str()
    }

    #[test]
    fn test_plain_metadata_stamped_and_namespace_filled() {
        let doc = relabel("kind: ConfigMap\nmetadata:\n  name: settings\ndata:\n  a: b\n");

        assert_eq!(
            annotation(&doc, &["metadata"], COMMIT_ANNOTATION),
            Some("abc123")
        );
        assert_eq!(
            annotation(&doc, &["metadata"], AGENT_VERSION_ANNOTATION),
            Some("1.2.0")
        );
        assert_eq!(doc["metadata"]["namespace"].as_str(), Some("web"));
        assert_eq!(doc["data"]["a"].as_str(), Some("b"));
    }

    #[test]
    fn test_declared_namespace_kept() {
        let doc = relabel("kind: Service\nmetadata:\n  name: api\n  namespace: other\n");
        assert_eq!(doc["metadata"]["namespace"].as_str(), Some("other"));
    }

    #[test]
    fn test_cluster_scoped_kind_gets_no_namespace() {
        let doc = relabel("kind: Namespace\nmetadata:\n  name: web\n");
        assert!(doc["metadata"].get("namespace").is_none());
        assert_eq!(
            annotation(&doc, &["metadata"], COMMIT_ANNOTATION),
            Some("abc123")
        );
    }

    #[test]
    fn test_pod_template_stamped() {
        let doc = relabel(
            "kind: Deployment\nmetadata:\n  name: api\nspec:\n  template:\n    metadata:\n      labels:\n        app: api\n",
        );
        assert_eq!(
            annotation(&doc, &["spec", "template", "metadata"], COMMIT_ANNOTATION),
            Some("abc123")
        );
        assert_eq!(
            doc["spec"]["template"]["metadata"]["labels"]["app"].as_str(),
            Some("api")
        );
    }

    #[test]
    fn test_cron_job_templates_stamped() {
        let doc = relabel(
            "kind: CronJob\nmetadata:\n  name: nightly\nspec:\n  schedule: \"0 0 * * *\"\n  jobTemplate:\n    spec:\n      template:\n        spec: {}\n",
        );
        assert_eq!(
            annotation(&doc, &["spec", "jobTemplate", "metadata"], COMMIT_ANNOTATION),
            Some("abc123")
        );
        assert_eq!(
            annotation(
                &doc,
                &["spec", "jobTemplate", "spec", "template", "metadata"],
                COMMIT_ANNOTATION
            ),
            Some("abc123")
        );
    }

    #[test]
    fn test_malformed_spec_is_relabel_error() {
        let result = RelabelTable::standard().relabel(
            "web",
            b"kind: Deployment\nmetadata:\n  name: api\nspec: 3\n",
            "1.2.0",
            "abc123",
        );
        assert!(matches!(result, Err(SyncError::Relabel { id, .. }) if id == "Deployment/api"));
    }

    #[test]
    fn test_stamp_resource_keeps_identity() {
        let set = parse_multidoc("web", b"kind: Service\nmetadata:\n  name: api\n", "svc.yaml").unwrap();
        let original = set.values().next().unwrap().clone();

        let stamped =
            stamp_resource(&RelabelTable::standard(), &original, "1.2.0", "abc123").unwrap();

        assert_eq!(stamped.id(), original.id());
        assert_eq!(stamped.source(), "svc.yaml");
        assert_eq!(
            stamped.metadata().annotation(COMMIT_ANNOTATION),
            Some("abc123")
        );
        assert_eq!(stamped.metadata().namespace.as_deref(), Some("web"));
    }
}
