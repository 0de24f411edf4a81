//! Cluster snapshot exporter.
//!
//! Lists the tracked kinds in a namespace and serializes them into the same
//! multidoc YAML the manifest store parses, so repository state and cluster
//! state can be compared id for id.
//!
//! Only objects this agent applied are exported. Everything else in the
//! namespace (service account tokens, objects installed by other tools) is
//! invisible to the plan and therefore never deleted.

use serde_yaml::{Mapping, Value};

use super::{ClusterClient, ClusterError, KindRegistry, TrackedKind};
use crate::error::{Result, SyncError};
use crate::manifest::parse_multidoc;
use crate::relabel::COMMIT_ANNOTATION;
use crate::resource::{LiveObject, ResourceId, ResourceSet, SharedResource};

/// Objects carrying this annotation with value `"true"` are never exported.
pub const IGNORE_ANNOTATION: &str = "kubesync.io/ignore";

/// Source recorded on resources decoded from an export.
pub const CLUSTER_SOURCE: &str = "<cluster>";

const RUNTIME_METADATA: &[&str] = &[
    "uid",
    "resourceVersion",
    "creationTimestamp",
    "generation",
    "managedFields",
    "selfLink",
];

const RUNTIME_ANNOTATIONS: &[&str] = &["kubectl.kubernetes.io/last-applied-configuration"];

/// Produces the serialized live state of a namespace.
pub trait ClusterSnapshot: Send + Sync {
    /// Serializes the tracked objects of `namespace` as multidoc YAML.
    fn export(&self, namespace: &str) -> Result<Vec<u8>>;

    /// Exports and decodes the live state of `namespace`.
    fn snapshot(&self, namespace: &str) -> Result<ResourceSet> {
        let exported = self.export(namespace)?;
        let decoded = parse_multidoc(namespace, &exported, CLUSTER_SOURCE)?;

        Ok(decoded
            .into_iter()
            .map(|(_, resource)| std::sync::Arc::new(LiveObject::new(resource)) as SharedResource)
            .collect())
    }
}

/// Exports live objects through a [`ClusterClient`].
pub struct ClusterExporter<C> {
    client: C,
    registry: KindRegistry,
    self_identity: Option<ResourceId>,
    excluded: Vec<ResourceId>,
}

impl<C: ClusterClient> ClusterExporter<C> {
    pub fn new(client: C, registry: KindRegistry) -> Self {
        Self {
            client,
            registry,
            self_identity: None,
            excluded: Vec::new(),
        }
    }

    /// Excludes the agent's own object from every export.
    pub fn with_self_identity(mut self, id: ResourceId) -> Self {
        self.self_identity = Some(id);
        self
    }

    /// Excludes further objects by id.
    pub fn with_excluded(mut self, ids: impl IntoIterator<Item = ResourceId>) -> Self {
        self.excluded.extend(ids);
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn registry(&self) -> &KindRegistry {
        &self.registry
    }

    fn is_excluded(&self, id: &ResourceId) -> bool {
        self.self_identity.as_ref() == Some(id) || self.excluded.contains(id)
    }

    /// Normalizes one listed object, or returns `None` when it is not ours to export.
    fn prepare(&self, namespace: &str, kind: &TrackedKind, object: Value) -> Result<Option<Value>> {
        let Value::Mapping(mut object) = object else {
            return Err(ClusterError::Decode(format!("{} object is not a mapping", kind.kind)).into());
        };

        let Some(Value::Mapping(metadata)) = object.get_mut("metadata") else {
            return Err(ClusterError::Decode(format!("{} object has no metadata", kind.kind)).into());
        };

        let name = metadata
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if name.is_empty() {
            return Err(ClusterError::Decode(format!("{} object has no name", kind.kind)).into());
        }

        let object_namespace = metadata
            .get("namespace")
            .and_then(Value::as_str)
            .unwrap_or(namespace)
            .to_string();
        let id = ResourceId::new(object_namespace, kind.kind, name);

        if self.is_excluded(&id) {
            log::debug!("Skipping excluded object {}", id);
            return Ok(None);
        }

        let owned = metadata
            .get("ownerReferences")
            .and_then(Value::as_sequence)
            .map(|refs| !refs.is_empty())
            .unwrap_or(false);
        if owned {
            log::debug!("Skipping owned object {}", id);
            return Ok(None);
        }

        let Some(Value::Mapping(annotations)) = metadata.get_mut("annotations") else {
            log::debug!("Skipping unmanaged object {}", id);
            return Ok(None);
        };
        if annotations.get(IGNORE_ANNOTATION).and_then(Value::as_str) == Some("true") {
            log::debug!("Skipping ignored object {}", id);
            return Ok(None);
        }
        if !annotations.contains_key(COMMIT_ANNOTATION) {
            log::debug!("Skipping unmanaged object {}", id);
            return Ok(None);
        }
        for key in RUNTIME_ANNOTATIONS {
            annotations.remove(*key);
        }

        for key in RUNTIME_METADATA {
            metadata.remove(*key);
        }
        object.remove("status");
        object.remove("apiVersion");
        object.remove("kind");

        let mut normalized = Mapping::new();
        normalized.insert("apiVersion".into(), kind.api_version.into());
        normalized.insert("kind".into(), kind.kind.into());
        normalized.extend(object);

        Ok(Some(Value::Mapping(normalized)))
    }
}

impl<C: ClusterClient> ClusterSnapshot for ClusterExporter<C> {
    fn export(&self, namespace: &str) -> Result<Vec<u8>> {
        let mut output = String::new();

        for kind in self.registry.iter() {
            let objects = match self.client.list(namespace, kind) {
                Ok(objects) => objects,
                Err(ClusterError::UnsupportedKind(_)) => {
                    log::debug!("Kind {} not served by cluster, skipping", kind.kind);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            for object in objects {
                if let Some(document) = self.prepare(namespace, kind, object)? {
                    let yaml = serde_yaml::to_string(&document)
                        .map_err(|e| SyncError::SerializeYaml(e.to_string()))?;
                    output.push_str("---\n");
                    output.push_str(&yaml);
                }
            }
        }

        Ok(output.into_bytes())
    }
}
