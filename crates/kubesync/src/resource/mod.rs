//! K8s-style resource model shared by repository and cluster state.
//!
//! Every resource, whether it was read from a manifest file, exported from the
//! live cluster, or stamped with a commit, exposes the same [`Resource`]
//! capability set. Diffing only ever looks at ids and bytes, never at where a
//! resource came from.

mod set;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::SyncError;

pub use set::ResourceSet;

/// Namespace used when a manifest does not declare one and none is supplied.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Identifies a resource as `namespace:kind/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    namespace: String,
    kind: String,
    name: String,
}

impl ResourceId {
    /// Creates a new id. An empty namespace becomes [`DEFAULT_NAMESPACE`].
    pub fn new(
        namespace: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        let namespace = namespace.into();
        Self {
            namespace: if namespace.is_empty() {
                DEFAULT_NAMESPACE.to_string()
            } else {
                namespace
            },
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.namespace, self.kind, self.name)
    }
}

impl std::str::FromStr for ResourceId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SyncError::InvalidResourceId(s.to_string());

        let (namespace, rest) = s.split_once(':').ok_or_else(invalid)?;
        let (kind, name) = rest.split_once('/').ok_or_else(invalid)?;
        if kind.is_empty() || name.is_empty() {
            return Err(invalid());
        }

        Ok(ResourceId::new(namespace, kind, name))
    }
}

impl Serialize for ResourceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Metadata for a resource, following K8s conventions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// The name of the resource within its kind and namespace.
    #[serde(default)]
    pub name: String,

    /// The namespace, when declared in the manifest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Key-value labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Key-value annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    /// Creates metadata with just a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Returns an annotation value.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

/// Capability set every resource variant provides.
pub trait Resource: Send + Sync + fmt::Debug {
    /// The unique id of this resource.
    fn id(&self) -> &ResourceId;

    /// Where the definition came from (file path relative to the manifest
    /// root, or a cluster marker).
    fn source(&self) -> &str;

    /// The raw manifest document.
    fn bytes(&self) -> &[u8];

    /// Decoded metadata of the document.
    fn metadata(&self) -> &ObjectMeta;
}

/// Reference-counted handle to any resource variant.
pub type SharedResource = Arc<dyn Resource>;

/// A resource loaded from a manifest file in the repository.
#[derive(Debug, Clone)]
pub struct Manifest {
    id: ResourceId,
    source: String,
    bytes: Vec<u8>,
    metadata: ObjectMeta,
}

impl Manifest {
    pub fn new(
        id: ResourceId,
        source: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
        metadata: ObjectMeta,
    ) -> Self {
        Self {
            id,
            source: source.into(),
            bytes: bytes.into(),
            metadata,
        }
    }
}

impl Resource for Manifest {
    fn id(&self) -> &ResourceId {
        &self.id
    }

    fn source(&self) -> &str {
        &self.source
    }

    fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
}

/// A resource exported from the live cluster.
#[derive(Debug, Clone)]
pub struct LiveObject {
    inner: SharedResource,
}

impl LiveObject {
    /// Wraps a document decoded from a cluster export.
    pub fn new(inner: SharedResource) -> Self {
        Self { inner }
    }
}

impl Resource for LiveObject {
    fn id(&self) -> &ResourceId {
        self.inner.id()
    }

    fn source(&self) -> &str {
        self.inner.source()
    }

    fn bytes(&self) -> &[u8] {
        self.inner.bytes()
    }

    fn metadata(&self) -> &ObjectMeta {
        self.inner.metadata()
    }
}

/// A resource whose document has been relabeled with a commit.
#[derive(Debug, Clone)]
pub struct Stamped {
    id: ResourceId,
    source: String,
    bytes: Vec<u8>,
    metadata: ObjectMeta,
    commit: String,
}

impl Stamped {
    /// Wraps the relabeled document of `original`. Id and source are kept.
    pub fn new(
        original: &dyn Resource,
        bytes: Vec<u8>,
        metadata: ObjectMeta,
        commit: impl Into<String>,
    ) -> Self {
        Self {
            id: original.id().clone(),
            source: original.source().to_string(),
            bytes,
            metadata,
            commit: commit.into(),
        }
    }

    /// The commit this resource was stamped with.
    pub fn commit(&self) -> &str {
        &self.commit
    }
}

impl Resource for Stamped {
    fn id(&self) -> &ResourceId {
        &self.id
    }

    fn source(&self) -> &str {
        &self.source
    }

    fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
}
