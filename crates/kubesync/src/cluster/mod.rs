//! Live cluster access: tracked kinds, the client seam and the snapshot exporter.

pub mod kubectl;
pub mod snapshot;

use thiserror::Error;

pub use kubectl::Kubectl;
pub use snapshot::{ClusterExporter, ClusterSnapshot, IGNORE_ANNOTATION};

/// Errors reported by a cluster client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("Kind {0} is not served by the cluster")]
    UnsupportedKind(String),

    #[error("Cluster request failed: {0}")]
    Request(String),

    #[error("Failed to decode cluster response: {0}")]
    Decode(String),
}

/// A kind the exporter lists from the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedKind {
    pub api_version: &'static str,
    pub kind: &'static str,
    /// Lower-case plural resource name, as the API server knows it.
    pub plural: &'static str,
}

impl TrackedKind {
    pub const fn new(api_version: &'static str, kind: &'static str, plural: &'static str) -> Self {
        Self {
            api_version,
            kind,
            plural,
        }
    }

    /// API group, empty for the core group.
    pub fn group(&self) -> &'static str {
        match self.api_version.split_once('/') {
            Some((group, _)) => group,
            None => "",
        }
    }

    /// `plural.group` form accepted by `kubectl get`.
    pub fn qualified_plural(&self) -> String {
        match self.group() {
            "" => self.plural.to_string(),
            group => format!("{}.{}", self.plural, group),
        }
    }
}

const STANDARD_KINDS: &[TrackedKind] = &[
    TrackedKind::new("v1", "ServiceAccount", "serviceaccounts"),
    TrackedKind::new("rbac.authorization.k8s.io/v1", "Role", "roles"),
    TrackedKind::new("rbac.authorization.k8s.io/v1", "RoleBinding", "rolebindings"),
    TrackedKind::new("v1", "Service", "services"),
    TrackedKind::new("v1", "ResourceQuota", "resourcequotas"),
    TrackedKind::new("v1", "LimitRange", "limitranges"),
    TrackedKind::new("v1", "Secret", "secrets"),
    TrackedKind::new("v1", "ConfigMap", "configmaps"),
    TrackedKind::new("v1", "PersistentVolumeClaim", "persistentvolumeclaims"),
    TrackedKind::new("networking.k8s.io/v1", "Ingress", "ingresses"),
    TrackedKind::new("apps/v1", "DaemonSet", "daemonsets"),
    TrackedKind::new("apps/v1", "Deployment", "deployments"),
    TrackedKind::new("v1", "ReplicationController", "replicationcontrollers"),
    TrackedKind::new("apps/v1", "ReplicaSet", "replicasets"),
    TrackedKind::new("apps/v1", "StatefulSet", "statefulsets"),
    TrackedKind::new("batch/v1", "Job", "jobs"),
    TrackedKind::new("batch/v1", "CronJob", "cronjobs"),
];

/// Static table of kinds the exporter tracks, passed in at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindRegistry {
    kinds: Vec<TrackedKind>,
}

impl KindRegistry {
    /// Creates a registry with exactly the given kinds.
    pub fn new(kinds: Vec<TrackedKind>) -> Self {
        Self { kinds }
    }

    /// The namespaced workload and configuration kinds.
    pub fn standard() -> Self {
        Self::new(STANDARD_KINDS.to_vec())
    }

    /// Adds a kind unless it is already tracked.
    pub fn with(mut self, kind: TrackedKind) -> Self {
        if !self.kinds.iter().any(|k| k.kind == kind.kind) {
            self.kinds.push(kind);
        }
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackedKind> {
        self.kinds.iter()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.kinds.iter().any(|k| k.kind == kind)
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

/// Read access to live objects.
pub trait ClusterClient: Send + Sync {
    /// Lists the objects of `kind` in `namespace`.
    ///
    /// Returns [`ClusterError::UnsupportedKind`] when the server does not
    /// serve the kind.
    fn list(
        &self,
        namespace: &str,
        kind: &TrackedKind,
    ) -> std::result::Result<Vec<serde_yaml::Value>, ClusterError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qualified_plural() {
        let svc = TrackedKind::new("v1", "Service", "services");
        assert_eq!(svc.group(), "");
        assert_eq!(svc.qualified_plural(), "services");

        let dep = TrackedKind::new("apps/v1", "Deployment", "deployments");
        assert_eq!(dep.group(), "apps");
        assert_eq!(dep.qualified_plural(), "deployments.apps");
    }

    #[test]
    fn test_standard_registry() {
        let registry = KindRegistry::standard();
        assert!(registry.contains("Deployment"));
        assert!(registry.contains("ConfigMap"));
        assert!(!registry.contains("Namespace"));
    }

    #[test]
    fn test_registry_with_ignores_duplicates() {
        let registry = KindRegistry::new(Vec::new())
            .with(TrackedKind::new("v1", "Service", "services"))
            .with(TrackedKind::new("v1", "Service", "services"));
        assert_eq!(registry.len(), 1);
    }
}
