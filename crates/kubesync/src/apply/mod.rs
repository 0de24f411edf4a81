//! Apply executor.
//!
//! Sequences a [`SyncDef`] into per-kind batches ordered by the rank table,
//! submits each batch once and falls back to one call per resource when a
//! batch is rejected. Failures are collected per resource; they never stop
//! the pass.

use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, info_span, warn};

use crate::cluster::ClusterError;
use crate::event::ResourceError;
use crate::plan::SyncDef;
use crate::resource::{Resource, SharedResource};

/// Rank given to kinds missing from the rank table.
pub const UNRANKED: u8 = 4;

/// The operation a batch performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Apply,
    Delete,
}

impl Operation {
    /// The `kubectl` verb for this operation.
    pub fn verb(&self) -> &'static str {
        match self {
            Operation::Apply => "apply",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

/// Submits documents to the cluster.
pub trait ApplyClient: Send + Sync {
    /// Applies or deletes `resources` in one call. All-or-nothing from the
    /// caller's point of view: any failure rejects the whole call.
    fn submit(
        &self,
        namespace: &str,
        operation: Operation,
        resources: &[SharedResource],
    ) -> Result<(), ClusterError>;
}

/// Executes a computed sync against the cluster.
pub trait Applier: Send + Sync {
    /// Runs every operation of `sync`, returning one error per failed resource.
    fn apply(&self, namespace: &str, sync: &SyncDef) -> Vec<ResourceError>;
}

/// Position of `kind` in the dependency order. Lower ranks are applied first
/// and deleted last.
pub fn kind_rank(kind: &str) -> u8 {
    match kind {
        "Namespace" => 0,
        "ServiceAccount" | "ClusterRole" | "Role" | "PersistentVolume" | "Service" => 1,
        "ResourceQuota" | "LimitRange" | "Secret" | "ConfigMap" | "RoleBinding"
        | "ClusterRoleBinding" | "PersistentVolumeClaim" | "Ingress" => 2,
        "DaemonSet" | "Deployment" | "ReplicationController" | "ReplicaSet" | "Job"
        | "CronJob" | "StatefulSet" => 3,
        _ => UNRANKED,
    }
}

/// A group of same-kind resources submitted together.
#[derive(Debug)]
pub struct Batch {
    pub kind: String,
    pub resources: Vec<SharedResource>,
}

/// Groups resources by kind, orders batches by `(rank, kind)` and resources
/// within a batch by name.
pub fn batches<'a>(resources: impl IntoIterator<Item = &'a SharedResource>) -> Vec<Batch> {
    let mut by_kind: BTreeMap<(u8, String), Vec<SharedResource>> = BTreeMap::new();
    for resource in resources {
        let kind = resource.id().kind().to_string();
        by_kind
            .entry((kind_rank(&kind), kind))
            .or_default()
            .push(resource.clone());
    }

    by_kind
        .into_iter()
        .map(|((_, kind), mut resources)| {
            resources.sort_by(|a, b| a.id().name().cmp(b.id().name()));
            Batch { kind, resources }
        })
        .collect()
}

/// [`Applier`] that talks to the cluster in per-kind batches.
pub struct BatchApplier<C> {
    client: C,
}

impl<C: ApplyClient> BatchApplier<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    fn run_batch(
        &self,
        namespace: &str,
        operation: Operation,
        batch: &Batch,
        errors: &mut Vec<ResourceError>,
    ) {
        let _span = info_span!("batch",
            op = %operation,
            kind = %batch.kind,
            count = batch.resources.len(),
        )
        .entered();

        match self.client.submit(namespace, operation, &batch.resources) {
            Ok(()) => {
                debug!("batch submitted");
                return;
            }
            Err(e) if batch.resources.len() == 1 => {
                errors.push(ResourceError::from_resource(&batch.resources[0], e.to_string()));
                return;
            }
            Err(e) => warn!(error = %e, "batch rejected, retrying one by one"),
        }

        for resource in &batch.resources {
            if let Err(e) =
                self.client
                    .submit(namespace, operation, std::slice::from_ref(resource))
            {
                warn!(id = %resource.id(), error = %e, "{} failed", operation);
                errors.push(ResourceError::from_resource(resource, e.to_string()));
            }
        }
    }
}

impl<C: ApplyClient> Applier for BatchApplier<C> {
    fn apply(&self, namespace: &str, sync: &SyncDef) -> Vec<ResourceError> {
        let _span = info_span!("apply", namespace = %namespace, actions = sync.len()).entered();
        let mut errors = Vec::new();

        for batch in batches(sync.deletes()).iter().rev() {
            self.run_batch(namespace, Operation::Delete, batch, &mut errors);
        }
        for batch in &batches(sync.applies()) {
            self.run_batch(namespace, Operation::Apply, batch, &mut errors);
        }

        errors
    }
}
