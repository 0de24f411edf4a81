//! Diff/plan builder: turns cluster, repository and changed sets into a
//! [`SyncDef`].

use crate::resource::{ResourceSet, SharedResource};

/// One operation of a sync.
#[derive(Debug, Clone)]
pub enum SyncAction {
    Delete(SharedResource),
    Apply(SharedResource),
}

impl SyncAction {
    pub fn resource(&self) -> &SharedResource {
        match self {
            SyncAction::Delete(r) | SyncAction::Apply(r) => r,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, SyncAction::Delete(_))
    }
}

/// The operations computed for one attempt. Order carries no meaning; the
/// applier sequences them.
#[derive(Debug, Clone, Default)]
pub struct SyncDef {
    actions: Vec<SyncAction>,
}

impl SyncDef {
    pub fn new(actions: Vec<SyncAction>) -> Self {
        Self { actions }
    }

    pub fn actions(&self) -> &[SyncAction] {
        &self.actions
    }

    pub fn deletes(&self) -> impl Iterator<Item = &SharedResource> {
        self.actions.iter().filter_map(|a| match a {
            SyncAction::Delete(r) => Some(r),
            SyncAction::Apply(_) => None,
        })
    }

    pub fn applies(&self) -> impl Iterator<Item = &SharedResource> {
        self.actions.iter().filter_map(|a| match a {
            SyncAction::Apply(r) => Some(r),
            SyncAction::Delete(_) => None,
        })
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Drops every delete, keeping applies.
    pub fn without_deletes(self) -> Self {
        Self {
            actions: self
                .actions
                .into_iter()
                .filter(|a| !a.is_delete())
                .collect(),
        }
    }
}

/// Computes the operations that bring the cluster in line with the repository.
///
/// Everything in `cluster` that `repo` no longer declares is deleted.
/// Everything in `changed` is applied; whether an apply is a no-op is for the
/// applier to find out.
pub fn plan(cluster: &ResourceSet, repo: &ResourceSet, changed: &ResourceSet) -> SyncDef {
    let deletes = cluster
        .iter()
        .filter(|(id, _)| !repo.contains(id))
        .map(|(_, r)| SyncAction::Delete(r.clone()));

    let applies = changed.values().map(|r| SyncAction::Apply(r.clone()));

    SyncDef::new(deletes.chain(applies).collect())
}
