//! Keyed collection of resources.

use std::collections::btree_map::{self, BTreeMap};
use std::sync::Arc;

use super::{Resource, ResourceId, SharedResource};

/// Resources keyed by id. Iteration is ordered by id.
#[derive(Debug, Clone, Default)]
pub struct ResourceSet {
    resources: BTreeMap<ResourceId, SharedResource>,
}

impl ResourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a resource, returning the one it replaced, if any.
    pub fn insert(&mut self, resource: SharedResource) -> Option<SharedResource> {
        self.resources.insert(resource.id().clone(), resource)
    }

    /// Convenience for inserting a concrete resource.
    pub fn add<R: Resource + 'static>(&mut self, resource: R) -> Option<SharedResource> {
        self.insert(Arc::new(resource))
    }

    pub fn get(&self, id: &ResourceId) -> Option<&SharedResource> {
        self.resources.get(id)
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.resources.contains_key(id)
    }

    pub fn remove(&mut self, id: &ResourceId) -> Option<SharedResource> {
        self.resources.remove(id)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ResourceId> {
        self.resources.keys()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, ResourceId, SharedResource> {
        self.resources.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &SharedResource> {
        self.resources.values()
    }

    /// Keeps only the resources for which `keep` returns true.
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&ResourceId, &SharedResource) -> bool,
    {
        self.resources.retain(|id, r| keep(id, r));
    }

    /// Returns the first id present in both sets.
    pub fn first_overlap<'a>(&'a self, other: &ResourceSet) -> Option<&'a ResourceId> {
        self.resources.keys().find(|id| other.contains(id))
    }

    /// Moves every resource of `other` into this set, replacing on collision.
    pub fn merge(&mut self, other: ResourceSet) {
        self.resources.extend(other.resources);
    }
}

impl IntoIterator for ResourceSet {
    type Item = (ResourceId, SharedResource);
    type IntoIter = btree_map::IntoIter<ResourceId, SharedResource>;

    fn into_iter(self) -> Self::IntoIter {
        self.resources.into_iter()
    }
}

impl<'a> IntoIterator for &'a ResourceSet {
    type Item = (&'a ResourceId, &'a SharedResource);
    type IntoIter = btree_map::Iter<'a, ResourceId, SharedResource>;

    fn into_iter(self) -> Self::IntoIter {
        self.resources.iter()
    }
}

impl FromIterator<SharedResource> for ResourceSet {
    fn from_iter<I: IntoIterator<Item = SharedResource>>(iter: I) -> Self {
        let mut set = ResourceSet::new();
        for resource in iter {
            set.insert(resource);
        }
        set
    }
}
