//! In-memory stand-ins for git and the cluster.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_yaml::Value;

use kubesync::apply::{ApplyClient, Operation};
use kubesync::cluster::{ClusterClient, ClusterError, TrackedKind};
use kubesync::repo::{CheckoutConfig, Repository, WorkingCopy};
use kubesync::{Resource, ResourceId, Result, SharedResource, SyncError};

/// One commit of the fake history: its revision and the files it touched.
#[derive(Debug, Clone)]
struct Commit {
    revision: String,
    files: Vec<PathBuf>,
}

#[derive(Debug, Default)]
struct RepoState {
    history: Vec<Commit>,
    watermark: Option<String>,
    fail_checkout: Option<String>,
    fail_push: bool,
    checkouts: usize,
    refreshes: usize,
    advanced: Vec<(String, String)>,
}

/// Repository over a manifest directory the test edits in place.
///
/// Every working copy shares the directory and the state, so a checkout
/// always sees the latest fake commit.
#[derive(Clone)]
pub struct FakeRepo {
    manifest_dir: PathBuf,
    state: Arc<Mutex<RepoState>>,
}

impl FakeRepo {
    pub fn new(manifest_dir: impl Into<PathBuf>) -> Self {
        Self {
            manifest_dir: manifest_dir.into(),
            state: Arc::new(Mutex::new(RepoState::default())),
        }
    }

    /// Records a commit touching `files` and returns its revision.
    pub fn record_commit(&self, files: Vec<PathBuf>) -> String {
        let mut state = self.state.lock().unwrap();
        let revision = format!("{:040x}", state.history.len() + 1);
        state.history.push(Commit {
            revision: revision.clone(),
            files,
        });
        revision
    }

    pub fn head(&self) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.history.last().map(|c| c.revision.clone())
    }

    pub fn watermark(&self) -> Option<String> {
        self.state.lock().unwrap().watermark.clone()
    }

    pub fn set_watermark(&self, revision: Option<&str>) {
        self.state.lock().unwrap().watermark = revision.map(str::to_string);
    }

    pub fn fail_checkout(&self, message: Option<&str>) {
        self.state.lock().unwrap().fail_checkout = message.map(str::to_string);
    }

    pub fn fail_push(&self, fail: bool) {
        self.state.lock().unwrap().fail_push = fail;
    }

    pub fn checkouts(&self) -> usize {
        self.state.lock().unwrap().checkouts
    }

    pub fn refreshes(&self) -> usize {
        self.state.lock().unwrap().refreshes
    }

    /// `(tag, revision)` pairs the watermark was moved to, oldest first.
    pub fn advanced(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().advanced.clone()
    }
}

#[async_trait]
impl Repository for FakeRepo {
    async fn checkout(&self, config: &CheckoutConfig) -> Result<Box<dyn WorkingCopy>> {
        let mut state = self.state.lock().unwrap();
        state.checkouts += 1;
        if let Some(message) = &state.fail_checkout {
            return Err(SyncError::GitNetworkError(message.clone()));
        }
        Ok(Box::new(FakeCopy {
            manifest_dir: self.manifest_dir.clone(),
            tag: config.sync_tag.clone(),
            state: Arc::clone(&self.state),
        }))
    }

    async fn refresh(&self) -> Result<()> {
        self.state.lock().unwrap().refreshes += 1;
        Ok(())
    }

    async fn revision(&self) -> Result<String> {
        self.head()
            .ok_or_else(|| SyncError::UnknownRevision("empty history".to_string()))
    }
}

struct FakeCopy {
    manifest_dir: PathBuf,
    tag: String,
    state: Arc<Mutex<RepoState>>,
}

#[async_trait]
impl WorkingCopy for FakeCopy {
    fn manifest_dir(&self) -> &Path {
        &self.manifest_dir
    }

    async fn watermark_revision(&self) -> Result<Option<String>> {
        Ok(self.state.lock().unwrap().watermark.clone())
    }

    async fn head_revision(&self) -> Result<String> {
        let state = self.state.lock().unwrap();
        state
            .history
            .last()
            .map(|c| c.revision.clone())
            .ok_or_else(|| SyncError::UnknownRevision("HEAD".to_string()))
    }

    async fn changed_files_since(&self, revision: &str) -> Result<Vec<PathBuf>> {
        let state = self.state.lock().unwrap();
        let position = state
            .history
            .iter()
            .position(|c| c.revision == revision)
            .ok_or_else(|| SyncError::UnknownRevision(revision.to_string()))?;

        let files: BTreeSet<PathBuf> = state.history[position + 1..]
            .iter()
            .flat_map(|c| c.files.iter().cloned())
            .collect();
        Ok(files.into_iter().collect())
    }

    async fn file_last_commit(&self, path: &Path) -> Result<String> {
        let state = self.state.lock().unwrap();
        state
            .history
            .iter()
            .rev()
            .find(|c| c.files.iter().any(|f| f == path))
            .map(|c| c.revision.clone())
            .ok_or_else(|| SyncError::GitOperation(format!("no commit touches {}", path.display())))
    }

    async fn advance_watermark(&self, revision: &str, _message: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_push {
            return Err(SyncError::GitNetworkError("push rejected".to_string()));
        }
        state.watermark = Some(revision.to_string());
        state.advanced.push((self.tag.clone(), revision.to_string()));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ClusterState {
    objects: BTreeMap<ResourceId, Vec<u8>>,
    rejected: BTreeSet<String>,
    calls: Vec<(Operation, Vec<ResourceId>)>,
}

/// Namespace contents held in memory. Serves both listings and applies.
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Puts an object in the cluster without going through an apply.
    pub fn seed(&self, id: ResourceId, document: &str) {
        let mut state = self.state.lock().unwrap();
        state.objects.insert(id, document.as_bytes().to_vec());
    }

    /// Makes every submission naming `name` fail.
    pub fn reject(&self, name: &str) {
        self.state.lock().unwrap().rejected.insert(name.to_string());
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.state.lock().unwrap().objects.contains_key(id)
    }

    pub fn document(&self, id: &ResourceId) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .get(id)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn ids(&self) -> Vec<ResourceId> {
        self.state.lock().unwrap().objects.keys().cloned().collect()
    }

    pub fn calls(&self) -> Vec<(Operation, Vec<ResourceId>)> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }
}

impl ClusterClient for FakeCluster {
    fn list(
        &self,
        namespace: &str,
        kind: &TrackedKind,
    ) -> std::result::Result<Vec<Value>, ClusterError> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .iter()
            .filter(|(id, _)| id.namespace() == namespace && id.kind() == kind.kind)
            .map(|(_, document)| {
                serde_yaml::from_slice(document).map_err(|e| ClusterError::Decode(e.to_string()))
            })
            .collect()
    }
}

impl ApplyClient for FakeCluster {
    fn submit(
        &self,
        _namespace: &str,
        operation: Operation,
        resources: &[SharedResource],
    ) -> std::result::Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        let ids: Vec<ResourceId> = resources.iter().map(|r| r.id().clone()).collect();
        state.calls.push((operation, ids));

        if let Some(bad) = resources
            .iter()
            .find(|r| state.rejected.contains(r.id().name()))
        {
            return Err(ClusterError::Request(format!(
                "admission webhook denied {}",
                bad.id()
            )));
        }

        for resource in resources {
            match operation {
                Operation::Apply => {
                    state
                        .objects
                        .insert(resource.id().clone(), resource.bytes().to_vec());
                }
                Operation::Delete => {
                    state.objects.remove(resource.id());
                }
            }
        }
        Ok(())
    }
}
