//! Sync controller: one attempt at bringing a namespace in line with the
//! repository.
//!
//! An attempt checks out a working copy, works out what changed since the
//! watermark, stamps and applies it, reports an [`Event`] and finally moves
//! the watermark. Anything that goes wrong before the apply step aborts the
//! attempt; the next trigger starts over.

pub mod scheduler;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::apply::Applier;
use crate::cluster::ClusterSnapshot;
use crate::config::{AgentConfig, WatermarkPolicy};
use crate::error::Result;
use crate::event::{Event, EventReporter, FileCommit, ResourceCommit, ResourceError};
use crate::manifest::{source_name, LoadReport, ManifestStore};
use crate::plan::plan;
use crate::relabel::{stamp_resource, Relabel};
use crate::repo::{with_timeout, CheckoutConfig, Repository, WorkingCopy};
use crate::resource::{Resource, ResourceId, ResourceSet, SharedResource};

pub use scheduler::{spawn_sync_loop, SyncHandle};

/// Per-namespace controller settings.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub checkout: CheckoutConfig,
    /// Upper bound for each repository call.
    pub timeout_secs: u64,
    pub agent_version: String,
    pub watermark: WatermarkPolicy,
    pub garbage_collect: bool,
}

impl ControllerSettings {
    pub fn from_config(config: &AgentConfig, namespace: &str) -> Self {
        Self {
            checkout: CheckoutConfig {
                sync_tag: config.git.tag_for(namespace),
                user_name: config.git.user_name.clone(),
                user_email: config.git.user_email.clone(),
            },
            timeout_secs: config.git.timeout_secs,
            agent_version: config.sync.agent_version.clone(),
            watermark: config.sync.watermark,
            garbage_collect: config.sync.garbage_collect,
        }
    }
}

/// What happened to the watermark at the end of an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatermarkOutcome {
    /// Moved to the contained revision.
    Advanced(String),
    /// Already at the synced revision.
    Unchanged,
    /// Kept in place because the attempt had failures.
    Held,
    /// Moving it failed; the next attempt redoes the work.
    Failed(String),
}

/// Summary of a completed attempt.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub namespace: String,
    pub event_id: Uuid,
    pub commit: String,
    pub initial_sync: bool,
    /// Resources the cluster accepted. Rejected ones only show in `errors`.
    pub applied: usize,
    /// Orphans actually removed.
    pub deleted: usize,
    pub errors: usize,
    pub load_failures: usize,
    pub watermark: WatermarkOutcome,
}

/// Capabilities a controller works with.
#[derive(Clone)]
pub struct Capabilities {
    pub repo: Arc<dyn Repository>,
    pub cluster: Arc<dyn ClusterSnapshot>,
    pub applier: Arc<dyn Applier>,
    pub relabel: Arc<dyn Relabel>,
    pub reporter: EventReporter,
}

/// What an attempt changes: the stamped resources and where they came from.
#[derive(Default)]
struct ChangeSet {
    initial: bool,
    resources: ResourceSet,
    file_commits: BTreeMap<String, String>,
    relabel_errors: Vec<ResourceError>,
}

/// Runs sync attempts for one namespace.
pub struct SyncController {
    namespace: String,
    caps: Capabilities,
    settings: ControllerSettings,
}

impl SyncController {
    pub fn new(
        namespace: impl Into<String>,
        caps: Capabilities,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            caps,
            settings,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Runs one attempt. Exactly one event is reported whatever the result.
    pub async fn sync_once(&self) -> Result<SyncOutcome> {
        let span = info_span!("sync", namespace = %self.namespace);
        let started_at = Utc::now();
        let mut commit = String::new();

        let result = self
            .run_attempt(started_at, &mut commit)
            .instrument(span)
            .await;

        match &result {
            Ok(outcome) => info!(
                namespace = %self.namespace,
                applied = outcome.applied,
                deleted = outcome.deleted,
                errors = outcome.errors,
                "sync finished"
            ),
            Err(e) => {
                warn!(namespace = %self.namespace, error = %e, retryable = e.is_retryable(), "sync aborted");
                self.caps.reporter.report(Event::aborted(
                    &self.namespace,
                    started_at,
                    commit,
                    e.to_string(),
                ));
            }
        }
        result
    }

    async fn run_attempt(
        &self,
        started_at: DateTime<Utc>,
        commit: &mut String,
    ) -> Result<SyncOutcome> {
        let timeout = self.settings.timeout_secs;

        let copy = with_timeout(timeout, self.caps.repo.checkout(&self.settings.checkout)).await?;
        let old_rev = with_timeout(timeout, copy.watermark_revision()).await?;
        let new_rev = with_timeout(timeout, copy.head_revision()).await?;
        commit.clone_from(&new_rev);
        debug!(old = ?old_rev, new = %new_rev, "revisions resolved");

        let store = ManifestStore::new(copy.manifest_dir(), &self.namespace);
        let full = store.load_all_tolerant()?;
        let changes = self
            .collect_changes(copy.as_ref(), &store, &full, old_rev.as_deref())
            .await?;

        let cluster = self.caps.cluster.snapshot(&self.namespace)?;
        let mut sync = plan(&cluster, &full.resources, &changes.resources);
        if !full.is_clean() {
            warn!(
                failures = full.failures.len(),
                "manifests failed to load, not deleting anything this round"
            );
            sync = sync.without_deletes();
        } else if !self.settings.garbage_collect {
            sync = sync.without_deletes();
        }

        let mut errors = self.caps.applier.apply(&self.namespace, &sync);
        let failed: BTreeSet<&ResourceId> = errors.iter().map(|e| &e.id).collect();
        let deleted = sync.deletes().filter(|r| !failed.contains(r.id())).count();
        let applied = sync.applies().filter(|r| !failed.contains(r.id())).count();
        errors.extend(changes.relabel_errors);
        for error in &mut errors {
            error.commit = changes.file_commits.get(&error.source).cloned();
        }

        let event = Event {
            id: Uuid::new_v4(),
            namespace: self.namespace.clone(),
            resource_ids: sync.actions().iter().map(|a| a.resource().id().clone()).collect(),
            started_at,
            ended_at: Utc::now(),
            commit: new_rev.clone(),
            initial_sync: changes.initial,
            errors,
            load_errors: full.failures.clone(),
            file_commits: changes
                .file_commits
                .iter()
                .map(|(path, commit)| FileCommit {
                    path: path.clone(),
                    commit: commit.clone(),
                })
                .collect(),
            resource_commits: resource_commits(&changes.resources, &changes.file_commits),
            failure: None,
        };
        let event_id = event.id;
        let error_count = event.errors.len();
        let clean = event.is_clean();
        self.caps.reporter.report(event);

        let watermark = self
            .advance_watermark(copy.as_ref(), old_rev.as_deref(), &new_rev, clean)
            .await;

        Ok(SyncOutcome {
            namespace: self.namespace.clone(),
            event_id,
            commit: new_rev,
            initial_sync: changes.initial,
            applied,
            deleted,
            errors: error_count,
            load_failures: full.failures.len(),
            watermark,
        })
    }

    /// Works out which resources changed since `old_rev` and stamps them.
    async fn collect_changes(
        &self,
        copy: &dyn WorkingCopy,
        store: &ManifestStore,
        full: &LoadReport,
        old_rev: Option<&str>,
    ) -> Result<ChangeSet> {
        let timeout = self.settings.timeout_secs;

        let diff = match old_rev {
            None => None,
            Some(rev) => match with_timeout(timeout, copy.changed_files_since(rev)).await {
                Ok(files) => Some(files),
                Err(e) if e.is_unknown_revision() => {
                    warn!(revision = rev, "watermark revision unknown, syncing everything");
                    None
                }
                Err(e) => return Err(e),
            },
        };

        let (initial, resources, files) = match diff {
            None => (true, full.resources.clone(), full.files.clone()),
            Some(files) => {
                let subset = store.load_subset_tolerant(&files)?;
                let mut resources = subset.resources;
                // Only keep definitions the full load agrees on.
                resources.retain(|id, resource| {
                    full.resources
                        .get(id)
                        .map(|r| r.source() == resource.source())
                        .unwrap_or(false)
                });
                let files: Vec<PathBuf> = subset
                    .files
                    .into_iter()
                    .filter(|f| full.files.contains(f))
                    .collect();
                (false, resources, files)
            }
        };

        let mut file_commits = BTreeMap::new();
        for file in &files {
            let commit = with_timeout(timeout, copy.file_last_commit(file)).await?;
            file_commits.insert(source_name(file), commit);
        }

        let mut changes = ChangeSet {
            initial,
            file_commits,
            ..Default::default()
        };
        for resource in resources.values() {
            let commit = changes
                .file_commits
                .get(resource.source())
                .cloned()
                .unwrap_or_default();
            match stamp_resource(
                self.caps.relabel.as_ref(),
                resource,
                &self.settings.agent_version,
                &commit,
            ) {
                Ok(stamped) => {
                    changes.resources.insert(stamped);
                }
                Err(e) => {
                    warn!(id = %resource.id(), error = %e, "relabel failed");
                    changes
                        .relabel_errors
                        .push(ResourceError::from_resource(resource, e.to_string()));
                }
            }
        }

        Ok(changes)
    }

    async fn advance_watermark(
        &self,
        copy: &dyn WorkingCopy,
        old_rev: Option<&str>,
        new_rev: &str,
        clean: bool,
    ) -> WatermarkOutcome {
        if old_rev == Some(new_rev) {
            return WatermarkOutcome::Unchanged;
        }
        if !clean && self.settings.watermark == WatermarkPolicy::OnSuccess {
            info!(revision = new_rev, "attempt had failures, holding watermark");
            return WatermarkOutcome::Held;
        }

        let timeout = self.settings.timeout_secs;
        let message = format!("Sync pointer for {}", self.namespace);
        if let Err(e) = with_timeout(timeout, copy.advance_watermark(new_rev, &message)).await {
            warn!(error = %e, "failed to move watermark");
            return WatermarkOutcome::Failed(e.to_string());
        }

        if let Err(e) = with_timeout(timeout, self.caps.repo.refresh()).await {
            warn!(error = %e, "refresh after moving watermark failed");
        }
        WatermarkOutcome::Advanced(new_rev.to_string())
    }
}

fn resource_commits(
    resources: &ResourceSet,
    file_commits: &BTreeMap<String, String>,
) -> Vec<ResourceCommit> {
    resources
        .values()
        .filter_map(|r: &SharedResource| {
            file_commits.get(r.source()).map(|commit| ResourceCommit {
                id: r.id().clone(),
                commit: commit.clone(),
            })
        })
        .collect()
}
