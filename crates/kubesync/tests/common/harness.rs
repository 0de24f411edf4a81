//! Test harness for isolated sync runs.
//!
//! `SyncHarness` owns a temporary manifest tree, a fake repository whose
//! history the test writes commit by commit and a fake cluster that records
//! every submission.

#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;
use tokio::sync::broadcast;

use kubesync::config::WatermarkPolicy;
use kubesync::controller::{Capabilities, ControllerSettings};
use kubesync::repo::CheckoutConfig;
use kubesync::{
    BatchApplier, ClusterExporter, ClusterSnapshot, EventReporter, KindRegistry, RelabelTable,
    ResourceSet, Result, SyncController, SyncNotification, SyncOutcome,
};

use super::fakes::{FakeCluster, FakeRepo};

/// Namespace every harness syncs.
pub const NAMESPACE: &str = "web";

pub struct SyncHarness {
    temp_dir: TempDir,
    /// Root of the manifest tree the controller loads.
    pub manifest_dir: PathBuf,
    pub repo: FakeRepo,
    pub cluster: FakeCluster,
    pub reporter: EventReporter,
    rt: tokio::runtime::Runtime,
}

impl SyncHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let manifest_dir = temp_dir.path().join("deploy");
        fs::create_dir_all(&manifest_dir).expect("Failed to create manifest dir");

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("Failed to build runtime");

        Self {
            repo: FakeRepo::new(&manifest_dir),
            cluster: FakeCluster::new(),
            reporter: EventReporter::default(),
            manifest_dir,
            temp_dir,
            rt,
        }
    }

    /// Writes (`Some`) or deletes (`None`) files and records one commit
    /// touching all of them. Returns the new revision.
    pub fn commit(&self, changes: &[(&str, Option<&str>)]) -> String {
        let mut touched = Vec::new();
        for (path, content) in changes {
            let full = self.manifest_dir.join(path);
            match content {
                Some(content) => {
                    if let Some(parent) = full.parent() {
                        fs::create_dir_all(parent).expect("Failed to create parent dir");
                    }
                    fs::write(&full, content).expect("Failed to write manifest");
                }
                None => fs::remove_file(&full).expect("Failed to remove manifest"),
            }
            touched.push(PathBuf::from(path));
        }
        self.repo.record_commit(touched)
    }

    pub fn settings() -> ControllerSettings {
        ControllerSettings {
            checkout: CheckoutConfig {
                sync_tag: format!("kubesync-sync-{}", NAMESPACE),
                user_name: "kubesync".to_string(),
                user_email: "kubesync@localhost".to_string(),
            },
            timeout_secs: 5,
            agent_version: "1.2.3".to_string(),
            watermark: WatermarkPolicy::OnSuccess,
            garbage_collect: true,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            repo: Arc::new(self.repo.clone()),
            cluster: Arc::new(self.exporter()),
            applier: Arc::new(BatchApplier::new(self.cluster.clone())),
            relabel: Arc::new(RelabelTable::standard()),
            reporter: self.reporter.clone(),
        }
    }

    /// Exporter over the fake cluster, as the agent builds it.
    pub fn exporter(&self) -> ClusterExporter<FakeCluster> {
        ClusterExporter::new(self.cluster.clone(), KindRegistry::standard())
    }

    /// What the agent sees of the namespace.
    pub fn live(&self) -> ResourceSet {
        self.exporter()
            .snapshot(NAMESPACE)
            .expect("Failed to snapshot fake cluster")
    }

    pub fn controller(&self) -> SyncController {
        self.controller_with(Self::settings())
    }

    pub fn controller_with(&self, settings: ControllerSettings) -> SyncController {
        SyncController::new(NAMESPACE, self.capabilities(), settings)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotification> {
        self.reporter.subscribe()
    }

    /// Runs one attempt to completion.
    pub fn sync(&self, controller: &SyncController) -> Result<SyncOutcome> {
        self.rt.block_on(controller.sync_once())
    }
}

impl Default for SyncHarness {
    fn default() -> Self {
        Self::new()
    }
}
