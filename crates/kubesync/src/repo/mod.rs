//! Repository capability consumed by the sync controller.
//!
//! A [`Repository`] hands out per-attempt [`WorkingCopy`]s. All paths
//! exchanged through a working copy are relative to its manifest directory.

pub mod auth;
pub mod git;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Result, SyncError};

pub use git::GitRepository;

/// What a checkout is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutConfig {
    /// Tag that records the last synced revision.
    pub sync_tag: String,
    /// Tagger identity.
    pub user_name: String,
    pub user_email: String,
}

/// Source of working copies and of the upstream revision.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Creates a fresh working copy at the upstream revision.
    async fn checkout(&self, config: &CheckoutConfig) -> Result<Box<dyn WorkingCopy>>;

    /// Fetches upstream changes, tags included.
    async fn refresh(&self) -> Result<()>;

    /// Current upstream revision of the tracked branch.
    async fn revision(&self) -> Result<String>;
}

/// One attempt's private view of the repository.
#[async_trait]
pub trait WorkingCopy: Send + Sync {
    /// Directory holding the manifests.
    fn manifest_dir(&self) -> &Path;

    /// Revision the watermark points at, `None` when it does not exist yet.
    async fn watermark_revision(&self) -> Result<Option<String>>;

    /// Revision this working copy is checked out at.
    async fn head_revision(&self) -> Result<String>;

    /// Manifest files that differ between `revision` and head.
    async fn changed_files_since(&self, revision: &str) -> Result<Vec<PathBuf>>;

    /// Most recent commit touching `path`.
    async fn file_last_commit(&self, path: &Path) -> Result<String>;

    /// Moves the watermark to `revision` and publishes it upstream.
    async fn advance_watermark(&self, revision: &str, message: &str) -> Result<()>;
}

/// Runs `future` with an upper bound, mapping expiry to [`SyncError::GitTimeout`].
pub async fn with_timeout<T>(secs: u64, future: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(Duration::from_secs(secs), future).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::GitTimeout(secs)),
    }
}
