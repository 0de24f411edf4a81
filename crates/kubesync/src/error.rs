//! Error types for the sync engine.

use std::path::PathBuf;
use thiserror::Error;

use crate::resource::ResourceId;

/// Errors that can occur while loading manifests or running a sync attempt.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Failed to read manifest directory '{path}': {source}")]
    ReadDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse manifest '{source_name}': {message}")]
    ParseManifest {
        source_name: String,
        message: String,
    },

    #[error("Resource {id} is defined in both '{first}' and '{second}'")]
    DuplicateDefinition {
        id: ResourceId,
        first: String,
        second: String,
    },

    #[error("Invalid resource id '{0}', expected namespace:kind/name")]
    InvalidResourceId(String),

    #[error("Failed to serialize YAML: {0}")]
    SerializeYaml(String),

    #[error("Relabel failed for {id}: {message}")]
    Relabel { id: String, message: String },

    #[error("Cluster error: {0}")]
    Cluster(#[from] crate::cluster::ClusterError),

    #[error("Git operation failed: {0}")]
    GitOperation(String),

    #[error("Git network error: {0}")]
    GitNetworkError(String),

    #[error("Git operation timed out after {0}s")]
    GitTimeout(u64),

    #[error("Git authentication failed: {0}")]
    GitAuthFailed(String),

    #[error("Unknown git revision: {0}")]
    UnknownRevision(String),

    #[error("Manifest directory not found: {0}")]
    ManifestDirNotFound(PathBuf),

    #[error("Failed to read config file '{path}': {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Logging setup failed: {0}")]
    Telemetry(String),
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::GitOperation(err.to_string())
    }
}

impl SyncError {
    /// Returns true if the error is likely transient and the next trigger may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::GitNetworkError(_) | SyncError::GitTimeout(_) | SyncError::Cluster(_)
        )
    }

    /// Returns true if a revision could not be resolved in the repository.
    ///
    /// An unknown watermark revision means there is no baseline to diff against.
    pub fn is_unknown_revision(&self) -> bool {
        matches!(self, SyncError::UnknownRevision(_))
    }
}

/// Classifies a git stderr string into a more specific error variant.
pub fn classify_git_error(stderr: &str) -> SyncError {
    let lower = stderr.to_lowercase();

    if lower.contains("unknown revision")
        || lower.contains("bad revision")
        || lower.contains("bad object")
        || lower.contains("not a valid object name")
        || lower.contains("needed a single revision")
    {
        return SyncError::UnknownRevision(stderr.trim().to_string());
    }

    if lower.contains("could not resolve host")
        || lower.contains("connection refused")
        || lower.contains("connection timed out")
        || lower.contains("network is unreachable")
        || lower.contains("unable to access")
        || lower.contains("failed to connect")
        || lower.contains("couldn't connect to server")
        || lower.contains("the remote end hung up unexpectedly")
    {
        return SyncError::GitNetworkError(stderr.trim().to_string());
    }

    if lower.contains("authentication failed")
        || lower.contains("permission denied")
        || lower.contains("invalid credentials")
    {
        return SyncError::GitAuthFailed(stderr.trim().to_string());
    }

    SyncError::GitOperation(stderr.trim().to_string())
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
