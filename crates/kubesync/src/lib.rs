pub mod agent;
pub mod apply;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod manifest;
pub mod plan;
pub mod process;
pub mod relabel;
pub mod repo;
pub mod resource;
pub mod secrets;
pub mod telemetry;

pub use agent::{Agent, AgentHandle};
pub use apply::{kind_rank, Applier, ApplyClient, BatchApplier, Operation};
pub use cluster::{ClusterError, ClusterExporter, ClusterSnapshot, KindRegistry, Kubectl};
pub use config::{AgentConfig, WatermarkPolicy};
pub use controller::{SyncController, SyncHandle, SyncOutcome, WatermarkOutcome};
pub use error::{Result, SyncError};
pub use event::{Event, EventReporter, ResourceError, SyncNotification};
pub use manifest::{parse_multidoc, LoadFailure, LoadReport, ManifestStore};
pub use plan::{plan, SyncAction, SyncDef};
pub use relabel::{Relabel, RelabelTable};
pub use repo::{CheckoutConfig, GitRepository, Repository, WorkingCopy};
pub use resource::{Resource, ResourceId, ResourceSet, SharedResource};
pub use secrets::{resolve_secret, SecretError};
