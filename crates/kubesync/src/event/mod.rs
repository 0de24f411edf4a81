//! Sync events and their broadcast to subscribers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::manifest::LoadFailure;
use crate::resource::{Resource, ResourceId, SharedResource};

/// A resource that failed to relabel, apply or delete.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceError {
    pub id: ResourceId,
    pub source: String,
    pub error: String,
    /// Last commit of the source file, filled in when the event is built.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

impl ResourceError {
    pub fn new(id: ResourceId, source: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id,
            source: source.into(),
            error: error.into(),
            commit: None,
        }
    }

    pub fn from_resource(resource: &SharedResource, error: impl Into<String>) -> Self {
        Self::new(resource.id().clone(), resource.source(), error)
    }
}

/// Last commit that touched a manifest file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileCommit {
    pub path: String,
    pub commit: String,
}

/// Commit a resource was stamped with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceCommit {
    pub id: ResourceId,
    pub commit: String,
}

/// Record of one sync attempt. Built once, never mutated after reporting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: Uuid,
    pub namespace: String,
    /// Ids of every resource the attempt acted on.
    pub resource_ids: Vec<ResourceId>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Revision the attempt synced to; empty when it aborted before resolving one.
    pub commit: String,
    pub initial_sync: bool,
    pub errors: Vec<ResourceError>,
    pub load_errors: Vec<LoadFailure>,
    pub file_commits: Vec<FileCommit>,
    pub resource_commits: Vec<ResourceCommit>,
    /// Why the attempt aborted, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl Event {
    /// Event for an attempt that aborted before applying anything.
    pub fn aborted(
        namespace: impl Into<String>,
        started_at: DateTime<Utc>,
        commit: impl Into<String>,
        failure: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            namespace: namespace.into(),
            resource_ids: Vec::new(),
            started_at,
            ended_at: Utc::now(),
            commit: commit.into(),
            initial_sync: false,
            errors: Vec::new(),
            load_errors: Vec::new(),
            file_commits: Vec::new(),
            resource_commits: Vec::new(),
            failure: Some(failure.into()),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failure.is_none() && self.errors.is_empty() && self.load_errors.is_empty()
    }

    fn short_commit(&self) -> &str {
        self.commit.get(..7).unwrap_or(&self.commit)
    }

    fn level(&self) -> NotificationLevel {
        if self.failure.is_some() {
            NotificationLevel::Error
        } else if !self.is_clean() {
            NotificationLevel::Warn
        } else {
            NotificationLevel::Info
        }
    }

    fn summary(&self) -> String {
        if let Some(failure) = &self.failure {
            return format!("Sync of {} aborted: {}", self.namespace, failure);
        }

        let mut message = format!(
            "Sync of {} at {}: {} resource(s)",
            self.namespace,
            self.short_commit(),
            self.resource_ids.len()
        );
        if self.initial_sync {
            message.push_str(", initial sync");
        }
        if !self.errors.is_empty() {
            message.push_str(&format!(", {} error(s)", self.errors.len()));
        }
        if !self.load_errors.is_empty() {
            message.push_str(&format!(", {} file(s) skipped", self.load_errors.len()));
        }
        message
    }
}

/// Severity of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warn,
    Error,
}

impl From<NotificationLevel> for log::Level {
    fn from(level: NotificationLevel) -> Self {
        match level {
            NotificationLevel::Info => log::Level::Info,
            NotificationLevel::Warn => log::Level::Warn,
            NotificationLevel::Error => log::Level::Error,
        }
    }
}

/// Outward form of an [`Event`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncNotification {
    pub timestamp: DateTime<Utc>,
    pub level: NotificationLevel,
    pub message: String,
    pub event: Event,
}

impl SyncNotification {
    /// Single-line JSON form, for consumers outside the process.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl From<Event> for SyncNotification {
    fn from(event: Event) -> Self {
        Self {
            timestamp: event.ended_at,
            level: event.level(),
            message: event.summary(),
            event,
        }
    }
}

/// Publishes sync events to any number of subscribers.
///
/// Reporting never blocks; subscribers that fall behind lose the oldest
/// notifications.
#[derive(Clone)]
pub struct EventReporter {
    sender: broadcast::Sender<SyncNotification>,
}

impl EventReporter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Logs and publishes the event.
    pub fn report(&self, event: Event) {
        let notification = SyncNotification::from(event);
        log::log!(log::Level::from(notification.level), "{}", notification.message);
        // No active receivers is fine
        let _ = self.sender.send(notification);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotification> {
        self.sender.subscribe()
    }
}

impl Default for EventReporter {
    fn default() -> Self {
        Self::new(100)
    }
}
