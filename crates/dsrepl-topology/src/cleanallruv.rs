//! CleanAllRUV tasks.
//!
//! Tasks are launched, listed and aborted through the gateway. Their state
//! is only observed through a full list refresh; there is no per-task
//! polling.

use crate::context::{EntityKey, Shared};
use crate::entry::Entry;
use crate::error::{Result, TopologyError, ValidationError};
use crate::events::{EntityKind, Snapshot};
use crate::gateway::{ArgValue, Command, Operation};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Display state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Still running; may be aborted.
    InProgress,
    /// Finished cleaning.
    Cleaned,
    /// Stopped by an abort.
    Aborted,
}

/// Classify a task status text. Matching is case-insensitive.
pub fn classify_task_status(status: &str) -> TaskState {
    let lower = status.to_ascii_lowercase();
    if lower.contains("successfully cleaned rid") {
        TaskState::Cleaned
    } else if lower.contains("task aborted for rid") {
        TaskState::Aborted
    } else {
        TaskState::InProgress
    }
}

/// One listed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanAllRuvTask {
    /// Task entry name.
    pub name: String,
    /// Suffix being cleaned.
    pub suffix: String,
    /// Replica id being purged.
    pub replica_id: String,
    /// Raw status text.
    pub status: String,
    /// Whether cleaning was forced.
    pub force: bool,
    /// Creation timestamp as stored.
    pub created: String,
    /// Derived from `status`.
    pub state: TaskState,
}

impl CleanAllRuvTask {
    /// Decode a task entry.
    pub fn from_entry(entry: &Entry) -> Self {
        let text = |attr: &str| entry.first(attr).unwrap_or_default().to_string();
        let status = text("nstaskstatus");
        Self {
            name: text("cn"),
            suffix: text("replica-base-dn"),
            replica_id: text("replica-id"),
            force: entry
                .first("replica-force-cleaning")
                .map_or(false, |v| v.eq_ignore_ascii_case("yes") || v.eq_ignore_ascii_case("on")),
            created: text("createtimestamp"),
            state: classify_task_status(&status),
            status,
        }
    }

    /// Whether an abort makes sense.
    pub fn is_abortable(&self) -> bool {
        self.state == TaskState::InProgress
    }
}

fn suffix_matches(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

fn require_target(suffix: &str, replica_id: &str) -> std::result::Result<(), ValidationError> {
    let mut missing = Vec::new();
    if suffix.trim().is_empty() {
        missing.push("suffix");
    }
    if replica_id.trim().is_empty() {
        missing.push("replica id");
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::MissingFields { fields: missing })
    }
}

/// Launches, lists and aborts CleanAllRUV tasks.
#[derive(Clone)]
pub struct CleanAllRuvManager {
    shared: Shared,
    tasks: Arc<DashMap<String, Vec<CleanAllRuvTask>>>,
}

impl CleanAllRuvManager {
    pub(crate) fn new(shared: Shared) -> Self {
        Self {
            shared,
            tasks: Arc::new(DashMap::new()),
        }
    }

    /// Tasks from the last refresh.
    pub fn snapshot(&self, suffix: &str) -> Vec<CleanAllRuvTask> {
        self.tasks
            .get(suffix.trim())
            .map(|tasks| tasks.clone())
            .unwrap_or_default()
    }

    /// Launch a task purging `replica_id` from `suffix`, then refresh the
    /// list.
    pub async fn launch(
        &self,
        suffix: &str,
        replica_id: &str,
        force: bool,
    ) -> Result<Vec<CleanAllRuvTask>> {
        let operation = Operation::CleanAllRuv.to_string();
        let result = async {
            require_target(suffix, replica_id)
                .map_err(|e| TopologyError::validation("launch cleanallruv task", e))?;
            let (suffix, replica_id) = (suffix.trim(), replica_id.trim());
            {
                let _guard = self
                    .shared
                    .lock(EntityKey::new(EntityKind::CleanAllRuvTask, suffix, replica_id))
                    .await;
                let mut cmd = Command::for_suffix(Operation::CleanAllRuv, suffix)
                    .flag("replica-id", replica_id);
                if force {
                    cmd = cmd.flag("force-cleaning", ArgValue::Switch);
                }
                if let Err(err) = self.shared.call(cmd).await {
                    self.resync(suffix).await;
                    return Err(err);
                }
            }
            info!(%suffix, %replica_id, force, "cleanallruv task launched");
            self.refresh(suffix).await
        }
        .await;
        self.shared.reported(&operation, result)
    }

    /// Replace the task list of `suffix` with the server's.
    pub async fn refresh_list(&self, suffix: &str) -> Result<Vec<CleanAllRuvTask>> {
        let operation = Operation::ListCleanAllRuv.to_string();
        let result = self.refresh(suffix.trim()).await;
        self.shared.reported(&operation, result)
    }

    async fn refresh(&self, suffix: &str) -> Result<Vec<CleanAllRuvTask>> {
        let payload = self.shared.call(Command::new(Operation::ListCleanAllRuv)).await?;
        let tasks: Vec<CleanAllRuvTask> = payload
            .items()?
            .iter()
            .map(CleanAllRuvTask::from_entry)
            .filter(|task| suffix_matches(&task.suffix, suffix))
            .collect();
        self.tasks.insert(suffix.to_string(), tasks.clone());
        self.shared.notify(
            EntityKind::CleanAllRuvTask,
            Snapshot::CleanAllRuvTasks {
                suffix: suffix.to_string(),
                tasks: tasks.clone(),
            },
        );
        Ok(tasks)
    }

    async fn resync(&self, suffix: &str) {
        if let Err(err) = self.refresh(suffix).await {
            warn!(%suffix, error = %err, "cleanallruv resync failed");
        }
    }

    /// Ask the server to abort the task for `replica_id`. Success only means
    /// the request was accepted; refresh the list to observe the effect.
    pub async fn abort(&self, suffix: &str, replica_id: &str) -> Result<()> {
        let operation = Operation::AbortCleanAllRuv.to_string();
        let result = async {
            require_target(suffix, replica_id)
                .map_err(|e| TopologyError::validation("abort cleanallruv task", e))?;
            let (suffix, replica_id) = (suffix.trim(), replica_id.trim());
            let _guard = self
                .shared
                .lock(EntityKey::new(EntityKind::CleanAllRuvTask, suffix, replica_id))
                .await;
            let cmd = Command::for_suffix(Operation::AbortCleanAllRuv, suffix)
                .flag("replica-id", replica_id);
            if let Err(err) = self.shared.call(cmd).await {
                self.resync(suffix).await;
                return Err(err);
            }
            info!(%suffix, %replica_id, "cleanallruv abort requested");
            Ok(())
        }
        .await;
        self.shared.reported(&operation, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert_eq!(
            classify_task_status("Successfully cleaned rid(4)"),
            TaskState::Cleaned
        );
        assert_eq!(
            classify_task_status("Task aborted for rid(4)."),
            TaskState::Aborted
        );
        assert_eq!(
            classify_task_status("Cleaning rid (4)..."),
            TaskState::InProgress
        );
        assert_eq!(classify_task_status(""), TaskState::InProgress);
    }

    #[test]
    fn test_task_from_entry() {
        let entry = Entry::new()
            .with("cn", ["clean 4"])
            .with("replica-base-dn", ["dc=example,dc=com"])
            .with("replica-id", ["4"])
            .with("replica-force-cleaning", ["no"])
            .with("createtimestamp", ["20240101120000Z"])
            .with("nstaskstatus", ["Waiting to process all the updates from the deleted replica..."]);
        let task = CleanAllRuvTask::from_entry(&entry);
        assert_eq!(task.name, "clean 4");
        assert_eq!(task.replica_id, "4");
        assert!(!task.force);
        assert!(task.is_abortable());

        let done = entry.with("nstaskstatus", ["Successfully cleaned rid(4)"]);
        assert!(!CleanAllRuvTask::from_entry(&done).is_abortable());
    }

    #[test]
    fn test_suffix_matching() {
        assert!(suffix_matches("dc=Example,dc=com", "dc=example,dc=com"));
        assert!(!suffix_matches("dc=other,dc=com", "dc=example,dc=com"));
    }
}
