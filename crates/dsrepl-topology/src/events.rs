//! Outward notifications.
//!
//! The controller reports every successful mutation, every poller completion
//! and every failure through a [`TopologyObserver`]. Observers only ever see
//! snapshots; they cannot reach back into controller state.

use crate::agreement::Agreement;
use crate::cleanallruv::CleanAllRuvTask;
use crate::poller::PollOutcome;
use crate::replica::ReplicaConfig;
use crate::winsync::WinsyncAgreement;
use serde::Serialize;
use std::fmt;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Which collection a notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EntityKind {
    /// Replica configuration and role.
    Replica,
    /// Replication managers.
    Manager,
    /// Replication changelog.
    Changelog,
    /// Replication agreements.
    Agreement,
    /// Windows sync agreements.
    WinsyncAgreement,
    /// CleanAllRUV tasks.
    CleanAllRuvTask,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Replica => "replica",
            EntityKind::Manager => "manager",
            EntityKind::Changelog => "changelog",
            EntityKind::Agreement => "agreement",
            EntityKind::WinsyncAgreement => "winsync agreement",
            EntityKind::CleanAllRuvTask => "cleanallruv task",
        };
        f.write_str(name)
    }
}

/// Read-only state handed to observers. Never carries secrets.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Snapshot {
    /// Replica configuration, including managers and changelog.
    Replica(ReplicaConfig),
    /// Every replication agreement of a suffix.
    Agreements {
        /// Owning suffix.
        suffix: String,
        /// Current rows.
        agreements: Vec<Agreement>,
    },
    /// Every winsync agreement of a suffix.
    WinsyncAgreements {
        /// Owning suffix.
        suffix: String,
        /// Current rows.
        agreements: Vec<WinsyncAgreement>,
    },
    /// CleanAllRUV tasks of a suffix.
    CleanAllRuvTasks {
        /// Owning suffix.
        suffix: String,
        /// Current tasks.
        tasks: Vec<CleanAllRuvTask>,
    },
    /// A total update finished.
    Initialization {
        /// Owning suffix.
        suffix: String,
        /// Agreement name.
        name: String,
        /// How it ended.
        outcome: PollOutcome,
    },
}

/// Receives controller notifications.
pub trait TopologyObserver: Send + Sync + 'static {
    /// A mutation succeeded or a poller finished.
    fn on_state_changed(&self, kind: EntityKind, snapshot: &Snapshot);

    /// An operation failed. `message` is the text shown to the user.
    fn on_error(&self, operation: &str, message: &str);
}

/// Event as delivered to [`EventBus`] subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TopologyEvent {
    /// See [`TopologyObserver::on_state_changed`].
    StateChanged {
        /// Collection.
        kind: EntityKind,
        /// New state.
        snapshot: Snapshot,
    },
    /// See [`TopologyObserver::on_error`].
    Error {
        /// Failed operation.
        operation: String,
        /// Error text.
        message: String,
    },
}

/// Broadcasts notifications to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TopologyEvent>,
}

impl EventBus {
    /// New bus; slow subscribers lag after `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    fn publish(&self, event: TopologyEvent) {
        if self.sender.receiver_count() == 0 {
            return;
        }
        // Only fails when every receiver dropped in between.
        let _ = self.sender.send(event);
    }
}

impl TopologyObserver for EventBus {
    fn on_state_changed(&self, kind: EntityKind, snapshot: &Snapshot) {
        self.publish(TopologyEvent::StateChanged {
            kind,
            snapshot: snapshot.clone(),
        });
    }

    fn on_error(&self, operation: &str, message: &str) {
        self.publish(TopologyEvent::Error {
            operation: operation.to_string(),
            message: message.to_string(),
        });
    }
}

/// Observer that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl TopologyObserver for TracingObserver {
    fn on_state_changed(&self, kind: EntityKind, snapshot: &Snapshot) {
        match snapshot {
            Snapshot::Replica(cfg) => {
                info!(%kind, suffix = %cfg.suffix, role = %cfg.role, "replica state changed")
            }
            Snapshot::Agreements { suffix, agreements } => {
                info!(%kind, %suffix, count = agreements.len(), "agreements refreshed")
            }
            Snapshot::WinsyncAgreements { suffix, agreements } => {
                info!(%kind, %suffix, count = agreements.len(), "winsync agreements refreshed")
            }
            Snapshot::CleanAllRuvTasks { suffix, tasks } => {
                info!(%kind, %suffix, count = tasks.len(), "cleanallruv tasks refreshed")
            }
            Snapshot::Initialization { suffix, name, outcome } => {
                info!(%kind, %suffix, %name, ?outcome, "initialization finished")
            }
        }
    }

    fn on_error(&self, operation: &str, message: &str) {
        warn!(%operation, %message, "operation failed");
    }
}
