//! State shared by the controller's components.

use crate::entry::Payload;
use crate::error::{Result, TopologyError};
use crate::events::{EntityKind, Snapshot, TopologyObserver};
use crate::gateway::{Command, CommandGateway};
use crate::poller::PollerRegistry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// Key of a per-entity lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct EntityKey {
    kind: EntityKind,
    suffix: String,
    name: String,
}

impl EntityKey {
    pub(crate) fn new(kind: EntityKind, suffix: &str, name: &str) -> Self {
        Self {
            kind,
            suffix: suffix.to_string(),
            name: name.to_string(),
        }
    }
}

/// Held while one entity is mutated. The lock table entry goes away with
/// its last holder.
pub(crate) struct EntityGuard {
    key: EntityKey,
    locks: Arc<DashMap<EntityKey, Arc<Mutex<()>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for EntityGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[derive(Clone)]
pub(crate) struct Shared {
    gateway: Arc<dyn CommandGateway>,
    observer: Arc<dyn TopologyObserver>,
    pub(crate) pollers: PollerRegistry,
    locks: Arc<DashMap<EntityKey, Arc<Mutex<()>>>>,
}

impl Shared {
    pub(crate) fn new(
        gateway: Arc<dyn CommandGateway>,
        observer: Arc<dyn TopologyObserver>,
        pollers: PollerRegistry,
    ) -> Self {
        Self {
            gateway,
            observer,
            pollers,
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Run one gateway command.
    pub(crate) async fn call(&self, cmd: Command) -> Result<Payload> {
        let operation = cmd.operation;
        debug!(
            %operation,
            suffix = cmd.suffix.as_deref().unwrap_or_default(),
            positional = cmd.positional.len(),
            named = cmd.named.len(),
            "gateway call"
        );
        self.gateway.execute(cmd).await.map_err(|message| {
            warn!(%operation, %message, "gateway call failed");
            TopologyError::gateway(operation.to_string(), message)
        })
    }

    /// Serialize mutations of one entity. Different entities never wait on
    /// each other.
    pub(crate) async fn lock(&self, key: EntityKey) -> EntityGuard {
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        EntityGuard {
            key,
            locks: Arc::clone(&self.locks),
            guard: Some(guard),
        }
    }

    pub(crate) fn notify(&self, kind: EntityKind, snapshot: Snapshot) {
        self.observer.on_state_changed(kind, &snapshot);
    }

    /// Pass `result` through, reporting a failure to the observer.
    pub(crate) fn reported<T>(&self, operation: &str, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.observer.on_error(operation, &err.to_string());
        }
        result
    }
}
