//! The replication topology controller of one directory instance.
//!
//! Owns the replica configurations, the agreement managers, the CleanAllRUV
//! task manager and the poller registry. All state lives in the controller
//! instance; observers only receive snapshots.

use crate::agreement::AgreementFields;
use crate::cleanallruv::CleanAllRuvManager;
use crate::config::ControllerConfig;
use crate::context::{EntityKey, Shared};
use crate::error::{Result, TopologyError, ValidationError};
use crate::events::{EntityKind, Snapshot, TopologyObserver};
use crate::gateway::{Command, CommandGateway, Operation};
use crate::lifecycle::AgreementManager;
use crate::manager::{check_dn, ManagerState, NewManager};
use crate::poller::PollerRegistry;
use crate::replica::{
    settings_command, ChangelogSettings, EnableRequest, ReplicaAttr, ReplicaConfig, ReplicaId,
    ReplicaRole, ReplicaSettings, RoleChange, RoleRequest,
};
use crate::winsync::WinsyncFields;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Drives the replication topology of one directory instance.
#[derive(Clone)]
pub struct ReplicationController {
    shared: Shared,
    replicas: Arc<DashMap<String, ReplicaConfig>>,
    agreements: AgreementManager<AgreementFields>,
    winsync: AgreementManager<WinsyncFields>,
    cleanallruv: CleanAllRuvManager,
}

impl ReplicationController {
    /// Build a controller issuing commands through `gateway` and reporting to
    /// `observer`.
    pub fn new(
        gateway: Arc<dyn CommandGateway>,
        observer: Arc<dyn TopologyObserver>,
        config: &ControllerConfig,
    ) -> Self {
        let pollers = PollerRegistry::new(config.poll_interval(), config.max_poll_attempts);
        let shared = Shared::new(gateway, observer, pollers);
        Self {
            replicas: Arc::new(DashMap::new()),
            agreements: AgreementManager::new(shared.clone()),
            winsync: AgreementManager::new(shared.clone()),
            cleanallruv: CleanAllRuvManager::new(shared.clone()),
            shared,
        }
    }

    /// Replication agreements.
    pub fn agreements(&self) -> &AgreementManager<AgreementFields> {
        &self.agreements
    }

    /// Windows sync agreements.
    pub fn winsync(&self) -> &AgreementManager<WinsyncFields> {
        &self.winsync
    }

    /// CleanAllRUV tasks.
    pub fn cleanallruv(&self) -> &CleanAllRuvManager {
        &self.cleanallruv
    }

    /// Running initialization pollers.
    pub fn pollers(&self) -> &PollerRegistry {
        &self.shared.pollers
    }

    /// Configuration of `suffix` as last loaded.
    pub fn replica(&self, suffix: &str) -> Option<ReplicaConfig> {
        self.replicas.get(suffix).map(|cfg| cfg.clone())
    }

    /// Stop every poller.
    pub fn shutdown(&self) {
        self.shared.pollers.cancel_all();
        info!("topology controller shut down");
    }

    fn replica_key(suffix: &str) -> EntityKey {
        EntityKey::new(EntityKind::Replica, suffix, "")
    }

    /// Read the replica configuration of `suffix`. A failed read means
    /// replication is not enabled on it.
    pub async fn load_replica(&self, suffix: &str) -> Result<ReplicaConfig> {
        let operation = Operation::ReplicationGet.to_string();
        let result = self.reload(suffix).await;
        self.shared.reported(&operation, result)
    }

    async fn reload(&self, suffix: &str) -> Result<ReplicaConfig> {
        let entry = match self
            .shared
            .call(Command::for_suffix(Operation::ReplicationGet, suffix))
            .await
        {
            Ok(payload) => Some(payload.entry()?),
            Err(err) => {
                debug!(%suffix, error = %err, "no replica configuration");
                None
            }
        };

        let mut cfg = match &entry {
            Some(entry) => ReplicaConfig::from_entry(suffix, entry)?,
            None => ReplicaConfig::disabled(suffix),
        };
        if let (Some(entry), Some(previous)) = (&entry, self.replicas.get(suffix)) {
            let mut managers = previous.managers.clone();
            managers.sync(entry.values("nsds5replicabinddn"));
            cfg.managers = managers;
        }
        if cfg.role.is_enabled() {
            cfg.changelog = self.read_changelog(suffix).await;
        }

        self.replicas.insert(suffix.to_string(), cfg.clone());
        self.shared
            .notify(EntityKind::Replica, Snapshot::Replica(cfg.clone()));
        Ok(cfg)
    }

    async fn resync(&self, suffix: &str) {
        if let Err(err) = self.reload(suffix).await {
            warn!(%suffix, error = %err, "replica resync failed");
        }
    }

    async fn current(&self, suffix: &str) -> Result<ReplicaConfig> {
        match self.replica(suffix) {
            Some(cfg) => Ok(cfg),
            None => self.reload(suffix).await,
        }
    }

    /// Enable replication on a disabled suffix. A failed enable is rolled
    /// back with one disable attempt.
    pub async fn enable(&self, suffix: &str, request: &EnableRequest) -> Result<ReplicaConfig> {
        let operation = Operation::ReplicationEnable.to_string();
        let result = async {
            let id = request
                .validate()
                .map_err(|e| TopologyError::validation("enable replication", e))?;

            let _guard = self.shared.lock(Self::replica_key(suffix)).await;
            let before = self.current(suffix).await?;
            if before.role.is_enabled() {
                return Err(TopologyError::validation(
                    "enable replication",
                    ValidationError::IllegalTransition {
                        from: before.role.to_string(),
                        to: request.role.to_string(),
                    },
                ));
            }
            if let Err(original) = self.shared.call(request.command(suffix, id)).await {
                let rollback = Command::for_suffix(Operation::ReplicationDisable, suffix);
                if let Err(rollback) = self.shared.call(rollback).await {
                    error!(%suffix, %original, %rollback, "rollback of failed enable failed");
                    self.resync(suffix).await;
                    return Err(TopologyError::Compensation {
                        original: Box::new(original),
                        rollback: Box::new(rollback),
                    });
                }
                warn!(%suffix, "enable failed, replication disabled again");
                self.resync(suffix).await;
                return Err(original);
            }
            info!(%suffix, role = %request.role, "replication enabled");
            self.reload(suffix).await
        }
        .await;
        self.shared.reported(&operation, result)
    }

    /// Disable replication on `suffix`. Its agreements go away with it, so
    /// their rows are dropped and their pollers stopped.
    pub async fn disable(&self, suffix: &str) -> Result<ReplicaConfig> {
        let operation = Operation::ReplicationDisable.to_string();
        let result = async {
            let _guard = self.shared.lock(Self::replica_key(suffix)).await;
            let cmd = Command::for_suffix(Operation::ReplicationDisable, suffix);
            if let Err(err) = self.shared.call(cmd).await {
                self.resync(suffix).await;
                return Err(err);
            }
            let cancelled = self.shared.pollers.cancel_suffix(suffix);
            self.agreements.forget_suffix(suffix);
            self.winsync.forget_suffix(suffix);
            info!(%suffix, cancelled, "replication disabled");
            self.reload(suffix).await
        }
        .await;
        self.shared.reported(&operation, result)
    }

    /// Move an enabled replica to another enabled role, then save
    /// `request.settings` if any.
    pub async fn change_role(&self, suffix: &str, request: &RoleRequest) -> Result<ReplicaConfig> {
        let operation = "change replica role";
        let result = async {
            let current = self.current(suffix).await?;
            let illegal = || {
                TopologyError::validation(
                    operation,
                    ValidationError::IllegalTransition {
                        from: current.role.to_string(),
                        to: request.role.to_string(),
                    },
                )
            };
            let cmd = match RoleChange::plan(current.role, request.role) {
                None => {
                    debug!(%suffix, role = %current.role, "role unchanged");
                    return Ok(current);
                }
                Some(RoleChange::Enable(_)) | Some(RoleChange::Disable) => return Err(illegal()),
                Some(RoleChange::Promote(ReplicaRole::Master)) => {
                    let id = ReplicaId::parse(&request.replica_id)
                        .map_err(|e| TopologyError::validation("promote replica", e))?;
                    Command::for_suffix(Operation::ReplicationPromote, suffix)
                        .flag("newrole", ReplicaRole::Master.as_arg())
                        .flag("replica-id", id.to_string())
                }
                Some(RoleChange::Promote(role)) => {
                    if !current.has_bind_identity() {
                        return Err(TopologyError::validation(
                            "promote replica",
                            ValidationError::MissingBindIdentity,
                        ));
                    }
                    Command::for_suffix(Operation::ReplicationPromote, suffix)
                        .flag("newrole", role.as_arg())
                }
                Some(RoleChange::Demote(role)) => {
                    self.require_manager(suffix, role).await?;
                    Command::for_suffix(Operation::ReplicationDemote, suffix)
                        .flag("newrole", role.as_arg())
                }
            };

            let _guard = self.shared.lock(Self::replica_key(suffix)).await;
            if let Err(err) = self.shared.call(cmd).await {
                self.resync(suffix).await;
                return Err(err);
            }
            info!(%suffix, from = %current.role, to = %request.role, "replica role changed");
            let cfg = self.reload(suffix).await?;

            let Some(pending) = &request.settings else {
                return Ok(cfg);
            };
            // The new role already carries the replica id.
            let Some(cmd) = settings_command(suffix, &cfg.settings, pending, None) else {
                return Ok(cfg);
            };
            if let Err(err) = self.shared.call(cmd).await {
                self.resync(suffix).await;
                return Err(err);
            }
            info!(%suffix, "replica settings saved after role change");
            self.reload(suffix).await
        }
        .await;
        self.shared.reported(operation, result)
    }

    /// Demotion needs a registered manager, checked against a fresh read.
    async fn require_manager(&self, suffix: &str, target: ReplicaRole) -> Result<()> {
        let missing = || {
            TopologyError::validation(
                "demote replica",
                ValidationError::MissingManager {
                    target: target.to_string(),
                },
            )
        };
        let payload = self
            .shared
            .call(Command::for_suffix(Operation::ReplicationGet, suffix))
            .await?;
        let entry = payload.entry()?;
        if entry
            .values("nsds5replicabinddn")
            .iter()
            .any(|dn| !dn.trim().is_empty())
        {
            Ok(())
        } else {
            Err(missing())
        }
    }

    /// Save edited tuning attributes, and the replica id of a master. Only
    /// changed attributes are sent, in one command. Returns `false` when
    /// nothing changed.
    pub async fn save_replica(
        &self,
        suffix: &str,
        pending: &ReplicaSettings,
        replica_id: Option<ReplicaId>,
    ) -> Result<bool> {
        let operation = Operation::ReplicationSet.to_string();
        let result = async {
            let current = self.current(suffix).await?;
            if !current.role.is_enabled() {
                return Err(TopologyError::validation(
                    "save replica configuration",
                    ValidationError::ReplicationDisabled(suffix.to_string()),
                ));
            }
            check_dn(
                "bind group DN",
                pending.get(ReplicaAttr::BindDnGroup).unwrap_or_default(),
            )
            .map_err(|e| TopologyError::validation("save replica configuration", e))?;
            let id_change = match (current.role, replica_id) {
                (ReplicaRole::Master, Some(id)) => Some((current.replica_id, id)),
                (_, Some(id)) => {
                    debug!(%suffix, %id, "replica id ignored on a non-master replica");
                    None
                }
                (_, None) => None,
            };
            let Some(cmd) = settings_command(suffix, &current.settings, pending, id_change) else {
                return Ok(false);
            };

            let _guard = self.shared.lock(Self::replica_key(suffix)).await;
            if let Err(err) = self.shared.call(cmd).await {
                self.resync(suffix).await;
                return Err(err);
            }
            info!(%suffix, "replica configuration saved");
            self.reload(suffix).await?;
            Ok(true)
        }
        .await;
        self.shared.reported(&operation, result)
    }

    /// Create a manager entry and register it as a bind DN of `suffix`.
    pub async fn create_manager(&self, suffix: &str, manager: &NewManager) -> Result<ReplicaConfig> {
        let operation = Operation::CreateManager.to_string();
        let result = async {
            manager
                .validate()
                .map_err(|e| TopologyError::validation("create manager", e))?;
            let dn = manager.dn.trim();
            let _guard = self
                .shared
                .lock(EntityKey::new(EntityKind::Manager, suffix, dn))
                .await;
            let cmd = Command::for_suffix(Operation::CreateManager, suffix)
                .flag("name", dn)
                .secret_flag("passwd", &manager.secret);
            if let Err(err) = self.shared.call(cmd).await {
                self.resync(suffix).await;
                return Err(err);
            }
            info!(%suffix, %dn, "manager created");
            let cfg = self.reload(suffix).await?;
            self.shared
                .notify(EntityKind::Manager, Snapshot::Replica(cfg.clone()));
            Ok(cfg)
        }
        .await;
        self.shared.reported(&operation, result)
    }

    /// Unregister `dn` from `suffix`, then delete its entry. When only the
    /// first step succeeded the manager is kept as removal pending and a
    /// later call resumes with the second step.
    pub async fn delete_manager(&self, suffix: &str, dn: &str) -> Result<ReplicaConfig> {
        let operation = Operation::DeleteManager.to_string();
        let result = async {
            let dn = dn.trim();
            let _guard = self
                .shared
                .lock(EntityKey::new(EntityKind::Manager, suffix, dn))
                .await;
            let current = self.current(suffix).await?;

            if current.managers.state(dn) != Some(ManagerState::RemovalPending) {
                let unregister = Command::for_suffix(Operation::ReplicationSet, suffix)
                    .flag("repl-del-bind-dn", dn);
                if let Err(err) = self.shared.call(unregister).await {
                    self.resync(suffix).await;
                    return Err(err);
                }
                debug!(%suffix, %dn, "manager unregistered");
            }

            let delete = Command::for_suffix(Operation::DeleteManager, suffix).flag("name", dn);
            if let Err(err) = self.shared.call(delete).await {
                let cfg = self.update_cached(suffix, |cfg| cfg.managers.mark_removal_pending(dn));
                warn!(%suffix, %dn, "manager unregistered but its entry was not deleted");
                if let Some(cfg) = cfg {
                    self.shared.notify(EntityKind::Manager, Snapshot::Replica(cfg));
                }
                return Err(err);
            }
            self.update_cached(suffix, |cfg| {
                cfg.managers.remove(dn);
            });
            info!(%suffix, %dn, "manager deleted");
            let cfg = self.reload(suffix).await?;
            self.shared
                .notify(EntityKind::Manager, Snapshot::Replica(cfg.clone()));
            Ok(cfg)
        }
        .await;
        self.shared.reported(&operation, result)
    }

    fn update_cached(
        &self,
        suffix: &str,
        f: impl FnOnce(&mut ReplicaConfig),
    ) -> Option<ReplicaConfig> {
        self.replicas.get_mut(suffix).map(|mut cfg| {
            f(&mut cfg);
            cfg.clone()
        })
    }

    async fn read_changelog(&self, suffix: &str) -> Option<ChangelogSettings> {
        let cmd = Command::for_suffix(Operation::GetChangelog, suffix);
        match self.shared.call(cmd).await {
            Ok(payload) => match payload.entry() {
                Ok(entry) => Some(ChangelogSettings::from_entry(&entry)),
                Err(err) => {
                    warn!(%suffix, error = %err, "unreadable changelog entry");
                    None
                }
            },
            Err(_) => None,
        }
    }

    /// Create the replication changelog with `settings`.
    pub async fn create_changelog(
        &self,
        suffix: &str,
        settings: &ChangelogSettings,
    ) -> Result<ReplicaConfig> {
        let operation = Operation::CreateChangelog.to_string();
        let result = async {
            let _guard = self
                .shared
                .lock(EntityKey::new(EntityKind::Changelog, suffix, ""))
                .await;
            let mut cmd = Command::for_suffix(Operation::CreateChangelog, suffix);
            for (flag, value) in settings.create_flags() {
                cmd = cmd.flag(flag, value);
            }
            if let Err(err) = self.shared.call(cmd).await {
                self.resync(suffix).await;
                return Err(err);
            }
            info!(%suffix, "changelog created");
            self.reload_changelog(suffix).await
        }
        .await;
        self.shared.reported(&operation, result)
    }

    /// Read the changelog settings; `None` when there is no changelog.
    pub async fn load_changelog(&self, suffix: &str) -> Result<Option<ChangelogSettings>> {
        let operation = Operation::GetChangelog.to_string();
        let result = self
            .reload_changelog(suffix)
            .await
            .map(|cfg| cfg.changelog);
        self.shared.reported(&operation, result)
    }

    async fn reload_changelog(&self, suffix: &str) -> Result<ReplicaConfig> {
        let changelog = self.read_changelog(suffix).await;
        let cfg = match self.update_cached(suffix, |cfg| cfg.changelog = changelog.clone()) {
            Some(cfg) => cfg,
            None => {
                let mut cfg = self.reload(suffix).await?;
                cfg.changelog = changelog;
                self.replicas.insert(suffix.to_string(), cfg.clone());
                cfg
            }
        };
        self.shared
            .notify(EntityKind::Changelog, Snapshot::Replica(cfg.clone()));
        Ok(cfg)
    }

    /// Save edited changelog settings. Returns `false` when nothing changed.
    pub async fn save_changelog(&self, suffix: &str, pending: &ChangelogSettings) -> Result<bool> {
        let operation = Operation::SetChangelog.to_string();
        let result = async {
            let baseline = match self.replica(suffix).and_then(|cfg| cfg.changelog) {
                Some(baseline) => baseline,
                None => self
                    .reload_changelog(suffix)
                    .await?
                    .changelog
                    .ok_or_else(|| {
                        TopologyError::validation(
                            "save changelog",
                            ValidationError::ChangelogMissing,
                        )
                    })?,
            };
            let changes = baseline.diff(pending);
            if changes.is_empty() {
                return Ok(false);
            }
            let _guard = self
                .shared
                .lock(EntityKey::new(EntityKind::Changelog, suffix, ""))
                .await;
            let mut cmd = Command::for_suffix(Operation::SetChangelog, suffix);
            for (flag, value) in changes {
                cmd = cmd.flag(flag, value);
            }
            if let Err(err) = self.shared.call(cmd).await {
                self.resync(suffix).await;
                return Err(err);
            }
            info!(%suffix, "changelog saved");
            self.reload_changelog(suffix).await?;
            Ok(true)
        }
        .await;
        self.shared.reported(&operation, result)
    }

    /// Remove the replication changelog.
    pub async fn delete_changelog(&self, suffix: &str) -> Result<ReplicaConfig> {
        let operation = Operation::DeleteChangelog.to_string();
        let result = async {
            let _guard = self
                .shared
                .lock(EntityKey::new(EntityKind::Changelog, suffix, ""))
                .await;
            let cmd = Command::for_suffix(Operation::DeleteChangelog, suffix);
            if let Err(err) = self.shared.call(cmd).await {
                self.resync(suffix).await;
                return Err(err);
            }
            info!(%suffix, "changelog deleted");
            self.reload_changelog(suffix).await
        }
        .await;
        self.shared.reported(&operation, result)
    }
}
