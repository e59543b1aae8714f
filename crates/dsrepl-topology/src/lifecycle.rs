//! Agreement lifecycle shared by replication and winsync agreements.
//!
//! Both flavors support the same operations and differ only in their
//! editable fields, which implement [`AgreementSpec`]. The manager keeps the
//! last listed rows per suffix, issues the gateway commands and starts the
//! initialization pollers.

use crate::agreement::{derive_init_status, InitStatus};
use crate::context::{EntityKey, Shared};
use crate::entry::{Entry, Payload};
use crate::error::{Result, TopologyError, ValidationError};
use crate::events::{EntityKind, Snapshot};
use crate::gateway::{ArgValue, Command, Operation};
use crate::poller::{PollKey, PollOutcome, PollTicket};
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Agreement flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgreementKind {
    /// Replication to another directory server.
    Replication,
    /// Synchronization with Active Directory.
    Winsync,
}

#[derive(Debug, Clone, Copy)]
enum Verb {
    List,
    Get,
    Create,
    Set,
    Delete,
    Enable,
    Disable,
    Init,
    InitStatus,
    Poke,
}

impl AgreementKind {
    /// Entity kind used in notifications.
    pub fn entity(self) -> EntityKind {
        match self {
            AgreementKind::Replication => EntityKind::Agreement,
            AgreementKind::Winsync => EntityKind::WinsyncAgreement,
        }
    }

    fn op(self, verb: Verb) -> Operation {
        use Operation::*;
        match (self, verb) {
            (AgreementKind::Replication, Verb::List) => AgmtList,
            (AgreementKind::Replication, Verb::Get) => AgmtGet,
            (AgreementKind::Replication, Verb::Create) => AgmtCreate,
            (AgreementKind::Replication, Verb::Set) => AgmtSet,
            (AgreementKind::Replication, Verb::Delete) => AgmtDelete,
            (AgreementKind::Replication, Verb::Enable) => AgmtEnable,
            (AgreementKind::Replication, Verb::Disable) => AgmtDisable,
            (AgreementKind::Replication, Verb::Init) => AgmtInit,
            (AgreementKind::Replication, Verb::InitStatus) => AgmtInitStatus,
            (AgreementKind::Replication, Verb::Poke) => AgmtPoke,
            (AgreementKind::Winsync, Verb::List) => WinsyncList,
            (AgreementKind::Winsync, Verb::Get) => WinsyncGet,
            (AgreementKind::Winsync, Verb::Create) => WinsyncCreate,
            (AgreementKind::Winsync, Verb::Set) => WinsyncSet,
            (AgreementKind::Winsync, Verb::Delete) => WinsyncDelete,
            (AgreementKind::Winsync, Verb::Enable) => WinsyncEnable,
            (AgreementKind::Winsync, Verb::Disable) => WinsyncDisable,
            (AgreementKind::Winsync, Verb::Init) => WinsyncInit,
            (AgreementKind::Winsync, Verb::InitStatus) => WinsyncInitStatus,
            (AgreementKind::Winsync, Verb::Poke) => WinsyncPoke,
        }
    }

    fn action(self, verb: Verb) -> &'static str {
        match (self, verb) {
            (AgreementKind::Replication, Verb::Create) => "create agreement",
            (AgreementKind::Winsync, Verb::Create) => "create winsync agreement",
            (AgreementKind::Replication, _) => "update agreement",
            (AgreementKind::Winsync, _) => "update winsync agreement",
        }
    }
}

impl fmt::Display for AgreementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.entity(), f)
    }
}

/// Editable fields of one agreement flavor.
pub trait AgreementSpec:
    Clone + Default + PartialEq + fmt::Debug + Serialize + Send + Sync + 'static
{
    /// Which flavor these fields belong to.
    const KIND: AgreementKind;

    /// Decode the fields of an agreement entry, credentials included.
    fn from_entry(entry: &Entry) -> Result<Self>;

    /// The same fields with every secret cleared.
    fn redacted(self) -> Self;

    /// Client-side checks before a create.
    fn validate_create(&self) -> std::result::Result<(), ValidationError>;

    /// Flags of the create command.
    fn create_flags(&self) -> Vec<(&'static str, ArgValue)>;

    /// Flags of the set command taking `self` to `pending`. Only changed
    /// fields are listed; cleared ones become [`ArgValue::Delete`].
    fn diff_flags(
        &self,
        pending: &Self,
    ) -> std::result::Result<Vec<(&'static str, ArgValue)>, ValidationError>;

    /// Wrap listed rows for observers.
    fn snapshot(suffix: String, rows: Vec<AgreementRecord<Self>>) -> Snapshot;
}

/// One listed agreement. Never carries secrets.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgreementRecord<F> {
    /// Owning suffix.
    pub suffix: String,
    /// Unique name within the suffix.
    pub name: String,
    /// Settings.
    pub fields: F,
    /// False when paused.
    pub enabled: bool,
    /// Total update state.
    pub init_status: InitStatus,
    /// Diagnostic of the last incremental update.
    pub last_update_status: String,
    /// Diagnostic of the last total update.
    pub last_init_status: String,
}

impl<F: AgreementSpec> AgreementRecord<F> {
    /// Decode a listed entry.
    pub fn from_entry(suffix: &str, entry: &Entry) -> Result<Self> {
        let name = entry
            .first_nonempty("cn")
            .ok_or_else(|| TopologyError::MalformedPayload {
                msg: "agreement without cn".to_string(),
            })?;
        Ok(Self {
            suffix: suffix.to_string(),
            name: name.to_string(),
            fields: F::from_entry(entry)?.redacted(),
            enabled: !entry
                .first("nsds5replicaenabled")
                .map_or(false, |v| v.eq_ignore_ascii_case("off")),
            init_status: derive_init_status(entry),
            last_update_status: entry
                .first("nsds5replicalastupdatestatus")
                .unwrap_or_default()
                .to_string(),
            last_init_status: entry
                .first("nsds5replicalastinitstatus")
                .unwrap_or_default()
                .to_string(),
        })
    }
}

/// Loaded baseline plus pending edit of one agreement.
#[derive(Debug, Clone)]
pub struct AgreementEdit<F> {
    /// Owning suffix.
    pub suffix: String,
    /// Agreement name.
    pub name: String,
    /// Values last read from the server.
    pub baseline: F,
    /// Values to save.
    pub pending: F,
}

impl<F: AgreementSpec> AgreementEdit<F> {
    /// Flags a save would send.
    pub fn changes(&self) -> std::result::Result<Vec<(&'static str, ArgValue)>, ValidationError> {
        self.baseline.diff_flags(&self.pending)
    }
}

/// CRUD, enable/disable and initialization of one agreement flavor.
pub struct AgreementManager<F: AgreementSpec> {
    shared: Shared,
    rows: Arc<DashMap<String, Vec<AgreementRecord<F>>>>,
}

impl<F: AgreementSpec> Clone for AgreementManager<F> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            rows: Arc::clone(&self.rows),
        }
    }
}

impl<F: AgreementSpec> AgreementManager<F> {
    pub(crate) fn new(shared: Shared) -> Self {
        Self {
            shared,
            rows: Arc::new(DashMap::new()),
        }
    }

    fn op(&self, verb: Verb) -> Operation {
        F::KIND.op(verb)
    }

    fn entity_key(&self, suffix: &str, name: &str) -> EntityKey {
        EntityKey::new(F::KIND.entity(), suffix, name)
    }

    /// Rows from the last refresh.
    pub fn snapshot(&self, suffix: &str) -> Vec<AgreementRecord<F>> {
        self.rows
            .get(suffix)
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }

    /// Refresh the rows of `suffix` from the server. Agreements found with a
    /// total update in progress get a poller unless one is already running or
    /// their last poll timed out.
    pub async fn list(&self, suffix: &str) -> Result<Vec<AgreementRecord<F>>> {
        let operation = self.op(Verb::List).to_string();
        let result = self.refresh(suffix).await;
        self.shared.reported(&operation, result)
    }

    async fn refresh(&self, suffix: &str) -> Result<Vec<AgreementRecord<F>>> {
        let payload = self
            .shared
            .call(Command::for_suffix(self.op(Verb::List), suffix))
            .await?;
        let rows = payload
            .items()?
            .iter()
            .map(|entry| AgreementRecord::from_entry(suffix, entry))
            .collect::<Result<Vec<_>>>()?;

        for row in &rows {
            if row.init_status == InitStatus::InProgress {
                self.watch(suffix, &row.name, false);
            } else {
                self.shared
                    .pollers
                    .release(&PollKey::new(F::KIND, suffix, &row.name));
            }
        }
        self.rows.insert(suffix.to_string(), rows.clone());
        self.shared.notify(
            F::KIND.entity(),
            F::snapshot(suffix.to_string(), rows.clone()),
        );
        Ok(rows)
    }

    /// Refresh after a failed mutation; a failure here is only logged.
    async fn resync(&self, suffix: &str) {
        if let Err(err) = self.refresh(suffix).await {
            warn!(kind = %F::KIND, %suffix, error = %err, "resync after failure failed");
        }
    }

    /// Read one agreement, credentials included, as an edit baseline.
    pub async fn get(&self, suffix: &str, name: &str) -> Result<AgreementEdit<F>> {
        let operation = self.op(Verb::Get).to_string();
        let result = async {
            let payload = self
                .shared
                .call(Command::for_suffix(self.op(Verb::Get), suffix).arg(name))
                .await?;
            let baseline = F::from_entry(&payload.entry()?)?;
            Ok(AgreementEdit {
                suffix: suffix.to_string(),
                name: name.to_string(),
                pending: baseline.clone(),
                baseline,
            })
        }
        .await;
        self.shared.reported(&operation, result)
    }

    /// Create an agreement. With `init_now` a total update is started right
    /// after and its ticket returned.
    pub async fn create(
        &self,
        suffix: &str,
        name: &str,
        fields: &F,
        init_now: bool,
    ) -> Result<Option<PollTicket>> {
        let op = self.op(Verb::Create);
        let operation = op.to_string();
        let result = async {
            validate_create(name, fields)
                .map_err(|e| TopologyError::validation(F::KIND.action(Verb::Create), e))?;
            let name = name.trim();
            {
                let _guard = self.shared.lock(self.entity_key(suffix, name)).await;
                let mut cmd = Command::for_suffix(op, suffix).arg(name);
                for (flag, value) in fields.create_flags() {
                    cmd = cmd.flag(flag, value);
                }
                if let Err(err) = self.shared.call(cmd).await {
                    self.resync(suffix).await;
                    return Err(err);
                }
            }
            info!(kind = %F::KIND, %suffix, %name, "agreement created");
            self.refresh(suffix).await?;
            if init_now {
                Ok(Some(self.start_init(suffix, name).await?))
            } else {
                Ok(None)
            }
        }
        .await;
        self.shared.reported(&operation, result)
    }

    /// Save `edit`. Returns `false` when nothing changed and no command was
    /// sent.
    pub async fn update(&self, edit: &AgreementEdit<F>) -> Result<bool> {
        let op = self.op(Verb::Set);
        let operation = op.to_string();
        let result = async {
            let changes = edit
                .changes()
                .map_err(|e| TopologyError::validation(F::KIND.action(Verb::Set), e))?;
            if changes.is_empty() {
                return Ok(false);
            }
            {
                let _guard = self.shared.lock(self.entity_key(&edit.suffix, &edit.name)).await;
                let mut cmd = Command::for_suffix(op, &edit.suffix).arg(edit.name.as_str());
                for (flag, value) in changes {
                    cmd = cmd.flag(flag, value);
                }
                if let Err(err) = self.shared.call(cmd).await {
                    self.resync(&edit.suffix).await;
                    return Err(err);
                }
            }
            info!(kind = %F::KIND, suffix = %edit.suffix, name = %edit.name, "agreement updated");
            self.refresh(&edit.suffix).await?;
            Ok(true)
        }
        .await;
        self.shared.reported(&operation, result)
    }

    /// Delete an agreement. The row is dropped only once the server
    /// confirmed; a running poller is cancelled.
    pub async fn delete(&self, suffix: &str, name: &str) -> Result<()> {
        let op = self.op(Verb::Delete);
        let operation = op.to_string();
        let result = async {
            let _guard = self.shared.lock(self.entity_key(suffix, name)).await;
            self.shared
                .call(Command::for_suffix(op, suffix).arg(name))
                .await?;
            self.shared
                .pollers
                .cancel(&PollKey::new(F::KIND, suffix, name));
            let rows = {
                let mut rows = self.rows.entry(suffix.to_string()).or_default();
                rows.retain(|r| r.name != name);
                rows.clone()
            };
            info!(kind = %F::KIND, %suffix, %name, "agreement deleted");
            self.shared
                .notify(F::KIND.entity(), F::snapshot(suffix.to_string(), rows));
            Ok(())
        }
        .await;
        self.shared.reported(&operation, result)
    }

    /// Resume a paused agreement.
    pub async fn enable(&self, suffix: &str, name: &str) -> Result<()> {
        self.toggle(Verb::Enable, suffix, name).await
    }

    /// Pause an agreement.
    pub async fn disable(&self, suffix: &str, name: &str) -> Result<()> {
        self.toggle(Verb::Disable, suffix, name).await
    }

    async fn toggle(&self, verb: Verb, suffix: &str, name: &str) -> Result<()> {
        let op = self.op(verb);
        let operation = op.to_string();
        let result = async {
            {
                let _guard = self.shared.lock(self.entity_key(suffix, name)).await;
                if let Err(err) = self.shared.call(Command::for_suffix(op, suffix).arg(name)).await {
                    self.resync(suffix).await;
                    return Err(err);
                }
            }
            info!(kind = %F::KIND, %suffix, %name, %operation, "agreement toggled");
            self.refresh(suffix).await.map(|_| ())
        }
        .await;
        self.shared.reported(&operation, result)
    }

    /// Start a total update and poll it to completion.
    pub async fn initialize(&self, suffix: &str, name: &str) -> Result<PollTicket> {
        let operation = self.op(Verb::Init).to_string();
        let result = self.start_init(suffix, name).await;
        self.shared.reported(&operation, result)
    }

    async fn start_init(&self, suffix: &str, name: &str) -> Result<PollTicket> {
        let op = self.op(Verb::Init);
        let _guard = self.shared.lock(self.entity_key(suffix, name)).await;
        if let Err(err) = self.shared.call(Command::for_suffix(op, suffix).arg(name)).await {
            self.resync(suffix).await;
            return Err(err);
        }
        info!(kind = %F::KIND, %suffix, %name, "total update started");

        let rows = self.rows.get_mut(suffix).map(|mut rows| {
            for row in rows.iter_mut().filter(|r| r.name == name) {
                row.init_status = InitStatus::InProgress;
            }
            rows.clone()
        });
        if let Some(rows) = rows {
            self.shared
                .notify(F::KIND.entity(), F::snapshot(suffix.to_string(), rows));
        }
        // Replacing never declines.
        self.watch(suffix, name, true).ok_or(TopologyError::Shutdown)
    }

    /// Send pending changes to the remote replica now.
    pub async fn poke(&self, suffix: &str, name: &str) -> Result<()> {
        let op = self.op(Verb::Poke);
        let operation = op.to_string();
        let result = async {
            if let Err(err) = self.shared.call(Command::for_suffix(op, suffix).arg(name)).await {
                self.resync(suffix).await;
                return Err(err);
            }
            info!(kind = %F::KIND, %suffix, %name, "agreement poked");
            Ok(())
        }
        .await;
        self.shared.reported(&operation, result)
    }

    /// Forget every row of `suffix` and stop its pollers.
    pub(crate) fn forget_suffix(&self, suffix: &str) {
        self.rows.remove(suffix);
        self.shared.notify(
            F::KIND.entity(),
            F::snapshot(suffix.to_string(), Vec::new()),
        );
    }

    /// Poll the total update of `name`. `replace` cancels a running poller
    /// for the same agreement, otherwise an existing one is kept.
    fn watch(&self, suffix: &str, name: &str, replace: bool) -> Option<PollTicket> {
        let key = PollKey::new(F::KIND, suffix, name);
        let probe = {
            let shared = self.shared.clone();
            let cmd = Command::for_suffix(self.op(Verb::InitStatus), suffix).arg(name);
            move || {
                let shared = shared.clone();
                let cmd = cmd.clone();
                async move {
                    shared
                        .call(cmd)
                        .await
                        .map(|payload| status_text(&payload))
                        .map_err(|e| e.to_string())
                }
            }
        };
        let on_terminal = {
            let manager = self.clone();
            let suffix = suffix.to_string();
            let name = name.to_string();
            move |outcome: PollOutcome| async move {
                manager.shared.notify(
                    F::KIND.entity(),
                    Snapshot::Initialization {
                        suffix: suffix.clone(),
                        name,
                        outcome,
                    },
                );
                manager.resync(&suffix).await;
            }
        };
        if replace {
            Some(self.shared.pollers.start(key, probe, on_terminal))
        } else {
            self.shared.pollers.ensure(key, probe, on_terminal)
        }
    }
}

fn validate_create<F: AgreementSpec>(name: &str, fields: &F) -> std::result::Result<(), ValidationError> {
    let checked = fields.validate_create();
    if !name.trim().is_empty() {
        return checked;
    }
    match checked {
        Err(ValidationError::MissingFields { mut fields }) => {
            fields.insert(0, "name");
            Err(ValidationError::MissingFields { fields })
        }
        _ => Err(ValidationError::MissingFields {
            fields: vec!["name"],
        }),
    }
}

fn status_text(payload: &Payload) -> String {
    match payload.message() {
        Some(text) => text.to_string(),
        None => payload.value().to_string(),
    }
}
